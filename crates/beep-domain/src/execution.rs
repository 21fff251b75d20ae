use serde::{Deserialize, Serialize};

/// How an execution reached its terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitKind {
    Completed,
    Timeout,
    Cancelled,
    Failed,
}

/// Result record for one code execution. User-code exceptions never
/// propagate past the execution boundary; they land here as
/// `success=false` with the traceback in `error` and `stderr`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_kind: ExitKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    #[must_use]
    pub fn completed(stdout: String, stderr: String, duration_ms: u64) -> Self {
        Self {
            success: true,
            stdout,
            stderr,
            exit_kind: ExitKind::Completed,
            error: None,
            duration_ms,
        }
    }

    #[must_use]
    pub fn failed(stdout: String, stderr: String, error: String, duration_ms: u64) -> Self {
        Self {
            success: false,
            stdout,
            stderr,
            exit_kind: ExitKind::Failed,
            error: Some(error),
            duration_ms,
        }
    }

    #[must_use]
    pub fn aborted(exit_kind: ExitKind, stdout: String, stderr: String, duration_ms: u64) -> Self {
        Self {
            success: false,
            stdout,
            stderr,
            exit_kind,
            error: None,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_results_carry_the_error_and_buffers() {
        let result = ExecutionResult::failed(
            "partial".to_string(),
            "Traceback (most recent call last):\n...".to_string(),
            "ZeroDivisionError: division by zero".to_string(),
            12,
        );
        assert!(!result.success);
        assert_eq!(result.exit_kind, ExitKind::Failed);
        assert!(result.stderr.starts_with("Traceback"));
        assert!(result.error.as_deref().unwrap_or("").contains("ZeroDivisionError"));
    }
}
