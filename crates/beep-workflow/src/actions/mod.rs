mod dataframe;
mod run_code;

pub use dataframe::{AddColumnBody, CreateDataFrameBody};
pub use run_code::RunCodeBody;

use std::sync::Arc;

use beep_core::{CancellationToken, ExecOptions, ExecutionEngine, ProgressSink};
use beep_domain::{ExecutionResult, ExitKind, SessionId};

use crate::action::ActionResult;
use crate::params::ParameterValue;

/// Shared plumbing for action bodies that run Python: everything funnels
/// through the execution engine against one session, so chained steps see
/// each other's variables.
#[derive(Clone)]
pub struct SessionCodeRunner {
    engine: Arc<ExecutionEngine>,
    session: SessionId,
}

impl SessionCodeRunner {
    #[must_use]
    pub fn new(engine: Arc<ExecutionEngine>, session: SessionId) -> Self {
        Self { engine, session }
    }

    #[must_use]
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub(crate) fn run(
        &self,
        code: &str,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ActionResult> {
        let opts = ExecOptions {
            timeout: None,
            progress: progress.clone(),
            cancel: cancel.clone(),
        };
        let result = self.engine.execute(&self.session, code, &opts)?;
        Ok(map_execution(result))
    }
}

fn map_execution(result: ExecutionResult) -> ActionResult {
    match result.exit_kind {
        ExitKind::Completed => {
            let message = result
                .stdout
                .lines()
                .next()
                .unwrap_or("ok")
                .trim()
                .to_string();
            let message = if message.is_empty() {
                "ok".to_string()
            } else {
                message
            };
            ActionResult::success(message, Some(ParameterValue::Str(result.stdout)))
        }
        ExitKind::Cancelled => ActionResult::cancelled("execution cancelled"),
        ExitKind::Timeout => ActionResult::error("execution timed out"),
        ExitKind::Failed => ActionResult::error(
            result
                .error
                .unwrap_or_else(|| result.stderr.trim().to_string()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionEventType;

    #[test]
    fn execution_results_map_onto_event_types() {
        let ok = map_execution(ExecutionResult::completed("42\n".into(), String::new(), 5));
        assert_eq!(ok.event_type, ActionEventType::Success);
        assert_eq!(ok.message, "42");

        let raised = map_execution(ExecutionResult::failed(
            String::new(),
            "Traceback (most recent call last):\n...".into(),
            "NameError: name 'df' is not defined".into(),
            5,
        ));
        assert_eq!(raised.event_type, ActionEventType::Error);
        assert!(raised.message.contains("NameError"));

        let cancelled = map_execution(ExecutionResult::aborted(
            ExitKind::Cancelled,
            String::new(),
            String::new(),
            5,
        ));
        assert_eq!(cancelled.event_type, ActionEventType::Cancelled);

        let timed_out = map_execution(ExecutionResult::aborted(
            ExitKind::Timeout,
            String::new(),
            String::new(),
            5,
        ));
        assert_eq!(timed_out.event_type, ActionEventType::Error);
    }
}
