mod driver;
mod host;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use beep_domain::{
    EnvId, ExecutionResult, ExitKind, SessionId, VirtualEnvironment,
};

use crate::progress::{CancellationToken, ProgressSink};
use crate::session::{SessionError, SessionManager};
use crate::venv::{python_executable, EnvManager};
use host::{AbortReason, ExecOutcome, InterpreterHost};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("environment is not initialized: {0}")]
    NotInitialized(String),
    #[error("session {0} is unknown")]
    UnknownSession(SessionId),
    #[error("session {0} has been terminated")]
    SessionGone(SessionId),
    #[error("environment {0} no longer exists")]
    EnvGone(EnvId),
    #[error("internal execution failure: {0}")]
    Internal(String),
}

impl From<SessionError> for ExecError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Unknown(id) => Self::UnknownSession(id),
            SessionError::Gone(id) => Self::SessionGone(id),
            SessionError::Env(other) => Self::Internal(other.to_string()),
        }
    }
}

/// Per-call knobs. The default has no timeout, a null progress sink, and
/// a fresh (never-fired) cancellation token.
#[derive(Clone, Default)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub progress: ProgressSink,
    pub cancel: CancellationToken,
}

impl ExecOptions {
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// Runs user code inside session scopes with FIFO ordering per
/// interpreter process, cooperative cancellation, and interrupt-then-kill
/// escalation for timeouts.
///
/// Each environment is hosted by one resident interpreter process; within
/// that process executions are serialized in submission order, while
/// distinct environments execute concurrently.
pub struct ExecutionEngine {
    sessions: Arc<SessionManager>,
    envs: Arc<EnvManager>,
    hosts: Mutex<HashMap<EnvId, Arc<InterpreterHost>>>,
    grace: Duration,
}

impl ExecutionEngine {
    #[must_use]
    pub fn new(sessions: Arc<SessionManager>, envs: Arc<EnvManager>) -> Self {
        Self {
            sessions,
            envs,
            hosts: Mutex::new(HashMap::new()),
            grace: Duration::from_millis(1500),
        }
    }

    /// Grace window between interrupt injection and process kill.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run `code` in the session's scope. User-code exceptions come back
    /// as a failed result, never as an `Err`.
    pub fn execute(
        &self,
        session_id: &SessionId,
        code: &str,
        opts: &ExecOptions,
    ) -> Result<ExecutionResult, ExecError> {
        self.execute_inner(session_id, code, None, opts)
    }

    /// Read a script file, then run it like `execute`.
    pub fn execute_script(
        &self,
        session_id: &SessionId,
        path: &Path,
        opts: &ExecOptions,
    ) -> Result<ExecutionResult, ExecError> {
        let code = fs::read_to_string(path).map_err(|err| {
            ExecError::Internal(format!("failed to read script {}: {err}", path.display()))
        })?;
        self.execute_inner(session_id, &code, None, opts)
    }

    /// Bind `vars` into the session scope (by value) before running.
    pub fn execute_with_variables(
        &self,
        session_id: &SessionId,
        code: &str,
        vars: &serde_json::Map<String, Value>,
        opts: &ExecOptions,
    ) -> Result<ExecutionResult, ExecError> {
        self.execute_inner(session_id, code, Some(vars), opts)
    }

    /// Run snippets in order, short-circuiting after the first one that
    /// does not complete successfully. The failing result is included.
    pub fn execute_batch(
        &self,
        session_id: &SessionId,
        codes: &[String],
        opts: &ExecOptions,
    ) -> Result<Vec<ExecutionResult>, ExecError> {
        let mut results = Vec::with_capacity(codes.len());
        for code in codes {
            let result = self.execute_inner(session_id, code, None, opts)?;
            let stop = !result.success;
            results.push(result);
            if stop {
                break;
            }
        }
        Ok(results)
    }

    /// Drop the session's interpreter-side scope and terminate it.
    pub fn release_session(&self, session_id: &SessionId) -> Result<(), ExecError> {
        let session = match self.sessions.active_session(session_id) {
            Ok(session) => session,
            // Already terminated; nothing interpreter-side to drop.
            Err(SessionError::Gone(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if let Some(scope) = &session.scope {
            let host = self.hosts.lock().expect("host table lock").get(&session.env_id).cloned();
            if let Some(host) = host {
                if let ExecOutcome::HostLost = host.submit_control("drop", scope.as_str()) {
                    warn!(session = %session_id, "interpreter host lost while dropping scope");
                }
            }
        }
        self.sessions.terminate(session_id).map_err(ExecError::from)
    }

    fn execute_inner(
        &self,
        session_id: &SessionId,
        code: &str,
        vars: Option<&serde_json::Map<String, Value>>,
        opts: &ExecOptions,
    ) -> Result<ExecutionResult, ExecError> {
        let session = self.sessions.active_session(session_id)?;
        let env = self
            .envs
            .get(&session.env_id)
            .ok_or_else(|| ExecError::EnvGone(session.env_id.clone()))?;
        let scope = self.sessions.create_scope(session_id)?;

        // Checkpoint before taking the interpreter lock.
        if opts.cancel.is_cancelled() {
            self.sessions.record_exit(session_id, ExitKind::Cancelled);
            return Ok(ExecutionResult::aborted(
                ExitKind::Cancelled,
                String::new(),
                String::new(),
                0,
            ));
        }

        let host = self.host_for(&env)?;
        opts.progress.message(format!("executing in {}", session_id));
        let started = Instant::now();
        let outcome = host.submit_exec(scope.as_str(), code, vars, opts.timeout, &opts.cancel);
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = match outcome {
            ExecOutcome::Reply(reply) if reply.ok => {
                ExecutionResult::completed(reply.stdout, reply.stderr, duration_ms)
            }
            ExecOutcome::Reply(reply) => {
                let error = reply
                    .error
                    .unwrap_or_else(|| "python raised an exception".to_string());
                ExecutionResult::failed(reply.stdout, reply.stderr, error, duration_ms)
            }
            ExecOutcome::Interrupted { reply, reason } => {
                let (stdout, stderr) = reply
                    .map(|reply| (reply.stdout, reply.stderr))
                    .unwrap_or_default();
                ExecutionResult::aborted(exit_kind(reason), stdout, stderr, duration_ms)
            }
            ExecOutcome::NotStarted { reason } => ExecutionResult::aborted(
                exit_kind(reason),
                String::new(),
                String::new(),
                duration_ms,
            ),
            ExecOutcome::Killed { reason } => {
                self.retire_host(&env.id);
                ExecutionResult::aborted(exit_kind(reason), String::new(), String::new(), duration_ms)
            }
            ExecOutcome::HostLost => {
                self.retire_host(&env.id);
                ExecutionResult::failed(
                    String::new(),
                    String::new(),
                    "interpreter process exited during execution".to_string(),
                    duration_ms,
                )
            }
        };
        self.sessions.record_exit(session_id, result.exit_kind);
        debug!(
            session = %session_id,
            exit = ?result.exit_kind,
            duration_ms,
            "execution finished"
        );
        Ok(result)
    }

    fn host_for(&self, env: &VirtualEnvironment) -> Result<Arc<InterpreterHost>, ExecError> {
        let mut hosts = self.hosts.lock().expect("host table lock");
        if let Some(host) = hosts.get(&env.id) {
            if host.is_alive() {
                return Ok(Arc::clone(host));
            }
            hosts.remove(&env.id);
        }
        let interpreter = interpreter_for(env);
        if !interpreter.is_file() {
            return Err(ExecError::NotInitialized(format!(
                "no interpreter at {}",
                interpreter.display()
            )));
        }
        let host = InterpreterHost::spawn(
            env.id.clone(),
            &interpreter,
            &env.path,
            env.is_managed,
            self.grace,
        )
        .map_err(|err| ExecError::Internal(err.to_string()))?;
        let host = Arc::new(host);
        hosts.insert(env.id.clone(), Arc::clone(&host));
        Ok(host)
    }

    /// Drop a dead or killed host and terminate the sessions it served:
    /// their interpreter-side scopes died with the process.
    fn retire_host(&self, env_id: &EnvId) {
        self.hosts.lock().expect("host table lock").remove(env_id);
        let terminated = self.sessions.terminate_all_for_env(env_id);
        if !terminated.is_empty() {
            warn!(env = %env_id, count = terminated.len(), "sessions terminated with their host");
        }
    }
}

fn exit_kind(reason: AbortReason) -> ExitKind {
    match reason {
        AbortReason::Timeout => ExitKind::Timeout,
        AbortReason::Cancelled => ExitKind::Cancelled,
    }
}

/// A venv's own interpreter when the env is a real venv; otherwise the
/// conventional executable under the adopted install root.
fn interpreter_for(env: &VirtualEnvironment) -> std::path::PathBuf {
    let venv_python = python_executable(&env.path);
    if venv_python.is_file() {
        venv_python
    } else {
        beep_domain::runtime::executable_under(&env.path)
    }
}
