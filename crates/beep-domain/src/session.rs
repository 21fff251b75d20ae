use crate::clock::now_rfc3339;
use crate::execution::ExitKind;
use crate::ids::{EnvId, ScopeHandle, SessionId};

/// Session lifecycle; transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    New,
    Active,
    Terminated,
}

/// A live execution context bound to exactly one environment for its
/// entire life. The scope handle names the interpreter-side namespace that
/// keeps module-level variables alive between executions.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub principal: String,
    pub env_id: EnvId,
    pub state: SessionState,
    pub scope: Option<ScopeHandle>,
    pub created_at: String,
    pub last_activity: String,
    pub last_exit: Option<ExitKind>,
}

impl Session {
    #[must_use]
    pub fn new(principal: impl Into<String>, env_id: EnvId) -> Self {
        let stamp = now_rfc3339();
        Self {
            id: SessionId::generate(),
            principal: principal.into(),
            env_id,
            state: SessionState::New,
            scope: None,
            created_at: stamp.clone(),
            last_activity: stamp,
            last_exit: None,
        }
    }

    pub fn activate(&mut self) {
        if self.state == SessionState::New {
            self.state = SessionState::Active;
        }
    }

    /// Forward-only: terminating drops the scope; a terminated session
    /// never becomes active again.
    pub fn terminate(&mut self) {
        self.state = SessionState::Terminated;
        self.scope = None;
    }

    pub fn touch(&mut self) {
        self.last_activity = now_rfc3339();
    }

    pub fn record_exit(&mut self, exit: ExitKind) {
        self.last_exit = Some(exit);
        self.touch();
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}
