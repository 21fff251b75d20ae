use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

use beep_domain::{EnvId, ExitKind, ScopeHandle, Session, SessionId, SessionState};

use crate::venv::{EnvError, EnvManager};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} is unknown")]
    Unknown(SessionId),
    #[error("session {0} has been terminated")]
    Gone(SessionId),
    #[error(transparent)]
    Env(#[from] EnvError),
}

/// Per-user execution scopes. Terminated sessions stay in the table so
/// their ids are never reused and later operations fail with a clean
/// `Gone` instead of recreating state.
pub struct SessionManager {
    envs: Arc<EnvManager>,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(envs: Arc<EnvManager>) -> Self {
        Self {
            envs,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// At most one `Active` session per (principal, env); pass `fresh` to
    /// force a new one alongside it.
    pub fn get_or_create(
        &self,
        principal: &str,
        env_id: &EnvId,
        fresh: bool,
    ) -> Result<Session, SessionError> {
        self.envs
            .get(env_id)
            .ok_or_else(|| EnvError::Unknown(env_id.clone()))?;
        let mut sessions = self.lock();
        if !fresh {
            if let Some(existing) = sessions.values_mut().find(|session| {
                session.is_active() && session.principal == principal && &session.env_id == env_id
            }) {
                existing.touch();
                return Ok(existing.clone());
            }
        }
        let mut session = Session::new(principal, env_id.clone());
        session.activate();
        self.envs.bind_session(env_id, session.id.clone())?;
        sessions.insert(session.id.clone(), session.clone());
        debug!(session = %session.id, env = %env_id, principal, "session created");
        Ok(session)
    }

    /// Idempotent: the first call names the interpreter-side namespace,
    /// later calls return the same handle.
    pub fn create_scope(&self, id: &SessionId) -> Result<ScopeHandle, SessionError> {
        let mut sessions = self.lock();
        let session = active_mut(&mut sessions, id)?;
        if session.scope.is_none() {
            session.scope = Some(ScopeHandle::for_session(id));
        }
        Ok(session.scope.clone().unwrap_or_else(|| ScopeHandle::for_session(id)))
    }

    pub fn has_scope(&self, id: &SessionId) -> Result<bool, SessionError> {
        let mut sessions = self.lock();
        Ok(active_mut(&mut sessions, id)?.scope.is_some())
    }

    pub fn get_scope(&self, id: &SessionId) -> Result<Option<ScopeHandle>, SessionError> {
        let mut sessions = self.lock();
        Ok(active_mut(&mut sessions, id)?.scope.clone())
    }

    /// Fetch a session for execution; fails with `Gone` once terminated.
    pub fn active_session(&self, id: &SessionId) -> Result<Session, SessionError> {
        let mut sessions = self.lock();
        Ok(active_mut(&mut sessions, id)?.clone())
    }

    /// Transition to `Terminated`, drop the scope, and unlink the session
    /// from its environment. Idempotent.
    pub fn terminate(&self, id: &SessionId) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::Unknown(id.clone()))?;
        if session.state == SessionState::Terminated {
            return Ok(());
        }
        session.terminate();
        let env_id = session.env_id.clone();
        drop(sessions);
        self.envs.unbind_session(&env_id, id);
        debug!(session = %id, "session terminated");
        Ok(())
    }

    /// Terminate every live session bound to an environment; the engine
    /// calls this after a host process had to be killed.
    pub fn terminate_all_for_env(&self, env_id: &EnvId) -> Vec<SessionId> {
        let mut terminated = Vec::new();
        let mut sessions = self.lock();
        for session in sessions.values_mut() {
            if &session.env_id == env_id && session.state != SessionState::Terminated {
                session.terminate();
                terminated.push(session.id.clone());
            }
        }
        drop(sessions);
        for id in &terminated {
            self.envs.unbind_session(env_id, id);
        }
        terminated
    }

    /// Terminate sessions idle longer than `max_idle`; returns the ids
    /// swept.
    pub fn sweep(&self, max_idle: Duration) -> Vec<SessionId> {
        let now = OffsetDateTime::now_utc();
        let idle_ids: Vec<SessionId> = {
            let sessions = self.lock();
            sessions
                .values()
                .filter(|session| session.is_active())
                .filter(|session| {
                    OffsetDateTime::parse(&session.last_activity, &Rfc3339)
                        .map(|last| now - last > max_idle)
                        .unwrap_or(false)
                })
                .map(|session| session.id.clone())
                .collect()
        };
        for id in &idle_ids {
            let _ = self.terminate(id);
        }
        idle_ids
    }

    pub fn touch(&self, id: &SessionId) {
        if let Some(session) = self.lock().get_mut(id) {
            session.touch();
        }
    }

    pub fn record_exit(&self, id: &SessionId, exit: ExitKind) {
        if let Some(session) = self.lock().get_mut(id) {
            session.record_exit(exit);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.lock().expect("session table lock")
    }
}

fn active_mut<'a>(
    sessions: &'a mut HashMap<SessionId, Session>,
    id: &SessionId,
) -> Result<&'a mut Session, SessionError> {
    match sessions.get_mut(id) {
        None => Err(SessionError::Unknown(id.clone())),
        Some(session) if session.state == SessionState::Terminated => {
            Err(SessionError::Gone(id.clone()))
        }
        Some(session) => Ok(session),
    }
}
