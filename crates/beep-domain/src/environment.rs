use std::path::PathBuf;

use crate::clock::now_rfc3339;
use crate::ids::{EnvId, RuntimeId, SessionId};

/// An isolated site-packages derived from a base runtime.
///
/// Environments are rehydrated from the `venvs/` directory on startup
/// rather than persisted in their own document; the id is derived from the
/// path so it is stable across restarts.
#[derive(Clone, Debug)]
pub struct VirtualEnvironment {
    pub id: EnvId,
    pub name: String,
    pub base_runtime_id: RuntimeId,
    pub path: PathBuf,
    /// Principal that created the env; `None` for rehydrated envs whose
    /// creator is unknown.
    pub created_by: Option<String>,
    pub is_active: bool,
    /// Owned by this host. Interpreter processes hosting an unmanaged env
    /// are never killed, only detached.
    pub is_managed: bool,
    pub created_at: String,
    pub sessions: Vec<SessionId>,
}

impl VirtualEnvironment {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        base_runtime_id: RuntimeId,
        path: PathBuf,
        created_by: Option<String>,
    ) -> Self {
        Self {
            id: EnvId::for_path(&path),
            name: name.into(),
            base_runtime_id,
            path,
            created_by,
            is_active: true,
            is_managed: true,
            created_at: now_rfc3339(),
            sessions: Vec::new(),
        }
    }

    pub fn bind_session(&mut self, session: SessionId) {
        if !self.sessions.contains(&session) {
            self.sessions.push(session);
        }
    }

    pub fn unbind_session(&mut self, session: &SessionId) {
        self.sessions.retain(|bound| bound != session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_is_idempotent_and_unbinding_removes() {
        let mut env = VirtualEnvironment::new(
            "data-science",
            RuntimeId::from_raw("rt-00000000"),
            "/home/u/.beep-python/venvs/data-science".into(),
            Some("alice".to_string()),
        );
        let session = SessionId::from_raw("ses-11111111");
        env.bind_session(session.clone());
        env.bind_session(session.clone());
        assert_eq!(env.sessions.len(), 1);
        env.unbind_session(&session);
        assert!(env.sessions.is_empty());
    }
}
