use std::fmt;
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

fn random_suffix() -> String {
    let bytes: [u8; 4] = rand::thread_rng().gen();
    hex::encode(bytes)
}

fn path_suffix(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    hex::encode(&digest[..4])
}

macro_rules! id_type {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, random_suffix()))
            }

            #[must_use]
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_type!(RuntimeId, "rt", "Identifies one catalogued Python runtime.");
id_type!(EnvId, "env", "Identifies one virtual environment.");
id_type!(SessionId, "ses", "Identifies one execution session.");

impl EnvId {
    /// Derive the id from the environment path. Rehydrating the same venv
    /// directory after a restart yields the same id.
    #[must_use]
    pub fn for_path(path: &Path) -> Self {
        Self(format!("env-{}", path_suffix(path)))
    }
}

/// Opaque token naming the interpreter-side namespace that holds a
/// session's globals. Owned exclusively by its session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScopeHandle(String);

impl ScopeHandle {
    #[must_use]
    pub fn for_session(session: &SessionId) -> Self {
        Self(format!("scope-{}", session.as_str()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn generated_ids_are_prefixed_and_distinct() {
        let a = RuntimeId::generate();
        let b = RuntimeId::generate();
        assert!(a.as_str().starts_with("rt-"));
        assert_ne!(a, b);
    }

    #[test]
    fn env_id_is_stable_for_a_path() {
        let path = PathBuf::from("/home/user/.beep-python/venvs/data-science");
        assert_eq!(EnvId::for_path(&path), EnvId::for_path(&path));
        assert_ne!(
            EnvId::for_path(&path),
            EnvId::for_path(&PathBuf::from("/somewhere/else"))
        );
    }

    #[test]
    fn ids_serialize_as_bare_strings() {
        let id = SessionId::from_raw("ses-12ab34cd");
        let json = serde_json::to_string(&id).expect("serialize id");
        assert_eq!(json, "\"ses-12ab34cd\"");
    }
}
