use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::clock::now_rfc3339;
use crate::ids::RuntimeId;

/// Where a catalogued interpreter came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeKind {
    /// Provisioner-owned relocatable distribution under our data dir.
    Embedded,
    /// Found on the machine; never deleted or killed by us.
    System,
    /// A conda base or named environment.
    Conda,
    /// A virtual environment layered over a base runtime.
    VirtualEnv,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeStatus {
    NotInitialized,
    Ready,
    Error,
    Updating,
}

/// One usable interpreter, as persisted in `runtimes.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PythonRuntime {
    pub id: RuntimeId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RuntimeKind,
    /// Absolute install root, not the executable.
    pub path: PathBuf,
    pub version: String,
    pub is_managed: bool,
    pub created_at: String,
    pub last_used: String,
    pub status: RuntimeStatus,
    #[serde(default)]
    pub installed_packages: IndexMap<String, String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl PythonRuntime {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: RuntimeKind, path: PathBuf) -> Self {
        let stamp = now_rfc3339();
        Self {
            id: RuntimeId::generate(),
            name: name.into(),
            kind,
            path,
            version: String::new(),
            is_managed: false,
            created_at: stamp.clone(),
            last_used: stamp,
            status: RuntimeStatus::NotInitialized,
            installed_packages: IndexMap::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// The interpreter executable for this install root, OS-aware.
    ///
    /// Prefers whatever actually exists on disk; falls back to the
    /// conventional location for the current OS so callers get a sensible
    /// path for error messages even when the install is gone.
    #[must_use]
    pub fn executable_path(&self) -> PathBuf {
        executable_under(&self.path)
    }

    pub fn touch(&mut self) {
        self.last_used = now_rfc3339();
    }
}

/// Candidate executable locations under a Python install root, most
/// specific first. Embedded Windows layouts keep `python.exe` at the root;
/// venvs use `Scripts/`; Unix installs use `bin/`.
#[must_use]
pub fn executable_under(root: &Path) -> PathBuf {
    let candidates: &[&[&str]] = if cfg!(windows) {
        &[
            &["python.exe"],
            &["Scripts", "python.exe"],
            &["bin", "python3"],
        ]
    } else {
        &[
            &["bin", "python3"],
            &["bin", "python"],
            &["python.exe"],
        ]
    };
    for parts in candidates {
        let mut path = root.to_path_buf();
        for part in *parts {
            path.push(part);
        }
        if path.is_file() {
            return path;
        }
    }
    if cfg!(windows) {
        root.join("python.exe")
    } else {
        root.join("bin").join("python3")
    }
}
