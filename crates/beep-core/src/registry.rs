use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, warn};
use which::which;

use beep_domain::{
    DataLayout, PythonRuntime, RegistryDocument, RuntimeId, RuntimeKind, RuntimeStatus,
};

use crate::diagnostics::probe_python;
use crate::fsops::{atomic_write_json, python_install_root, read_json_or_default, remove_tree_if_exists};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("runtime {0} is not in the registry")]
    NotFound(RuntimeId),
    #[error("runtime {0} is not managed by this host")]
    NotManaged(RuntimeId),
    #[error("a runtime is already registered at {0}")]
    DuplicatePath(PathBuf),
    #[error("{kind:?} runtimes need an explicit path")]
    PathRequired { kind: RuntimeKind },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Persistent catalog of Python runtimes. One process-local lock guards
/// the in-memory document; every mutation is followed by an atomic write
/// of `runtimes.json`, so readers across restarts see the last completed
/// mutation.
pub struct RuntimeRegistry {
    layout: DataLayout,
    state: Mutex<RegistryDocument>,
}

impl RuntimeRegistry {
    /// Load the registry document; when it is empty, discover interpreters
    /// already on the machine.
    pub fn initialize(layout: DataLayout) -> Result<Self> {
        layout.ensure_dirs()?;
        let document: RegistryDocument = read_json_or_default(&layout.registry_path());
        let registry = Self {
            layout,
            state: Mutex::new(document),
        };
        let empty = registry.with_state(|doc| doc.runtimes.is_empty())?;
        if empty {
            let found = registry.discover()?;
            debug!(count = found.len(), "registry seeded from discovery");
        }
        Ok(registry)
    }

    #[must_use]
    pub fn list(&self) -> Vec<PythonRuntime> {
        self.lock().runtimes.clone()
    }

    #[must_use]
    pub fn get(&self, id: &RuntimeId) -> Option<PythonRuntime> {
        self.lock().find(id).cloned()
    }

    #[must_use]
    pub fn get_by_path(&self, path: &Path) -> Option<PythonRuntime> {
        self.lock().find_by_path(path).cloned()
    }

    #[must_use]
    pub fn get_default(&self) -> Option<PythonRuntime> {
        self.lock().default_runtime().cloned()
    }

    pub fn set_default(&self, id: &RuntimeId) -> Result<(), RegistryError> {
        let mut state = self.lock();
        if state.find(id).is_none() {
            return Err(RegistryError::NotFound(id.clone()));
        }
        state.default_runtime_id = Some(id.clone());
        self.save(&state)?;
        Ok(())
    }

    /// Record a runtime the host owns, in `NotInitialized`, allocating its
    /// managed directory. Embedded runtimes default to `embedded/`,
    /// virtual environments to `venvs/<name>`; other kinds need an
    /// explicit path.
    pub fn register_managed(
        &self,
        name: &str,
        kind: RuntimeKind,
        path: Option<PathBuf>,
    ) -> Result<PythonRuntime, RegistryError> {
        let path = match (path, kind) {
            (Some(path), _) => path,
            (None, RuntimeKind::Embedded) => self.layout.embedded_dir(),
            (None, RuntimeKind::VirtualEnv) => self.layout.venv_dir(name),
            (None, kind) => return Err(RegistryError::PathRequired { kind }),
        };
        let mut state = self.lock();
        if state.find_by_path(&path).is_some() {
            return Err(RegistryError::DuplicatePath(path));
        }
        let mut record = PythonRuntime::new(name, kind, path);
        record.is_managed = true;
        let record_out = record.clone();
        state.runtimes.push(record);
        if state.default_runtime_id.is_none() {
            state.default_runtime_id = Some(record_out.id.clone());
        }
        self.save(&state)?;
        Ok(record_out)
    }

    /// Upsert a fully-formed record by path, preserving an existing id.
    pub fn upsert(&self, record: PythonRuntime) -> Result<RuntimeId, RegistryError> {
        let mut state = self.lock();
        let id = state.upsert_by_path(record);
        if state.default_runtime_id.is_none() {
            state.default_runtime_id = Some(id.clone());
        }
        self.save(&state)?;
        Ok(id)
    }

    /// Delete a managed runtime: files first, then the record. Deleting
    /// the default promotes any remaining runtime.
    pub fn delete(&self, id: &RuntimeId) -> Result<(), RegistryError> {
        let mut state = self.lock();
        let record = state
            .find(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        if !record.is_managed {
            return Err(RegistryError::NotManaged(id.clone()));
        }
        remove_tree_if_exists(&record.path).map_err(RegistryError::Other)?;
        state.remove(id);
        self.save(&state)?;
        Ok(())
    }

    /// Thread-safe edit-then-persist.
    pub fn update(
        &self,
        id: &RuntimeId,
        mutator: impl FnOnce(&mut PythonRuntime),
    ) -> Result<PythonRuntime, RegistryError> {
        let mut state = self.lock();
        let record = state
            .find_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        mutator(record);
        let updated = record.clone();
        self.save(&state)?;
        Ok(updated)
    }

    pub fn mark_used(&self, id: &RuntimeId) -> Result<(), RegistryError> {
        self.update(id, PythonRuntime::touch).map(|_| ())
    }

    /// Re-probe the machine and upsert every interpreter found. Records
    /// keep their ids; paths stay unique.
    pub fn discover(&self) -> Result<Vec<PythonRuntime>> {
        let mut found = Vec::new();
        let mut seen_roots = BTreeSet::new();
        for executable in candidate_interpreters() {
            let report = probe_python(&executable);
            if !report.can_execute_code {
                continue;
            }
            let Some(root) = report
                .executable
                .as_deref()
                .map(PathBuf::from)
                .and_then(|exe| python_install_root(&exe))
            else {
                continue;
            };
            if !seen_roots.insert(root.clone()) {
                continue;
            }
            let kind = if report.is_conda {
                RuntimeKind::Conda
            } else {
                RuntimeKind::System
            };
            let version = report.version.clone().unwrap_or_default();
            let mut record = PythonRuntime::new(
                format!("{} {version}", kind_label(kind)),
                kind,
                root,
            );
            record.version = version;
            record.status = RuntimeStatus::Ready;
            record.installed_packages = report
                .installed_packages
                .iter()
                .map(|package| (package.name.clone(), package.version.clone()))
                .collect();
            record.warnings = report.warnings.clone();
            found.push(record);
        }

        let mut state = self.lock();
        let mut upserted = Vec::new();
        for record in found {
            let id = state.upsert_by_path(record);
            if let Some(runtime) = state.find(&id) {
                upserted.push(runtime.clone());
            }
        }
        if state.default_runtime_id.is_none() {
            state.default_runtime_id = state.runtimes.first().map(|runtime| runtime.id.clone());
        }
        self.save(&state)?;
        Ok(upserted)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryDocument> {
        self.state.lock().expect("registry lock")
    }

    fn with_state<T>(&self, read: impl FnOnce(&RegistryDocument) -> T) -> Result<T> {
        Ok(read(&self.lock()))
    }

    fn save(&self, document: &RegistryDocument) -> Result<()> {
        if let Err(reason) = document.validate() {
            warn!(reason, "registry document failed validation before write");
        }
        atomic_write_json(&self.layout.registry_path(), document)
            .with_context(|| "persisting runtime registry".to_string())
    }
}

fn kind_label(kind: RuntimeKind) -> &'static str {
    match kind {
        RuntimeKind::Embedded => "embedded",
        RuntimeKind::System => "system",
        RuntimeKind::Conda => "conda",
        RuntimeKind::VirtualEnv => "venv",
    }
}

/// Interpreter executables worth probing: PATH lookups first, then the
/// usual install roots.
fn candidate_interpreters() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for name in ["python3", "python"] {
        if let Ok(path) = which(name) {
            candidates.push(path);
        }
    }
    let mut roots: Vec<PathBuf> = Vec::new();
    if let Some(home) = dirs_next::home_dir() {
        roots.push(home.join("miniconda3"));
        roots.push(home.join("anaconda3"));
        roots.push(home.join(".conda"));
    }
    if cfg!(windows) {
        for version in ["Python313", "Python312", "Python311", "Python310"] {
            roots.push(PathBuf::from(r"C:\").join(version));
        }
    } else {
        roots.push(PathBuf::from("/opt/homebrew"));
        roots.push(PathBuf::from("/usr/local"));
    }
    for root in roots {
        let executable = beep_domain::runtime::executable_under(&root);
        if executable.is_file() {
            candidates.push(executable);
        }
    }
    candidates
}
