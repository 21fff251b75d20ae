use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, warn};

use beep_domain::{DataLayout, EnvId, PythonRuntime, RuntimeId, SessionId, VirtualEnvironment};

use crate::fsops::{copy_tree, python_install_root, remove_tree_if_exists};
use crate::process::run_command;
use crate::registry::RuntimeRegistry;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("a virtual environment already exists at {0}")]
    AlreadyExists(PathBuf),
    #[error("base runtime {0} is missing or has no interpreter")]
    BaseRuntimeMissing(RuntimeId),
    #[error("virtual environment creation failed: {details}")]
    CreateFailed { details: String },
    #[error("environment {env} is in use by {count} bound session(s)")]
    InUse { env: EnvId, count: usize },
    #[error("environment {0} is not known")]
    Unknown(EnvId),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The interpreter inside a venv, OS-aware: `Scripts\python.exe` on
/// Windows, `bin/python` elsewhere.
#[must_use]
pub fn python_executable(env_path: &Path) -> PathBuf {
    if cfg!(windows) {
        env_path.join("Scripts").join("python.exe")
    } else {
        env_path.join("bin").join("python")
    }
}

fn scripts_dir(env_path: &Path) -> PathBuf {
    if cfg!(windows) {
        env_path.join("Scripts")
    } else {
        env_path.join("bin")
    }
}

/// Creates, clones, and deletes virtual environments derived from a base
/// runtime. The catalog is rebuilt from `venvs/` on startup; ids are
/// path-derived, so records keep their identity across restarts.
pub struct EnvManager {
    layout: DataLayout,
    envs: Mutex<HashMap<EnvId, VirtualEnvironment>>,
}

impl EnvManager {
    #[must_use]
    pub fn new(layout: DataLayout) -> Self {
        Self {
            layout,
            envs: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild the catalog by scanning `venvs/`. Each directory's
    /// `pyvenv.cfg` points back at its base interpreter; bases missing
    /// from the registry are registered so referential integrity holds.
    pub fn rehydrate(&self, registry: &RuntimeRegistry) -> Result<usize> {
        let venvs_dir = self.layout.venvs_dir();
        if !venvs_dir.is_dir() {
            return Ok(0);
        }
        let mut count = 0;
        for entry in fs::read_dir(&venvs_dir)
            .with_context(|| format!("failed to list {}", venvs_dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || !path.join("pyvenv.cfg").is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match self.base_runtime_for(&path, registry) {
                Ok(base_id) => {
                    let env = VirtualEnvironment::new(name, base_id, path, None);
                    self.insert(env);
                    count += 1;
                }
                Err(err) => {
                    warn!(venv = %path.display(), error = %err, "skipping unreadable venv");
                }
            }
        }
        debug!(count, "rehydrated virtual environments");
        Ok(count)
    }

    /// Create a venv off `base` by invoking its interpreter with the venv
    /// module, blocking until it exits.
    pub fn create(
        &self,
        base: &PythonRuntime,
        name: &str,
        path: Option<PathBuf>,
        created_by: Option<String>,
    ) -> Result<VirtualEnvironment, EnvError> {
        let path = path.unwrap_or_else(|| self.layout.venv_dir(name));
        if path.exists() {
            return Err(EnvError::AlreadyExists(path));
        }
        let base_exe = base.executable_path();
        if !base_exe.is_file() {
            return Err(EnvError::BaseRuntimeMissing(base.id.clone()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| EnvError::Other(err.into()))?;
        }
        let output = run_command(
            &base_exe,
            &[
                "-m".to_string(),
                "venv".to_string(),
                path.to_string_lossy().to_string(),
            ],
            &[],
            &base.path,
        )?;
        if output.code != 0 {
            // A failed create leaves a partial tree behind; remove it so a
            // retry starts clean.
            let _ = remove_tree_if_exists(&path);
            return Err(EnvError::CreateFailed {
                details: if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                },
            });
        }
        let env = VirtualEnvironment::new(name, base.id.clone(), path, created_by);
        self.insert(env.clone());
        Ok(env)
    }

    /// Register an existing venv directory without creating anything.
    pub fn adopt(
        &self,
        base_runtime_id: RuntimeId,
        name: &str,
        path: PathBuf,
        managed: bool,
    ) -> VirtualEnvironment {
        let mut env = VirtualEnvironment::new(name, base_runtime_id, path, None);
        env.is_managed = managed;
        self.insert(env.clone());
        env
    }

    /// File-copy clone. `pyvenv.cfg` still points at the same base;
    /// activation scripts and console-script shebangs are rewritten to the
    /// new prefix.
    pub fn clone_env(&self, src: &EnvId, dst_name: &str) -> Result<VirtualEnvironment, EnvError> {
        let source = self.get(src).ok_or_else(|| EnvError::Unknown(src.clone()))?;
        let dst_path = self.layout.venv_dir(dst_name);
        if dst_path.exists() {
            return Err(EnvError::AlreadyExists(dst_path));
        }
        copy_tree(&source.path, &dst_path)?;
        rewrite_prefix_references(&source.path, &dst_path)?;
        let env = VirtualEnvironment::new(
            dst_name,
            source.base_runtime_id.clone(),
            dst_path,
            source.created_by.clone(),
        );
        self.insert(env.clone());
        Ok(env)
    }

    /// Refused while any session is still bound to the environment.
    pub fn delete(&self, id: &EnvId) -> Result<(), EnvError> {
        let mut envs = self.lock();
        let env = envs.get(id).ok_or_else(|| EnvError::Unknown(id.clone()))?;
        if !env.sessions.is_empty() {
            return Err(EnvError::InUse {
                env: id.clone(),
                count: env.sessions.len(),
            });
        }
        remove_tree_if_exists(&env.path)?;
        envs.remove(id);
        Ok(())
    }

    /// Environments with no bound sessions, eligible for an explicitly
    /// requested cleanup. Nothing here is ever deleted automatically.
    #[must_use]
    pub fn cleanup_candidates(&self) -> Vec<VirtualEnvironment> {
        self.lock()
            .values()
            .filter(|env| env.sessions.is_empty())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: &EnvId) -> Option<VirtualEnvironment> {
        self.lock().get(id).cloned()
    }

    #[must_use]
    pub fn get_by_path(&self, path: &Path) -> Option<VirtualEnvironment> {
        self.lock()
            .values()
            .find(|env| env.path == path)
            .cloned()
    }

    #[must_use]
    pub fn list(&self) -> Vec<VirtualEnvironment> {
        self.lock().values().cloned().collect()
    }

    pub fn bind_session(&self, id: &EnvId, session: SessionId) -> Result<(), EnvError> {
        let mut envs = self.lock();
        let env = envs
            .get_mut(id)
            .ok_or_else(|| EnvError::Unknown(id.clone()))?;
        env.bind_session(session);
        Ok(())
    }

    pub fn unbind_session(&self, id: &EnvId, session: &SessionId) {
        if let Some(env) = self.lock().get_mut(id) {
            env.unbind_session(session);
        }
    }

    fn base_runtime_for(&self, venv: &Path, registry: &RuntimeRegistry) -> Result<RuntimeId> {
        let base_exe = base_interpreter_from_cfg(venv)?;
        let root = python_install_root(&base_exe)
            .ok_or_else(|| anyhow::anyhow!("cannot determine install root of {}", base_exe.display()))?;
        if let Some(existing) = registry.get_by_path(&root) {
            return Ok(existing.id);
        }
        let report = crate::diagnostics::probe_python(&base_exe);
        let mut record = PythonRuntime::new(
            format!("base of {}", venv.display()),
            beep_domain::RuntimeKind::System,
            root,
        );
        record.version = report.version.unwrap_or_default();
        record.status = if report.can_execute_code {
            beep_domain::RuntimeStatus::Ready
        } else {
            beep_domain::RuntimeStatus::Error
        };
        registry
            .upsert(record)
            .map_err(|err| anyhow::anyhow!("registering rehydrated base: {err}"))
    }

    fn insert(&self, env: VirtualEnvironment) {
        self.lock().insert(env.id.clone(), env);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EnvId, VirtualEnvironment>> {
        self.envs.lock().expect("env catalog lock")
    }
}

/// Read the base interpreter out of a venv's `pyvenv.cfg`: the
/// `executable` key when present, otherwise `<home>/python3`.
fn base_interpreter_from_cfg(venv: &Path) -> Result<PathBuf> {
    let cfg_path = venv.join("pyvenv.cfg");
    let contents = fs::read_to_string(&cfg_path)
        .with_context(|| format!("failed to read {}", cfg_path.display()))?;
    let mut home = None;
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key == "executable" {
            return Ok(PathBuf::from(value));
        }
        if key == "home" {
            home = Some(PathBuf::from(value));
        }
    }
    let home = home.ok_or_else(|| anyhow::anyhow!("pyvenv.cfg has no home entry"))?;
    for name in ["python3", "python", "python.exe"] {
        let candidate = home.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Ok(home.join("python3"))
}

/// Rewrite activation scripts and console-script shebangs after a clone so
/// they point at the new prefix.
fn rewrite_prefix_references(old_prefix: &Path, new_prefix: &Path) -> Result<()> {
    let old = old_prefix.to_string_lossy().to_string();
    let new = new_prefix.to_string_lossy().to_string();
    let scripts = scripts_dir(new_prefix);
    if !scripts.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(&scripts)
        .with_context(|| format!("failed to list {}", scripts.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Ok(contents) = fs::read_to_string(&path) else {
            // Binary launchers are left alone.
            continue;
        };
        let is_activation = entry
            .file_name()
            .to_string_lossy()
            .to_ascii_lowercase()
            .starts_with("activate");
        let rewritten = if is_activation {
            contents.replace(&old, &new)
        } else if contents.starts_with("#!") {
            match contents.split_once('\n') {
                Some((shebang, rest)) if shebang.contains(&old) => {
                    format!("{}\n{rest}", shebang.replace(&old, &new))
                }
                _ => continue,
            }
        } else {
            continue;
        };
        if rewritten != contents {
            fs::write(&path, rewritten)
                .with_context(|| format!("failed to rewrite {}", path.display()))?;
        }
    }
    Ok(())
}
