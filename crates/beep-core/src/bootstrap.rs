use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use beep_domain::clock::now_rfc3339;
use beep_domain::{DataLayout, PythonRuntime, RuntimeId, RuntimeKind, VirtualEnvironment};

use crate::engine::{ExecOptions, ExecutionEngine};
use crate::packages::PackageManager;
use crate::progress::{CancellationToken, ProgressSink};
use crate::provision::{ProvisionRequest, Provisioner};
use crate::registry::RuntimeRegistry;
use crate::session::SessionManager;
use crate::venv::EnvManager;

pub const DEFAULT_PYTHON_VERSION: &str = "3.12";
const DEFAULT_ENV_NAME: &str = "default";
const BOOTSTRAP_PRINCIPAL: &str = "bootstrap";

/// Options for `ensure_python_environment`. The defaults provision an
/// embedded interpreter and a venv named `default` with no profiles.
#[derive(Clone, Debug)]
pub struct BootstrapOptions {
    pub ensure_embedded_python: bool,
    pub embedded_python_path: Option<PathBuf>,
    pub python_version: String,
    pub create_virtual_environment: bool,
    pub virtual_environment_path: Option<PathBuf>,
    pub environment_name: Option<String>,
    pub package_profiles: Vec<String>,
    pub set_as_default: bool,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            ensure_embedded_python: true,
            embedded_python_path: None,
            python_version: DEFAULT_PYTHON_VERSION.to_string(),
            create_virtual_environment: true,
            virtual_environment_path: None,
            environment_name: None,
            package_profiles: Vec::new(),
            set_as_default: false,
        }
    }
}

/// Reported stages, in order, with a monotonically increasing percentage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapStage {
    Initializing,
    InitializingRegistry,
    LoadingProfiles,
    CheckingRuntime,
    ProvisioningPython,
    RegisteringRuntime,
    CreatingVirtualEnv,
    InstallingPackages,
    Verifying,
    Complete,
    Failed,
}

impl BootstrapStage {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::InitializingRegistry => "InitializingRegistry",
            Self::LoadingProfiles => "LoadingProfiles",
            Self::CheckingRuntime => "CheckingRuntime",
            Self::ProvisioningPython => "ProvisioningPython",
            Self::RegisteringRuntime => "RegisteringRuntime",
            Self::CreatingVirtualEnv => "CreatingVirtualEnv",
            Self::InstallingPackages => "InstallingPackages",
            Self::Verifying => "Verifying",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
        }
    }

    #[must_use]
    pub fn percent(self) -> u8 {
        match self {
            Self::Initializing => 0,
            Self::InitializingRegistry => 5,
            Self::LoadingProfiles => 10,
            Self::CheckingRuntime => 15,
            Self::ProvisioningPython => 25,
            Self::RegisteringRuntime => 55,
            Self::CreatingVirtualEnv => 62,
            Self::InstallingPackages => 70,
            Self::Verifying => 92,
            Self::Complete | Self::Failed => 100,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BootstrapResult {
    pub is_successful: bool,
    pub base_runtime_id: Option<RuntimeId>,
    pub environment_path: Option<PathBuf>,
    pub installed_profiles: Vec<String>,
    pub validation_messages: Vec<String>,
    pub started_at: String,
    pub finished_at: String,
    pub options: BootstrapOptions,
}

/// The assembled runtime fabric: registry, environments, sessions,
/// packages, engine, and provisioner wired together over one data layout.
pub struct PythonHost {
    layout: DataLayout,
    registry: Arc<RuntimeRegistry>,
    envs: Arc<EnvManager>,
    sessions: Arc<SessionManager>,
    packages: Arc<PackageManager>,
    engine: Arc<ExecutionEngine>,
    provisioner: Provisioner,
}

impl PythonHost {
    /// Load persisted state and rebuild the environment catalog.
    pub fn initialize(layout: DataLayout) -> Result<Self> {
        layout.ensure_dirs()?;
        let registry = Arc::new(RuntimeRegistry::initialize(layout.clone())?);
        let envs = Arc::new(EnvManager::new(layout.clone()));
        envs.rehydrate(&registry)?;
        let sessions = Arc::new(SessionManager::new(Arc::clone(&envs)));
        let packages = Arc::new(PackageManager::new(
            layout.clone(),
            Arc::clone(&sessions),
            Arc::clone(&envs),
        ));
        let engine = Arc::new(ExecutionEngine::new(
            Arc::clone(&sessions),
            Arc::clone(&envs),
        ));
        let provisioner = Provisioner::new(layout.clone())?;
        Ok(Self {
            layout,
            registry,
            envs,
            sessions,
            packages,
            engine,
            provisioner,
        })
    }

    #[must_use]
    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn envs(&self) -> &Arc<EnvManager> {
        &self.envs
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    #[must_use]
    pub fn packages(&self) -> &Arc<PackageManager> {
        &self.packages
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    #[must_use]
    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// One-call bootstrap: base runtime, venv, package profiles, probe.
    ///
    /// Component failures land in the result (`is_successful=false`, the
    /// error in `validation_messages`) rather than an `Err`; re-running
    /// with identical options and no external mutation downloads and
    /// installs nothing.
    pub fn ensure_python_environment(
        &self,
        options: &BootstrapOptions,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> BootstrapResult {
        let started_at = now_rfc3339();
        let mut messages = Vec::new();
        let outcome = self.bootstrap_inner(options, progress, cancel, &mut messages);
        match outcome {
            Ok((base_runtime_id, environment_path, installed_profiles)) => {
                report_stage(progress, BootstrapStage::Complete);
                BootstrapResult {
                    is_successful: true,
                    base_runtime_id: Some(base_runtime_id),
                    environment_path,
                    installed_profiles,
                    validation_messages: messages,
                    started_at,
                    finished_at: now_rfc3339(),
                    options: options.clone(),
                }
            }
            Err(err) => {
                warn!(error = %err, "bootstrap failed");
                report_stage(progress, BootstrapStage::Failed);
                messages.push(format!("{err:#}"));
                BootstrapResult {
                    is_successful: false,
                    base_runtime_id: None,
                    environment_path: None,
                    installed_profiles: Vec::new(),
                    validation_messages: messages,
                    started_at,
                    finished_at: now_rfc3339(),
                    options: options.clone(),
                }
            }
        }
    }

    fn bootstrap_inner(
        &self,
        options: &BootstrapOptions,
        progress: &ProgressSink,
        cancel: &CancellationToken,
        messages: &mut Vec<String>,
    ) -> Result<(RuntimeId, Option<PathBuf>, Vec<String>)> {
        report_stage(progress, BootstrapStage::Initializing);
        self.layout.ensure_dirs()?;
        checkpoint(cancel)?;

        report_stage(progress, BootstrapStage::InitializingRegistry);
        checkpoint(cancel)?;

        report_stage(progress, BootstrapStage::LoadingProfiles);
        let profiles = self.packages.load_profiles().context("loading profiles")?;
        for name in &options.package_profiles {
            if profiles.profile(name).is_none() {
                bail!("unknown package profile `{name}`");
            }
        }
        checkpoint(cancel)?;

        report_stage(progress, BootstrapStage::CheckingRuntime);
        let base = self.ensure_base_runtime(options, progress, cancel, messages)?;
        if options.set_as_default {
            self.registry.set_default(&base.id)?;
        }
        self.registry.mark_used(&base.id)?;
        checkpoint(cancel)?;

        let env = if options.create_virtual_environment {
            report_stage(progress, BootstrapStage::CreatingVirtualEnv);
            Some(self.ensure_environment(options, &base, messages)?)
        } else {
            None
        };
        checkpoint(cancel)?;

        report_stage(progress, BootstrapStage::InstallingPackages);
        let mut installed_profiles = Vec::new();
        if !options.package_profiles.is_empty() {
            if let Some(env) = &env {
                let session = self
                    .sessions
                    .get_or_create(BOOTSTRAP_PRINCIPAL, &env.id, false)?;
                let results = self.packages.install_profiles(
                    &session.id,
                    &env.id,
                    &options.package_profiles,
                    progress,
                    cancel,
                )?;
                installed_profiles.clone_from(&options.package_profiles);
                messages.push(format!("{} package requirement(s) processed", results.len()));
            } else {
                messages.push("no virtual environment; package profiles skipped".to_string());
            }
        }
        checkpoint(cancel)?;

        report_stage(progress, BootstrapStage::Verifying);
        if let Some(env) = &env {
            let session = self
                .sessions
                .get_or_create(BOOTSTRAP_PRINCIPAL, &env.id, false)?;
            let result = self
                .engine
                .execute(&session.id, "print('hello')", &ExecOptions::default())
                .context("verification probe")?;
            if !result.success {
                bail!(
                    "environment verification failed: {}",
                    result
                        .error
                        .unwrap_or_else(|| result.stderr.trim().to_string())
                );
            }
            self.engine
                .release_session(&session.id)
                .context("releasing bootstrap session")?;
        } else {
            self.provisioner.verify(&base.path)?;
        }

        debug!(base = %base.id, "bootstrap complete");
        Ok((base.id, env.map(|env| env.path), installed_profiles))
    }

    fn ensure_base_runtime(
        &self,
        options: &BootstrapOptions,
        progress: &ProgressSink,
        cancel: &CancellationToken,
        messages: &mut Vec<String>,
    ) -> Result<PythonRuntime> {
        if !options.ensure_embedded_python {
            if let Some(default) = self.registry.get_default() {
                messages.push(format!("using runtime {} ({})", default.name, default.id));
                return Ok(default);
            }
            let discovered = self.registry.discover()?;
            if let Some(first) = discovered.into_iter().next() {
                messages.push(format!("discovered runtime {}", first.name));
                return Ok(first);
            }
            bail!("no python runtime available and embedded provisioning is disabled");
        }

        // Prefer an already-managed embedded install; `ensure` short
        // circuits on a verified directory, so a warm call never downloads.
        let install_dir = options.embedded_python_path.clone().or_else(|| {
            self.registry
                .list()
                .into_iter()
                .find(|runtime| runtime.kind == RuntimeKind::Embedded && runtime.is_managed)
                .map(|runtime| runtime.path)
        });
        let needs_provision = !install_dir
            .as_deref()
            .unwrap_or(&self.layout.embedded_dir())
            .exists();
        if needs_provision {
            report_stage(progress, BootstrapStage::ProvisioningPython);
        }

        let mut request = ProvisionRequest::new(options.python_version.clone());
        request.install_dir = install_dir;
        let record = self.provisioner.ensure(&request, progress, cancel)?;

        report_stage(progress, BootstrapStage::RegisteringRuntime);
        let id = self.registry.upsert(record)?;
        self.registry
            .get(&id)
            .ok_or_else(|| anyhow::anyhow!("registered runtime {id} disappeared"))
    }

    fn ensure_environment(
        &self,
        options: &BootstrapOptions,
        base: &PythonRuntime,
        messages: &mut Vec<String>,
    ) -> Result<VirtualEnvironment> {
        let name = options
            .environment_name
            .clone()
            .unwrap_or_else(|| DEFAULT_ENV_NAME.to_string());
        let path = options
            .virtual_environment_path
            .clone()
            .unwrap_or_else(|| self.layout.venv_dir(&name));

        if let Some(existing) = self.envs.get_by_path(&path) {
            messages.push(format!("reusing environment {}", existing.name));
            return Ok(existing);
        }
        if path.join("pyvenv.cfg").is_file() {
            messages.push(format!("adopting environment at {}", path.display()));
            return Ok(self.envs.adopt(base.id.clone(), &name, path, true));
        }
        let env = self.envs.create(
            base,
            &name,
            Some(path),
            Some(BOOTSTRAP_PRINCIPAL.to_string()),
        )?;
        messages.push(format!("created environment {}", env.name));
        Ok(env)
    }
}

fn report_stage(progress: &ProgressSink, stage: BootstrapStage) {
    progress.phase(stage.label(), stage.percent());
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        bail!("bootstrap cancelled");
    }
    Ok(())
}
