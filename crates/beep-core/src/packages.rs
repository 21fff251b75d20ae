use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use beep_domain::{
    DataLayout, EnvId, InstallSource, MessageLevel, PackageOperationResult, PackageRecord,
    PackageRequirement, ProfileDocument, Session, SessionId, VirtualEnvironment,
};

use crate::fsops::{atomic_write_json, read_json_or_default};
use crate::process::{run_command, run_streaming, StreamedOutput};
use crate::progress::{CancellationToken, ProgressSink};
use crate::session::{SessionError, SessionManager};
use crate::venv::{python_executable, EnvError, EnvManager};

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("session {0} is unknown")]
    UnknownSession(SessionId),
    #[error("session {0} has been terminated")]
    SessionGone(SessionId),
    #[error("environment {0} no longer exists")]
    EnvGone(EnvId),
    #[error("session {session} is not bound to environment {env}")]
    EnvMismatch { session: SessionId, env: EnvId },
    #[error("unknown package profile `{0}`")]
    UnknownProfile(String),
    #[error("installing {package} failed: {message}")]
    ProfileInstallFailed {
        package: String,
        message: String,
        result: Box<PackageOperationResult>,
    },
    #[error("package operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<SessionError> for PackageError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Unknown(id) => Self::UnknownSession(id),
            SessionError::Gone(id) => Self::SessionGone(id),
            SessionError::Env(EnvError::Unknown(id)) => Self::EnvGone(id),
            SessionError::Env(other) => Self::Other(other.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PackageOp {
    Install,
    Remove,
    Upgrade,
    RequirementsFile,
}

/// Installs, removes, and inspects packages inside an environment through
/// that environment's own tooling. One installer subprocess runs per env
/// at a time; output is streamed line-by-line to the caller's progress
/// channel and classified against tool-specific outcome markers.
pub struct PackageManager {
    layout: DataLayout,
    sessions: Arc<SessionManager>,
    envs: Arc<EnvManager>,
    env_locks: Mutex<HashMap<EnvId, Arc<Mutex<()>>>>,
}

impl PackageManager {
    #[must_use]
    pub fn new(layout: DataLayout, sessions: Arc<SessionManager>, envs: Arc<EnvManager>) -> Self {
        Self {
            layout,
            sessions,
            envs,
            env_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn install(
        &self,
        session: &SessionId,
        env: &EnvId,
        name: &str,
        version: Option<&str>,
        use_conda: bool,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PackageOperationResult, PackageError> {
        let target = install_target(name, version);
        self.run_operation(
            session,
            env,
            use_conda,
            PackageOp::Install,
            &target,
            name,
            None,
            progress,
            cancel,
        )
    }

    pub fn install_requirement(
        &self,
        session: &SessionId,
        env: &EnvId,
        requirement: &PackageRequirement,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PackageOperationResult, PackageError> {
        let use_conda = requirement.source == InstallSource::Conda;
        self.run_operation(
            session,
            env,
            use_conda,
            PackageOp::Install,
            &requirement.install_spec(),
            &requirement.name,
            requirement.index_url.as_deref(),
            progress,
            cancel,
        )
    }

    pub fn remove(
        &self,
        session: &SessionId,
        env: &EnvId,
        name: &str,
        use_conda: bool,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PackageOperationResult, PackageError> {
        self.run_operation(
            session,
            env,
            use_conda,
            PackageOp::Remove,
            name,
            name,
            None,
            progress,
            cancel,
        )
    }

    pub fn upgrade(
        &self,
        session: &SessionId,
        env: &EnvId,
        name: &str,
        use_conda: bool,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PackageOperationResult, PackageError> {
        self.run_operation(
            session,
            env,
            use_conda,
            PackageOp::Upgrade,
            name,
            name,
            None,
            progress,
            cancel,
        )
    }

    pub fn install_from_requirements_file(
        &self,
        session: &SessionId,
        env: &EnvId,
        path: &Path,
        use_conda: bool,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PackageOperationResult, PackageError> {
        let target = path.to_string_lossy().to_string();
        self.run_operation(
            session,
            env,
            use_conda,
            PackageOp::RequirementsFile,
            &target,
            &target,
            None,
            progress,
            cancel,
        )
    }

    pub fn list_installed(
        &self,
        session: &SessionId,
        env: &EnvId,
        use_conda: bool,
    ) -> Result<Vec<PackageRecord>, PackageError> {
        let (_, env) = self.checked_context(session, env)?;
        list_in_env(&env, use_conda).map_err(PackageError::Other)
    }

    pub fn get_version(
        &self,
        session: &SessionId,
        env: &EnvId,
        name: &str,
        use_conda: bool,
    ) -> Result<Option<String>, PackageError> {
        let wanted = normalize_name(name);
        Ok(self
            .list_installed(session, env, use_conda)?
            .into_iter()
            .find(|package| normalize_name(&package.name) == wanted)
            .map(|package| package.version))
    }

    pub fn is_installed(
        &self,
        session: &SessionId,
        env: &EnvId,
        name: &str,
        use_conda: bool,
    ) -> Result<bool, PackageError> {
        Ok(self.get_version(session, env, name, use_conda)?.is_some())
    }

    /// Write the environment's pinned package list to `output_path`.
    pub fn freeze(
        &self,
        session: &SessionId,
        env: &EnvId,
        output_path: &Path,
        use_conda: bool,
    ) -> Result<(), PackageError> {
        let (_, env) = self.checked_context(session, env)?;
        let output = if use_conda {
            run_command(
                Path::new("conda"),
                &[
                    "list".to_string(),
                    "--prefix".to_string(),
                    env.path.to_string_lossy().to_string(),
                    "--export".to_string(),
                ],
                &[],
                &env.path,
            )
        } else {
            run_command(
                &python_executable(&env.path),
                &["-m".to_string(), "pip".to_string(), "freeze".to_string()],
                &[],
                &env.path,
            )
        }
        .map_err(PackageError::Other)?;
        if output.code != 0 {
            return Err(PackageError::Other(anyhow::anyhow!(
                "freeze exited with {}: {}",
                output.code,
                output.stderr.trim()
            )));
        }
        fs::write(output_path, output.stdout)
            .with_context(|| format!("failed to write {}", output_path.display()))
            .map_err(PackageError::Other)?;
        Ok(())
    }

    /// Resolve named profiles to concrete requirements and install them in
    /// order, skipping requirements the environment already satisfies.
    /// Reports `{current, total, package}` progress and honors
    /// cancellation between packages.
    pub fn install_profiles(
        &self,
        session: &SessionId,
        env: &EnvId,
        names: &[String],
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<PackageOperationResult>, PackageError> {
        let document = self.load_profiles()?;
        let mut requirements: Vec<PackageRequirement> = Vec::new();
        for name in names {
            let profile = document
                .profile(name)
                .ok_or_else(|| PackageError::UnknownProfile(name.clone()))?;
            for requirement in profile {
                if !requirements
                    .iter()
                    .any(|seen| normalize_name(&seen.name) == normalize_name(&requirement.name))
                {
                    requirements.push(requirement.clone());
                }
            }
        }

        let installed: HashMap<String, String> = self
            .list_installed(session, env, false)?
            .into_iter()
            .map(|package| (normalize_name(&package.name), package.version))
            .collect();

        let total = requirements.len();
        let mut results = Vec::with_capacity(total);
        for (index, requirement) in requirements.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(PackageError::Cancelled);
            }
            progress.package(index + 1, total, &requirement.name);
            let satisfied = installed
                .get(&normalize_name(&requirement.name))
                .is_some_and(|version| requirement.accepts_version(version));
            if satisfied {
                debug!(package = %requirement.name, "requirement already satisfied");
                results.push(PackageOperationResult {
                    success: true,
                    level: MessageLevel::Info,
                    message: format!("{} is already satisfied", requirement.name),
                    package: requirement.name.clone(),
                    details: String::new(),
                    command_executed: format!("pip install {}", requirement.install_spec()),
                });
                continue;
            }
            let result = self.install_requirement(session, env, requirement, progress, cancel)?;
            if !result.success {
                return Err(PackageError::ProfileInstallFailed {
                    package: requirement.name.clone(),
                    message: result.message.clone(),
                    result: Box::new(result),
                });
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Load `package-requirements.json`, seeding and persisting the stock
    /// profiles on first use.
    pub fn load_profiles(&self) -> Result<ProfileDocument, PackageError> {
        let path = self.layout.profiles_path();
        let document: ProfileDocument = read_json_or_default(&path);
        if document.profiles.is_empty() {
            let seeded = ProfileDocument::seeded();
            atomic_write_json(&path, &seeded).map_err(PackageError::Other)?;
            return Ok(seeded);
        }
        Ok(document)
    }

    pub fn save_profiles(&self, document: &ProfileDocument) -> Result<(), PackageError> {
        atomic_write_json(&self.layout.profiles_path(), document).map_err(PackageError::Other)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_operation(
        &self,
        session: &SessionId,
        env: &EnvId,
        use_conda: bool,
        op: PackageOp,
        target: &str,
        package: &str,
        index_url: Option<&str>,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PackageOperationResult, PackageError> {
        let (_, env) = self.checked_context(session, env)?;
        let lock = self.env_lock(&env.id);
        let _serialized = lock.lock().expect("env install lock");
        if cancel.is_cancelled() {
            return Err(PackageError::Cancelled);
        }

        let command = build_command(&env.path, use_conda, op, target, index_url);
        debug!(command = %command.display, env = %env.id, "running package operation");
        let streamed = run_streaming(
            &command.program,
            &command.args,
            &[],
            &env.path,
            cancel,
            &mut |line| progress.message(line),
        )
        .map_err(PackageError::Other)?;
        if streamed.cancelled {
            return Err(PackageError::Cancelled);
        }

        let (success, level, message) = if use_conda {
            classify_conda(op, &streamed)
        } else {
            classify_pip(op, &streamed)
        };
        Ok(PackageOperationResult {
            success,
            level,
            message,
            package: package.to_string(),
            details: format!("{}\n{}", streamed.stdout.trim_end(), streamed.stderr.trim_end())
                .trim()
                .to_string(),
            command_executed: command.display,
        })
    }

    fn checked_context(
        &self,
        session: &SessionId,
        env: &EnvId,
    ) -> Result<(Session, VirtualEnvironment), PackageError> {
        let session = self.sessions.active_session(session)?;
        if &session.env_id != env {
            return Err(PackageError::EnvMismatch {
                session: session.id,
                env: env.clone(),
            });
        }
        let env = self
            .envs
            .get(env)
            .ok_or_else(|| PackageError::EnvGone(env.clone()))?;
        self.sessions.touch(&session.id);
        Ok((session, env))
    }

    fn env_lock(&self, env: &EnvId) -> Arc<Mutex<()>> {
        let mut locks = self.env_locks.lock().expect("env lock table");
        Arc::clone(locks.entry(env.clone()).or_default())
    }
}

fn install_target(name: &str, version: Option<&str>) -> String {
    match version {
        None => name.to_string(),
        Some(version)
            if version.starts_with(['=', '>', '<', '!', '~']) =>
        {
            format!("{name}{version}")
        }
        Some(version) => format!("{name}=={version}"),
    }
}

fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase().replace('_', "-")
}

struct PackageCommand {
    program: PathBuf,
    args: Vec<String>,
    /// Logical command shown to callers, e.g. `pip install numpy==1.26`.
    display: String,
}

fn build_command(
    env_path: &Path,
    use_conda: bool,
    op: PackageOp,
    target: &str,
    index_url: Option<&str>,
) -> PackageCommand {
    if use_conda {
        let prefix = env_path.to_string_lossy().to_string();
        let (verb, mut tail) = match op {
            PackageOp::Install => ("install", vec![target.to_string()]),
            PackageOp::Remove => ("remove", vec![target.to_string()]),
            PackageOp::Upgrade => ("update", vec![target.to_string()]),
            PackageOp::RequirementsFile => {
                ("install", vec!["--file".to_string(), target.to_string()])
            }
        };
        let mut args = vec![
            verb.to_string(),
            "--prefix".to_string(),
            prefix,
            "--yes".to_string(),
        ];
        args.append(&mut tail);
        PackageCommand {
            program: PathBuf::from("conda"),
            args,
            display: format!("conda {verb} {target}"),
        }
    } else {
        let mut tail = match op {
            PackageOp::Install => vec!["install".to_string(), target.to_string()],
            PackageOp::Remove => {
                vec!["uninstall".to_string(), "--yes".to_string(), target.to_string()]
            }
            PackageOp::Upgrade => vec![
                "install".to_string(),
                "--upgrade".to_string(),
                target.to_string(),
            ],
            PackageOp::RequirementsFile => {
                vec!["install".to_string(), "-r".to_string(), target.to_string()]
            }
        };
        if let Some(url) = index_url {
            tail.push("--index-url".to_string());
            tail.push(url.to_string());
        }
        let display = format!("pip {}", tail.join(" "));
        let mut args = vec![
            "-m".to_string(),
            "pip".to_string(),
            "--disable-pip-version-check".to_string(),
        ];
        args.append(&mut tail);
        PackageCommand {
            program: python_executable(env_path),
            args,
            display,
        }
    }
}

fn list_in_env(env: &VirtualEnvironment, use_conda: bool) -> anyhow::Result<Vec<PackageRecord>> {
    #[derive(Deserialize)]
    struct ListEntry {
        name: String,
        version: String,
    }

    let output = if use_conda {
        run_command(
            Path::new("conda"),
            &[
                "list".to_string(),
                "--prefix".to_string(),
                env.path.to_string_lossy().to_string(),
                "--json".to_string(),
            ],
            &[],
            &env.path,
        )?
    } else {
        run_command(
            &python_executable(&env.path),
            &[
                "-m".to_string(),
                "pip".to_string(),
                "list".to_string(),
                "--format=json".to_string(),
                "--disable-pip-version-check".to_string(),
            ],
            &[],
            &env.path,
        )?
    };
    if output.code != 0 {
        anyhow::bail!(
            "package listing exited with {}: {}",
            output.code,
            output.stderr.trim()
        );
    }
    let entries: Vec<ListEntry> = serde_json::from_str(output.stdout.trim())
        .context("unparseable package listing")?;
    Ok(entries
        .into_iter()
        .map(|entry| PackageRecord {
            name: entry.name,
            version: entry.version,
        })
        .collect())
}

fn first_line_containing<'a>(haystack: &'a str, needle: &str) -> Option<&'a str> {
    haystack
        .lines()
        .find(|line| line.contains(needle))
        .map(str::trim)
}

fn classify_pip(op: PackageOp, output: &StreamedOutput) -> (bool, MessageLevel, String) {
    let combined = format!("{}\n{}", output.stdout, output.stderr);
    if let Some(line) = first_line_containing(&combined, "No matching distribution found") {
        return (false, MessageLevel::Error, line.to_string());
    }
    if let Some(line) = first_line_containing(&combined, "ERROR:") {
        return (false, MessageLevel::Error, line.to_string());
    }
    if output.code != 0 {
        let line = output
            .stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map_or_else(|| format!("pip exited with {}", output.code), str::to_string);
        return (false, MessageLevel::Error, line);
    }
    let success_markers: &[&str] = match op {
        PackageOp::Remove => &["Successfully uninstalled", "as it is not installed"],
        _ => &["Successfully installed", "Requirement already satisfied"],
    };
    for marker in success_markers {
        if let Some(line) = first_line_containing(&combined, marker) {
            return (true, MessageLevel::Info, line.to_string());
        }
    }
    (
        false,
        MessageLevel::Warning,
        "pip output did not confirm the operation".to_string(),
    )
}

fn classify_conda(_op: PackageOp, output: &StreamedOutput) -> (bool, MessageLevel, String) {
    let combined = format!("{}\n{}", output.stdout, output.stderr);
    for marker in ["PackagesNotFoundError", "CondaError", "CondaHTTPError"] {
        if let Some(line) = first_line_containing(&combined, marker) {
            return (false, MessageLevel::Error, line.to_string());
        }
    }
    if output.code != 0 {
        return (
            false,
            MessageLevel::Error,
            format!("conda exited with {}", output.code),
        );
    }
    for marker in [
        "Executing transaction",
        "All requested packages already installed",
        "Transaction finished",
    ] {
        if let Some(line) = first_line_containing(&combined, marker) {
            return (true, MessageLevel::Info, line.to_string());
        }
    }
    (
        false,
        MessageLevel::Warning,
        "conda output did not confirm the operation".to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use beep_domain::RuntimeId;
    use tempfile::TempDir;

    fn streamed(code: i32, stdout: &str, stderr: &str) -> StreamedOutput {
        StreamedOutput {
            code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            cancelled: false,
        }
    }

    #[test]
    fn pip_success_markers_classify_as_success() {
        let (success, level, message) = classify_pip(
            PackageOp::Install,
            &streamed(0, "Collecting numpy\nSuccessfully installed numpy-1.26.4\n", ""),
        );
        assert!(success);
        assert_eq!(level, MessageLevel::Info);
        assert!(message.contains("Successfully installed"));

        let (success, _, message) = classify_pip(
            PackageOp::Install,
            &streamed(0, "Requirement already satisfied: pip in ./lib\n", ""),
        );
        assert!(success);
        assert!(message.contains("already satisfied"));
    }

    #[test]
    fn missing_distribution_is_an_error_even_with_exit_zero() {
        let output = streamed(
            1,
            "",
            "ERROR: Could not find a version that satisfies the requirement this-package-does-not-exist-xyz\n\
             ERROR: No matching distribution found for this-package-does-not-exist-xyz\n",
        );
        let (success, level, message) = classify_pip(PackageOp::Install, &output);
        assert!(!success);
        assert_eq!(level, MessageLevel::Error);
        assert!(message.contains("No matching distribution found"));
    }

    #[test]
    fn ambiguous_pip_output_is_a_warning_failure() {
        let (success, level, _) = classify_pip(PackageOp::Install, &streamed(0, "Collecting numpy\n", ""));
        assert!(!success);
        assert_eq!(level, MessageLevel::Warning);
    }

    #[test]
    fn uninstall_markers_are_op_specific() {
        let (success, _, _) = classify_pip(
            PackageOp::Remove,
            &streamed(0, "Successfully uninstalled numpy-1.26.4\n", ""),
        );
        assert!(success);

        let (success, _, _) = classify_pip(
            PackageOp::Remove,
            &streamed(0, "WARNING: Skipping numpy as it is not installed.\n", ""),
        );
        assert!(success);
    }

    #[test]
    fn conda_markers_classify_both_ways() {
        let (success, _, _) = classify_conda(
            PackageOp::Install,
            &streamed(0, "Executing transaction: ...working... done\n", ""),
        );
        assert!(success);

        let (success, level, message) = classify_conda(
            PackageOp::Install,
            &streamed(1, "", "PackagesNotFoundError: The following packages are missing\n"),
        );
        assert!(!success);
        assert_eq!(level, MessageLevel::Error);
        assert!(message.contains("PackagesNotFoundError"));
    }

    #[test]
    fn pip_install_command_shape() {
        let command = build_command(
            Path::new("/envs/demo"),
            false,
            PackageOp::Install,
            "numpy==1.26.4",
            None,
        );
        assert!(command.display.starts_with("pip install"));
        assert_eq!(command.program, python_executable(Path::new("/envs/demo")));
        assert!(command.args.contains(&"install".to_string()));
        assert!(command.args.contains(&"numpy==1.26.4".to_string()));

        let with_index = build_command(
            Path::new("/envs/demo"),
            false,
            PackageOp::Install,
            "numpy",
            Some("https://mirror.example/simple"),
        );
        assert!(with_index.args.contains(&"--index-url".to_string()));
    }

    #[test]
    fn conda_commands_target_the_prefix() {
        let command = build_command(
            Path::new("/envs/demo"),
            true,
            PackageOp::Install,
            "numpy",
            None,
        );
        assert_eq!(command.program, PathBuf::from("conda"));
        assert!(command.display.starts_with("conda install"));
        assert!(command.args.contains(&"--prefix".to_string()));
        assert!(command.args.contains(&"--yes".to_string()));
    }

    #[test]
    fn install_target_pins_bare_versions() {
        assert_eq!(install_target("numpy", None), "numpy");
        assert_eq!(install_target("numpy", Some("1.26.4")), "numpy==1.26.4");
        assert_eq!(install_target("numpy", Some(">=1.24")), "numpy>=1.24");
    }

    #[test]
    fn profiles_are_seeded_and_persisted_on_first_load() {
        let scratch = TempDir::new().expect("tempdir");
        let layout = DataLayout::at(scratch.path().join("home"));
        layout.ensure_dirs().expect("dirs");
        let envs = Arc::new(EnvManager::new(layout.clone()));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&envs)));
        let packages = PackageManager::new(layout.clone(), sessions, envs);

        let document = packages.load_profiles().expect("seeded");
        assert!(document.profile("base").is_some());
        assert!(layout.profiles_path().is_file());

        let reread = packages.load_profiles().expect("reread");
        assert_eq!(
            reread.profile("data-science").map(<[_]>::len),
            Some(2)
        );
    }

    #[test]
    fn operations_on_unknown_sessions_and_envs_fail_cleanly() {
        let scratch = TempDir::new().expect("tempdir");
        let layout = DataLayout::at(scratch.path().join("home"));
        layout.ensure_dirs().expect("dirs");
        let envs = Arc::new(EnvManager::new(layout.clone()));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&envs)));
        let packages = PackageManager::new(layout.clone(), Arc::clone(&sessions), Arc::clone(&envs));

        let ghost_session = SessionId::from_raw("ses-missing");
        let ghost_env = EnvId::from_raw("env-missing");
        assert!(matches!(
            packages.list_installed(&ghost_session, &ghost_env, false),
            Err(PackageError::UnknownSession(_))
        ));

        let env_path = layout.venv_dir("demo");
        std::fs::create_dir_all(&env_path).expect("venv dir");
        let env = envs.adopt(RuntimeId::from_raw("rt-0"), "demo", env_path, true);
        let session = sessions.get_or_create("alice", &env.id, false).expect("session");
        sessions.terminate(&session.id).expect("terminate");
        assert!(matches!(
            packages.list_installed(&session.id, &env.id, false),
            Err(PackageError::SessionGone(_))
        ));
    }
}
