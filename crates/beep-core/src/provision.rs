use std::collections::HashMap;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use fs4::FileExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tar::Archive;
use tempfile::{tempdir_in, NamedTempFile};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use zip::ZipArchive;

use beep_domain::runtime::executable_under;
use beep_domain::{DataLayout, PythonRuntime, RuntimeKind, RuntimeStatus};

use crate::diagnostics::probe_python;
use crate::fsops::remove_tree_if_exists;
use crate::net::build_http_client;
use crate::process::run_command;
use crate::progress::{CancellationToken, ProgressSink};

/// Overrides where the provisioner looks for the download manifest; may be
/// an http(s) URL or a local file path.
pub const DOWNLOADS_URL_ENV: &str = "BEEP_PYTHON_DOWNLOADS_URL";

const WINDOWS_EMBED_TEMPLATE: &str =
    "https://www.python.org/ftp/python/{ver}/python-{ver}-embed-amd64.zip";
const GET_PIP_URL: &str = "https://bootstrap.pypa.io/get-pip.py";
const DEFAULT_MANIFEST_URL: &str =
    "https://raw.githubusercontent.com/astral-sh/uv/main/crates/uv-python/download-metadata.json";

const DOWNLOAD_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const DOWNLOAD_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("download failed: {0}")]
    DownloadFailed(#[source] anyhow::Error),
    #[error("extraction failed: {0}")]
    ExtractFailed(#[source] anyhow::Error),
    #[error("configuration failed: {0}")]
    ConfigurationFailed(#[source] anyhow::Error),
    #[error("pip bootstrap failed: {0}")]
    PipBootstrapFailed(#[source] anyhow::Error),
    #[error("verification failed: {0}")]
    VerificationFailed(#[source] anyhow::Error),
    #[error("provisioning cancelled")]
    Cancelled,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// The five provisioning phases, each owning a slice of the 0..=100
/// progress range. Download is byte-weighted and takes the first 40%.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionPhase {
    Download,
    Extraction,
    Configuration,
    PipInstallation,
    Verification,
}

impl ProvisionPhase {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Download => "Download",
            Self::Extraction => "Extraction",
            Self::Configuration => "Configuration",
            Self::PipInstallation => "PipInstallation",
            Self::Verification => "Verification",
        }
    }

    pub(crate) fn span(self) -> (u8, u8) {
        match self {
            Self::Download => (0, 40),
            Self::Extraction => (40, 60),
            Self::Configuration => (60, 70),
            Self::PipInstallation => (70, 90),
            Self::Verification => (90, 100),
        }
    }
}

fn report_phase(progress: &ProgressSink, phase: ProvisionPhase, fraction: f64) {
    let (start, end) = phase.span();
    let fraction = fraction.clamp(0.0, 1.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let percent = f64::from(start) + f64::from(end - start) * fraction;
    progress.phase(phase.label(), percent.round() as u8);
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), ProvisionError> {
    if cancel.is_cancelled() {
        return Err(ProvisionError::Cancelled);
    }
    Ok(())
}

/// What to provision. With no overrides the embedded runtime lands at
/// `<data dir>/embedded` and is selected per-OS: the python.org embeddable
/// zip on Windows, a relocatable python-build-standalone archive
/// elsewhere.
#[derive(Clone, Debug)]
pub struct ProvisionRequest {
    /// `3.12` or a fully pinned `3.12.4`.
    pub version: String,
    pub install_dir: Option<PathBuf>,
    /// `{ver}` template overriding asset selection entirely.
    pub url_template: Option<String>,
    pub upgrade_seed_packages: bool,
}

impl ProvisionRequest {
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            install_dir: None,
            url_template: None,
            upgrade_seed_packages: true,
        }
    }
}

#[derive(Clone, Debug)]
struct SelectedAsset {
    url: String,
    filename: String,
    kind: ArchiveKind,
    sha256: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArchiveKind {
    TarGz,
    Zip,
}

enum ManifestSource {
    Http(String),
    File(PathBuf),
}

#[derive(Clone, Copy, Debug)]
struct HostTarget {
    os: &'static str,
    arch: &'static str,
    libc: &'static str,
}

#[derive(Deserialize, Clone)]
struct PythonDownload {
    name: String,
    arch: PythonDownloadArch,
    os: String,
    libc: String,
    major: u8,
    minor: u8,
    patch: u8,
    #[serde(default)]
    prerelease: Option<String>,
    url: String,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    build: Option<String>,
}

#[derive(Deserialize, Clone)]
struct PythonDownloadArch {
    family: String,
    #[serde(default)]
    variant: Option<String>,
}

impl PythonDownload {
    fn matches(&self, major: u8, minor: u8, patch: Option<u8>, target: &HostTarget) -> bool {
        let no_prerelease = self
            .prerelease
            .as_deref()
            .map(str::is_empty)
            .unwrap_or(true);
        let no_variant = self.variant.as_deref().map(str::is_empty).unwrap_or(true);
        let no_arch_variant = self
            .arch
            .variant
            .as_deref()
            .map(str::is_empty)
            .unwrap_or(true);
        self.name == "cpython"
            && self.major == major
            && self.minor == minor
            && patch.is_none_or(|patch| self.patch == patch)
            && no_prerelease
            && no_variant
            && no_arch_variant
            && self.arch.family == target.arch
            && self.os == target.os
            && self.libc == target.libc
    }

    fn rank(&self) -> (u8, u64) {
        let build = self
            .build
            .as_deref()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        (self.patch, build)
    }
}

/// Outcome of a successful verification.
#[derive(Clone, Debug)]
pub struct VerifiedRuntime {
    pub version: String,
    pub installed_packages: Vec<beep_domain::PackageRecord>,
}

/// Holds the embedded install directory exclusively for the duration of
/// one `ensure`.
struct InstallLock {
    _file: File,
}

impl InstallLock {
    fn acquire(root: &Path) -> Result<Self> {
        let path = root.join("embedded.lock");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(Self { _file: file })
    }
}

/// Produces a `Ready` embedded runtime at the configured install path:
/// download, extract, enable site-packages, bootstrap pip, verify. Any
/// step failure (or cancellation) removes the partial install directory
/// before surfacing.
pub struct Provisioner {
    layout: DataLayout,
    client: reqwest::blocking::Client,
}

impl Provisioner {
    pub fn new(layout: DataLayout) -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
            layout,
        })
    }

    /// Idempotent: an install that already verifies is returned
    /// immediately without touching the network.
    pub fn ensure(
        &self,
        request: &ProvisionRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PythonRuntime, ProvisionError> {
        let install_dir = request
            .install_dir
            .clone()
            .unwrap_or_else(|| self.layout.embedded_dir());
        if let Ok(verified) = self.verify(&install_dir) {
            debug!(path = %install_dir.display(), "embedded runtime already verifies");
            report_phase(progress, ProvisionPhase::Verification, 1.0);
            return Ok(ready_record(&request.version, &install_dir, &verified));
        }
        self.layout.ensure_dirs().map_err(ProvisionError::Internal)?;
        let _lock = InstallLock::acquire(self.layout.root()).map_err(ProvisionError::Internal)?;
        // Another process may have finished while we waited on the lock.
        if let Ok(verified) = self.verify(&install_dir) {
            report_phase(progress, ProvisionPhase::Verification, 1.0);
            return Ok(ready_record(&request.version, &install_dir, &verified));
        }

        match self.provision(&install_dir, request, progress, cancel) {
            Ok(runtime) => Ok(runtime),
            Err(err) => {
                let _ = remove_tree_if_exists(&install_dir);
                Err(err)
            }
        }
    }

    fn provision(
        &self,
        install_dir: &Path,
        request: &ProvisionRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PythonRuntime, ProvisionError> {
        checkpoint(cancel)?;
        let asset = self
            .select_asset(request)
            .map_err(ProvisionError::DownloadFailed)?;
        let archive = self.fetch_archive(&asset, progress, cancel)?;

        checkpoint(cancel)?;
        report_phase(progress, ProvisionPhase::Extraction, 0.0);
        let stage = tempdir_in(self.layout.root())
            .context("creating staging directory")
            .map_err(ProvisionError::Internal)?;
        extract_archive(&archive, stage.path(), asset.kind).map_err(ProvisionError::ExtractFailed)?;
        let stage_root = find_install_root(stage.path()).map_err(ProvisionError::ExtractFailed)?;
        report_phase(progress, ProvisionPhase::Extraction, 1.0);

        checkpoint(cancel)?;
        report_phase(progress, ProvisionPhase::Configuration, 0.0);
        configure_site_packages(&stage_root).map_err(ProvisionError::ConfigurationFailed)?;
        remove_tree_if_exists(install_dir).map_err(ProvisionError::Internal)?;
        fs::rename(&stage_root, install_dir)
            .with_context(|| format!("moving runtime into place at {}", install_dir.display()))
            .map_err(ProvisionError::Internal)?;
        report_phase(progress, ProvisionPhase::Configuration, 1.0);

        checkpoint(cancel)?;
        self.bootstrap_pip(install_dir, request.upgrade_seed_packages, progress, cancel)?;

        checkpoint(cancel)?;
        report_phase(progress, ProvisionPhase::Verification, 0.0);
        let verified = self.verify(install_dir)?;
        report_phase(progress, ProvisionPhase::Verification, 1.0);
        Ok(ready_record(&request.version, install_dir, &verified))
    }

    /// Repair entry point: (re-)bootstrap pip and the seed packages in an
    /// existing install.
    pub fn setup_pip(
        &self,
        root: &Path,
        upgrade_seed_packages: bool,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        self.bootstrap_pip(root, upgrade_seed_packages, progress, cancel)
    }

    /// The executable exists, a probe snippet prints, and pip is
    /// importable.
    pub fn verify(&self, root: &Path) -> Result<VerifiedRuntime, ProvisionError> {
        let exe = executable_under(root);
        if !exe.is_file() {
            return Err(ProvisionError::VerificationFailed(anyhow!(
                "no interpreter at {}",
                exe.display()
            )));
        }
        let output = run_command(
            &exe,
            &["-c".to_string(), "print('hello')".to_string()],
            &[],
            root,
        )
        .map_err(ProvisionError::VerificationFailed)?;
        if output.code != 0 || output.stdout.trim() != "hello" {
            return Err(ProvisionError::VerificationFailed(anyhow!(
                "probe snippet failed (exit {}): {}",
                output.code,
                output.stderr.trim()
            )));
        }
        let report = probe_python(&exe);
        if !report.can_execute_code {
            return Err(ProvisionError::VerificationFailed(anyhow!(
                "interpreter probe failed: {}",
                report.errors.join("; ")
            )));
        }
        if !report.pip_found {
            return Err(ProvisionError::VerificationFailed(anyhow!(
                "pip is not importable"
            )));
        }
        Ok(VerifiedRuntime {
            version: report.version.unwrap_or_default(),
            installed_packages: report.installed_packages,
        })
    }

    fn bootstrap_pip(
        &self,
        root: &Path,
        upgrade_seed_packages: bool,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let exe = executable_under(root);
        if !exe.is_file() {
            return Err(ProvisionError::PipBootstrapFailed(anyhow!(
                "no interpreter at {}",
                exe.display()
            )));
        }
        report_phase(progress, ProvisionPhase::PipInstallation, 0.0);

        let pip_probe = run_command(
            &exe,
            &[
                "-m".to_string(),
                "pip".to_string(),
                "--version".to_string(),
            ],
            &[],
            root,
        )
        .map_err(ProvisionError::PipBootstrapFailed)?;
        if pip_probe.code != 0 {
            checkpoint(cancel)?;
            // ensurepip first; embeddable distributions don't ship it and
            // fall through to the canonical bootstrap script.
            let ensurepip = run_command(
                &exe,
                &[
                    "-m".to_string(),
                    "ensurepip".to_string(),
                    "--upgrade".to_string(),
                ],
                &[],
                root,
            )
            .map_err(ProvisionError::PipBootstrapFailed)?;
            if ensurepip.code != 0 {
                let script = self
                    .cached_get_pip(cancel)
                    .map_err(ProvisionError::PipBootstrapFailed)?;
                let bootstrap = run_command(
                    &exe,
                    &[
                        script.to_string_lossy().to_string(),
                        "--no-warn-script-location".to_string(),
                    ],
                    &[],
                    root,
                )
                .map_err(ProvisionError::PipBootstrapFailed)?;
                if bootstrap.code != 0 {
                    return Err(ProvisionError::PipBootstrapFailed(anyhow!(
                        "get-pip.py exited with {}: {}",
                        bootstrap.code,
                        bootstrap.stderr.trim()
                    )));
                }
            }
        }
        report_phase(progress, ProvisionPhase::PipInstallation, 0.6);

        if upgrade_seed_packages {
            checkpoint(cancel)?;
            let upgrade = run_command(
                &exe,
                &[
                    "-m".to_string(),
                    "pip".to_string(),
                    "install".to_string(),
                    "--upgrade".to_string(),
                    "pip".to_string(),
                    "setuptools".to_string(),
                    "wheel".to_string(),
                ],
                &[],
                root,
            )
            .map_err(ProvisionError::PipBootstrapFailed)?;
            if upgrade.code != 0 {
                return Err(ProvisionError::PipBootstrapFailed(anyhow!(
                    "seed package upgrade exited with {}: {}",
                    upgrade.code,
                    upgrade.stderr.trim()
                )));
            }
        }
        report_phase(progress, ProvisionPhase::PipInstallation, 1.0);
        Ok(())
    }

    fn cached_get_pip(&self, cancel: &CancellationToken) -> Result<PathBuf> {
        let path = self.layout.offline_cache_dir().join("get-pip.py");
        if path.is_file() {
            return Ok(path);
        }
        fs::create_dir_all(self.layout.offline_cache_dir())?;
        let body = self
            .client
            .get(GET_PIP_URL)
            .send()
            .context("failed to download get-pip.py")?
            .error_for_status()
            .context("get-pip.py request failed")?
            .bytes()
            .context("failed to read get-pip.py body")?;
        if cancel.is_cancelled() {
            bail!("cancelled while fetching get-pip.py");
        }
        fs::write(&path, &body)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    fn select_asset(&self, request: &ProvisionRequest) -> Result<SelectedAsset> {
        if let Some(template) = &request.url_template {
            return asset_from_template(template, &request.version);
        }
        if cfg!(windows) {
            return asset_from_template(WINDOWS_EMBED_TEMPLATE, &request.version);
        }
        let (major, minor, patch) = parse_version_request(&request.version)?;
        let target = detect_host_target()?;
        let downloads = self.load_download_manifest()?;
        let entry = downloads
            .iter()
            .filter(|download| download.matches(major, minor, patch, &target))
            .max_by(|left, right| left.rank().cmp(&right.rank()))
            .ok_or_else(|| {
                anyhow!(
                    "python {} is not available for {}-{}",
                    request.version,
                    target.os,
                    target.arch
                )
            })?;
        let filename = filename_from_url(&entry.url);
        let kind = archive_kind(&filename)?;
        Ok(SelectedAsset {
            url: entry.url.clone(),
            filename,
            kind,
            sha256: entry.sha256.clone(),
        })
    }

    fn load_download_manifest(&self) -> Result<Vec<PythonDownload>> {
        let raw_source =
            env::var(DOWNLOADS_URL_ENV).unwrap_or_else(|_| DEFAULT_MANIFEST_URL.to_string());
        let source = if let Some(path) = raw_source.strip_prefix("file://") {
            ManifestSource::File(PathBuf::from(path))
        } else if raw_source.starts_with("http://") || raw_source.starts_with("https://") {
            ManifestSource::Http(raw_source)
        } else {
            ManifestSource::File(PathBuf::from(raw_source))
        };
        let bytes = match source {
            ManifestSource::Http(url) => self
                .client
                .get(&url)
                .send()
                .with_context(|| format!("failed to download manifest from {url}"))?
                .error_for_status()
                .with_context(|| format!("manifest request failed ({url})"))?
                .bytes()
                .context("failed to read manifest body")?
                .to_vec(),
            ManifestSource::File(path) => fs::read(&path)
                .with_context(|| format!("reading manifest at {}", path.display()))?,
        };
        let map: HashMap<String, PythonDownload> =
            serde_json::from_slice(&bytes).context("invalid python downloads manifest")?;
        Ok(map.into_values().collect())
    }

    /// Download the archive into `offline-cache/`, reusing a cached copy
    /// whose checksum still matches. Byte progress occupies the Download
    /// phase; cancellation is honored between chunks, removing the
    /// partial file.
    fn fetch_archive(
        &self,
        asset: &SelectedAsset,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProvisionError> {
        let cache_dir = self.layout.offline_cache_dir();
        let cached = cache_dir.join(&asset.filename);
        if cached.is_file() {
            let checksum_ok = match &asset.sha256 {
                Some(expected) => sha256_file(&cached)
                    .map(|actual| actual.eq_ignore_ascii_case(expected))
                    .unwrap_or(false),
                None => true,
            };
            if checksum_ok {
                debug!(archive = %cached.display(), "reusing cached distribution");
                report_phase(progress, ProvisionPhase::Download, 1.0);
                return Ok(cached);
            }
            let _ = fs::remove_file(&cached);
        }
        fs::create_dir_all(&cache_dir).map_err(|err| ProvisionError::Internal(err.into()))?;

        match self.stream_download(asset, &cached, progress, cancel) {
            Ok(()) => Ok(cached),
            Err(ProvisionError::DownloadFailed(first)) => {
                warn!(error = %first, url = %asset.url, "download failed; retrying once");
                thread::sleep(DOWNLOAD_RETRY_BACKOFF);
                checkpoint(cancel)?;
                self.stream_download(asset, &cached, progress, cancel)
                    .map_err(|err| match err {
                        ProvisionError::DownloadFailed(second) => ProvisionError::DownloadFailed(
                            second.context(format!("first attempt: {first}")),
                        ),
                        other => other,
                    })?;
                Ok(cached)
            }
            Err(other) => Err(other),
        }
    }

    fn stream_download(
        &self,
        asset: &SelectedAsset,
        dest: &Path,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let mut response = self
            .client
            .get(&asset.url)
            .send()
            .with_context(|| format!("failed to download {}", asset.url))
            .map_err(ProvisionError::DownloadFailed)?
            .error_for_status()
            .with_context(|| format!("download failed for {}", asset.url))
            .map_err(ProvisionError::DownloadFailed)?;
        let total = response.content_length();
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        let mut staged = NamedTempFile::new_in(parent)
            .context("staging download")
            .map_err(ProvisionError::Internal)?;

        let mut hasher = Sha256::new();
        let mut done: u64 = 0;
        let mut chunk = vec![0u8; DOWNLOAD_CHUNK];
        loop {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }
            let read = response
                .read(&mut chunk)
                .with_context(|| format!("reading download stream for {}", asset.filename))
                .map_err(ProvisionError::DownloadFailed)?;
            if read == 0 {
                break;
            }
            staged
                .write_all(&chunk[..read])
                .context("writing downloaded bytes")
                .map_err(ProvisionError::Internal)?;
            hasher.update(&chunk[..read]);
            done += read as u64;
            progress.bytes(done, total);
            let fraction = total
                .filter(|total| *total > 0)
                .map_or(0.0, |total| done as f64 / total as f64);
            report_phase(progress, ProvisionPhase::Download, fraction);
        }

        if let Some(expected) = &asset.sha256 {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(ProvisionError::DownloadFailed(anyhow!(
                    "checksum mismatch for {}: expected {expected}, got {actual}",
                    asset.filename
                )));
            }
        }
        staged
            .persist(dest)
            .with_context(|| format!("failed to place {}", dest.display()))
            .map_err(ProvisionError::Internal)?;
        report_phase(progress, ProvisionPhase::Download, 1.0);
        Ok(())
    }
}

fn ready_record(requested_version: &str, install_dir: &Path, verified: &VerifiedRuntime) -> PythonRuntime {
    let mut record = PythonRuntime::new(
        format!("embedded-{requested_version}"),
        RuntimeKind::Embedded,
        install_dir.to_path_buf(),
    );
    record.is_managed = true;
    record.status = RuntimeStatus::Ready;
    record.version = verified.version.clone();
    record.installed_packages = verified
        .installed_packages
        .iter()
        .map(|package| (package.name.clone(), package.version.clone()))
        .collect();
    record
}

fn asset_from_template(template: &str, version: &str) -> Result<SelectedAsset> {
    let url = template.replace("{ver}", version);
    Url::parse(&url).with_context(|| format!("invalid download url {url}"))?;
    let filename = filename_from_url(&url);
    let kind = archive_kind(&filename)?;
    Ok(SelectedAsset {
        url,
        filename,
        kind,
        sha256: None,
    })
}

fn parse_version_request(input: &str) -> Result<(u8, u8, Option<u8>)> {
    let mut parts = input.split('.');
    let major = parts
        .next()
        .ok_or_else(|| anyhow!("python version missing major component"))?
        .parse()
        .with_context(|| format!("invalid python version `{input}`"))?;
    let minor = parts
        .next()
        .ok_or_else(|| anyhow!("python version `{input}` missing minor component"))?
        .parse()
        .with_context(|| format!("invalid python version `{input}`"))?;
    let patch = match parts.next() {
        None => None,
        Some(patch) => Some(
            patch
                .parse()
                .with_context(|| format!("invalid python version `{input}`"))?,
        ),
    };
    if parts.next().is_some() {
        bail!("invalid python version `{input}`");
    }
    Ok((major, minor, patch))
}

fn detect_host_target() -> Result<HostTarget> {
    match (env::consts::OS, env::consts::ARCH) {
        ("linux", "x86_64") => Ok(HostTarget {
            os: "linux",
            arch: "x86_64",
            libc: "gnu",
        }),
        ("linux", "aarch64") => Ok(HostTarget {
            os: "linux",
            arch: "aarch64",
            libc: "gnu",
        }),
        ("macos", "x86_64") => Ok(HostTarget {
            os: "darwin",
            arch: "x86_64",
            libc: "none",
        }),
        ("macos", "aarch64") => Ok(HostTarget {
            os: "darwin",
            arch: "aarch64",
            libc: "none",
        }),
        ("windows", "x86_64") => Ok(HostTarget {
            os: "windows",
            arch: "x86_64",
            libc: "none",
        }),
        (os, arch) => bail!("unsupported host platform {os}-{arch}"),
    }
}

fn filename_from_url(url: &str) -> String {
    url.rsplit('/')
        .next()
        .unwrap_or("python-archive")
        .to_string()
}

fn archive_kind(name: &str) -> Result<ArchiveKind> {
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Ok(ArchiveKind::TarGz)
    } else if name.ends_with(".zip") {
        Ok(ArchiveKind::Zip)
    } else {
        bail!("unsupported archive format for {name}")
    }
}

fn extract_archive(archive: &Path, dest: &Path, kind: ArchiveKind) -> Result<()> {
    match kind {
        ArchiveKind::TarGz => {
            let file = File::open(archive)
                .with_context(|| format!("opening archive {}", archive.display()))?;
            let decoder = GzDecoder::new(file);
            let mut tar = Archive::new(decoder);
            tar.unpack(dest)
                .with_context(|| format!("extracting archive into {}", dest.display()))?;
        }
        ArchiveKind::Zip => {
            let file = File::open(archive)
                .with_context(|| format!("opening archive {}", archive.display()))?;
            let mut zip = ZipArchive::new(file)
                .with_context(|| format!("reading zip archive {}", archive.display()))?;
            zip.extract(dest)
                .with_context(|| format!("extracting zip archive into {}", dest.display()))?;
        }
    }
    Ok(())
}

/// The directory that actually holds the interpreter. Embeddable zips are
/// flat; python-build-standalone archives nest everything under `python/`
/// (sometimes `python/install/`).
fn find_install_root(stage: &Path) -> Result<PathBuf> {
    let mut candidates = vec![stage.to_path_buf()];
    for nested in ["python", "python/install"] {
        candidates.push(stage.join(nested));
    }
    for candidate in &candidates {
        let exe = executable_under(candidate);
        if exe.is_file() {
            return Ok(candidate.clone());
        }
    }
    bail!("no python interpreter found in extracted archive")
}

/// Enable site-packages in an embeddable distribution by rewriting its
/// `python<M><m>._pth`: uncomment `import site` and make sure `Lib` and
/// `Lib/site-packages` are on the path. Full distributions have no `._pth`
/// and need no configuration.
fn configure_site_packages(root: &Path) -> Result<()> {
    let Some(pth) = find_pth_file(root)? else {
        if cfg!(windows) {
            bail!("no python*._pth found under {}", root.display());
        }
        return Ok(());
    };
    let contents =
        fs::read_to_string(&pth).with_context(|| format!("reading {}", pth.display()))?;
    let rewritten = rewrite_pth_contents(&contents);
    fs::write(&pth, rewritten).with_context(|| format!("rewriting {}", pth.display()))?;
    Ok(())
}

fn find_pth_file(root: &Path) -> Result<Option<PathBuf>> {
    for entry in
        fs::read_dir(root).with_context(|| format!("listing {}", root.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("python") && name.ends_with("._pth") {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

fn rewrite_pth_contents(contents: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut has_import_site = false;
    let mut has_lib = false;
    let mut has_site_packages = false;
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed == "#import site" || trimmed == "# import site" {
            lines.push("import site".to_string());
            has_import_site = true;
            continue;
        }
        if trimmed == "import site" {
            has_import_site = true;
        }
        if trimmed == "Lib" {
            has_lib = true;
        }
        if trimmed == "Lib/site-packages" || trimmed == r"Lib\site-packages" {
            has_site_packages = true;
        }
        lines.push(line.to_string());
    }
    // Path entries go before the import so site sees them.
    let insert_at = lines
        .iter()
        .position(|line| line.trim() == "import site")
        .unwrap_or(lines.len());
    let mut missing = Vec::new();
    if !has_lib {
        missing.push("Lib".to_string());
    }
    if !has_site_packages {
        missing.push("Lib/site-packages".to_string());
    }
    for (offset, entry) in missing.into_iter().enumerate() {
        lines.insert(insert_at + offset, entry);
    }
    if !has_import_site {
        lines.push("import site".to_string());
    }
    let mut output = lines.join("\n");
    output.push('\n');
    output
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; DOWNLOAD_CHUNK];
    loop {
        let read = file.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{matchers::request, responders::status_code, Expectation, Server};
    use std::sync::{Arc, Mutex};

    use crate::progress::ProgressUpdate;

    #[test]
    fn phase_spans_cover_the_range_monotonically() {
        let phases = [
            ProvisionPhase::Download,
            ProvisionPhase::Extraction,
            ProvisionPhase::Configuration,
            ProvisionPhase::PipInstallation,
            ProvisionPhase::Verification,
        ];
        let mut previous_end = 0;
        for phase in phases {
            let (start, end) = phase.span();
            assert_eq!(start, previous_end);
            assert!(end > start);
            previous_end = end;
        }
        assert_eq!(previous_end, 100);
        assert_eq!(ProvisionPhase::Download.span(), (0, 40));
    }

    #[test]
    fn pth_rewrite_uncomments_import_site_and_adds_lib_entries() {
        let input = "python312.zip\n.\n#import site\n";
        let rewritten = rewrite_pth_contents(input);
        let lines: Vec<&str> = rewritten.lines().collect();
        assert!(lines.contains(&"import site"));
        assert!(!rewritten.contains("#import site"));
        assert!(lines.contains(&"Lib"));
        assert!(lines.contains(&"Lib/site-packages"));
        let import_pos = lines.iter().position(|line| *line == "import site").expect("import");
        let lib_pos = lines.iter().position(|line| *line == "Lib").expect("lib");
        assert!(lib_pos < import_pos);
    }

    #[test]
    fn pth_rewrite_is_idempotent() {
        let input = "python312.zip\n.\nLib\nLib/site-packages\nimport site\n";
        assert_eq!(rewrite_pth_contents(input), input);
    }

    #[test]
    fn version_requests_parse_with_and_without_patch() {
        assert_eq!(parse_version_request("3.12").expect("parse"), (3, 12, None));
        assert_eq!(
            parse_version_request("3.12.4").expect("parse"),
            (3, 12, Some(4))
        );
        assert!(parse_version_request("3").is_err());
        assert!(parse_version_request("3.12.4.1").is_err());
    }

    #[test]
    fn template_assets_substitute_the_version() {
        let asset = asset_from_template(WINDOWS_EMBED_TEMPLATE, "3.12.4").expect("asset");
        assert_eq!(
            asset.url,
            "https://www.python.org/ftp/python/3.12.4/python-3.12.4-embed-amd64.zip"
        );
        assert_eq!(asset.filename, "python-3.12.4-embed-amd64.zip");
        assert_eq!(asset.kind, ArchiveKind::Zip);

        assert!(asset_from_template("not a url {ver}", "3.12").is_err());
    }

    #[test]
    fn archive_kinds_follow_the_filename() {
        assert_eq!(
            archive_kind("cpython-3.12.4-linux.tar.gz").expect("kind"),
            ArchiveKind::TarGz
        );
        assert_eq!(
            archive_kind("python-embed.zip").expect("kind"),
            ArchiveKind::Zip
        );
        assert!(archive_kind("python.msi").is_err());
    }

    fn provisioner_at(root: &Path) -> Provisioner {
        let layout = DataLayout::at(root.join("home"));
        layout.ensure_dirs().expect("dirs");
        Provisioner::new(layout).expect("provisioner")
    }

    #[test]
    fn downloads_land_in_the_offline_cache_and_are_reused() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let provisioner = provisioner_at(scratch.path());
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/python-3.12.4-embed-amd64.zip"))
                .times(1)
                .respond_with(status_code(200).body("fake-archive-bytes")),
        );
        let asset = SelectedAsset {
            url: server
                .url("/python-3.12.4-embed-amd64.zip")
                .to_string(),
            filename: "python-3.12.4-embed-amd64.zip".to_string(),
            kind: ArchiveKind::Zip,
            sha256: None,
        };

        let bytes_seen = Arc::new(Mutex::new(0u64));
        let sink = {
            let bytes_seen = Arc::clone(&bytes_seen);
            ProgressSink::new(move |update| {
                if let ProgressUpdate::Bytes { done, .. } = update {
                    *bytes_seen.lock().expect("bytes lock") = done;
                }
            })
        };
        let cancel = CancellationToken::new();
        let first = provisioner
            .fetch_archive(&asset, &sink, &cancel)
            .expect("download");
        assert!(first.is_file());
        assert_eq!(*bytes_seen.lock().expect("bytes lock"), 18);

        // Second fetch must hit the cache: the expectation above only
        // allows one request.
        *bytes_seen.lock().expect("bytes lock") = 0;
        let second = provisioner
            .fetch_archive(&asset, &sink, &cancel)
            .expect("cached");
        assert_eq!(first, second);
        assert_eq!(*bytes_seen.lock().expect("bytes lock"), 0);
    }

    #[test]
    fn failed_downloads_are_retried_once() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let provisioner = provisioner_at(scratch.path());
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/flaky.zip"))
                .times(2)
                .respond_with(httptest::cycle![
                    status_code(503),
                    status_code(200).body("recovered"),
                ]),
        );
        let asset = SelectedAsset {
            url: server.url("/flaky.zip").to_string(),
            filename: "flaky.zip".to_string(),
            kind: ArchiveKind::Zip,
            sha256: None,
        };
        let path = provisioner
            .fetch_archive(&asset, &ProgressSink::null(), &CancellationToken::new())
            .expect("retried download");
        assert_eq!(fs::read(path).expect("read"), b"recovered");
    }

    #[test]
    fn checksum_mismatches_fail_the_download() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let provisioner = provisioner_at(scratch.path());
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/sum.zip"))
                .times(2)
                .respond_with(status_code(200).body("payload")),
        );
        let asset = SelectedAsset {
            url: server.url("/sum.zip").to_string(),
            filename: "sum.zip".to_string(),
            kind: ArchiveKind::Zip,
            sha256: Some("00".repeat(32)),
        };
        let err = provisioner
            .fetch_archive(&asset, &ProgressSink::null(), &CancellationToken::new())
            .expect_err("mismatch");
        assert!(matches!(err, ProvisionError::DownloadFailed(_)));
        assert!(!provisioner.layout.offline_cache_dir().join("sum.zip").exists());
    }

    #[test]
    fn cancellation_aborts_the_download_cleanly() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let provisioner = provisioner_at(scratch.path());
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/slow.zip"))
                .times(1)
                .respond_with(status_code(200).body("does-not-matter")),
        );
        let asset = SelectedAsset {
            url: server.url("/slow.zip").to_string(),
            filename: "slow.zip".to_string(),
            kind: ArchiveKind::Zip,
            sha256: None,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = provisioner
            .fetch_archive(&asset, &ProgressSink::null(), &cancel)
            .expect_err("cancelled");
        assert!(matches!(err, ProvisionError::Cancelled));
        assert!(!provisioner.layout.offline_cache_dir().join("slow.zip").exists());
    }

    #[test]
    fn zip_archives_extract_into_the_stage() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let archive_path = scratch.path().join("embed.zip");
        let file = File::create(&archive_path).expect("create zip");
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        writer.start_file("python312._pth", options).expect("entry");
        writer
            .write_all(b"python312.zip\n.\n#import site\n")
            .expect("write entry");
        writer.finish().expect("finish zip");

        let dest = scratch.path().join("stage");
        extract_archive(&archive_path, &dest, ArchiveKind::Zip).expect("extract");
        let extracted = fs::read_to_string(dest.join("python312._pth")).expect("read");
        assert!(extracted.contains("#import site"));
    }

    #[test]
    fn verify_rejects_a_missing_install() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let provisioner = provisioner_at(scratch.path());
        let err = provisioner
            .verify(&scratch.path().join("nowhere"))
            .expect_err("missing install");
        assert!(matches!(err, ProvisionError::VerificationFailed(_)));
    }
}
