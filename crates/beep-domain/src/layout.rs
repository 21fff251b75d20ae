use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use dirs_next::home_dir;

/// Overrides the data directory, primarily for tests and portable installs.
pub const HOME_ENV: &str = "BEEP_PYTHON_HOME";

const DATA_DIR_NAME: &str = ".beep-python";
const REGISTRY_FILENAME: &str = "runtimes.json";
const PROFILES_FILENAME: &str = "package-requirements.json";

/// The on-disk home of the runtime host:
///
/// ```text
/// ${userHome}/.beep-python/
///   runtimes.json
///   package-requirements.json
///   embedded/
///   venvs/<name>/
///   offline-cache/
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    /// Resolve the layout from `BEEP_PYTHON_HOME` or the user's home
    /// directory. Does not touch the filesystem.
    pub fn resolve() -> Result<Self> {
        if let Some(root) = env::var_os(HOME_ENV) {
            return Ok(Self {
                root: PathBuf::from(root),
            });
        }
        let home = home_dir().ok_or_else(|| anyhow!("home directory not found"))?;
        Ok(Self {
            root: home.join(DATA_DIR_NAME),
        })
    }

    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILENAME)
    }

    #[must_use]
    pub fn profiles_path(&self) -> PathBuf {
        self.root.join(PROFILES_FILENAME)
    }

    #[must_use]
    pub fn embedded_dir(&self) -> PathBuf {
        self.root.join("embedded")
    }

    #[must_use]
    pub fn venvs_dir(&self) -> PathBuf {
        self.root.join("venvs")
    }

    #[must_use]
    pub fn venv_dir(&self, name: &str) -> PathBuf {
        self.venvs_dir().join(name)
    }

    #[must_use]
    pub fn offline_cache_dir(&self) -> PathBuf {
        self.root.join("offline-cache")
    }

    /// Create the directory skeleton. Idempotent.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.venvs_dir(),
            self.offline_cache_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_hang_off_the_root() {
        let layout = DataLayout::at("/data/beep");
        assert_eq!(layout.registry_path(), PathBuf::from("/data/beep/runtimes.json"));
        assert_eq!(
            layout.profiles_path(),
            PathBuf::from("/data/beep/package-requirements.json")
        );
        assert_eq!(
            layout.venv_dir("data-science"),
            PathBuf::from("/data/beep/venvs/data-science")
        );
        assert_eq!(layout.embedded_dir(), PathBuf::from("/data/beep/embedded"));
    }

    #[test]
    fn ensure_dirs_is_idempotent() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let layout = DataLayout::at(scratch.path().join("home"));
        layout.ensure_dirs().expect("first ensure");
        layout.ensure_dirs().expect("second ensure");
        assert!(layout.venvs_dir().is_dir());
        assert!(layout.offline_cache_dir().is_dir());
    }
}
