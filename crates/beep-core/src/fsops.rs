use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::warn;
use walkdir::WalkDir;

/// Serialize `value` as pretty JSON and move it into place atomically
/// (temp file in the same directory, then rename). Readers never observe a
/// half-written document.
pub(crate) fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let contents = serde_json::to_string_pretty(value).context("serializing document")?;
    let mut staged = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to stage write under {}", parent.display()))?;
    staged.write_all(contents.as_bytes())?;
    staged.write_all(b"\n")?;
    staged
        .persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Fault-tolerant document read: a missing or corrupt file is logged and
/// treated as the default, never an error.
pub(crate) fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable document; treating as empty");
            return T::default();
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "corrupt document; treating as empty");
            T::default()
        }
    }
}

pub(crate) fn remove_tree_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// Copy a directory tree. Symlinks are recreated (not followed) on Unix so
/// a cloned venv keeps its interpreter links; elsewhere the link target's
/// contents are copied.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {}", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("path escapes {}", src.display()))?;
        if relative.as_os_str().is_empty() {
            fs::create_dir_all(dst)?;
            continue;
        }
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let link_target = fs::read_link(src)
        .with_context(|| format!("failed to read link {}", src.display()))?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(&link_target, dst).with_context(|| {
        format!(
            "failed to create symlink {} -> {}",
            dst.display(),
            link_target.display()
        )
    })
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst).with_context(|| format!("failed to copy {}", src.display()))?;
    Ok(())
}

/// Best-effort guess of the Python install root from an executable path.
///
/// On Unix this is typically `<root>/bin/python`. On Windows (and some
/// portable layouts) the executable can live directly under the install
/// root.
pub(crate) fn python_install_root(python_exe: &Path) -> Option<PathBuf> {
    let parent = python_exe.parent()?;

    for marker in ["Lib", "lib", "DLLs", "include"] {
        if parent.join(marker).exists() {
            return Some(parent.to_path_buf());
        }
    }

    if parent
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.eq_ignore_ascii_case("bin"))
    {
        return parent.parent().map(Path::to_path_buf);
    }

    Some(parent.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        value: u32,
    }

    #[test]
    fn atomic_write_round_trips_and_replaces() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let path = scratch.path().join("doc.json");
        atomic_write_json(&path, &Doc { value: 1 }).expect("first write");
        atomic_write_json(&path, &Doc { value: 2 }).expect("second write");
        let read: Doc = read_json_or_default(&path);
        assert_eq!(read, Doc { value: 2 });
    }

    #[test]
    fn corrupt_documents_read_as_default() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let path = scratch.path().join("doc.json");
        fs::write(&path, b"{not json").expect("write garbage");
        let read: Doc = read_json_or_default(&path);
        assert_eq!(read, Doc::default());
        let missing: Doc = read_json_or_default(&scratch.path().join("absent.json"));
        assert_eq!(missing, Doc::default());
    }

    #[test]
    fn copy_tree_replicates_nested_files() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let src = scratch.path().join("src");
        fs::create_dir_all(src.join("inner")).expect("mkdir");
        fs::write(src.join("top.txt"), b"top").expect("write");
        fs::write(src.join("inner").join("leaf.txt"), b"leaf").expect("write");

        let dst = scratch.path().join("dst");
        copy_tree(&src, &dst).expect("copy");
        assert_eq!(fs::read(dst.join("top.txt")).expect("read"), b"top");
        assert_eq!(
            fs::read(dst.join("inner").join("leaf.txt")).expect("read"),
            b"leaf"
        );
    }

    #[cfg(unix)]
    #[test]
    fn copy_tree_preserves_symlinks() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let src = scratch.path().join("src");
        fs::create_dir_all(&src).expect("mkdir");
        fs::write(src.join("real.txt"), b"real").expect("write");
        std::os::unix::fs::symlink("real.txt", src.join("link.txt")).expect("symlink");

        let dst = scratch.path().join("dst");
        copy_tree(&src, &dst).expect("copy");
        let copied = fs::symlink_metadata(dst.join("link.txt")).expect("stat");
        assert!(copied.file_type().is_symlink());
    }

    #[test]
    fn install_root_recognizes_unix_and_flat_layouts() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let root = scratch.path().join("py");
        fs::create_dir_all(root.join("bin")).expect("mkdir");
        let exe = root.join("bin").join("python3");
        fs::write(&exe, b"").expect("write");
        assert_eq!(python_install_root(&exe), Some(root.clone()));

        let flat = scratch.path().join("embed");
        fs::create_dir_all(flat.join("Lib")).expect("mkdir");
        let flat_exe = flat.join("python.exe");
        fs::write(&flat_exe, b"").expect("write");
        assert_eq!(python_install_root(&flat_exe), Some(flat));
    }
}
