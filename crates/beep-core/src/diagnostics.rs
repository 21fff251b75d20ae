use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use beep_domain::PackageRecord;

use crate::process::run_command;

/// What an interpreter probe found. Probes are read-only: they never
/// mutate the candidate install, and a failed probe reports through
/// `errors` rather than an `Err`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PythonDiagnostics {
    pub python_found: bool,
    pub version: Option<String>,
    pub executable: Option<String>,
    pub is_conda: bool,
    pub can_execute_code: bool,
    pub pip_found: bool,
    pub installed_packages: Vec<PackageRecord>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

const PROBE_SCRIPT: &str = "import importlib.util, json, os, platform, sys; \
print(json.dumps({'version': platform.python_version(), 'executable': sys.executable, \
'is_conda': os.path.isdir(os.path.join(sys.prefix, 'conda-meta')), \
'pip': importlib.util.find_spec('pip') is not None}))";

#[derive(Deserialize)]
struct ProbePayload {
    version: String,
    executable: String,
    is_conda: bool,
    pip: bool,
}

/// Probe a candidate interpreter executable.
#[must_use]
pub fn probe_python(executable: &Path) -> PythonDiagnostics {
    let mut report = PythonDiagnostics::default();
    if !executable.is_file() {
        report
            .errors
            .push(format!("no interpreter at {}", executable.display()));
        return report;
    }
    report.python_found = true;

    let cwd = executable
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let output = match run_command(
        executable,
        &["-c".to_string(), PROBE_SCRIPT.to_string()],
        &[],
        &cwd,
    ) {
        Ok(output) => output,
        Err(err) => {
            report.errors.push(format!("probe did not start: {err}"));
            return report;
        }
    };
    if output.code != 0 {
        report.errors.push(format!(
            "probe exited with {}: {}",
            output.code,
            output.stderr.trim()
        ));
        return report;
    }
    let payload: ProbePayload = match serde_json::from_str(output.stdout.trim()) {
        Ok(payload) => payload,
        Err(err) => {
            report.errors.push(format!("invalid probe payload: {err}"));
            return report;
        }
    };
    report.can_execute_code = true;
    report.version = Some(payload.version);
    report.executable = Some(payload.executable);
    report.is_conda = payload.is_conda;
    report.pip_found = payload.pip;

    if report.pip_found {
        match list_with_pip(executable, &cwd) {
            Ok(packages) => report.installed_packages = packages,
            Err(err) => report.warnings.push(format!("pip list failed: {err}")),
        }
    } else {
        report
            .warnings
            .push("pip is not importable in this interpreter".to_string());
    }
    debug!(
        executable = %executable.display(),
        version = report.version.as_deref().unwrap_or("?"),
        pip = report.pip_found,
        "probed interpreter"
    );
    report
}

#[derive(Deserialize)]
struct PipListEntry {
    name: String,
    version: String,
}

fn list_with_pip(executable: &Path, cwd: &Path) -> anyhow::Result<Vec<PackageRecord>> {
    let output = run_command(
        executable,
        &[
            "-m".to_string(),
            "pip".to_string(),
            "list".to_string(),
            "--format=json".to_string(),
            "--disable-pip-version-check".to_string(),
        ],
        &[],
        cwd,
    )?;
    if output.code != 0 {
        anyhow::bail!("pip list exited with {}", output.code);
    }
    let entries: Vec<PipListEntry> = serde_json::from_str(output.stdout.trim())?;
    Ok(entries
        .into_iter()
        .map(|entry| PackageRecord {
            name: entry.name,
            version: entry.version,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_interpreter_reports_without_erroring() {
        let report = probe_python(Path::new("/definitely/not/python"));
        assert!(!report.python_found);
        assert!(!report.can_execute_code);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn system_interpreter_probes_clean() {
        let Ok(python) = which::which("python3") else {
            return;
        };
        let report = probe_python(&PathBuf::from(&python));
        assert!(report.python_found);
        assert!(report.can_execute_code);
        assert!(report.version.is_some());
    }
}
