//! Bootstrap orchestration against the system interpreter: no network,
//! no embedded download. Tests return early when `python3` is missing.

use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use beep_core::{
    BootstrapOptions, CancellationToken, ExecOptions, ProgressSink, ProgressUpdate, PythonHost,
};
use beep_domain::DataLayout;

fn has_python() -> bool {
    which::which("python3").is_ok()
}

fn offline_options(name: &str) -> BootstrapOptions {
    BootstrapOptions {
        ensure_embedded_python: false,
        environment_name: Some(name.to_string()),
        set_as_default: true,
        ..BootstrapOptions::default()
    }
}

#[test]
fn cold_bootstrap_creates_env_and_sets_default() {
    if !has_python() {
        return;
    }
    let _ = tracing_subscriber::fmt::try_init();
    let scratch = TempDir::new().expect("tempdir");
    let layout = DataLayout::at(scratch.path().join("home"));
    let host = PythonHost::initialize(layout.clone()).expect("host");

    let stages = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let stages = Arc::clone(&stages);
        ProgressSink::new(move |update| {
            if let ProgressUpdate::Phase { label, percent } = update {
                stages.lock().expect("stages lock").push((label, percent));
            }
        })
    };

    let result = host.ensure_python_environment(
        &offline_options("data-science"),
        &sink,
        &CancellationToken::new(),
    );
    assert!(result.is_successful, "{:?}", result.validation_messages);

    let base_id = result.base_runtime_id.clone().expect("base runtime");
    assert_eq!(
        host.registry().get_default().map(|runtime| runtime.id),
        Some(base_id.clone())
    );

    let env_path = result.environment_path.clone().expect("env path");
    assert_eq!(env_path, layout.venv_dir("data-science"));
    assert!(env_path.join("pyvenv.cfg").is_file());

    // The stage channel ends on Complete with a monotone percentage.
    let stages = stages.lock().expect("stages lock").clone();
    let last = stages.last().expect("stages reported");
    assert_eq!(last.0, "Complete");
    assert_eq!(last.1, 100);
    let bootstrap_percents: Vec<u8> = stages
        .iter()
        .filter(|(label, _)| {
            // Provisioner phases interleave with their own scale.
            !matches!(
                label.as_str(),
                "Download" | "Extraction" | "Configuration" | "PipInstallation" | "Verification"
            )
        })
        .map(|(_, percent)| *percent)
        .collect();
    assert!(bootstrap_percents.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn warm_bootstrap_reuses_runtime_and_env() {
    if !has_python() {
        return;
    }
    let scratch = TempDir::new().expect("tempdir");
    let layout = DataLayout::at(scratch.path().join("home"));
    let host = PythonHost::initialize(layout.clone()).expect("host");
    let options = offline_options("repeat");

    let first = host.ensure_python_environment(&options, &ProgressSink::null(), &CancellationToken::new());
    assert!(first.is_successful, "{:?}", first.validation_messages);

    let second = host.ensure_python_environment(&options, &ProgressSink::null(), &CancellationToken::new());
    assert!(second.is_successful, "{:?}", second.validation_messages);
    assert_eq!(first.base_runtime_id, second.base_runtime_id);
    assert_eq!(first.environment_path, second.environment_path);
    assert!(second
        .validation_messages
        .iter()
        .any(|message| message.contains("reusing environment")));
}

#[test]
fn state_survives_a_host_restart() {
    if !has_python() {
        return;
    }
    let scratch = TempDir::new().expect("tempdir");
    let layout = DataLayout::at(scratch.path().join("home"));

    let (base_id, env_path) = {
        let host = PythonHost::initialize(layout.clone()).expect("host");
        let result = host.ensure_python_environment(
            &offline_options("persistent"),
            &ProgressSink::null(),
            &CancellationToken::new(),
        );
        assert!(result.is_successful, "{:?}", result.validation_messages);
        (
            result.base_runtime_id.expect("base runtime"),
            result.environment_path.expect("env path"),
        )
    };

    let reopened = PythonHost::initialize(layout).expect("reopened host");
    let restored = reopened.registry().get(&base_id).expect("restored runtime");
    assert_eq!(restored.id, base_id);
    assert_eq!(
        reopened.registry().get_default().map(|runtime| runtime.id),
        Some(base_id)
    );

    let env = reopened
        .envs()
        .get_by_path(&env_path)
        .expect("rehydrated env");
    assert_eq!(env.path, env_path);

    // The rehydrated env still executes with its persistent scope.
    let session = reopened
        .sessions()
        .get_or_create("alice", &env.id, false)
        .expect("session");
    let set = reopened
        .engine()
        .execute(&session.id, "marker = 'alive'", &ExecOptions::default())
        .expect("exec");
    assert!(set.success, "{set:?}");
    let get = reopened
        .engine()
        .execute(&session.id, "print(marker)", &ExecOptions::default())
        .expect("exec");
    assert_eq!(get.stdout, "alive\n");
}

#[test]
fn cancelled_bootstrap_reports_failed() {
    if !has_python() {
        return;
    }
    let scratch = TempDir::new().expect("tempdir");
    let host =
        PythonHost::initialize(DataLayout::at(scratch.path().join("home"))).expect("host");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result =
        host.ensure_python_environment(&offline_options("never"), &ProgressSink::null(), &cancel);
    assert!(!result.is_successful);
    assert!(result
        .validation_messages
        .iter()
        .any(|message| message.contains("cancelled")));
}

#[test]
fn unknown_profiles_fail_before_any_work() {
    if !has_python() {
        return;
    }
    let scratch = TempDir::new().expect("tempdir");
    let host =
        PythonHost::initialize(DataLayout::at(scratch.path().join("home"))).expect("host");
    let options = BootstrapOptions {
        package_profiles: vec!["does-not-exist".to_string()],
        ..offline_options("profiled")
    };

    let result = host.ensure_python_environment(
        &options,
        &ProgressSink::null(),
        &CancellationToken::new(),
    );
    assert!(!result.is_successful);
    assert!(result
        .validation_messages
        .iter()
        .any(|message| message.contains("unknown package profile")));
    assert!(!host.layout().venv_dir("profiled").exists());
}
