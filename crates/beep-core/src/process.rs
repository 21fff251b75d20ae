use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::progress::CancellationToken;

const PROXY_VARS: [&str; 8] = [
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "ALL_PROXY",
    "all_proxy",
    "NO_PROXY",
    "no_proxy",
];

fn is_proxy_env(key: &str) -> bool {
    PROXY_VARS.contains(&key)
}

const STREAM_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy)]
enum StreamKind {
    Out,
    Err,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Output of a streamed subprocess run. `cancelled` is set when the child
/// was killed because the caller's token fired mid-run.
#[derive(Debug, Clone)]
pub struct StreamedOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub cancelled: bool,
}

/// Execute a program and capture stdout/stderr.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned or the I/O streams
/// cannot be read entirely.
pub fn run_command(
    program: &Path,
    args: &[String],
    envs: &[(String, String)],
    cwd: &Path,
) -> Result<RunOutput> {
    let mut command = configured_command(program, args, envs, cwd);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let output = command
        .output()
        .with_context(|| format!("failed to start {}", program.display()))?;
    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    Ok(RunOutput {
        code,
        stdout,
        stderr,
    })
}

/// Execute a program, forwarding each output line to `on_line` as it
/// arrives and honoring cancellation between lines. The child is killed
/// when the token fires; the partial output is still returned.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned or waited on.
pub fn run_streaming(
    program: &Path,
    args: &[String],
    envs: &[(String, String)],
    cwd: &Path,
    cancel: &CancellationToken,
    on_line: &mut dyn FnMut(&str),
) -> Result<StreamedOutput> {
    let mut command = configured_command(program, args, envs, cwd);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {}", program.display()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout missing for {}", program.display()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr missing for {}", program.display()))?;

    let (tx, rx) = mpsc::channel::<(StreamKind, String)>();
    let tx_err = tx.clone();
    thread::spawn(move || forward_lines(stdout, &tx, StreamKind::Out));
    thread::spawn(move || forward_lines(stderr, &tx_err, StreamKind::Err));

    let mut out_buf = String::new();
    let mut err_buf = String::new();
    let mut cancelled = false;
    loop {
        match rx.recv_timeout(STREAM_POLL) {
            Ok((kind, line)) => {
                on_line(&line);
                let buffer = match kind {
                    StreamKind::Out => &mut out_buf,
                    StreamKind::Err => &mut err_buf,
                };
                buffer.push_str(&line);
                buffer.push('\n');
            }
            Err(RecvTimeoutError::Timeout) => {
                if !cancelled && cancel.is_cancelled() {
                    cancelled = true;
                    let _ = child.kill();
                }
            }
            // Both reader threads finished; the child has closed its pipes.
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = child
        .wait()
        .with_context(|| format!("failed to wait for {}", program.display()))?;
    Ok(StreamedOutput {
        code: status.code().unwrap_or(-1),
        stdout: out_buf,
        stderr: err_buf,
        cancelled,
    })
}

fn forward_lines<K>(stream: impl Read, tx: &mpsc::Sender<(K, String)>, kind: K)
where
    K: Copy,
{
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if tx.send((kind, line)).is_err() {
            break;
        }
    }
}

fn configured_command(
    program: &Path,
    args: &[String],
    envs: &[(String, String)],
    cwd: &Path,
) -> Command {
    let mut command = Command::new(program);
    command.args(args);
    for (key, value) in envs {
        if value.is_empty() && is_proxy_env(key) {
            command.env_remove(key);
            continue;
        }
        command.env(key, value);
    }
    command.current_dir(cwd);
    command
}
