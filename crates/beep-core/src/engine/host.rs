use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use beep_domain::EnvId;

use super::driver::PY_DRIVER;
use crate::progress::CancellationToken;

const POLL: Duration = Duration::from_millis(25);

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct DriverReply {
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AbortReason {
    Timeout,
    Cancelled,
}

#[derive(Debug)]
pub(crate) enum ExecOutcome {
    /// The driver answered normally (the snippet may still have raised).
    Reply(DriverReply),
    /// An interrupt was injected and the snippet yielded within the grace
    /// window; buffers up to the interrupt are preserved.
    Interrupted {
        reply: Option<DriverReply>,
        reason: AbortReason,
    },
    /// The snippet did not yield; the host process was killed (managed
    /// hosts) or abandoned (shared interpreters).
    Killed { reason: AbortReason },
    /// Cancellation observed before the request was dispatched.
    NotStarted { reason: AbortReason },
    /// The host process died underneath us.
    HostLost,
}

struct Job {
    id: u64,
    request: String,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    reply_to: Sender<ExecOutcome>,
}

/// One resident interpreter process plus the worker thread that owns it.
/// All submissions funnel through a single-consumer channel, which is the
/// interpreter lock: jobs run strictly in submission order.
pub(crate) struct InterpreterHost {
    jobs: Sender<Job>,
    alive: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl InterpreterHost {
    pub(crate) fn spawn(
        env_id: EnvId,
        interpreter: &Path,
        workdir: &Path,
        managed: bool,
        grace: Duration,
    ) -> Result<Self> {
        let mut command = Command::new(interpreter);
        command.arg("-u").arg("-c").arg(PY_DRIVER);
        command.current_dir(workdir);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start interpreter {}", interpreter.display()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("interpreter host has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("interpreter host has no stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("interpreter host has no stderr"))?;

        let stderr_env = env_id.clone();
        thread::spawn(move || {
            let mut buffer = String::new();
            let _ = BufReader::new(stderr).read_to_string(&mut buffer);
            if !buffer.trim().is_empty() {
                debug!(env = %stderr_env, output = %buffer.trim(), "interpreter host stderr");
            }
        });

        let (reply_tx, reply_rx) = mpsc::channel::<DriverReply>();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                // Anything unparseable is stray user output on the channel.
                if let Ok(reply) = serde_json::from_str::<DriverReply>(&line) {
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
            }
        });

        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let alive = Arc::new(AtomicBool::new(true));
        let worker_alive = Arc::clone(&alive);
        let worker_env = env_id.clone();
        thread::spawn(move || {
            worker_loop(child, stdin, &reply_rx, &job_rx, &worker_alive, managed, grace);
            debug!(env = %worker_env, "interpreter host worker finished");
        });

        debug!(env = %env_id, interpreter = %interpreter.display(), "interpreter host started");
        Ok(Self {
            jobs: job_tx,
            alive,
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(AtomicOrdering::SeqCst)
    }

    pub(crate) fn submit_exec(
        &self,
        scope: &str,
        code: &str,
        vars: Option<&serde_json::Map<String, Value>>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ExecOutcome {
        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        let mut payload = json!({
            "op": "exec",
            "id": id,
            "session": scope,
            "code": code,
        });
        if let Some(vars) = vars {
            payload["vars"] = Value::Object(vars.clone());
        }
        self.submit(id, payload.to_string(), timeout, cancel.clone())
    }

    /// Dispatch a non-exec op (`ensure`, `drop`) with a short deadline.
    pub(crate) fn submit_control(&self, op: &str, scope: &str) -> ExecOutcome {
        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        let payload = json!({ "op": op, "id": id, "session": scope });
        self.submit(
            id,
            payload.to_string(),
            Some(Duration::from_secs(5)),
            CancellationToken::new(),
        )
    }

    fn submit(
        &self,
        id: u64,
        request: String,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> ExecOutcome {
        let (tx, rx) = mpsc::channel();
        let job = Job {
            id,
            request,
            timeout,
            cancel,
            reply_to: tx,
        };
        if self.jobs.send(job).is_err() {
            return ExecOutcome::HostLost;
        }
        rx.recv().unwrap_or(ExecOutcome::HostLost)
    }
}

fn worker_loop(
    mut child: Child,
    mut stdin: ChildStdin,
    replies: &Receiver<DriverReply>,
    jobs: &Receiver<Job>,
    alive: &Arc<AtomicBool>,
    managed: bool,
    grace: Duration,
) {
    for job in jobs.iter() {
        if job.cancel.is_cancelled() {
            let _ = job.reply_to.send(ExecOutcome::NotStarted {
                reason: AbortReason::Cancelled,
            });
            continue;
        }
        if writeln!(stdin, "{}", job.request)
            .and_then(|()| stdin.flush())
            .is_err()
        {
            alive.store(false, AtomicOrdering::SeqCst);
            let _ = job.reply_to.send(ExecOutcome::HostLost);
            break;
        }
        let started = Instant::now();
        let deadline = job.timeout.map(|timeout| started + timeout);
        let mut abort: Option<(AbortReason, Instant)> = None;
        let outcome = loop {
            match replies.recv_timeout(POLL) {
                Ok(reply) if reply.id == Some(job.id) => {
                    break match abort {
                        Some((reason, _)) => ExecOutcome::Interrupted {
                            reply: Some(reply),
                            reason,
                        },
                        None => ExecOutcome::Reply(reply),
                    };
                }
                Ok(stale) => {
                    debug!(id = ?stale.id, "dropping stale driver reply");
                }
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    match abort {
                        None => {
                            let reason = if job.cancel.is_cancelled() {
                                Some(AbortReason::Cancelled)
                            } else if deadline.is_some_and(|deadline| now >= deadline) {
                                Some(AbortReason::Timeout)
                            } else {
                                None
                            };
                            if let Some(reason) = reason {
                                send_interrupt(&child);
                                abort = Some((reason, now));
                            }
                        }
                        Some((reason, since)) if now.duration_since(since) >= grace => {
                            alive.store(false, AtomicOrdering::SeqCst);
                            if managed {
                                let _ = child.kill();
                            } else {
                                warn!("abandoning unresponsive shared interpreter host");
                            }
                            break ExecOutcome::Killed { reason };
                        }
                        Some(_) => {}
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    alive.store(false, AtomicOrdering::SeqCst);
                    break ExecOutcome::HostLost;
                }
            }
        };
        let finished = alive.load(AtomicOrdering::SeqCst);
        let _ = job.reply_to.send(outcome);
        if !finished {
            break;
        }
    }
    alive.store(false, AtomicOrdering::SeqCst);
    if managed {
        let _ = child.kill();
        let _ = child.wait();
    } else {
        // Reap in the background; never kill an interpreter we don't own.
        thread::spawn(move || {
            let _ = child.wait();
        });
    }
}

#[cfg(unix)]
fn send_interrupt(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let pid = Pid::from_raw(child.id() as i32);
    if let Err(err) = kill(pid, Signal::SIGINT) {
        warn!(error = %err, "failed to interrupt interpreter host");
    }
}

#[cfg(not(unix))]
fn send_interrupt(_child: &Child) {
    // No interrupt analogue is wired on this platform; escalation goes
    // straight to kill after the grace window.
}
