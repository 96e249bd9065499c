//! Owned handle to the spawned service process.
//!
//! The `Child` itself lives in a waiter task that reaps it and publishes the
//! exit on a watch channel. The handle keeps the PID for signal delivery and a
//! channel for forced-kill requests, so stopping and crash monitoring can
//! both observe the same exit without sharing the `Child`.

use std::ffi::OsString;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};

use crate::config::SupervisorConfig;

/// How the process ended, as observed by the waiter task.
#[derive(Debug, Clone)]
pub enum ExitOutcome {
    Exited(ExitStatus),
    WaitFailed(String),
}

impl ExitOutcome {
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(status) => status.code(),
            Self::WaitFailed(_) => None,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(status) => write!(f, "{}", status),
            Self::WaitFailed(e) => write!(f, "wait failed: {}", e),
        }
    }
}

/// Cloneable view of a process exit.
#[derive(Clone)]
pub struct ExitWatch(watch::Receiver<Option<ExitOutcome>>);

impl ExitWatch {
    /// Resolve once the process has exited.
    pub async fn wait(&mut self) -> ExitOutcome {
        match self.0.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome)
                .clone()
                .unwrap_or_else(|| ExitOutcome::WaitFailed("no exit recorded".into())),
            Err(_) => ExitOutcome::WaitFailed("waiter task ended without reporting".into()),
        }
    }

    pub fn has_exited(&self) -> bool {
        self.0.borrow().is_some()
    }
}

/// Stdout/stderr pipes handed to the output relay.
pub struct OutputPipes {
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

pub struct ServiceProcess {
    pid: u32,
    exit: ExitWatch,
    kill_tx: mpsc::Sender<()>,
}

/// Command-line arguments for the service binary (llama-server long flags).
/// The model path is passed through untouched, even if it is not UTF-8.
pub fn build_args(config: &SupervisorConfig) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--model".into(),
        config.model.as_os_str().to_owned(),
        "--host".into(),
        config.host.as_str().into(),
        "--port".into(),
        config.port.to_string().into(),
        "--threads".into(),
        config.threads.to_string().into(),
    ];
    args.extend(config.extra_args.iter().map(OsString::from));
    args
}

impl ServiceProcess {
    /// Spawn the service binary with stdout/stderr piped.
    ///
    /// The child inherits the supervisor's working directory, so relative
    /// paths mean the same thing to it as they did to validation.
    pub fn spawn(config: &SupervisorConfig) -> std::io::Result<(Self, OutputPipes)> {
        let mut cmd = Command::new(&config.binary);
        cmd.args(build_args(config))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        hide_console_window(&mut cmd);

        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "spawned process has no PID")
        })?;

        let pipes = OutputPipes {
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(4);

        // ── process waiter ───────────────────────────────────
        tokio::spawn(async move {
            let mut handle_alive = true;
            let outcome = loop {
                tokio::select! {
                    status = child.wait() => {
                        break match status {
                            Ok(status) => ExitOutcome::Exited(status),
                            Err(e) => ExitOutcome::WaitFailed(e.to_string()),
                        };
                    }
                    request = kill_rx.recv(), if handle_alive => {
                        // a dropped handle ties the child's lifetime to its owner
                        if request.is_none() {
                            handle_alive = false;
                        }
                        if let Err(e) = child.start_kill() {
                            tracing::warn!(pid, "Failed to kill service process: {}", e);
                        }
                    }
                }
            };
            tracing::debug!(pid, "Service process exited with {}", outcome);
            let _ = exit_tx.send(Some(outcome));
        });

        Ok((
            Self {
                pid,
                exit: ExitWatch(exit_rx),
                kill_tx,
            },
            pipes,
        ))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.has_exited()
    }

    pub async fn wait_exit(&self) -> ExitOutcome {
        self.exit.clone().wait().await
    }

    /// Ask the process to shut down gracefully (SIGINT).
    #[cfg(unix)]
    pub fn interrupt(&self) -> Result<(), String> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if self.has_exited() {
            return Ok(());
        }
        signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGINT)
            .map_err(|e| format!("failed to send SIGINT to {}: {}", self.pid, e))
    }

    /// No interrupt signal on this platform; termination is forced.
    #[cfg(not(unix))]
    pub fn interrupt(&self) -> Result<(), String> {
        self.force_kill();
        Ok(())
    }

    /// Forced termination, delivered through the waiter task that owns the child.
    pub fn force_kill(&self) {
        if self.has_exited() {
            return;
        }
        if self.kill_tx.try_send(()).is_err() {
            tracing::debug!(pid = self.pid, "Kill request dropped; waiter already finished or busy");
        }
    }

    /// Force-kill and wait (bounded) for the exit to be reaped.
    pub async fn kill_and_reap(&self, timeout: Duration) -> Option<ExitOutcome> {
        self.force_kill();
        match tokio::time::timeout(timeout, self.wait_exit()).await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                tracing::error!(pid = self.pid, "Service process was not reaped within {:?}", timeout);
                None
            }
        }
    }
}

#[cfg(target_os = "windows")]
fn hide_console_window(cmd: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(target_os = "windows"))]
fn hide_console_window(_cmd: &mut Command) {}
