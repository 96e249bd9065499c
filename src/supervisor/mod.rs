//! Lifecycle supervisor for the llama-server subprocess.
//!
//! One `Supervisor` owns one service: it spawns the binary, waits for the
//! health endpoint, watches for unexpected exits and shuts the process down
//! with a graceful-then-forced escalation.
//!
//! Every state transition happens under a single async mutex (the guard).
//! The running flag is mirrored into a watch channel from inside the guard,
//! so `is_running` never waits on an in-flight `start` or `stop`.

pub mod error;
mod monitor;
pub mod probe;
pub mod process;
pub mod relay;
pub mod state_machine;

use std::fmt;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;

pub use error::SupervisorError;
pub use probe::{ProbeError, ReadinessProbe};
pub use process::{ExitOutcome, ServiceProcess};
pub use relay::{ConsoleBuffer, LogLevel, LogLine, LogSource};
pub use state_machine::{State, StateMachine, TransitionError};

use relay::SharedConsole;

const EVENT_CAPACITY: usize = 256;
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
/// Upper bound for reaping a process after a forced kill.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Events ──────────────────────────────────────────────────

/// Lifecycle events, published to subscribers and mirrored into `tracing`
/// and the console buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Starting { address: String },
    Spawned { pid: u32 },
    /// A healthy service was already listening; it was taken over, not spawned.
    Adopted { address: String },
    Ready { address: String, pid: u32, attempts: u32 },
    StartFailed { reason: String },
    Stopping { pid: Option<u32> },
    ForceKilled { pid: u32 },
    Stopped { pid: Option<u32> },
    UnexpectedExit { pid: u32, code: Option<i32>, status: String },
    /// An adopted service stopped answering its health check.
    AdoptedLost { address: String, failures: u32 },
}

impl SupervisorEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Starting { .. } => "starting",
            Self::Spawned { .. } => "spawned",
            Self::Adopted { .. } => "adopted",
            Self::Ready { .. } => "ready",
            Self::StartFailed { .. } => "start_failed",
            Self::Stopping { .. } => "stopping",
            Self::ForceKilled { .. } => "force_killed",
            Self::Stopped { .. } => "stopped",
            Self::UnexpectedExit { .. } => "unexpected_exit",
            Self::AdoptedLost { .. } => "adopted_lost",
        }
    }

    fn level(&self) -> LogLevel {
        match self {
            Self::StartFailed { .. } | Self::UnexpectedExit { .. } | Self::AdoptedLost { .. } => LogLevel::Error,
            Self::ForceKilled { .. } => LogLevel::Warn,
            _ => LogLevel::Info,
        }
    }
}

impl fmt::Display for SupervisorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting { address } => write!(f, "Starting service at {}", address),
            Self::Spawned { pid } => write!(f, "Process started with PID {}", pid),
            Self::Adopted { address } => write!(f, "Adopted healthy service already listening at {}", address),
            Self::Ready { address, pid, attempts } => {
                write!(f, "Service ready at {} (PID {}, {} health checks)", address, pid, attempts)
            }
            Self::StartFailed { reason } => write!(f, "Start failed: {}", reason),
            Self::Stopping { pid: Some(pid) } => write!(f, "Stopping service (PID {})", pid),
            Self::Stopping { pid: None } => write!(f, "Releasing adopted service"),
            Self::ForceKilled { pid } => write!(f, "Grace period elapsed, force-killing PID {}", pid),
            Self::Stopped { .. } => write!(f, "Service stopped"),
            Self::UnexpectedExit { pid, status, .. } => {
                write!(f, "Service (PID {}) exited unexpectedly with {}", pid, status)
            }
            Self::AdoptedLost { address, failures } => write!(
                f,
                "Adopted service at {} stopped answering health checks ({} failures)",
                address, failures
            ),
        }
    }
}

// ─── Shared State ────────────────────────────────────────────

/// Everything guarded by the supervisor lock.
struct Inner {
    machine: StateMachine,
    /// Bumped on every successful start; lets the crash monitor tell its own
    /// lifetime apart from a later one.
    generation: u64,
    process: Option<ServiceProcess>,
    running_tx: watch::Sender<bool>,
}

impl Inner {
    fn set_state(&mut self, to: State) -> Result<(), TransitionError> {
        self.machine.transition(to)?;
        self.running_tx.send_replace(to.is_running());
        Ok(())
    }
}

/// State shared with background tasks.
struct Shared {
    inner: Mutex<Inner>,
    events: broadcast::Sender<SupervisorEvent>,
    console: SharedConsole,
}

impl Shared {
    async fn emit(&self, event: SupervisorEvent) {
        let kind = event.kind();
        let level = event.level();
        match level {
            LogLevel::Error => tracing::error!(event = kind, "{}", event),
            LogLevel::Warn => tracing::warn!(event = kind, "{}", event),
            _ => tracing::info!(event = kind, "{}", event),
        }
        self.console.lock().await.push(LogSource::System, event.to_string(), level);
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

// ─── Supervisor ──────────────────────────────────────────────

pub struct Supervisor {
    config: SupervisorConfig,
    shared: Arc<Shared>,
    running_rx: watch::Receiver<bool>,
    /// Aborts an in-flight readiness poll. Replaced on every stop so the
    /// supervisor can be started again.
    cancel: std::sync::Mutex<CancellationToken>,
    probe: ReadinessProbe,
    level_pattern: Option<Arc<Regex>>,
}

impl Supervisor {
    /// Build a supervisor. Fails if the binary or model path does not exist.
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        config.validate()?;

        let probe = ReadinessProbe::new(
            config.health_url(),
            config.probe_timeout,
            config.ready_timeout,
            config.poll_interval,
        )?;
        let level_pattern = relay::compile_level_pattern(config.log_pattern.as_deref());

        let (running_tx, running_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                machine: StateMachine::new(),
                generation: 0,
                process: None,
                running_tx,
            }),
            events,
            console: Arc::new(Mutex::new(ConsoleBuffer::default())),
        });

        Ok(Self {
            config,
            shared,
            running_rx,
            cancel: std::sync::Mutex::new(CancellationToken::new()),
            probe,
            level_pattern,
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Base address of the service. Pure formatting, valid before `start`.
    pub fn address(&self) -> String {
        self.config.address()
    }

    /// Whether the service is currently usable. Never blocks.
    ///
    /// An owned process is reported as gone as soon as it exits. An adopted
    /// service has no process to watch, so it is polled on its health
    /// endpoint and reported as gone after a few consecutive failures.
    pub fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    /// Receiver that follows `is_running`.
    pub fn watch_running(&self) -> watch::Receiver<bool> {
        self.running_rx.clone()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.shared.events.subscribe()
    }

    pub async fn state(&self) -> State {
        self.shared.inner.lock().await.machine.state()
    }

    /// PID of the owned process; `None` when idle or when the service was adopted.
    pub async fn pid(&self) -> Option<u32> {
        self.shared.inner.lock().await.process.as_ref().map(ServiceProcess::pid)
    }

    /// Console lines with `id > since_id`. IDs start at 1, so 0 returns
    /// everything still buffered.
    pub async fn console_since(&self, since_id: u64) -> Vec<LogLine> {
        self.shared.console.lock().await.since(since_id)
    }

    /// The most recent `count` console lines.
    pub async fn recent_console(&self, count: usize) -> Vec<LogLine> {
        self.shared.console.lock().await.recent(count)
    }

    /// Start the service and wait until it answers its health check.
    ///
    /// If a healthy service already listens on the configured address it is
    /// adopted instead of spawning a second one. On any failure after the
    /// spawn, the child is killed before this returns.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.machine.state().is_running() {
            return Err(SupervisorError::AlreadyRunning(self.address()));
        }

        let cancel = self.token().clone();
        inner.set_state(State::Starting)?;
        self.shared
            .emit(SupervisorEvent::Starting {
                address: self.address(),
            })
            .await;

        match self.launch(&mut inner, &cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                inner.set_state(State::Stopped)?;
                self.shared
                    .emit(SupervisorEvent::StartFailed { reason: e.to_string() })
                    .await;
                Err(e)
            }
        }
    }

    async fn launch(&self, inner: &mut Inner, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        if probe::port_in_use(&self.config.host, self.config.port, PORT_PROBE_TIMEOUT).await {
            if !self.probe.check().await {
                return Err(SupervisorError::PortInUse(self.address()));
            }
            inner.generation += 1;
            inner.process = None;
            monitor::watch_adopted(
                self.shared.clone(),
                inner.generation,
                self.probe.clone(),
                self.address(),
                self.config.poll_interval,
            );
            inner.set_state(State::Running)?;
            self.shared
                .emit(SupervisorEvent::Adopted {
                    address: self.address(),
                })
                .await;
            return Ok(());
        }

        let (process, pipes) = ServiceProcess::spawn(&self.config).map_err(|source| SupervisorError::Spawn {
            binary: self.config.binary.clone(),
            source,
        })?;
        let pid = process.pid();
        self.shared.emit(SupervisorEvent::Spawned { pid }).await;
        relay::attach(pipes, pid, self.shared.console.clone(), self.level_pattern.clone());

        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SupervisorError::Cancelled),
            outcome = process.wait_exit() => Err(SupervisorError::ExitedDuringStartup(outcome.to_string())),
            ready = self.probe.wait_until_ready() => {
                ready.map_err(|_| SupervisorError::ReadinessTimeout(self.config.ready_timeout))
            }
        };

        let attempts = match ready {
            Ok(attempts) => attempts,
            Err(e) => {
                tracing::warn!(pid, "Terminating service process after failed start: {}", e);
                process.kill_and_reap(KILL_REAP_TIMEOUT).await;
                return Err(e);
            }
        };

        inner.generation += 1;
        monitor::launch(self.shared.clone(), inner.generation, pid, process.exit_watch());
        inner.process = Some(process);
        inner.set_state(State::Running)?;
        self.shared
            .emit(SupervisorEvent::Ready {
                address: self.address(),
                pid,
                attempts,
            })
            .await;
        Ok(())
    }

    /// Stop the service. A no-op when not running; safe to call repeatedly.
    ///
    /// Sends an interrupt, waits up to the grace period, then force-kills.
    /// An in-flight `start` is cancelled first so this does not wait out its
    /// readiness deadline.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.cancel_in_flight();

        let mut inner = self.shared.inner.lock().await;
        if !inner.machine.state().is_running() {
            tracing::debug!("Stop requested while not running");
            return Ok(());
        }

        inner.set_state(State::Stopping)?;
        let process = inner.process.take();
        let pid = process.as_ref().map(ServiceProcess::pid);
        self.shared.emit(SupervisorEvent::Stopping { pid }).await;

        match process {
            Some(process) => self.terminate(process).await,
            None => tracing::info!(address = %self.address(), "Adopted service is not owned; leaving it running"),
        }

        inner.set_state(State::Stopped)?;
        self.shared.emit(SupervisorEvent::Stopped { pid }).await;
        Ok(())
    }

    /// Wait for exit OR the grace period, whichever comes first, then escalate.
    async fn terminate(&self, process: ServiceProcess) {
        let pid = process.pid();
        if let Err(e) = process.interrupt() {
            tracing::warn!(pid, "{}", e);
        }

        let graceful = tokio::time::timeout(self.config.grace_period, process.wait_exit()).await;
        match graceful {
            Ok(outcome) => tracing::info!(pid, "Service exited with {}", outcome),
            Err(_) => {
                self.shared.emit(SupervisorEvent::ForceKilled { pid }).await;
                if let Some(outcome) = process.kill_and_reap(KILL_REAP_TIMEOUT).await {
                    tracing::info!(pid, "Service exited with {}", outcome);
                }
            }
        }
    }

    fn token(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel the current token and install a fresh one for the next start.
    fn cancel_in_flight(&self) {
        let previous = std::mem::replace(&mut *self.token(), CancellationToken::new());
        previous.cancel();
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.token().cancel();
        // The crash monitor keeps `Shared` alive, so release the child here.
        if let Ok(mut inner) = self.shared.inner.try_lock() {
            if let Some(process) = inner.process.take() {
                tracing::info!(pid = process.pid(), "Supervisor dropped, killing service process");
                process.force_kill();
                let _ = inner.set_state(State::Stopping);
                let _ = inner.set_state(State::Stopped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use std::fs;

    fn supervisor(dir: &std::path::Path) -> Supervisor {
        let binary = dir.join("llama-server");
        let model = dir.join("model.gguf");
        fs::write(&binary, b"").unwrap();
        fs::write(&model, b"").unwrap();
        let config = SupervisorConfig::resolve(Settings {
            binary: Some(binary),
            model: Some(model),
            port: Some(18080),
            ..Settings::default()
        })
        .unwrap();
        Supervisor::new(config).unwrap()
    }

    #[tokio::test]
    async fn fresh_supervisor_is_idle() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        assert!(!sup.is_running());
        assert_eq!(sup.state().await, State::Idle);
        assert_eq!(sup.pid().await, None);
        assert_eq!(sup.address(), "http://127.0.0.1:18080");
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let mut events = sup.subscribe();
        sup.stop().await.unwrap();
        sup.stop().await.unwrap();
        assert!(!sup.is_running());
        assert_eq!(sup.state().await, State::Idle);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn construction_requires_existing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let mut config = sup.config().clone();
        config.binary = dir.path().join("missing-binary");
        let err = Supervisor::new(config).err().unwrap();
        assert_eq!(err.error_code(), "CONFIG");
    }

    #[test]
    fn event_messages() {
        let event = SupervisorEvent::UnexpectedExit {
            pid: 7,
            code: Some(3),
            status: "exit status: 3".into(),
        };
        assert_eq!(event.kind(), "unexpected_exit");
        assert_eq!(event.level(), LogLevel::Error);
        assert_eq!(event.to_string(), "Service (PID 7) exited unexpectedly with exit status: 3");
        assert_eq!(SupervisorEvent::Stopping { pid: None }.to_string(), "Releasing adopted service");
    }
}
