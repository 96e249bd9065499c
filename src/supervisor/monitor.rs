//! Crash monitor: one background task per service lifetime that waits for the
//! process to exit and reconciles supervisor state if nobody asked it to stop.
//! Adopted services have no process, so they are watched through their
//! health endpoint instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::probe::ReadinessProbe;
use super::process::ExitWatch;
use super::state_machine::State;
use super::{Shared, SupervisorEvent};

/// Watch `exit` for the lifetime started as `generation`.
///
/// A deliberate stop holds the guard while the process exits and leaves the
/// state at `Stopped`, and a later restart bumps the generation. Either way
/// the monitor finds nothing to do and stays silent.
pub(super) fn launch(shared: Arc<Shared>, generation: u64, pid: u32, mut exit: ExitWatch) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = exit.wait().await;

        let mut inner = shared.inner.lock().await;
        if inner.generation != generation || inner.machine.state() != State::Running {
            tracing::debug!(pid, generation, "Service exit after deliberate stop: {}", outcome);
            return;
        }

        inner.process = None;
        if let Err(e) = inner.set_state(State::Crashed) {
            tracing::error!(pid, "Crash reconciliation failed: {}", e);
            return;
        }

        shared
            .emit(SupervisorEvent::UnexpectedExit {
                pid,
                code: outcome.code(),
                status: outcome.to_string(),
            })
            .await;
    })
}

/// Consecutive failed health checks before an adopted service counts as gone.
const ADOPTED_FAILURE_THRESHOLD: u32 = 3;

/// Poll an adopted service every `interval` for the lifetime `generation`.
pub(super) fn watch_adopted(
    shared: Arc<Shared>,
    generation: u64,
    probe: ReadinessProbe,
    address: String,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures = 0u32;
        loop {
            tokio::time::sleep(interval).await;
            if !still_current(&shared, generation).await {
                return;
            }

            if probe.check().await {
                failures = 0;
                continue;
            }
            failures += 1;
            tracing::debug!(generation, failures, "Adopted service failed a health check");
            if failures < ADOPTED_FAILURE_THRESHOLD {
                continue;
            }

            let mut inner = shared.inner.lock().await;
            if inner.generation != generation || inner.machine.state() != State::Running {
                return;
            }
            if let Err(e) = inner.set_state(State::Crashed) {
                tracing::error!("Crash reconciliation failed: {}", e);
                return;
            }
            shared.emit(SupervisorEvent::AdoptedLost { address, failures }).await;
            return;
        }
    })
}

async fn still_current(shared: &Shared, generation: u64) -> bool {
    let inner = shared.inner.lock().await;
    inner.generation == generation && inner.machine.state() == State::Running
}
