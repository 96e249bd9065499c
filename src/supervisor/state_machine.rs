use serde::Serialize;
use thiserror::Error;

/// Lifecycle state of the supervised service.
///
/// `Starting` and `Stopping` only exist while the supervisor guard is held,
/// so outside observers see `Idle`, `Running`, `Stopped` or `Crashed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl State {
    pub fn is_running(self) -> bool {
        self == State::Running
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(State, State),
}

pub struct StateMachine {
    state: State,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: State::Idle }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn can_transition(&self, to: State) -> bool {
        matches!(
            (self.state, to),
            (State::Idle, State::Starting)
                | (State::Stopped, State::Starting)
                | (State::Crashed, State::Starting)
                | (State::Starting, State::Running)
                | (State::Starting, State::Stopped)
                | (State::Running, State::Stopping)
                | (State::Running, State::Crashed)
                | (State::Stopping, State::Stopped)
        )
    }

    pub fn transition(&mut self, to: State) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::debug!("State transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}
