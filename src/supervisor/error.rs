//! Supervisor error kinds. Each variant carries a stable machine-readable
//! code so callers can branch without matching on message text.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::ConfigError;
use super::state_machine::TransitionError;

/// Errors returned synchronously from supervisor construction and `start`/`stop`.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Service at {0} is already running")]
    AlreadyRunning(String),

    #[error("Failed to spawn '{}': {source}", binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Service failed to become ready within {0:?}")]
    ReadinessTimeout(Duration),

    #[error("Service exited before becoming ready ({0})")]
    ExitedDuringStartup(String),

    #[error("Port {0} is in use by a service that does not pass the health check")]
    PortInUse(String),

    #[error("Startup was cancelled by a concurrent stop")]
    Cancelled,

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SupervisorError {
    /// Machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::ReadinessTimeout(_) => "READINESS_TIMEOUT",
            Self::ExitedDuringStartup(_) => "EXITED_DURING_STARTUP",
            Self::PortInUse(_) => "PORT_IN_USE",
            Self::Cancelled => "CANCELLED",
            Self::Transition(_) => "INVALID_TRANSITION",
            Self::Http(_) => "HTTP_CLIENT",
        }
    }

    /// Whether a caller can reasonably retry `start` after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ReadinessTimeout(_) | Self::ExitedDuringStartup(_) | Self::Cancelled | Self::PortInUse(_)
        )
    }
}
