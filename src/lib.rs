pub mod config;
pub mod path_resolver;
pub mod supervisor;

pub use config::{ConfigError, Settings, SupervisorConfig};
pub use supervisor::{State, Supervisor, SupervisorError, SupervisorEvent};
