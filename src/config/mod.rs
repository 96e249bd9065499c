//! Configuration loading and validation.
//!
//! `Settings` is the raw, all-optional shape read from `config/sidecar.toml`
//! and environment overrides. `SupervisorConfig` is the validated, immutable
//! result that a `Supervisor` is built from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::path_resolver::PathResolver;

pub const DEFAULT_CONFIG_PATH: &str = "config/sidecar.toml";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_THREADS: u32 = 4;
pub const DEFAULT_HEALTH_PATH: &str = "/health";
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

const ENV_PREFIX: &str = "LLAMA_SIDECAR_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{what} not found at '{}'", path.display())]
    MissingPath { what: String, path: PathBuf },

    #[error("{what} not found (searched {} locations)", searched.len())]
    NotFound { what: String, searched: Vec<PathBuf> },

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Raw settings as written in the TOML file. Every key is optional.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub threads: Option<u32>,
    pub binary: Option<PathBuf>,
    pub model: Option<PathBuf>,
    pub health_path: Option<String>,
    pub ready_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub grace_period_secs: Option<u64>,
    /// Regex with a named `level` group used to classify relayed output
    pub log_pattern: Option<String>,
    pub extra_args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Settings {
    /// Load from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `LLAMA_SIDECAR_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (keys carry the `LLAMA_SIDECAR_` prefix).
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.is_empty());

        if let Some(host) = get("HOST") {
            self.host = Some(host);
        }
        if let Some(port) = get("PORT") {
            self.port = Some(parse_value("port", &port)?);
        }
        if let Some(threads) = get("THREADS") {
            self.threads = Some(parse_value("threads", &threads)?);
        }
        if let Some(binary) = get("BINARY") {
            self.binary = Some(PathBuf::from(binary));
        }
        if let Some(model) = get("MODEL") {
            self.model = Some(PathBuf::from(model));
        }
        Ok(self)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Make a resolved path absolute so it names the same file no matter which
/// directory it is later used from.
fn absolute(path: PathBuf) -> Result<PathBuf, ConfigError> {
    std::fs::canonicalize(&path).map_err(|source| ConfigError::Io { path, source })
}

/// Validated supervisor configuration. Both paths existed when it was
/// resolved, and `resolve` leaves them absolute.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub host: String,
    pub port: u16,
    pub threads: u32,
    pub binary: PathBuf,
    pub model: PathBuf,
    pub health_path: String,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub grace_period: Duration,
    pub log_pattern: Option<String>,
    pub extra_args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl SupervisorConfig {
    /// Fill defaults, resolve paths and validate.
    pub fn resolve(settings: Settings) -> Result<Self, ConfigError> {
        let binary = PathResolver::resolve_explicit_or_default(
            "service binary",
            settings.binary.as_deref(),
            &PathResolver::default_binary_candidates(),
        )?;
        let model = PathResolver::resolve_explicit_or_default(
            "model file",
            settings.model.as_deref(),
            &PathResolver::default_model_candidates(),
        )?;
        let binary = absolute(binary)?;
        let model = absolute(model)?;

        let threads = settings.threads.unwrap_or(DEFAULT_THREADS);
        if threads == 0 {
            return Err(ConfigError::InvalidValue {
                key: "threads".into(),
                value: "0".into(),
            });
        }

        let mut health_path = settings.health_path.unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string());
        if !health_path.starts_with('/') {
            health_path.insert(0, '/');
        }

        let config = Self {
            host: settings
                .host
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: settings.port.unwrap_or(DEFAULT_PORT),
            threads,
            binary,
            model,
            health_path,
            ready_timeout: settings
                .ready_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_READY_TIMEOUT),
            poll_interval: settings
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            probe_timeout: settings
                .probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_PROBE_TIMEOUT),
            grace_period: settings
                .grace_period_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_GRACE_PERIOD),
            log_pattern: settings.log_pattern,
            extra_args: settings.extra_args,
            env: settings.env.into_iter().collect(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Both the binary and the model must exist on disk.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.binary.exists() {
            return Err(ConfigError::MissingPath {
                what: "service binary".into(),
                path: self.binary.clone(),
            });
        }
        if !self.model.exists() {
            return Err(ConfigError::MissingPath {
                what: "model file".into(),
                path: self.model.clone(),
            });
        }
        Ok(())
    }

    /// Base address of the service, e.g. `http://127.0.0.1:8080`.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.address(), self.health_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    fn with_files(dir: &Path) -> Settings {
        let binary = dir.join("llama-server");
        let model = dir.join("model.gguf");
        fs::write(&binary, b"").unwrap();
        fs::write(&model, b"").unwrap();
        Settings {
            binary: Some(binary),
            model: Some(model),
            ..Settings::default()
        }
    }

    #[test]
    fn defaults_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let config = SupervisorConfig::resolve(with_files(dir.path())).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.threads, 4);
        assert_eq!(config.health_path, "/health");
        assert_eq!(config.ready_timeout, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert_eq!(config.address(), "http://127.0.0.1:8080");
        assert_eq!(config.health_url(), "http://127.0.0.1:8080/health");
    }

    #[test]
    fn relative_paths_become_absolute() {
        // unit tests run from the package root
        let dir = tempfile::Builder::new().prefix("relcfg").tempdir_in(".").unwrap();
        let files = with_files(dir.path());
        let rel = PathBuf::from(dir.path().file_name().unwrap());
        let settings = Settings {
            binary: Some(rel.join("llama-server")),
            model: Some(rel.join("model.gguf")),
            ..files
        };

        let config = SupervisorConfig::resolve(settings).unwrap();
        assert!(config.binary.is_absolute());
        assert!(config.model.is_absolute());
        assert_eq!(config.binary, fs::canonicalize(dir.path().join("llama-server")).unwrap());
        assert_eq!(config.model, fs::canonicalize(dir.path().join("model.gguf")).unwrap());
    }

    #[test]
    fn missing_binary_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = with_files(dir.path());
        settings.binary = Some(dir.path().join("does-not-exist"));
        let err = SupervisorConfig::resolve(settings).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPath { ref what, .. } if what == "service binary"));
    }

    #[test]
    fn missing_model_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = with_files(dir.path());
        settings.model = Some(dir.path().join("gone.gguf"));
        assert!(SupervisorConfig::resolve(settings).is_err());
    }

    #[test]
    fn zero_threads_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = with_files(dir.path());
        settings.threads = Some(0);
        assert!(matches!(
            SupervisorConfig::resolve(settings),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn toml_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sidecar.toml");
        fs::write(
            &path,
            r#"
host = "0.0.0.0"
port = 9090
threads = 8
health_path = "healthz"
extra_args = ["--ctx-size", "4096"]

[env]
LLAMA_LOG_COLORS = "off"
"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(settings.port, Some(9090));
        assert_eq!(settings.extra_args, vec!["--ctx-size", "4096"]);
        assert_eq!(settings.env.get("LLAMA_LOG_COLORS").map(String::as_str), Some("off"));

        let mut settings = settings;
        let files = with_files(dir.path());
        settings.binary = files.binary;
        settings.model = files.model;
        let config = SupervisorConfig::resolve(settings).unwrap();
        assert_eq!(config.health_url(), "http://0.0.0.0:9090/healthz");
    }

    #[test]
    fn example_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/sidecar.example.toml");
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.port, Some(8080));
        assert!(settings.binary.is_none());
        assert!(settings.log_pattern.is_some());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(matches!(Settings::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env: HashMap<&str, &str> = [
            ("LLAMA_SIDECAR_HOST", "10.0.0.5"),
            ("LLAMA_SIDECAR_PORT", "8181"),
            ("LLAMA_SIDECAR_THREADS", ""),
        ]
        .into_iter()
        .collect();

        let settings = Settings {
            host: Some("127.0.0.1".into()),
            threads: Some(2),
            ..Settings::default()
        }
        .with_overrides(|k| env.get(k).map(|v| v.to_string()))
        .unwrap();

        assert_eq!(settings.host.as_deref(), Some("10.0.0.5"));
        assert_eq!(settings.port, Some(8181));
        // empty values are ignored
        assert_eq!(settings.threads, Some(2));
    }

    #[test]
    fn bad_env_port_is_reported() {
        let err = Settings::default()
            .with_overrides(|k| (k == "LLAMA_SIDECAR_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "port"));
    }

    #[test]
    fn ipv6_host_is_bracketed() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = with_files(dir.path());
        settings.host = Some("::1".into());
        let config = SupervisorConfig::resolve(settings).unwrap();
        assert_eq!(config.address(), "http://[::1]:8080");
    }
}
