//! Locates the service binary and model file among ordered candidate paths.
//!
//! Candidates may be plain paths or glob patterns (`models/*.gguf`). The
//! first candidate that exists on disk wins; patterns yield their matches in
//! lexical order.

use std::path::{Path, PathBuf};

use glob::glob;

use crate::config::ConfigError;

pub const DEFAULT_BINARY_NAME: &str = "llama-server";
const APP_DIR: &str = "llama-sidecar";

pub struct PathResolver;

impl PathResolver {
    /// Return the first candidate that exists, or `ConfigError::NotFound`.
    pub fn resolve(what: &str, candidates: &[PathBuf]) -> Result<PathBuf, ConfigError> {
        for candidate in candidates {
            if let Some(found) = Self::first_match(candidate) {
                tracing::info!("Resolved {} at: {}", what, found.display());
                return Ok(found);
            }
        }

        tracing::warn!("Could not find {} in {} candidate locations", what, candidates.len());
        Err(ConfigError::NotFound {
            what: what.to_string(),
            searched: candidates.to_vec(),
        })
    }

    /// Explicit configuration always wins: it must exist, no fallback.
    pub fn resolve_explicit_or_default(
        what: &str,
        explicit: Option<&Path>,
        defaults: &[PathBuf],
    ) -> Result<PathBuf, ConfigError> {
        match explicit {
            Some(path) if path.exists() => Ok(path.to_path_buf()),
            Some(path) => Err(ConfigError::MissingPath {
                what: what.to_string(),
                path: path.to_path_buf(),
            }),
            None => Self::resolve(what, defaults),
        }
    }

    fn first_match(candidate: &Path) -> Option<PathBuf> {
        let pattern = candidate.to_string_lossy();
        if !is_pattern(&pattern) {
            return candidate.exists().then(|| candidate.to_path_buf());
        }

        match glob(&pattern) {
            Ok(paths) => paths.flatten().find(|p| p.is_file()),
            Err(e) => {
                tracing::debug!("Ignoring invalid candidate pattern '{}': {}", pattern, e);
                None
            }
        }
    }

    /// User-local install first, then system-wide.
    pub fn default_binary_candidates() -> Vec<PathBuf> {
        let exe = if cfg!(target_os = "windows") {
            format!("{}.exe", DEFAULT_BINARY_NAME)
        } else {
            DEFAULT_BINARY_NAME.to_string()
        };

        let mut paths = Vec::new();
        if let Some(home) = home_dir() {
            paths.push(home.join(".local").join("bin").join(&exe));
        }

        #[cfg(not(target_os = "windows"))]
        {
            paths.push(PathBuf::from("/usr/local/bin").join(&exe));
            paths.push(PathBuf::from("/usr/bin").join(&exe));
        }

        #[cfg(target_os = "windows")]
        {
            if let Some(program_files) = std::env::var_os("ProgramFiles") {
                paths.push(PathBuf::from(program_files).join(APP_DIR).join(&exe));
            }
        }

        paths
    }

    pub fn default_model_candidates() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(home) = home_dir() {
            paths.push(
                home.join(".local")
                    .join("share")
                    .join(APP_DIR)
                    .join("models")
                    .join("*.gguf"),
            );
        }

        #[cfg(not(target_os = "windows"))]
        paths.push(PathBuf::from("/usr/local/share").join(APP_DIR).join("models").join("*.gguf"));

        paths
    }
}

fn is_pattern(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
