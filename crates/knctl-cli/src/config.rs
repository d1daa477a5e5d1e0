//! User configuration
//!
//! Read from `config.yaml` in the config directory (`$KN_CONFIG_DIR`, else
//! the platform config dir). A missing file yields the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use knctl_kube::actions::DEFAULT_UPDATE_ATTEMPTS;
use knctl_kube::wait::{DEFAULT_WAIT_TIMEOUT, DEFAULT_WAIT_WINDOW};
use serde::Deserialize;

use crate::error::{CliError, Result};

pub const CONFIG_DIR_ENV: &str = "KN_CONFIG_DIR";
pub const CACHE_DIR_ENV: &str = "KN_CACHE_DIR";
pub const CONFIG_FILE: &str = "config.yaml";

/// Prefix of `--target` values resolved inside the cache directory
const CACHE_TARGET_PREFIX: &str = "cache:";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub defaults: Defaults,
}

/// Defaults for flags the user did not pass
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Defaults {
    /// Readiness timeout in seconds
    pub wait_timeout: u64,

    /// Error window in seconds
    pub wait_window: u64,

    pub update_retries: u32,

    pub lock_to_digest: bool,

    pub namespace: Option<String>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT.as_secs(),
            wait_window: DEFAULT_WAIT_WINDOW.as_secs(),
            update_retries: DEFAULT_UPDATE_ATTEMPTS,
            lock_to_digest: true,
            namespace: None,
        }
    }
}

impl Defaults {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout)
    }

    pub fn wait_window(&self) -> Duration {
        Duration::from_secs(self.wait_window)
    }
}

impl Config {
    /// Load from the configured directory
    pub fn load() -> Result<Self> {
        Self::load_from(&config_dir().join(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&text)
            .map_err(|e| CliError::config(format!("{}: {e}", path.display())))
    }
}

/// `$KN_CONFIG_DIR`, else `<config dir>/knctl`
pub fn config_dir() -> PathBuf {
    std::env::var_os(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("knctl")
        })
}

/// `$KN_CACHE_DIR`, else `<cache dir>/knctl`
pub fn cache_dir() -> PathBuf {
    std::env::var_os(CACHE_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("knctl")
        })
}

/// Resolve a `--target` value; `cache:NAME` lands in the cache directory
pub fn resolve_target(target: &str, cache: &Path) -> Result<PathBuf> {
    match target.strip_prefix(CACHE_TARGET_PREFIX) {
        Some("") => Err(CliError::input_with_help(
            "--target cache: needs a directory name",
            "For example --target cache:work",
        )),
        Some(name) => Ok(cache.join(name)),
        None => Ok(PathBuf::from(target)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.defaults.wait_timeout(), Duration::from_secs(600));
        assert_eq!(config.defaults.update_retries, 3);
        assert!(config.defaults.lock_to_digest);
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "defaults:\n  waitTimeout: 30\n  lockToDigest: false\n  namespace: dev\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.defaults.wait_timeout, 30);
        assert_eq!(config.defaults.wait_window, 2);
        assert!(!config.defaults.lock_to_digest);
        assert_eq!(config.defaults.namespace.as_deref(), Some("dev"));
    }

    #[test]
    fn test_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "defaults: [1, 2").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(CliError::Config { .. })
        ));
    }

    #[test]
    fn test_resolve_target() {
        let cache = Path::new("/tmp/cache");
        assert_eq!(
            resolve_target("cache:work", cache).unwrap(),
            PathBuf::from("/tmp/cache/work")
        );
        assert_eq!(
            resolve_target("./repo", cache).unwrap(),
            PathBuf::from("./repo")
        );
        assert!(resolve_target("cache:", cache).is_err());
    }
}
