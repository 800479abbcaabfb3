// ABOUTME: Configuration loading and validation for the packsync daemon.
// ABOUTME: Reads PACKSYNC_* environment variables and derives manifest, health and retry settings.

use std::path::PathBuf;
use std::time::Duration;

use packsync_store::RetryPolicy;
use thiserror::Error;

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:54321";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{var} must be an http(s) URL, got {value:?}")]
    InvalidUrl { var: &'static str, value: String },
}

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub home: PathBuf,
    pub backend_url: String,
    pub api_key: Option<String>,
    pub manifest_url: String,
    pub health_url: String,
    /// None when dead-lettering is disabled.
    pub max_attempts: Option<u32>,
    pub base_backoff: Duration,
    pub probe_interval: Duration,
    pub request_timeout: Duration,
}

impl SyncConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - PACKSYNC_HOME: data directory (default: ~/.packsync)
    /// - PACKSYNC_BACKEND_URL: backend base URL (default: http://127.0.0.1:54321)
    /// - PACKSYNC_API_KEY: API key sent as `apikey` and bearer token (optional)
    /// - PACKSYNC_MANIFEST_URL: manifest endpoint (default: {backend}/manifest)
    /// - PACKSYNC_HEALTH_URL: reachability probe target (default: {backend}/rest/v1/)
    /// - PACKSYNC_MAX_ATTEMPTS: deliveries before dead-lettering, 0 disables (default: 10)
    /// - PACKSYNC_BACKOFF_MS: base retry backoff in milliseconds (default: 0)
    /// - PACKSYNC_PROBE_INTERVAL_SECS: seconds between probes (default: 30)
    /// - PACKSYNC_REQUEST_TIMEOUT_SECS: HTTP request timeout (default: 15)
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = non_empty("PACKSYNC_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/tmp"))
                    .join(".packsync")
            });

        let backend_url = url("PACKSYNC_BACKEND_URL")?
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
        let api_key = non_empty("PACKSYNC_API_KEY");

        let manifest_url = url("PACKSYNC_MANIFEST_URL")?
            .unwrap_or_else(|| format!("{}/manifest", backend_url));
        let health_url = url("PACKSYNC_HEALTH_URL")?
            .unwrap_or_else(|| format!("{}/rest/v1/", backend_url));

        let max_attempts = match number("PACKSYNC_MAX_ATTEMPTS")? {
            Some(0) => None,
            Some(n) => Some(u32::try_from(n).unwrap_or(u32::MAX)),
            None => Some(10),
        };
        let base_backoff = Duration::from_millis(number("PACKSYNC_BACKOFF_MS")?.unwrap_or(0));

        let probe_interval = Duration::from_secs(positive("PACKSYNC_PROBE_INTERVAL_SECS", 30)?);
        let request_timeout = Duration::from_secs(positive("PACKSYNC_REQUEST_TIMEOUT_SECS", 15)?);

        Ok(Self {
            home,
            backend_url,
            api_key,
            manifest_url,
            health_url,
            max_attempts,
            base_backoff,
            probe_interval,
            request_timeout,
        })
    }

    /// SQLite file holding packs and the outbox.
    pub fn database_path(&self) -> PathBuf {
        self.home.join("packsync.db")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: self.base_backoff,
            ..RetryPolicy::default()
        }
    }
}

fn non_empty(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn number(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match non_empty(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        None => Ok(None),
    }
}

fn positive(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match number(var)? {
        Some(0) => Err(ConfigError::Zero(var)),
        Some(n) => Ok(n),
        None => Ok(default),
    }
}

fn url(var: &'static str) -> Result<Option<String>, ConfigError> {
    match non_empty(var) {
        Some(value) if value.starts_with("http://") || value.starts_with("https://") => {
            Ok(Some(value.trim_end_matches('/').to_string()))
        }
        Some(value) => Err(ConfigError::InvalidUrl { var, value }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: [&str; 9] = [
        "PACKSYNC_HOME",
        "PACKSYNC_BACKEND_URL",
        "PACKSYNC_API_KEY",
        "PACKSYNC_MANIFEST_URL",
        "PACKSYNC_HEALTH_URL",
        "PACKSYNC_MAX_ATTEMPTS",
        "PACKSYNC_BACKOFF_MS",
        "PACKSYNC_PROBE_INTERVAL_SECS",
        "PACKSYNC_REQUEST_TIMEOUT_SECS",
    ];

    fn with_env<R>(vars: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: test-only code, env access serialized by ENV_LOCK
        unsafe {
            for var in VARS {
                std::env::remove_var(var);
            }
            for (key, value) in vars {
                std::env::set_var(key, value);
            }
        }
        let result = f();
        // SAFETY: test-only code, env access serialized by ENV_LOCK
        unsafe {
            for var in VARS {
                std::env::remove_var(var);
            }
        }
        result
    }

    #[test]
    fn config_loads_defaults() {
        let config = with_env(&[], SyncConfig::from_env).unwrap();

        assert_eq!(config.backend_url, "http://127.0.0.1:54321");
        assert_eq!(config.manifest_url, "http://127.0.0.1:54321/manifest");
        assert_eq!(config.health_url, "http://127.0.0.1:54321/rest/v1/");
        assert!(config.api_key.is_none());
        assert_eq!(config.max_attempts, Some(10));
        assert_eq!(config.base_backoff, Duration::ZERO);
        assert_eq!(config.probe_interval, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert!(config.home.to_string_lossy().contains(".packsync"));
        assert!(config.database_path().ends_with("packsync.db"));
    }

    #[test]
    fn config_derives_urls_from_backend() {
        let config = with_env(
            &[
                ("PACKSYNC_BACKEND_URL", "https://api.example.com/"),
                ("PACKSYNC_API_KEY", "anon-key"),
                ("PACKSYNC_HOME", "/var/lib/packsync"),
            ],
            SyncConfig::from_env,
        )
        .unwrap();

        assert_eq!(config.backend_url, "https://api.example.com");
        assert_eq!(config.manifest_url, "https://api.example.com/manifest");
        assert_eq!(config.health_url, "https://api.example.com/rest/v1/");
        assert_eq!(config.api_key.as_deref(), Some("anon-key"));
        assert_eq!(config.home, PathBuf::from("/var/lib/packsync"));
    }

    #[test]
    fn config_retry_settings() {
        let config = with_env(
            &[("PACKSYNC_MAX_ATTEMPTS", "0"), ("PACKSYNC_BACKOFF_MS", "250")],
            SyncConfig::from_env,
        )
        .unwrap();

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, None);
        assert_eq!(policy.base_backoff, Duration::from_millis(250));
    }

    #[test]
    fn config_rejects_bad_values() {
        let err = with_env(&[("PACKSYNC_MAX_ATTEMPTS", "lots")], SyncConfig::from_env).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                var: "PACKSYNC_MAX_ATTEMPTS",
                value: "lots".into()
            }
        );

        let err =
            with_env(&[("PACKSYNC_PROBE_INTERVAL_SECS", "0")], SyncConfig::from_env).unwrap_err();
        assert_eq!(err, ConfigError::Zero("PACKSYNC_PROBE_INTERVAL_SECS"));

        let err = with_env(&[("PACKSYNC_BACKEND_URL", "ftp://nope")], SyncConfig::from_env)
            .unwrap_err();
        assert!(err.to_string().contains("PACKSYNC_BACKEND_URL"));
    }
}
