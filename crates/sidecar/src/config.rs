//! Configuration for the sidecar.

use std::path::PathBuf;
use std::time::Duration;

use crate::client::RetryPolicy;

pub const DEFAULT_BINARY: &str = "opencode";
pub const DEFAULT_HOSTNAME: &str = "127.0.0.1";
pub const DEFAULT_FALLBACK_URL: &str = "http://127.0.0.1:4096";

/// Sidecar configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub binary: PathBuf,
    pub hostname: String,
    /// `0` lets the OS pick a port.
    pub port: u16,
    pub directory: Option<String>,
    pub fallback_url: String,
    pub launch_timeout: Duration,
    pub request_timeout: Duration,
    pub health_interval: Duration,
    pub retry: RetryPolicy,
    pub startup_check: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_BINARY),
            hostname: DEFAULT_HOSTNAME.to_string(),
            port: 0,
            directory: None,
            fallback_url: DEFAULT_FALLBACK_URL.to_string(),
            launch_timeout: Duration::from_millis(5000),
            request_timeout: Duration::from_secs(300),
            health_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            startup_check: RetryPolicy::startup_check(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source. Unset or unparsable
    /// values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let binary = non_empty("OPENCODE_CLI_PATH")
            .map(|p| PathBuf::from(shellexpand::tilde(p.trim()).to_string()))
            .unwrap_or(defaults.binary);
        let hostname = non_empty("OPENCODE_HOSTNAME").unwrap_or(defaults.hostname);
        let port = resolve_port(None, lookup("OPENCODE_PORT").as_deref());
        let directory = non_empty("OPENCODE_DIRECTORY")
            .map(|d| shellexpand::tilde(d.trim()).to_string());
        let fallback_url = non_empty("OPENCODE_FALLBACK_URL").unwrap_or(defaults.fallback_url);
        let launch_timeout = lookup("OPENCODE_LAUNCH_TIMEOUT_MS")
            .and_then(|v| v.trim().parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.launch_timeout);
        let request_timeout = lookup("OPENCODE_REQUEST_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);
        let health_interval = lookup("OPENCODE_HEALTH_INTERVAL_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.health_interval);

        let mut retry = defaults.retry;
        if let Some(n) = lookup("OPENCODE_RETRY_ATTEMPTS").and_then(|v| v.trim().parse().ok()) {
            retry.max_retries = n;
        }
        if let Some(ms) = lookup("OPENCODE_RETRY_DELAY_MS").and_then(|v| v.trim().parse().ok()) {
            retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(m) = lookup("OPENCODE_RETRY_BACKOFF")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|m| m.is_finite() && *m >= 1.0)
        {
            retry.multiplier = m;
        }

        Self {
            binary,
            hostname,
            port,
            directory,
            fallback_url,
            launch_timeout,
            request_timeout,
            health_interval,
            retry,
            startup_check: defaults.startup_check,
        }
    }
}

/// Explicit port wins; otherwise the configured value; otherwise `0`.
pub fn resolve_port(explicit: Option<u16>, configured: Option<&str>) -> u16 {
    explicit
        .or_else(|| configured.and_then(|v| v.trim().parse().ok()))
        .unwrap_or(0)
}
