use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Balancer behavior knobs, all of them reconfigurable at runtime
/// through the control port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Maximum same-backend retries and maximum cross-backend attempts
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Delay between same-backend retries, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Seconds between health-check sweeps
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_health_check_interval() -> u64 {
    60
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

/// Startup configuration: listen addresses, balancer defaults, and any
/// backends to register before the listeners come up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data-plane listen address (default: 0.0.0.0:8080)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Control-plane listen address (default: 0.0.0.0:4501)
    #[serde(default = "default_control_listen")]
    pub control_listen: String,

    /// Balancer settings
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Backend URLs registered at boot
    #[serde(default)]
    pub backends: Vec<String>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_control_listen() -> String {
    "0.0.0.0:4501".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            control_listen: default_control_listen(),
            balancer: BalancerConfig::default(),
            backends: Vec::new(),
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Supported variables:
/// - PROXYPOOL_LISTEN (default 0.0.0.0:8080)
/// - PROXYPOOL_CONTROL_LISTEN (default 0.0.0.0:4501)
/// - PROXYPOOL_BACKENDS (comma-separated backend URLs)
/// - LB_RETRIES
/// - LB_RETRY_DELAY_MS
/// - LB_HEALTH_CHECK_INTERVAL (seconds)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::default();

    if let Ok(listen) = std::env::var("PROXYPOOL_LISTEN") {
        config.listen = listen;
    }

    if let Ok(listen) = std::env::var("PROXYPOOL_CONTROL_LISTEN") {
        config.control_listen = listen;
    }

    if let Ok(backends) = std::env::var("PROXYPOOL_BACKENDS") {
        config.backends = backends
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    if let Ok(retries) = std::env::var("LB_RETRIES") {
        if let Ok(val) = retries.parse() {
            config.balancer.retries = val;
        }
    }

    if let Ok(delay) = std::env::var("LB_RETRY_DELAY_MS") {
        if let Ok(val) = delay.parse() {
            config.balancer.retry_delay_ms = val;
        }
    }

    if let Ok(interval) = std::env::var("LB_HEALTH_CHECK_INTERVAL") {
        if let Ok(val) = interval.parse() {
            config.balancer.health_check_interval = val;
        }
    }

    Ok(config)
}

/// Load configuration from file or environment
///
/// Tries the YAML file when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}

/// Mutable configuration shared between the dispatcher, the health
/// checker, and the control handlers.
///
/// Reads are lock-free. Writes come from the single control handler;
/// readers tolerate eventually consistent values; there are no
/// cross-field invariants.
#[derive(Debug)]
pub struct RuntimeConfig {
    retries: AtomicU32,
    retry_delay_ms: AtomicU64,
    hc_period: watch::Sender<Duration>,
}

impl RuntimeConfig {
    pub fn new(defaults: &BalancerConfig) -> Self {
        let (hc_period, _) = watch::channel(Duration::from_secs(defaults.health_check_interval));
        Self {
            retries: AtomicU32::new(defaults.retries),
            retry_delay_ms: AtomicU64::new(defaults.retry_delay_ms),
            hc_period,
        }
    }

    /// Maximum same-backend retries and cross-backend attempts
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn set_retries(&self, retries: u32) {
        self.retries.store(retries, Ordering::Relaxed);
    }

    /// Delay between same-backend retries
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.load(Ordering::Relaxed))
    }

    pub fn set_retry_delay(&self, delay: Duration) {
        self.retry_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Current health-check period
    pub fn hc_period(&self) -> Duration {
        *self.hc_period.borrow()
    }

    /// Update the health-check period. The health checker observes the
    /// change through its watch receiver and resets its timer; a sweep
    /// already in progress completes on the old schedule.
    pub fn set_hc_period(&self, period: Duration) {
        self.hc_period.send_replace(period);
    }

    /// Subscribe to health-check period changes
    pub fn watch_hc_period(&self) -> watch::Receiver<Duration> {
        self.hc_period.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.control_listen, "0.0.0.0:4501");
        assert_eq!(config.balancer.retries, 3);
        assert_eq!(config.balancer.retry_delay_ms, 1000);
        assert_eq!(config.balancer.health_check_interval, 60);
        assert!(config.backends.is_empty());
    }

    #[test]
    fn test_load_from_yaml_str() {
        let yaml = r#"
listen: "127.0.0.1:9090"
balancer:
  retries: 5
  retry_delay_ms: 200
backends:
  - http://10.0.0.1:8000
  - http://10.0.0.2:8000
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.listen, "127.0.0.1:9090");
        // Unset fields keep their defaults
        assert_eq!(config.control_listen, "0.0.0.0:4501");
        assert_eq!(config.balancer.retries, 5);
        assert_eq!(config.balancer.retry_delay_ms, 200);
        assert_eq!(config.balancer.health_check_interval, 60);
        assert_eq!(config.backends.len(), 2);
    }

    #[test]
    fn test_runtime_config_updates() {
        let runtime = RuntimeConfig::new(&BalancerConfig::default());

        assert_eq!(runtime.retries(), 3);
        assert_eq!(runtime.retry_delay(), Duration::from_millis(1000));
        assert_eq!(runtime.hc_period(), Duration::from_secs(60));

        runtime.set_retries(7);
        runtime.set_retry_delay(Duration::from_millis(50));
        runtime.set_hc_period(Duration::from_secs(5));

        assert_eq!(runtime.retries(), 7);
        assert_eq!(runtime.retry_delay(), Duration::from_millis(50));
        assert_eq!(runtime.hc_period(), Duration::from_secs(5));
    }

    #[test]
    fn test_hc_period_watch() {
        let runtime = RuntimeConfig::new(&BalancerConfig::default());
        let rx = runtime.watch_hc_period();

        runtime.set_hc_period(Duration::from_secs(10));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow(), Duration::from_secs(10));
    }
}
