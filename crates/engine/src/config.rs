//! Daemon configuration
//!
//! Settings are read from an optional TOML file (path from `NETPULSE_CONFIG`,
//! default `netpulse.toml`) and overridden by `NETPULSE_*` environment
//! variables. Nested sections use a double underscore, for example
//! `NETPULSE_DETECTOR__Z_THRESHOLD=4`.

use anyhow::{bail, Context, Result};
use engine_lib::alerting::RuleEngineConfig;
use engine_lib::anomaly::DetectorConfig;
use engine_lib::correlation::CorrelatorConfig;
use engine_lib::dispatch::{DispatcherConfig, RetryPolicy};
use engine_lib::history::HistoryConfig;
use engine_lib::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "netpulse.toml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Name attached to structured log events
    #[serde(default = "default_instance")]
    pub instance: String,

    /// Port for the query API and health/metrics endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Rule file loaded at startup and on reload
    #[serde(default)]
    pub rules_path: Option<PathBuf>,

    /// Reload rules when the rule file changes
    #[serde(default = "default_true")]
    pub watch_rules: bool,

    /// Alertmanager-compatible webhook; notifications are only logged when unset
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,

    /// How long loops get to finish their current cycle on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_ingest_buffer")]
    pub ingest_buffer: usize,

    #[serde(default)]
    pub detector: DetectorSettings,

    #[serde(default)]
    pub history: HistorySettings,

    #[serde(default)]
    pub correlator: CorrelatorSettings,

    #[serde(default)]
    pub rules: RuleSettings,

    #[serde(default)]
    pub dispatcher: DispatcherSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub z_threshold: f64,
    pub warmup_count: usize,
    pub window_capacity: usize,
    /// Values older than this leave the baseline window; unset keeps count-only eviction
    pub window_max_age_secs: Option<u64>,
    pub event_capacity: usize,
    pub idle_ttl_secs: u64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        let defaults = DetectorConfig::default();
        Self {
            z_threshold: defaults.z_threshold,
            warmup_count: defaults.warmup_count,
            window_capacity: defaults.window_capacity,
            window_max_age_secs: defaults.window_max_age.map(|d| d.as_secs()),
            event_capacity: defaults.event_capacity,
            idle_ttl_secs: defaults.idle_ttl.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    pub retention_secs: u64,
    pub max_per_series: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        let defaults = HistoryConfig::default();
        Self {
            retention_secs: defaults.retention.as_secs(),
            max_per_series: defaults.max_per_series,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrelatorSettings {
    pub transmit_metric: String,
    pub receive_metric: String,
    pub window_secs: u64,
    pub interval_secs: u64,
    pub top_k: usize,
    pub min_magnitude: f64,
    pub min_delta: f64,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        let defaults = CorrelatorConfig::default();
        Self {
            transmit_metric: defaults.transmit_metric,
            receive_metric: defaults.receive_metric,
            window_secs: defaults.window.as_secs(),
            interval_secs: defaults.interval.as_secs(),
            top_k: defaults.top_k,
            min_magnitude: defaults.min_magnitude,
            min_delta: defaults.min_delta,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuleSettings {
    pub tick_ms: u64,
    pub stale_after_secs: u64,
    pub node_ttl_secs: u64,
    pub maintenance_every: u32,
}

impl Default for RuleSettings {
    fn default() -> Self {
        let defaults = RuleEngineConfig::default();
        Self {
            tick_ms: defaults.tick.as_millis() as u64,
            stale_after_secs: defaults.stale_after.as_secs(),
            node_ttl_secs: defaults.node_ttl.as_secs(),
            maintenance_every: defaults.maintenance_every,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub queue_capacity: usize,
    pub dedupe_window_secs: u64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub max_attempts: u32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        let defaults = DispatcherConfig::default();
        Self {
            queue_capacity: defaults.queue_capacity,
            dedupe_window_secs: defaults.dedupe_window.as_secs(),
            retry_base_ms: defaults.retry.base_delay.as_millis() as u64,
            retry_max_ms: defaults.retry.max_delay.as_millis() as u64,
            max_attempts: defaults.retry.max_attempts,
        }
    }
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "netpulse".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_webhook_timeout() -> u64 {
    10
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_ingest_buffer() -> usize {
    10_000
}

impl EngineSettings {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("NETPULSE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path, environment())
    }

    /// Load from an explicit file (may be absent) and environment source
    pub fn load_from(path: &Path, env: config::Environment) -> Result<Self> {
        let settings: EngineSettings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(env)
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?
            .try_deserialize()
            .context("Invalid configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if !(self.detector.z_threshold.is_finite() && self.detector.z_threshold > 0.0) {
            bail!("detector.z_threshold must be a positive number");
        }
        if self.detector.window_capacity == 0 {
            bail!("detector.window_capacity must be at least 1");
        }
        // A window that can never fill would never produce a verdict
        if self.detector.warmup_count < 2 {
            bail!("detector.warmup_count must be at least 2");
        }
        if self.detector.warmup_count > self.detector.window_capacity {
            bail!(
                "detector.warmup_count ({}) exceeds detector.window_capacity ({})",
                self.detector.warmup_count,
                self.detector.window_capacity
            );
        }
        if self.correlator.window_secs == 0 || self.correlator.interval_secs == 0 {
            bail!("correlator window and interval must be positive");
        }
        if self.rules.tick_ms == 0 {
            bail!("rules.tick_ms must be positive");
        }
        if self.dispatcher.queue_capacity == 0 {
            bail!("dispatcher.queue_capacity must be at least 1");
        }
        if self.dispatcher.max_attempts == 0 {
            bail!("dispatcher.max_attempts must be at least 1");
        }
        if let Some(url) = &self.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("webhook_url must be an http(s) URL, got {url}");
            }
        }
        Ok(())
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Translate into the library's component configuration
    pub fn engine_config(&self) -> EngineConfig {
        let d = &self.detector;
        let detector = DetectorConfig {
            idle_ttl: Duration::from_secs(d.idle_ttl_secs),
            ..DetectorConfig::default()
        }
        .with_z_threshold(d.z_threshold)
        .with_warmup_count(d.warmup_count)
        .with_window(d.window_capacity, d.window_max_age_secs.map(Duration::from_secs))
        .with_event_capacity(d.event_capacity);

        let history = HistoryConfig::default()
            .with_retention(Duration::from_secs(self.history.retention_secs))
            .with_max_per_series(self.history.max_per_series);

        let c = &self.correlator;
        let correlator = CorrelatorConfig {
            min_magnitude: c.min_magnitude,
            min_delta: c.min_delta,
            ..CorrelatorConfig::default()
        }
        .with_counter_metrics(c.transmit_metric.clone(), c.receive_metric.clone())
        .with_window(Duration::from_secs(c.window_secs))
        .with_interval(Duration::from_secs(c.interval_secs))
        .with_top_k(c.top_k);

        let rules = RuleEngineConfig {
            maintenance_every: self.rules.maintenance_every,
            ..RuleEngineConfig::default()
        }
        .with_tick(Duration::from_millis(self.rules.tick_ms))
        .with_stale_after(Duration::from_secs(self.rules.stale_after_secs))
        .with_node_ttl(Duration::from_secs(self.rules.node_ttl_secs));

        let dispatcher = DispatcherConfig::default()
            .with_queue_capacity(self.dispatcher.queue_capacity)
            .with_dedupe_window(Duration::from_secs(self.dispatcher.dedupe_window_secs))
            .with_retry(RetryPolicy {
                base_delay: Duration::from_millis(self.dispatcher.retry_base_ms),
                max_delay: Duration::from_millis(self.dispatcher.retry_max_ms),
                max_attempts: self.dispatcher.max_attempts,
            });

        let mut config = EngineConfig {
            ingest_buffer: self.ingest_buffer,
            ..EngineConfig::default()
        }
        .with_instance(self.instance.clone())
        .with_detector(detector)
        .with_history(history)
        .with_correlator(correlator)
        .with_rules(rules)
        .with_dispatcher(dispatcher);

        if let Some(path) = &self.rules_path {
            config = config.with_rule_file(path);
        }
        config
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("NETPULSE")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        environment().source(Some(map))
    }

    #[test]
    fn test_defaults_without_file() {
        let settings =
            EngineSettings::load_from(Path::new("/nonexistent/netpulse.toml"), env(&[])).unwrap();

        assert_eq!(settings.api_port, 8080);
        assert_eq!(settings.log_format, LogFormat::Json);
        assert!(settings.watch_rules);
        assert!(settings.webhook_url.is_none());
        assert_eq!(settings.detector.z_threshold, 3.0);
        assert_eq!(settings.rules.tick_ms, 1000);
        assert_eq!(settings.dispatcher.max_attempts, 5);
    }

    #[test]
    fn test_file_then_environment_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
api_port = 9000
log_format = "pretty"
rules_path = "/etc/netpulse/rules.toml"

[detector]
z_threshold = 2.5

[dispatcher]
queue_capacity = 16
"#
        )
        .unwrap();

        let settings = EngineSettings::load_from(
            file.path(),
            env(&[("NETPULSE_API_PORT", "9100"), ("NETPULSE_DETECTOR__WARMUP_COUNT", "5")]),
        )
        .unwrap();

        assert_eq!(settings.api_port, 9100);
        assert_eq!(settings.log_format, LogFormat::Pretty);
        assert_eq!(settings.detector.z_threshold, 2.5);
        assert_eq!(settings.detector.warmup_count, 5);

        let config = settings.engine_config();
        assert_eq!(config.dispatcher.queue_capacity, 16);
        assert_eq!(config.detector.warmup_count, 5);
        assert_eq!(
            config.rule_file.as_deref(),
            Some(Path::new("/etc/netpulse/rules.toml"))
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EngineSettings::load_from(
            Path::new("/nonexistent/netpulse.toml"),
            env(&[("NETPULSE_DETECTOR__Z_THRESHOLD", "-1")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("z_threshold"));

        assert!(EngineSettings::load_from(
            Path::new("/nonexistent/netpulse.toml"),
            env(&[("NETPULSE_WEBHOOK_URL", "ftp://example.com")]),
        )
        .is_err());

        let err = EngineSettings::load_from(
            Path::new("/nonexistent/netpulse.toml"),
            env(&[("NETPULSE_DETECTOR__WARMUP_COUNT", "100")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceeds detector.window_capacity"));

        let err = EngineSettings::load_from(
            Path::new("/nonexistent/netpulse.toml"),
            env(&[("NETPULSE_DETECTOR__WARMUP_COUNT", "1")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("warmup_count must be at least 2"));

        // Equal to the capacity still fills the window
        assert!(EngineSettings::load_from(
            Path::new("/nonexistent/netpulse.toml"),
            env(&[
                ("NETPULSE_DETECTOR__WARMUP_COUNT", "20"),
                ("NETPULSE_DETECTOR__WINDOW_CAPACITY", "20"),
            ]),
        )
        .is_ok());
    }
}
