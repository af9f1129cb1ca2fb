//! Coordinator configuration using Figment.
//!
//! Configuration is loaded from a TOML file and then overridden by
//! environment variables prefixed with `DAQCNC_`. Nested keys are separated
//! by a double underscore:
//!
//! ```text
//! DAQCNC_SERVER__LISTEN=0.0.0.0:9000
//! DAQCNC_TIMEOUTS__STOP_SECS=120
//! DAQCNC_TASKS__WATCHDOG_THRESHOLD=5
//! ```
//!
//! Every section has defaults, so an empty file is a valid configuration.

use crate::logfabric::SinkAddr;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_PREFIX: &str = "DAQCNC_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    #[error("Required environment variable {0} is not set")]
    MissingEnv(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::LoadError(Box::new(err))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CncConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub runset: RunSetConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the coordinator RPC server binds.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Host name handed to components for reaching coordinator-side
    /// services. Defaults to this machine's host name.
    #[serde(default)]
    pub advertise_host: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            advertise_host: None,
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl ServerConfig {
    pub fn advertised_host(&self) -> String {
        self.advertise_host.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string())
        })
    }
}

/// Deadlines applied to remote calls and transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_call_ms")]
    pub call_ms: u64,
    #[serde(default = "default_configure_secs")]
    pub configure_secs: u64,
    #[serde(default = "default_stop_secs")]
    pub stop_secs: u64,
    #[serde(default = "default_force_secs")]
    pub force_secs: u64,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    /// Retries of a call that failed transiently.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call_ms: default_call_ms(),
            configure_secs: default_configure_secs(),
            stop_secs: default_stop_secs(),
            force_secs: default_force_secs(),
            poll_ms: default_poll_ms(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn call(&self) -> Duration {
        Duration::from_millis(self.call_ms)
    }

    pub fn configure(&self) -> Duration {
        Duration::from_secs(self.configure_secs)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_secs(self.stop_secs)
    }

    pub fn force(&self) -> Duration {
        Duration::from_secs(self.force_secs)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSetConfig {
    /// Concurrent calls per fan-out level.
    #[serde(default = "default_fanout_limit")]
    pub fanout_limit: usize,
    /// Connector types that close a feedback loop and do not order startup.
    #[serde(default = "default_back_edges")]
    pub back_edges: Vec<String>,
    /// Refuse to build a run-set with missing components.
    #[serde(default = "default_true")]
    pub strict: bool,
    /// Scheduler tick while running.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// First port handed out for run log receivers; 0 lets the OS choose.
    #[serde(default)]
    pub log_port_base: u16,
    #[serde(default = "default_log_port_count")]
    pub log_port_count: u16,
    /// Service name stamped on monitor records.
    #[serde(default = "default_service")]
    pub service: String,
}

impl Default for RunSetConfig {
    fn default() -> Self {
        Self {
            fanout_limit: default_fanout_limit(),
            back_edges: default_back_edges(),
            strict: true,
            tick_ms: default_tick_ms(),
            log_port_base: 0,
            log_port_count: default_log_port_count(),
            service: default_service(),
        }
    }
}

impl RunSetConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Periods and thresholds of the in-run monitoring tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_rate_secs")]
    pub rate_secs: u64,
    #[serde(default = "default_active_channels_secs")]
    pub active_channels_secs: u64,
    #[serde(default = "default_monitor_secs")]
    pub monitor_secs: u64,
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,
    #[serde(default = "default_radar_secs")]
    pub radar_secs: u64,
    /// Consecutive unhealthy watchdog fires before the run is aborted.
    #[serde(default = "default_watchdog_threshold")]
    pub watchdog_threshold: u32,
    /// Builder disk space, in megabytes, below which the run is unhealthy.
    #[serde(default = "default_disk_min_mb")]
    pub disk_min_mb: u64,
    /// Queue depth above which a component is unhealthy.
    #[serde(default = "default_queue_max")]
    pub queue_max: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            rate_secs: default_rate_secs(),
            active_channels_secs: default_active_channels_secs(),
            monitor_secs: default_monitor_secs(),
            watchdog_secs: default_watchdog_secs(),
            radar_secs: default_radar_secs(),
            watchdog_threshold: default_watchdog_threshold(),
            disk_min_mb: default_disk_min_mb(),
            queue_max: default_queue_max(),
        }
    }
}

/// Startup sinks of the coordinator's own logger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub primary: Option<SinkAddr>,
    /// Live-monitoring sink. Runs publish monitor records here.
    #[serde(default)]
    pub live: Option<SinkAddr>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_call_ms() -> u64 {
    30_000
}

fn default_configure_secs() -> u64 {
    120
}

fn default_stop_secs() -> u64 {
    60
}

fn default_force_secs() -> u64 {
    30
}

fn default_poll_ms() -> u64 {
    1_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_fanout_limit() -> usize {
    16
}

fn default_back_edges() -> Vec<String> {
    vec!["rdoutReq".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_tick_ms() -> u64 {
    1_000
}

fn default_log_port_count() -> u16 {
    1_000
}

fn default_service() -> String {
    "daqcnc".to_string()
}

fn default_rate_secs() -> u64 {
    60
}

fn default_active_channels_secs() -> u64 {
    600
}

fn default_monitor_secs() -> u64 {
    100
}

fn default_watchdog_secs() -> u64 {
    10
}

fn default_radar_secs() -> u64 {
    600
}

fn default_watchdog_threshold() -> u32 {
    10
}

fn default_disk_min_mb() -> u64 {
    1_024
}

fn default_queue_max() -> u64 {
    100_000
}

impl CncConfig {
    /// Loads `path` merged with `DAQCNC_` environment overrides, then
    /// validates the result. A missing file yields the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(CncConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document without consulting the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(CncConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.server.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.server.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.runset.fanout_limit == 0 {
            return Err(ConfigError::ValidationError(
                "runset.fanout_limit must be positive".to_string(),
            ));
        }

        if self.runset.tick_ms == 0 || self.timeouts.poll_ms == 0 {
            return Err(ConfigError::ValidationError(
                "runset.tick_ms and timeouts.poll_ms must be positive".to_string(),
            ));
        }

        if self.timeouts.call_ms == 0 {
            return Err(ConfigError::ValidationError(
                "timeouts.call_ms must be positive".to_string(),
            ));
        }

        let periods = [
            ("rate_secs", self.tasks.rate_secs),
            ("active_channels_secs", self.tasks.active_channels_secs),
            ("monitor_secs", self.tasks.monitor_secs),
            ("watchdog_secs", self.tasks.watchdog_secs),
            ("radar_secs", self.tasks.radar_secs),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::ValidationError(format!(
                "tasks.{} must be positive",
                name
            )));
        }

        if self.tasks.watchdog_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "tasks.watchdog_threshold must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
