//! Node configuration
//!
//! Parameters arrive as a JSON object (from a pipeline file or the CLI) and
//! are deserialized into these structs. Every option has a default, so an
//! empty object is a valid configuration. Converter-specific options live in
//! the same object and are ignored here.

use crate::policy::{FilterTimeoutAction, ReaderTimeoutAction};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Where the pub/sub service lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Redis host
    ///
    /// Default: "localhost"
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    /// Redis port
    ///
    /// Default: 6379
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Redis database index
    ///
    /// Default: 0
    #[serde(default)]
    pub redis_db: u32,
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            redis_db: 0,
        }
    }
}

impl ConnectionConfig {
    /// Endpoint URL used for logging and error messages
    pub fn endpoint(&self) -> String {
        format!("redis://{}:{}/{}", self.redis_host, self.redis_port, self.redis_db)
    }
}

/// Configuration of a request/response (filter) bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Connection parameters
    #[serde(flatten)]
    pub connection: ConnectionConfig,

    /// Channel the request payloads are published on
    ///
    /// Default: "images"
    #[serde(default = "default_filter_channel_out")]
    pub channel_out: String,

    /// Channel (pattern) the replies arrive on
    ///
    /// Default: "predictions"
    #[serde(default = "default_filter_channel_in")]
    pub channel_in: String,

    /// Seconds to wait for a reply; zero or negative waits forever
    ///
    /// Default: 5.0
    #[serde(default = "default_filter_timeout")]
    pub timeout: f64,

    /// What to do when no reply arrives in time ("drop" or "passthrough")
    ///
    /// Default: "drop"
    #[serde(default = "default_filter_timeout_action")]
    pub timeout_action: String,

    /// Seconds between checks for a reply
    ///
    /// Default: 0.01
    #[serde(default = "default_sleep_time")]
    pub sleep_time: f64,
}

fn default_filter_channel_out() -> String {
    "images".to_string()
}

fn default_filter_channel_in() -> String {
    "predictions".to_string()
}

fn default_filter_timeout() -> f64 {
    5.0
}

fn default_filter_timeout_action() -> String {
    FilterTimeoutAction::Drop.as_str().to_string()
}

fn default_sleep_time() -> f64 {
    0.01
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            channel_out: default_filter_channel_out(),
            channel_in: default_filter_channel_in(),
            timeout: default_filter_timeout(),
            timeout_action: default_filter_timeout_action(),
            sleep_time: default_sleep_time(),
        }
    }
}

impl FilterConfig {
    /// Parse from node parameters
    pub fn from_params(params: &Value) -> Result<Self> {
        let config: Self = serde_json::from_value(params.clone())
            .map_err(|e| Error::ConfigError(format!("Failed to parse FilterConfig: {}", e)))?;
        Ok(config)
    }

    /// Resolved timeout policy
    pub fn timeout_action(&self) -> Result<FilterTimeoutAction> {
        self.timeout_action.parse()
    }

    /// Check every option, including the timeout policy
    pub fn validate(&self) -> Result<()> {
        validate_channel("channel_out", &self.channel_out)?;
        validate_channel("channel_in", &self.channel_in)?;
        validate_timing(self.timeout, self.sleep_time)?;
        self.timeout_action()?;
        Ok(())
    }

    /// Timing parameters for the session
    pub fn timing(&self) -> Timing {
        Timing::new(self.timeout, self.sleep_time)
    }
}

/// Configuration of a wait-only (reader) bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Connection parameters
    #[serde(flatten)]
    pub connection: ConnectionConfig,

    /// Channel (pattern) the data arrives on
    ///
    /// Default: "data_in"
    #[serde(default = "default_reader_channel_in")]
    pub channel_in: String,

    /// Seconds to wait for data; zero or negative waits forever
    ///
    /// Default: 30.0
    #[serde(default = "default_reader_timeout")]
    pub timeout: f64,

    /// What to do when nothing arrives in time ("keep-waiting" or "stop")
    ///
    /// Default: "keep-waiting"
    #[serde(default = "default_reader_timeout_action")]
    pub timeout_action: String,

    /// Seconds between checks for data
    ///
    /// Default: 0.01
    #[serde(default = "default_sleep_time")]
    pub sleep_time: f64,
}

fn default_reader_channel_in() -> String {
    "data_in".to_string()
}

fn default_reader_timeout() -> f64 {
    30.0
}

fn default_reader_timeout_action() -> String {
    ReaderTimeoutAction::KeepWaiting.as_str().to_string()
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            channel_in: default_reader_channel_in(),
            timeout: default_reader_timeout(),
            timeout_action: default_reader_timeout_action(),
            sleep_time: default_sleep_time(),
        }
    }
}

impl ReaderConfig {
    /// Parse from node parameters
    pub fn from_params(params: &Value) -> Result<Self> {
        serde_json::from_value(params.clone())
            .map_err(|e| Error::ConfigError(format!("Failed to parse ReaderConfig: {}", e)))
    }

    /// Resolved timeout policy
    pub fn timeout_action(&self) -> Result<ReaderTimeoutAction> {
        self.timeout_action.parse()
    }

    /// Check every option, including the timeout policy
    pub fn validate(&self) -> Result<()> {
        validate_channel("channel_in", &self.channel_in)?;
        validate_timing(self.timeout, self.sleep_time)?;
        self.timeout_action()?;
        Ok(())
    }

    /// Timing parameters for the session
    pub fn timing(&self) -> Timing {
        Timing::new(self.timeout, self.sleep_time)
    }
}

/// Configuration of the broadcast writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Connection parameters
    #[serde(flatten)]
    pub connection: ConnectionConfig,

    /// Channel the records are broadcast on
    ///
    /// Default: "data_out"
    #[serde(default = "default_broadcast_channel_out")]
    pub channel_out: String,

    /// Whether to embed the image bytes (base64) in the broadcast JSON
    ///
    /// Default: false
    #[serde(default)]
    pub include_image: bool,
}

fn default_broadcast_channel_out() -> String {
    "data_out".to_string()
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            channel_out: default_broadcast_channel_out(),
            include_image: false,
        }
    }
}

impl BroadcastConfig {
    /// Parse from node parameters
    pub fn from_params(params: &Value) -> Result<Self> {
        let config: Self = serde_json::from_value(params.clone())
            .map_err(|e| Error::ConfigError(format!("Failed to parse BroadcastConfig: {}", e)))?;
        validate_channel("channel_out", &config.channel_out)?;
        Ok(config)
    }
}

/// Upper bound for `timeout` and `sleep_time` (one year)
pub const MAX_TIMING_SECS: f64 = 365.0 * 24.0 * 3600.0;

const DEFAULT_SLEEP: Duration = Duration::from_millis(10);

/// Deadline and poll interval of a session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    /// Deadline per call; `None` waits forever
    pub timeout: Option<Duration>,
    /// Granularity of the wait loop
    pub sleep_time: Duration,
}

impl Timing {
    /// Build from seconds; non-positive timeouts mean "wait forever"
    ///
    /// A timeout too large for a `Duration` also waits forever; an unusable
    /// sleep time falls back to the default.
    pub fn new(timeout_secs: f64, sleep_secs: f64) -> Self {
        let timeout = if timeout_secs > 0.0 {
            Duration::try_from_secs_f64(timeout_secs).ok()
        } else {
            None
        };
        let sleep_time = Some(sleep_secs)
            .filter(|s| *s > 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .unwrap_or(DEFAULT_SLEEP);
        Self { timeout, sleep_time }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Timing::new(default_filter_timeout(), default_sleep_time())
    }
}

fn validate_channel(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::ConfigError(format!("{} must not be empty", name)));
    }
    Ok(())
}

fn validate_timing(timeout: f64, sleep_time: f64) -> Result<()> {
    if !timeout.is_finite() || timeout > MAX_TIMING_SECS {
        return Err(Error::ConfigError(format!(
            "timeout must be at most {} seconds (0 or less waits forever), got {}",
            MAX_TIMING_SECS, timeout
        )));
    }
    if !(sleep_time > 0.0 && sleep_time <= MAX_TIMING_SECS) {
        return Err(Error::ConfigError(format!(
            "sleep_time must be a positive number of seconds up to {}, got {}",
            MAX_TIMING_SECS, sleep_time
        )));
    }
    Ok(())
}

/// Load node parameters from a JSON, YAML or TOML file (chosen by extension)
pub fn load_params_file(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    match extension.as_str() {
        "json" => Ok(serde_json::from_str(&text)?),
        "yaml" | "yml" => serde_yaml::from_str(&text).map_err(|e| {
            Error::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        }),
        "toml" => {
            let table: toml::Value = toml::from_str(&text).map_err(|e| {
                Error::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
            })?;
            Ok(serde_json::to_value(table)?)
        }
        other => Err(Error::ConfigError(format!(
            "Unsupported config file extension '{}' for {} (expected json, yaml or toml)",
            other,
            path.display()
        ))),
    }
}
