// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (VIGIL_ prefix, `__` nesting)
// - Validation
// - Sensible defaults for every field
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::client::DeviceType;
use crate::error::ConfigError;
use crate::{
    CLOCK_SKEW_TOLERANCE_SECS, DEFAULT_ALERT_QUERY_LIMIT, DEFAULT_COLLECTION_INTERVAL_SECS,
    DEFAULT_DEDUP_WINDOW_SECS, DEFAULT_EVENT_BUFFER_CAPACITY, DEFAULT_HTTP_TIMEOUT_SECS,
    DEFAULT_MIN_EVENTS, DEFAULT_POLL_WINDOW_HOURS, DEFAULT_SHELL_MAX_LINES,
    DEFAULT_SHELL_TIMEOUT_SECS, DEFAULT_SOURCE_THRESHOLD, DEFAULT_STORE_PORT,
    REALTIME_CONNECT_TIMEOUT_SECS, REALTIME_RECONNECT_BACKOFF_SECS, RECURRING_THRESHOLD,
    ROAM_FLAP_THRESHOLD, WORKER_STOP_TIMEOUT_SECS,
};

// ----------------------------------------------------------------------------
// Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigilConfig {
    /// Controller connection settings
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Realtime stream settings
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Collection cycle and fallback settings
    #[serde(default)]
    pub collection: CollectionConfig,

    /// Remote shell access (needed for shell fallback and store queries)
    #[serde(default)]
    pub shell: Option<ShellConfig>,

    /// Correlation and deduplication settings
    #[serde(default)]
    pub correlation: CorrelationConfig,

    /// Threat aggregation settings
    #[serde(default)]
    pub threats: ThreatConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl VigilConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("VIGIL_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.realtime.buffer_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "realtime.buffer_capacity",
                "must be greater than zero",
            ));
        }

        if self.collection.min_events == 0 {
            return Err(ConfigError::invalid_value(
                "collection.min_events",
                "must be greater than zero",
            ));
        }

        if self.collection.window_hours == 0 {
            return Err(ConfigError::invalid_value(
                "collection.window_hours",
                "must be at least one hour",
            ));
        }

        if self.threats.source_threshold == 0 {
            return Err(ConfigError::invalid_value(
                "threats.source_threshold",
                "must be greater than zero",
            ));
        }

        if self.correlation.roam_flap_threshold < 2 {
            return Err(ConfigError::invalid_value(
                "correlation.roam_flap_threshold",
                "must be at least 2",
            ));
        }

        if self.correlation.dedup_window.is_zero() {
            return Err(ConfigError::invalid_value(
                "correlation.dedup_window",
                "must be a positive duration",
            ));
        }

        if self.collection.shell_fallback {
            match &self.shell {
                None => return Err(ConfigError::missing_field("shell")),
                Some(shell) if shell.host.trim().is_empty() => {
                    return Err(ConfigError::missing_field("shell.host"))
                }
                Some(_) => {}
            }
        }

        if let Err(e) = reqwest::Url::parse(&self.controller.base_url) {
            return Err(ConfigError::invalid_value(
                "controller.base_url",
                format!("not a valid URL: {}", e),
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        let mut config = Self::default();
        config.shell = Some(ShellConfig::default());
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Controller Configuration
// ----------------------------------------------------------------------------

/// How to reach the network controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Base URL, e.g. `https://192.168.1.1` or `https://ctl.local:8443`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Site name
    #[serde(default = "default_site")]
    pub site: String,

    /// Standalone controller or UniFi-OS console
    #[serde(default)]
    pub device_type: DeviceType,

    /// Pre-established session cookie header value
    #[serde(default)]
    pub cookie: Option<String>,

    /// Verify the controller's TLS certificate
    #[serde(default)]
    pub verify_tls: bool,

    /// Per-request timeout
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            site: default_site(),
            device_type: DeviceType::default(),
            cookie: None,
            verify_tls: false,
            timeout: default_http_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://127.0.0.1:8443".into()
}

fn default_site() -> String {
    "default".into()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// Realtime Configuration
// ----------------------------------------------------------------------------

/// Realtime stream listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Run the background listener
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Events held between drains before the oldest are dropped
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Pause between reconnect attempts
    #[serde(default = "default_reconnect_backoff", with = "humantime_serde")]
    pub reconnect_backoff: Duration,

    /// Timeout for one connection attempt
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// How long `stop()` waits for the worker thread
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_capacity: default_buffer_capacity(),
            reconnect_backoff: default_reconnect_backoff(),
            connect_timeout: default_connect_timeout(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_buffer_capacity() -> usize {
    DEFAULT_EVENT_BUFFER_CAPACITY
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(REALTIME_RECONNECT_BACKOFF_SECS)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(REALTIME_CONNECT_TIMEOUT_SECS)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(WORKER_STOP_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// Collection Configuration
// ----------------------------------------------------------------------------

/// Collection cycle and fallback policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Time between cycles in `run` mode
    #[serde(default = "default_collection_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Look-back window passed to the polling API
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,

    /// Event count below which shell fallback is attempted
    #[serde(default = "default_min_events")]
    pub min_events: usize,

    /// Tolerance applied to the `since` cutoff
    #[serde(default = "default_clock_skew", with = "humantime_serde")]
    pub clock_skew: Duration,

    /// Read appliance logs over SSH when the API comes up short
    #[serde(default)]
    pub shell_fallback: bool,

    /// Fetch alarms alongside events when polling
    #[serde(default = "default_true")]
    pub include_alarms: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: default_collection_interval(),
            window_hours: default_window_hours(),
            min_events: default_min_events(),
            clock_skew: default_clock_skew(),
            shell_fallback: false,
            include_alarms: true,
        }
    }
}

fn default_collection_interval() -> Duration {
    Duration::from_secs(DEFAULT_COLLECTION_INTERVAL_SECS)
}

fn default_window_hours() -> u32 {
    DEFAULT_POLL_WINDOW_HOURS
}

fn default_min_events() -> usize {
    DEFAULT_MIN_EVENTS
}

fn default_clock_skew() -> Duration {
    Duration::from_secs(CLOCK_SKEW_TOLERANCE_SECS as u64)
}

// ----------------------------------------------------------------------------
// Shell Configuration
// ----------------------------------------------------------------------------

/// SSH access to the appliance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Hostname or address
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_ssh_user")]
    pub username: String,

    /// Private key passed with `-i`
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    /// Timeout for one remote command
    #[serde(default = "default_shell_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Log file tailed for fallback events
    #[serde(default = "default_log_path")]
    pub log_path: String,

    /// Lines read per collection
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,

    /// Alert records fetched per store query
    #[serde(default = "default_alert_limit")]
    pub alert_limit: usize,

    /// Port of the appliance's local document store
    #[serde(default = "default_store_port")]
    pub store_port: u16,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            username: default_ssh_user(),
            identity_file: None,
            timeout: default_shell_timeout(),
            log_path: default_log_path(),
            max_lines: default_max_lines(),
            alert_limit: default_alert_limit(),
            store_port: default_store_port(),
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".into()
}

fn default_shell_timeout() -> Duration {
    Duration::from_secs(DEFAULT_SHELL_TIMEOUT_SECS)
}

fn default_log_path() -> String {
    "/var/log/messages".into()
}

fn default_max_lines() -> usize {
    DEFAULT_SHELL_MAX_LINES
}

fn default_alert_limit() -> usize {
    DEFAULT_ALERT_QUERY_LIMIT
}

fn default_store_port() -> u16 {
    DEFAULT_STORE_PORT
}

// ----------------------------------------------------------------------------
// Correlation Configuration
// ----------------------------------------------------------------------------

/// Correlation and deduplication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Roams per client in one batch that count as flapping
    #[serde(default = "default_roam_flap_threshold")]
    pub roam_flap_threshold: usize,

    /// Window within which repeated findings are merged
    #[serde(default = "default_dedup_window", with = "humantime_serde")]
    pub dedup_window: Duration,

    /// Occurrence count at which a finding is recurring
    #[serde(default = "default_recurring_threshold")]
    pub recurring_threshold: u32,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            roam_flap_threshold: default_roam_flap_threshold(),
            dedup_window: default_dedup_window(),
            recurring_threshold: default_recurring_threshold(),
        }
    }
}

fn default_roam_flap_threshold() -> usize {
    ROAM_FLAP_THRESHOLD
}

fn default_dedup_window() -> Duration {
    Duration::from_secs(DEFAULT_DEDUP_WINDOW_SECS)
}

fn default_recurring_threshold() -> u32 {
    RECURRING_THRESHOLD
}

// ----------------------------------------------------------------------------
// Threat Configuration
// ----------------------------------------------------------------------------

/// Threat aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatConfig {
    /// Query IDS/IPS alerts each cycle (requires `shell`)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum events from one address before it is reported
    #[serde(default = "default_source_threshold")]
    pub source_threshold: usize,
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source_threshold: default_source_threshold(),
        }
    }
}

fn default_source_threshold() -> usize {
    DEFAULT_SOURCE_THRESHOLD
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to this file instead of stderr
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}
