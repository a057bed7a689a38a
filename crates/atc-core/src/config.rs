//! Session, router and monitor configuration.
//!
//! [`SessionConfig`] holds the timing discipline of a [`DeviceSession`]
//! (connect retries, settings exchange deadline and poll cadence).
//! [`MonitorConfig`] describes a set of thermometers in a TOML file:
//!
//! ```toml
//! [session]
//! exchange_timeout_ms = 5000
//! track_time = true
//!
//! [router]
//! address_prefix = "A4"
//!
//! [[sensors]]
//! address = "A4:C1:38:12:34:56"
//! name = "Kitchen"
//! mode = "notification"
//! ```
//!
//! [`DeviceSession`]: crate::DeviceSession

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use atc_types::ConnectionMode;

use crate::retry::RetryConfig;
use crate::transport::normalize_address;

/// Default number of connect attempts.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;

/// Default delay between connect attempts.
pub const DEFAULT_CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Default number of settings reads attempted by `init`.
pub const DEFAULT_SETTINGS_ATTEMPTS: u32 = 5;

/// Default overall deadline of one settings exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cadence at which a settings exchange checks for its response.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default wait between subscribing and sending a settings read request.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Default advertising scan duration.
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(5);

/// Address prefix of the thermometers' vendor (Telink, `A4:C1:38`).
pub const DEFAULT_ADDRESS_PREFIX: &str = "A4";

/// Timing and behaviour of one device session.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use atc_core::SessionConfig;
///
/// let config = SessionConfig::default()
///     .exchange_timeout(Duration::from_secs(10))
///     .track_time(true);
/// assert_eq!(config.connect_attempts, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Connect attempts before giving up.
    pub connect_attempts: u32,
    /// Fixed delay between connect attempts.
    #[serde(rename = "connect_backoff_ms", with = "millis")]
    pub connect_backoff: Duration,
    /// Settings read attempts made by `init`.
    pub settings_attempts: u32,
    /// Overall deadline of one settings exchange.
    #[serde(rename = "exchange_timeout_ms", with = "millis")]
    pub exchange_timeout: Duration,
    /// How often the exchange checks for its response.
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    /// Wait between subscribing and sending a settings read request.
    #[serde(rename = "settle_delay_ms", with = "millis")]
    pub settle_delay: Duration,
    /// Stamp every cache update with the current time.
    pub track_time: bool,
    /// Mode applied by `init`.
    pub initial_mode: ConnectionMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_backoff: DEFAULT_CONNECT_BACKOFF,
            settings_attempts: DEFAULT_SETTINGS_ATTEMPTS,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
            track_time: false,
            initial_mode: ConnectionMode::Advertising,
        }
    }
}

impl SessionConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorter deadlines for thermometers close to the adapter.
    pub fn fast() -> Self {
        Self {
            connect_attempts: 3,
            connect_backoff: Duration::from_millis(500),
            exchange_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            settle_delay: Duration::from_millis(250),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    #[must_use]
    pub fn connect_backoff(mut self, backoff: Duration) -> Self {
        self.connect_backoff = backoff;
        self
    }

    #[must_use]
    pub fn settings_attempts(mut self, attempts: u32) -> Self {
        self.settings_attempts = attempts;
        self
    }

    #[must_use]
    pub fn exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    #[must_use]
    pub fn track_time(mut self, enabled: bool) -> Self {
        self.track_time = enabled;
        self
    }

    #[must_use]
    pub fn initial_mode(mut self, mode: ConnectionMode) -> Self {
        self.initial_mode = mode;
        self
    }

    /// Retry policy for connect: fixed backoff, no jitter.
    pub fn connect_retry(&self) -> RetryConfig {
        RetryConfig::fixed(self.connect_attempts.saturating_sub(1), self.connect_backoff)
    }

    /// Validate timing values.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut require = |ok: bool, field: &str, message: &str| {
            if !ok {
                errors.push(ValidationError {
                    field: format!("{prefix}.{field}"),
                    message: message.to_string(),
                });
            }
        };

        require(
            self.connect_attempts > 0,
            "connect_attempts",
            "must be at least 1",
        );
        require(
            self.settings_attempts > 0,
            "settings_attempts",
            "must be at least 1",
        );
        require(
            !self.poll_interval.is_zero(),
            "poll_interval_ms",
            "must be greater than zero",
        );
        require(
            self.exchange_timeout >= self.poll_interval,
            "exchange_timeout_ms",
            "must not be shorter than the poll interval",
        );
        errors
    }
}

/// Advertising router settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Only addresses starting with this prefix (ignoring case and separators)
    /// are routed.
    /// `None` routes every address.
    pub address_prefix: Option<String>,
    /// Duration of one scan window.
    #[serde(rename = "scan_duration_ms", with = "millis")]
    pub scan_duration: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            address_prefix: Some(DEFAULT_ADDRESS_PREFIX.to_string()),
            scan_duration: DEFAULT_SCAN_DURATION,
        }
    }
}

impl RouterConfig {
    /// Route advertisements from every address.
    #[must_use]
    pub fn any_address(mut self) -> Self {
        self.address_prefix = None;
        self
    }

    #[must_use]
    pub fn address_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.address_prefix = Some(prefix.into());
        self
    }

    #[must_use]
    pub fn scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    /// Whether `address` passes the prefix filter.
    pub fn accepts(&self, address: &str) -> bool {
        match &self.address_prefix {
            None => true,
            Some(prefix) => normalize_address(address).starts_with(&normalize_address(prefix)),
        }
    }
}

/// One thermometer in a monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Bluetooth address.
    pub address: String,
    /// Friendly name.
    #[serde(default)]
    pub name: Option<String>,
    /// Connection mode applied after init.
    #[serde(default)]
    pub mode: ConnectionMode,
}

impl SensorConfig {
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.address.trim().is_empty() {
            errors.push(ValidationError {
                field: format!("{prefix}.address"),
                message: "sensor address cannot be empty".to_string(),
            });
        }
        if let Some(name) = &self.name
            && name.is_empty()
        {
            errors.push(ValidationError {
                field: format!("{prefix}.name"),
                message: "name cannot be empty string (omit it instead)".to_string(),
            });
        }
        errors
    }

    /// Session config for this sensor, with its mode as the initial mode.
    pub fn session_config(&self, base: &SessionConfig) -> SessionConfig {
        base.clone().initial_mode(self.mode)
    }
}

/// A set of thermometers and shared settings, loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub session: SessionConfig,
    pub router: RouterConfig,
    pub sensors: Vec<SensorConfig>,
}

impl MonitorConfig {
    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<string>"),
            source: e,
        })
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// This checks:
    /// - Session timing values are usable
    /// - Sensor addresses are not empty
    /// - No duplicate sensor addresses (ignoring case and separators)
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self.session.validate("session");

        if self.router.scan_duration.is_zero() {
            errors.push(ValidationError {
                field: "router.scan_duration_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for (i, sensor) in self.sensors.iter().enumerate() {
            let prefix = format!("sensors[{i}]");
            errors.extend(sensor.validate(&prefix));
            if !seen.insert(normalize_address(&sensor.address)) {
                errors.push(ValidationError {
                    field: format!("{prefix}.address"),
                    message: format!("duplicate sensor address '{}'", sensor.address),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `session.poll_interval_ms` or `sensors[0].address`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Serde adapter storing a `Duration` as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.connect_attempts, 5);
        assert_eq!(config.connect_backoff, Duration::from_secs(1));
        assert_eq!(config.settings_attempts, 5);
        assert_eq!(config.exchange_timeout, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.settle_delay, Duration::from_secs(1));
        assert!(!config.track_time);
        assert_eq!(config.initial_mode, ConnectionMode::Advertising);
        assert!(config.validate("session").is_empty());
    }

    #[test]
    fn test_session_config_builder() {
        let config = SessionConfig::new()
            .connect_attempts(2)
            .exchange_timeout(Duration::from_secs(1))
            .initial_mode(ConnectionMode::Connection);
        assert_eq!(config.connect_attempts, 2);
        assert_eq!(config.exchange_timeout, Duration::from_secs(1));
        assert_eq!(config.initial_mode, ConnectionMode::Connection);
    }

    #[test]
    fn test_connect_retry_is_fixed() {
        let retry = SessionConfig::default().connect_retry();
        assert_eq!(retry.max_retries, 4);
        assert_eq!(retry.initial_delay, Duration::from_secs(1));
        assert_eq!(retry.backoff_multiplier, 1.0);
        assert!(!retry.jitter);
    }

    #[test]
    fn test_session_config_validation() {
        let config = SessionConfig::default()
            .connect_attempts(0)
            .poll_interval(Duration::ZERO);
        let errors = config.validate("session");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "session.connect_attempts");
        assert_eq!(errors[1].field, "session.poll_interval_ms");
    }

    #[test]
    fn test_router_prefix_filter() {
        let config = RouterConfig::default();
        assert!(config.accepts("A4:C1:38:00:11:22"));
        assert!(config.accepts("a4:c1:38:00:11:22"));
        assert!(!config.accepts("B4:C1:38:00:11:22"));
        assert!(!config.accepts("A"));
        assert!(config.accepts("a4c138001122"));
        assert!(config.clone().any_address().accepts("B4:C1:38:00:11:22"));
        assert!(config.address_prefix("b4:c1").accepts("B4:C1:38:00:11:22"));
    }

    #[test]
    fn test_monitor_config_from_toml() {
        let toml = r#"
            [session]
            exchange_timeout_ms = 2500
            track_time = true

            [router]
            address_prefix = "A4:C1"
            scan_duration_ms = 10000

            [[sensors]]
            address = "A4:C1:38:12:34:56"
            name = "Kitchen"
            mode = "notification"

            [[sensors]]
            address = "A4:C1:38:AB:CD:EF"
        "#;

        let config = MonitorConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.session.exchange_timeout, Duration::from_millis(2500));
        assert!(config.session.track_time);
        assert_eq!(config.session.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.router.address_prefix.as_deref(), Some("A4:C1"));
        assert_eq!(config.router.scan_duration, Duration::from_secs(10));
        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.sensors[0].name.as_deref(), Some("Kitchen"));
        assert_eq!(config.sensors[0].mode, ConnectionMode::Notification);
        assert_eq!(config.sensors[1].mode, ConnectionMode::Advertising);
        config.validate().unwrap();
    }

    #[test]
    fn test_monitor_config_empty_is_default() {
        let config = MonitorConfig::from_toml_str("").unwrap();
        assert_eq!(config, MonitorConfig::default());
    }

    #[test]
    fn test_monitor_config_duplicate_addresses() {
        let config = MonitorConfig {
            sensors: vec![
                SensorConfig {
                    address: "A4:C1:38:12:34:56".to_string(),
                    name: None,
                    mode: ConnectionMode::Advertising,
                },
                SensorConfig {
                    address: "a4:c1:38:12:34:56".to_string(),
                    name: Some(String::new()),
                    mode: ConnectionMode::Connection,
                },
            ],
            ..Default::default()
        };

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.message.contains("duplicate")));
        assert!(errors.iter().any(|e| e.field == "sensors[1].name"));
    }

    #[test]
    fn test_monitor_config_parse_error() {
        let result = MonitorConfig::from_toml_str("this is not valid { toml");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_monitor_config_load_nonexistent() {
        let result = MonitorConfig::load("/nonexistent/path/atc.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_session_config_toml_round_trip() {
        let config = SessionConfig::fast().track_time(true);
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("poll_interval_ms = 50"));
        let back: SessionConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_sensor_config_json_shape() {
        let sensor = SensorConfig {
            address: "A4:C1:38:00:00:01".to_string(),
            name: None,
            mode: ConnectionMode::Notification,
        };
        let value = serde_json::to_value(&sensor).unwrap();
        assert_eq!(value["mode"], "notification");
        assert!(value["name"].is_null());
    }
}
