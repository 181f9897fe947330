//! Reader configuration

use crate::ReaderError;
use config::{Config, Environment, File, FileFormat, Source};
use obd_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file read when no path is given on the command line
pub const DEFAULT_CONFIG_PATH: &str = "obd-reader.toml";

/// Environment variable prefix; nested keys are separated by `__`
pub const ENV_PREFIX: &str = "OBD_READER";

/// Longest accepted cycle period (one hour)
pub const MAX_CYCLE_PERIOD_MS: u64 = 3_600_000;

/// CAN transport selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// In-process simulated ECU
    #[default]
    Simulated,
    /// slcan (Lawicel) adapter on a serial port
    Slcan {
        device: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_bitrate_kbps")]
        bitrate_kbps: u32,
    },
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_bitrate_kbps() -> u32 {
    500
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Max level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON lines instead of plain text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Top-level reader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub transport: TransportConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,

    /// Period between cycle starts (milliseconds)
    pub cycle_period_ms: u64,

    /// Prometheus exporter address, e.g. "0.0.0.0:9100"
    pub metrics_listen: Option<String>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
            cycle_period_ms: 100,
            metrics_listen: None,
        }
    }
}

impl ReaderConfig {
    /// Load defaults, then the TOML file at `path` if it exists, then
    /// `OBD_READER__*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReaderError> {
        Self::from_sources(File::from(path.as_ref()).required(false), env_overrides())
    }

    /// Parse a TOML document without touching the environment
    pub fn from_toml_str(toml: &str) -> Result<Self, ReaderError> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Self::finish(settings)
    }

    fn from_sources<S>(file: S, env: Environment) -> Result<Self, ReaderError>
    where
        S: Source + Send + Sync + 'static,
    {
        let settings = Config::builder().add_source(file).add_source(env).build()?;
        Self::finish(settings)
    }

    fn finish(settings: Config) -> Result<Self, ReaderError> {
        let config: ReaderConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges, including the scheduler section
    pub fn validate(&self) -> Result<(), ReaderError> {
        if self.cycle_period_ms == 0 || self.cycle_period_ms > MAX_CYCLE_PERIOD_MS {
            return Err(ReaderError::InvalidConfig(format!(
                "cycle_period_ms must be between 1 and {}",
                MAX_CYCLE_PERIOD_MS
            )));
        }
        self.scheduler.validate()?;
        Ok(())
    }

    /// Period between cycle starts
    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.cycle_period_ms)
    }
}

/// `OBD_READER__SECTION__KEY` variables, e.g. `OBD_READER__SCHEDULER__REQUEST_TIMEOUT_MS`
fn env_overrides() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_scheduler::ValidityPolicy;

    #[test]
    fn test_defaults() {
        let config = ReaderConfig::from_toml_str("").unwrap();
        assert_eq!(config.transport, TransportConfig::Simulated);
        assert_eq!(config.cycle_period_ms, 100);
        assert_eq!(config.scheduler.request_timeout_ms, 500);
        assert_eq!(config.scheduler.inter_request_gap_ms, 10);
        assert_eq!(config.scheduler.validity_policy, ValidityPolicy::RpmOverride);
        assert_eq!(config.logging, LoggingConfig::default());
        assert!(config.metrics_listen.is_none());
    }

    #[test]
    fn test_full_document() {
        let config = ReaderConfig::from_toml_str(
            r#"
            cycle_period_ms = 250
            metrics_listen = "127.0.0.1:9100"

            [transport]
            kind = "slcan"
            device = "/dev/ttyACM0"

            [scheduler]
            request_timeout_ms = 200
            validity_policy = "all_fields"

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();

        assert_eq!(
            config.transport,
            TransportConfig::Slcan {
                device: "/dev/ttyACM0".to_string(),
                baud_rate: 115_200,
                bitrate_kbps: 500,
            }
        );
        assert_eq!(config.cycle_period(), Duration::from_millis(250));
        assert_eq!(config.metrics_listen.as_deref(), Some("127.0.0.1:9100"));
        assert_eq!(config.scheduler.request_timeout_ms, 200);
        assert_eq!(config.scheduler.inter_request_gap_ms, 10);
        assert_eq!(config.scheduler.validity_policy, ValidityPolicy::AllFields);
        assert!(config.logging.json);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            ReaderConfig::from_toml_str("cycle_period_ms = 0"),
            Err(ReaderError::InvalidConfig(_))
        ));
        assert!(matches!(
            ReaderConfig::from_toml_str("[scheduler]\nrequest_timeout_ms = 0"),
            Err(ReaderError::Scheduler(_))
        ));
        assert!(matches!(
            ReaderConfig::from_toml_str("[scheduler]\nvalidity_policy = \"sometimes\""),
            Err(ReaderError::Config(_))
        ));
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = File::from_str(
            r#"
            cycle_period_ms = 250

            [scheduler]
            request_timeout_ms = 200
            inter_request_gap_ms = 5
            "#,
            FileFormat::Toml,
        );
        let mut vars = config::Map::new();
        vars.insert(
            "OBD_READER__SCHEDULER__REQUEST_TIMEOUT_MS".to_string(),
            "750".to_string(),
        );
        vars.insert("OBD_READER__LOGGING__JSON".to_string(), "true".to_string());
        vars.insert("UNRELATED__CYCLE_PERIOD_MS".to_string(), "1".to_string());

        let config =
            ReaderConfig::from_sources(file, env_overrides().source(Some(vars))).unwrap();
        assert_eq!(config.scheduler.request_timeout_ms, 750);
        assert_eq!(config.scheduler.inter_request_gap_ms, 5);
        assert_eq!(config.cycle_period_ms, 250);
        assert!(config.logging.json);
    }

    #[test]
    fn test_environment_values_are_validated() {
        let mut vars = config::Map::new();
        vars.insert("OBD_READER__CYCLE_PERIOD_MS".to_string(), "0".to_string());
        let file = File::from_str("", FileFormat::Toml);

        assert!(matches!(
            ReaderConfig::from_sources(file, env_overrides().source(Some(vars))),
            Err(ReaderError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_cycle_period_upper_bound() {
        let toml = format!("cycle_period_ms = {}", MAX_CYCLE_PERIOD_MS + 1);
        assert!(matches!(
            ReaderConfig::from_toml_str(&toml),
            Err(ReaderError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ReaderConfig::load("does-not-exist/obd-reader.toml").unwrap();
        assert_eq!(config.cycle_period_ms, 100);
    }
}
