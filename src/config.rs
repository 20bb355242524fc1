//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `labctl.toml` (base configuration)
//! 2. Environment variables prefixed with `LABCTL_` (`__` between nested keys)
//!
//! ```toml
//! [application]
//! log_level = "info"
//! log_format = "compact"
//!
//! [[instruments]]
//! id = "stage"
//! driver = "stage"
//! device = "/dev/ttyUSB0"
//! timeout_ms = 1500
//! ```
//!
//! # Example
//! ```no_run
//! use labctl::config::LabConfig;
//!
//! let config = LabConfig::load()?;
//! config.validate()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::registry::DriverRegistry;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use labctl_core::driver::DriverOptions;
use labctl_core::error::{LabError, LabResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "labctl.toml";

/// Log levels accepted in `[application] log_level`.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// One instrument in `[[instruments]]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier
    pub id: String,
    /// Driver type (stage, laser, shutter, thermometer)
    pub driver: String,
    /// Character device path
    pub device: String,
    /// Read timeout override in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Suppress identification failure logging
    #[serde(default)]
    pub quiet: bool,
    /// Echo serial traffic at debug level
    #[serde(default)]
    pub debug: bool,
    /// Whether this instrument is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl InstrumentDefinition {
    /// Driver options for this instrument.
    pub fn options(&self) -> DriverOptions {
        let options = DriverOptions::default()
            .quiet(self.quiet)
            .debug(self.debug);
        match self.timeout_ms {
            Some(ms) => options.with_timeout(Duration::from_millis(ms)),
            None => options,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_enabled() -> bool {
    true
}

impl LabConfig {
    /// Load configuration from `labctl.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `LABCTL_`, with
    /// `__` separating nested keys.
    /// Example: `LABCTL_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file yields the defaults (plus any environment overrides).
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(LabConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("LABCTL_").split("__"))
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    /// `Configuration` for an unknown log level, an unknown driver type, an
    /// empty device path or a duplicate instrument id.
    pub fn validate(&self) -> LabResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(LabError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        let registry = DriverRegistry::with_builtin();
        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(instrument.id.as_str()) {
                return Err(LabError::Configuration(format!(
                    "Duplicate instrument ID: {}",
                    instrument.id
                )));
            }
            if !registry.contains(&instrument.driver) {
                return Err(LabError::Configuration(format!(
                    "Instrument '{}' uses unknown driver '{}'. Must be one of: {}",
                    instrument.id,
                    instrument.driver,
                    registry.driver_types().join(", ")
                )));
            }
            if instrument.device.trim().is_empty() {
                return Err(LabError::Configuration(format!(
                    "Instrument '{}' has an empty device path",
                    instrument.id
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> impl Iterator<Item = &InstrumentDefinition> {
        self.instruments.iter().filter(|inst| inst.enabled)
    }

    /// Look up an instrument by id.
    pub fn instrument(&self, id: &str) -> Option<&InstrumentDefinition> {
        self.instruments.iter().find(|inst| inst.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument(id: &str, driver: &str) -> InstrumentDefinition {
        InstrumentDefinition {
            id: id.to_string(),
            driver: driver.to_string(),
            device: "/dev/ttyUSB0".to_string(),
            timeout_ms: None,
            quiet: false,
            debug: false,
            enabled: true,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = LabConfig::default();
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.application.log_format, LogFormat::Compact);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = LabConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(LabError::Configuration(_))));
    }

    #[test]
    fn test_duplicate_instrument_ids() {
        let config = LabConfig {
            instruments: vec![instrument("a", "stage"), instrument("a", "laser")],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate instrument ID: a"));
    }

    #[test]
    fn test_unknown_driver_rejected() {
        let config = LabConfig {
            instruments: vec![instrument("v", "viper")],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown driver 'viper'"));
    }

    #[test]
    fn test_instrument_options() {
        let mut def = instrument("t", "thermometer");
        def.timeout_ms = Some(2500);
        def.quiet = true;
        let options = def.options();
        assert_eq!(options.timeout, Some(Duration::from_millis(2500)));
        assert!(options.quiet);
        assert!(!options.debug);
    }
}
