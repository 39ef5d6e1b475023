//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. A TOML file (base configuration)
//! 2. Environment variables (prefixed with `MULTIBEAM_DAQ_`, sections
//!    separated by `__`)
//!
//! # Example
//! ```no_run
//! use multibeam_daq::config::AppConfig;
//!
//! let config = AppConfig::load_from("config/multibeam.toml")?;
//! println!("ASM host: {}", config.asm.host);
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use mb_driver_asm::config::{
    AcquisitionSettings, AsmDriverConfig, AsmSettings, CalibrationSettings, DescannerSettings,
    ExternalStorageSettings,
};
use mb_driver_asm::storage::StorageUrl;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Prefix of the environment variables overriding the file.
pub const ENV_PREFIX: &str = "MULTIBEAM_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Connection to the ASM
    pub asm: AsmSettings,
    /// Where the ASM stores images
    #[serde(default)]
    pub external_storage: ExternalStorageSettings,
    /// Acquisition worker timing
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
    /// Descan mirror properties
    #[serde(default)]
    pub descanner: DescannerSettings,
    /// Calibration signal limits
    #[serde(default)]
    pub calibration: CalibrationSettings,
    /// Initial attribute values per device (`scanner`, `descanner`, `mppc`)
    #[serde(default)]
    pub attributes: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "multibeam-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl AppConfig {
    /// Defaults everywhere except the ASM host.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            application: ApplicationConfig::default(),
            asm: AsmSettings::new(host),
            external_storage: ExternalStorageSettings::default(),
            acquisition: AcquisitionSettings::default(),
            descanner: DescannerSettings::default(),
            calibration: CalibrationSettings::default(),
            attributes: BTreeMap::new(),
        }
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables override the file, e.g.
    /// `MULTIBEAM_DAQ_ASM__HOST=http://asm:8080/v2`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.asm.host.trim().is_empty() {
            return Err("asm.host must not be empty".to_string());
        }

        StorageUrl::parse(&self.external_storage.url())
            .map_err(|e| format!("Invalid external_storage settings: {}", e))?;

        let timeouts = [
            ("asm.request_timeout_secs", self.asm.request_timeout_secs),
            (
                "acquisition.single_field_timeout_secs",
                self.acquisition.single_field_timeout_secs,
            ),
            (
                "acquisition.cancel_max_wait_secs",
                self.acquisition.cancel_max_wait_secs,
            ),
            (
                "acquisition.terminate_timeout_secs",
                self.acquisition.terminate_timeout_secs,
            ),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(format!("{} must be greater than 0", name));
        }

        let calibration = &self.calibration;
        if !(calibration.min_frequency_hz > 0.0
            && calibration.min_frequency_hz < calibration.max_frequency_hz)
        {
            return Err(format!(
                "Invalid calibration band [{}, {}] Hz",
                calibration.min_frequency_hz, calibration.max_frequency_hz
            ));
        }
        if calibration.scan_setpoints_per_period < 2 {
            return Err("calibration.scan_setpoints_per_period must be at least 2".to_string());
        }

        if self.descanner.physical_flyback_time < 0.0 {
            return Err(format!(
                "Invalid descanner.physical_flyback_time {}. Must not be negative",
                self.descanner.physical_flyback_time
            ));
        }

        Ok(())
    }

    /// Settings consumed by the ASM driver.
    pub fn driver_config(&self) -> AsmDriverConfig {
        AsmDriverConfig {
            asm: self.asm.clone(),
            external_storage: self.external_storage.clone(),
            acquisition: self.acquisition.clone(),
            descanner: self.descanner.clone(),
            calibration: self.calibration.clone(),
            attributes: self.attributes.clone(),
        }
    }

    /// Render as TOML, e.g. to start a new configuration file.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let config = AppConfig::new("http://localhost:8080/v2");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::new("http://localhost:8080/v2");
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        config.application.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.application.log_format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_storage_and_timeouts() {
        let mut config = AppConfig::new("http://localhost:8080/v2");
        config.external_storage.username = "user name".to_string();
        assert!(config.validate().unwrap_err().contains("external_storage"));

        let mut config = AppConfig::new("http://localhost:8080/v2");
        config.acquisition.terminate_timeout_secs = 0;
        assert!(config
            .validate()
            .unwrap_err()
            .contains("terminate_timeout_secs"));

        let mut config = AppConfig::new(" ");
        assert!(config.validate().is_err());
        config.asm.host = "http://asm/v2".to_string();
        config.calibration.min_frequency_hz = 6000.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_driver_config_carries_sections() {
        let mut config = AppConfig::new("http://asm/v2");
        config.acquisition.image_ready_delay_ms = 0;
        config.attributes.insert(
            "mppc".to_string(),
            BTreeMap::from([("acqDelay".to_string(), serde_json::json!(1e-5))]),
        );
        let driver = config.driver_config();
        assert_eq!(driver.asm.host, "http://asm/v2");
        assert_eq!(driver.acquisition.image_ready_delay_ms, 0);
        assert_eq!(driver.attributes["mppc"]["acqDelay"], serde_json::json!(1e-5));
    }
}
