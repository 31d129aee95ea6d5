//! Application configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. built-in defaults
//! 2. the JSON document (`config.json` in the user's config directory by default)
//! 3. environment variables prefixed with `OWON_BENCH_`, nested with `__`
//!    (e.g. `OWON_BENCH_SERIAL_MULTIMETER__PORT=/dev/ttyUSB1`)
//!
//! Keys this version does not know about are kept in `extra` maps at every level and
//! written back by [`AppConfig::save`].
//!
//! # Example
//! ```no_run
//! use owon_bench::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load_default()?;
//! config.validate()?;
//! println!("Multimeter on {}", config.serial_multimeter.port);
//! # Ok(())
//! # }
//! ```

use crate::error::{BenchError, BenchResult};
use crate::transport::{Parity, SerialSettings};
use figment::{
    providers::{Env, Format, Json, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "OWON_BENCH_";

const THEMES: [&str; 2] = ["light", "dark"];
const LOG_LEVELS: [&str; 4] = ["DEBUG", "INFO", "WARNING", "ERROR"];
const SCOPE_MODES: [&str; 2] = ["serial", "usb"];

/// Top-level configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub serial_multimeter: MultimeterPortConfig,
    #[serde(default = "PortConfig::generator")]
    pub serial_generator: PortConfig,
    #[serde(default = "PortConfig::power_supply")]
    pub serial_power_supply: PortConfig,
    #[serde(default)]
    pub oscilloscope: OscilloscopeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Multimeter serial link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultimeterPortConfig {
    pub port: String,
    pub baudrate: u32,
    /// `N`, `E` or `O`
    pub parity: String,
    pub timeout_s: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for MultimeterPortConfig {
    fn default() -> Self {
        Self {
            port: default_port(0),
            baudrate: 115_200,
            parity: "N".to_string(),
            timeout_s: 1.0,
            extra: Map::new(),
        }
    }
}

/// Serial link of a device without framing options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConfig {
    pub port: String,
    pub baudrate: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PortConfig {
    fn generator() -> Self {
        Self {
            port: default_port(1),
            baudrate: 115_200,
            extra: Map::new(),
        }
    }

    fn power_supply() -> Self {
        Self {
            port: default_port(2),
            baudrate: 115_200,
            extra: Map::new(),
        }
    }
}

/// Oscilloscope link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OscilloscopeConfig {
    /// `serial` or `usb`
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usb_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for OscilloscopeConfig {
    fn default() -> Self {
        Self {
            mode: "serial".to_string(),
            port: None,
            usb_id: None,
            extra: Map::new(),
        }
    }
}

/// Data logger defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub output_dir: PathBuf,
    pub default_interval_s: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            output_dir: dirs::document_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("owon-bench"),
            default_interval_s: 1.0,
            extra: Map::new(),
        }
    }
}

/// Front-end preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiConfig {
    /// `light` or `dark`
    pub theme: String,
    /// `DEBUG`, `INFO`, `WARNING` or `ERROR`
    pub log_level: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            theme: "light".to_string(),
            log_level: "INFO".to_string(),
            extra: Map::new(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            serial_multimeter: MultimeterPortConfig::default(),
            serial_generator: PortConfig::generator(),
            serial_power_supply: PortConfig::power_supply(),
            oscilloscope: OscilloscopeConfig::default(),
            logging: LoggingConfig::default(),
            ui: UiConfig::default(),
            extra: Map::new(),
        }
    }
}

#[cfg(windows)]
fn default_port(index: usize) -> String {
    format!("COM{}", index + 3)
}

#[cfg(not(windows))]
fn default_port(index: usize) -> String {
    format!("/dev/ttyUSB{index}")
}

impl AppConfig {
    /// `<config dir>/owon-bench/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("owon-bench").join("config.json"))
    }

    /// Load from the default path. A missing file yields the defaults.
    pub fn load_default() -> BenchResult<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Self::from_sources(None, ENV_PREFIX),
        }
    }

    /// Load defaults, then `path`, then `OWON_BENCH_*` variables.
    pub fn load(path: &Path) -> BenchResult<Self> {
        Self::from_sources(Some(path), ENV_PREFIX)
    }

    /// Load with an explicit environment prefix.
    pub fn from_sources(path: Option<&Path>, env_prefix: &str) -> BenchResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Json::file(path));
        }
        let config = figment
            .merge(Env::prefixed(env_prefix).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> BenchResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> BenchResult<()> {
        if !THEMES.contains(&self.ui.theme.as_str()) {
            return Err(BenchError::InvalidConfig(format!(
                "Invalid theme '{}'. Must be one of: {}",
                self.ui.theme,
                THEMES.join(", ")
            )));
        }

        if !LOG_LEVELS.contains(&self.ui.log_level.as_str()) {
            return Err(BenchError::InvalidConfig(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.ui.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        if !SCOPE_MODES.contains(&self.oscilloscope.mode.as_str()) {
            return Err(BenchError::InvalidConfig(format!(
                "Invalid oscilloscope mode '{}'. Must be one of: {}",
                self.oscilloscope.mode,
                SCOPE_MODES.join(", ")
            )));
        }

        if !(self.logging.default_interval_s.is_finite() && self.logging.default_interval_s > 0.0)
        {
            return Err(BenchError::InvalidConfig(format!(
                "logging.default_interval_s must be > 0, got {}",
                self.logging.default_interval_s
            )));
        }

        for (name, baud) in [
            ("serial_multimeter", self.serial_multimeter.baudrate),
            ("serial_generator", self.serial_generator.baudrate),
            ("serial_power_supply", self.serial_power_supply.baudrate),
        ] {
            if baud == 0 {
                return Err(BenchError::InvalidConfig(format!(
                    "{name}.baudrate must be non-zero"
                )));
            }
        }

        if !(self.serial_multimeter.timeout_s.is_finite() && self.serial_multimeter.timeout_s > 0.0)
        {
            return Err(BenchError::InvalidConfig(format!(
                "serial_multimeter.timeout_s must be > 0, got {}",
                self.serial_multimeter.timeout_s
            )));
        }

        self.serial_multimeter.parity.parse::<Parity>()?;
        Ok(())
    }

    /// Endpoint settings for the multimeter link.
    pub fn multimeter_settings(&self) -> BenchResult<SerialSettings> {
        let link = &self.serial_multimeter;
        Ok(SerialSettings::new(&link.port, link.baudrate)
            .with_parity(link.parity.parse()?)
            .with_timeout(Duration::from_secs_f64(link.timeout_s)))
    }

    /// Endpoint settings for the generator link.
    pub fn generator_settings(&self) -> SerialSettings {
        SerialSettings::new(&self.serial_generator.port, self.serial_generator.baudrate)
    }

    /// Endpoint settings for the power supply link.
    pub fn power_supply_settings(&self) -> SerialSettings {
        SerialSettings::new(
            &self.serial_power_supply.port,
            self.serial_power_supply.baudrate,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial_multimeter.baudrate, 115_200);
        assert_eq!(config.ui.log_level, "INFO");
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "serial_multimeter": {"port": "COM7", "baudrate": 9600, "parity": "E",
                                      "timeout_s": 0.5, "echo": true},
                "ui": {"theme": "dark", "log_level": "DEBUG", "font_size": 14},
                "window": {"width": 1200}
            }"#,
        )
        .unwrap();

        let config = AppConfig::from_sources(Some(&path), "OWON_BENCH_TEST_NONE_").unwrap();
        assert_eq!(config.serial_multimeter.port, "COM7");
        assert_eq!(config.serial_multimeter.extra["echo"], Value::Bool(true));
        assert_eq!(config.ui.extra["font_size"], Value::from(14));
        assert!(config.extra.contains_key("window"));
        // Sections missing from the file fall back to defaults.
        assert_eq!(config.serial_generator.baudrate, 115_200);

        let copy = dir.path().join("nested").join("copy.json");
        config.save(&copy).unwrap();
        let reloaded = AppConfig::from_sources(Some(&copy), "OWON_BENCH_TEST_NONE_").unwrap();
        assert_eq!(reloaded, config);

        let settings = config.multimeter_settings().unwrap();
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.timeout, Duration::from_millis(500));
    }

    #[test]
    fn environment_overrides_file() {
        std::env::set_var("OWON_BENCH_TEST_ENV_UI__THEME", "dark");
        std::env::set_var("OWON_BENCH_TEST_ENV_SERIAL_GENERATOR__BAUDRATE", "9600");

        let config = AppConfig::from_sources(None, "OWON_BENCH_TEST_ENV_").unwrap();
        assert_eq!(config.ui.theme, "dark");
        assert_eq!(config.serial_generator.baudrate, 9600);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.ui.log_level = "TRACE".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.oscilloscope.mode = "lan".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.default_interval_s = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.serial_generator.baudrate = 0;
        assert!(matches!(config.validate(), Err(BenchError::InvalidConfig(_))));

        let mut config = AppConfig::default();
        config.serial_multimeter.parity = "X".into();
        assert!(config.validate().is_err());
    }
}
