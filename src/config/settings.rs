//! Application settings and port bindings

use super::{ConfigError, PortConfigSource};
use crate::core::diagnostics::{LogFormat, DEFAULT_CAPACITY};
use crate::core::port::PortConfig;
use crate::core::session::SessionSettings;
use crate::core::supervisor::SupervisorSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Logging settings
    pub logging: LoggingConfig,
    /// Read loop settings shared by every port
    pub session: SessionConfig,
    /// Supervisor settings
    pub supervisor: SupervisorConfig,
    /// Configured instrument ports
    pub ports: Vec<PortConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            session: SessionConfig::default(),
            supervisor: SupervisorConfig::default(),
            ports: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Default config file location
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        super::config_dir()
            .map(|dir| dir.join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load config from the default location; a missing file yields defaults
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::default_path()?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::io(dir, e))?;
        }
        self.save_to(&path)
    }

    /// Load and validate config from a file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::io(path, e))
    }

    /// Reject unusable port records and duplicate port keys
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for port in &self.ports {
            port.validate().map_err(ConfigError::Invalid)?;
            if !seen.insert(port.port.as_str()) {
                return Err(ConfigError::Invalid(format!("{} is configured twice", port.port)));
            }
        }
        if self.session.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("read timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Port record by name
    pub fn port(&self, name: &str) -> Option<&PortConfig> {
        self.ports.iter().find(|p| p.port == name)
    }

    /// Supervisor settings described by this config
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            session: self.session.to_settings(),
            channel_capacity: self.supervisor.channel_capacity,
            diagnostic_capacity: self.supervisor.diagnostic_capacity,
        }
    }
}

impl PortConfigSource for AppConfig {
    fn port_configs(&self) -> Result<Vec<PortConfig>, ConfigError> {
        self.validate()?;
        Ok(self.ports.clone())
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON log lines
    pub json: bool,
    /// Also write a daily-rolling log file
    pub file: bool,
    /// Log file directory
    pub directory: Option<PathBuf>,
    /// Format used when exporting diagnostics
    pub diagnostics_format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: false,
            directory: super::log_dir(),
            diagnostics_format: LogFormat::Text,
        }
    }
}

/// Read loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Blocking read timeout (milliseconds); one health tick
    pub read_timeout_ms: u64,
    /// Silence before a link is Degraded (seconds)
    pub degraded_after_secs: u64,
    /// Silence before a link is Lost (seconds)
    pub lost_after_secs: u64,
    /// OS input queue size that triggers a drain (bytes)
    pub drain_threshold: u32,
    /// Largest unterminated fragment kept (bytes)
    pub framing_high_water: usize,
    /// Read buffer size (bytes)
    pub read_chunk: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let defaults = SessionSettings::default();
        Self {
            read_timeout_ms: defaults.read_timeout.as_millis() as u64,
            degraded_after_secs: defaults.degraded_after.as_secs(),
            lost_after_secs: defaults.lost_after.as_secs(),
            drain_threshold: defaults.drain_threshold,
            framing_high_water: defaults.framing_high_water,
            read_chunk: defaults.read_chunk,
        }
    }
}

impl SessionConfig {
    /// Convert to session settings
    pub fn to_settings(&self) -> SessionSettings {
        SessionSettings {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            degraded_after: Duration::from_secs(self.degraded_after_secs),
            lost_after: Duration::from_secs(self.lost_after_secs),
            drain_threshold: self.drain_threshold,
            framing_high_water: self.framing_high_water,
            read_chunk: self.read_chunk,
        }
    }
}

/// Supervisor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Bound of the session event channel
    pub channel_capacity: usize,
    /// Diagnostic entries retained
    pub diagnostic_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            diagnostic_capacity: DEFAULT_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::{MeasurementKind, ParsingRule, Unit};

    fn sample() -> AppConfig {
        AppConfig {
            ports: vec![
                PortConfig::new("COM3", 9600, 1, MeasurementKind::with_unit("Weight", Unit::Kilograms))
                    .equipment_name("Marel M2000")
                    .rule(ParsingRule::delimited(",", 1).unit(Unit::Kilograms)),
                PortConfig::new("COM7", 9600, 12, MeasurementKind::with_unit("Length", Unit::Centimeters))
                    .rule(ParsingRule::fixed(0, 6).unit(Unit::Millimeters).terminator(b"\r")),
                PortConfig::new("COM9", 9600, 40, MeasurementKind::new("Label")),
            ],
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = sample();
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.port("COM7").unwrap().rule.as_ref().unwrap().line_terminator, b"\r");
        assert!(loaded.port("COM9").unwrap().is_write_only());
    }

    #[test]
    fn test_parse_handwritten() {
        let text = r#"
            [session]
            read_timeout_ms = 100

            [[ports]]
            port = "/dev/ttyUSB0"
            baud_rate = 4800
            parity = "even"
            equipment_id = 5

            [ports.measurement]
            name = "Barcode"

            [ports.rule]
            mode = "delimited"
            delimiter = ";"
            field_index = 2
            line_terminator = "\\r\\n"
        "#;
        let config: AppConfig = toml::from_str(text).unwrap();
        config.validate().unwrap();

        let port = &config.ports[0];
        assert_eq!(port.data_bits, 8);
        let rule = port.rule.as_ref().unwrap();
        assert_eq!(rule.line_terminator, b"\r\n");
        assert_eq!(config.session.to_settings().read_timeout, Duration::from_millis(100));
        assert_eq!(config.session.lost_after_secs, 60);
    }

    #[test]
    fn test_duplicate_ports_rejected() {
        let mut config = sample();
        config.ports.push(config.ports[0].clone());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(config.port_configs().is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
