//! Port configuration
//!
//! One record per deployed instrument: line parameters, what it measures, and
//! how its sentences are parsed. Records come from the configuration source
//! and are only read here.

use super::rule::{MeasurementKind, ParsingRule, RuleMode};
use serde::{Deserialize, Serialize};

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            other => Err(format!("unknown parity: {other}")),
        }
    }
}

impl std::str::FromStr for SerialFlowControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "hw" | "hardware" | "rtscts" => Ok(Self::Hardware),
            "sw" | "software" | "xonxoff" | "on" => Ok(Self::Software),
            other => Err(format!("unknown flow control: {other}")),
        }
    }
}

/// Configuration of one instrument port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0); also the session key
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Stop bits (1, 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Parity
    #[serde(default)]
    pub parity: SerialParity,
    /// Flow control
    #[serde(default)]
    pub flow_control: SerialFlowControl,
    /// Equipment identifier from the configuration source
    pub equipment_id: u32,
    /// Human-readable equipment name
    #[serde(default)]
    pub equipment_name: String,
    /// What this port measures
    pub measurement: MeasurementKind,
    /// Parsing rule; absent for write-only ports such as label printers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<ParsingRule>,
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl PortConfig {
    /// Create a reader port with 8N1 line settings
    pub fn new(port: &str, baud_rate: u32, equipment_id: u32, measurement: MeasurementKind) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
            equipment_id,
            equipment_name: String::new(),
            measurement,
            rule: None,
        }
    }

    /// Set the parsing rule
    #[must_use]
    pub fn rule(mut self, rule: ParsingRule) -> Self {
        self.rule = Some(rule);
        self
    }

    /// Set the equipment name
    #[must_use]
    pub fn equipment_name(mut self, name: &str) -> Self {
        self.equipment_name = name.to_string();
        self
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Ports without a rule are never read
    pub fn is_write_only(&self) -> bool {
        self.rule.is_none()
    }

    /// Line settings summary, e.g. `COM3 @ 9600 baud (8N1 No FC)`
    pub fn connection_info(&self) -> String {
        format!(
            "{} @ {} baud ({}{}{} {})",
            self.port,
            self.baud_rate,
            self.data_bits,
            match self.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.stop_bits,
            match self.flow_control {
                SerialFlowControl::None => "No FC",
                SerialFlowControl::Hardware => "HW FC",
                SerialFlowControl::Software => "SW FC",
            }
        )
    }

    /// Check values the serial driver and extractor cannot handle
    pub fn validate(&self) -> Result<(), String> {
        if self.port.trim().is_empty() {
            return Err("port name is empty".to_string());
        }
        if self.baud_rate == 0 {
            return Err(format!("{}: baud rate must be positive", self.port));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(format!("{}: data bits must be 5-8, got {}", self.port, self.data_bits));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(format!("{}: stop bits must be 1 or 2, got {}", self.port, self.stop_bits));
        }
        match self.rule.as_ref().map(|r| &r.mode) {
            Some(RuleMode::Fixed {
                start_offset,
                end_offset,
            }) if end_offset < start_offset => Err(format!(
                "{}: fixed rule ends ({end_offset}) before it starts ({start_offset})",
                self.port
            )),
            Some(RuleMode::Delimited { delimiter, .. }) if delimiter.is_empty() => {
                Err(format!("{}: delimited rule has an empty delimiter", self.port))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::Unit;

    fn caliper() -> PortConfig {
        PortConfig::new("COM7", 9600, 12, MeasurementKind::with_unit("Width", Unit::Centimeters))
            .rule(ParsingRule::fixed(0, 6).unit(Unit::Millimeters))
    }

    #[test]
    fn test_connection_info() {
        let config = caliper().parity(SerialParity::Even).flow_control(SerialFlowControl::Software);
        assert_eq!(config.connection_info(), "COM7 @ 9600 baud (8E1 SW FC)");
    }

    #[test]
    fn test_write_only() {
        assert!(!caliper().is_write_only());
        let printer = PortConfig::new("COM9", 9600, 40, MeasurementKind::new("Label"));
        assert!(printer.is_write_only());
    }

    #[test]
    fn test_validate() {
        assert!(caliper().validate().is_ok());
        assert!(caliper().data_bits(9).validate().is_err());
        assert!(caliper().rule(ParsingRule::fixed(5, 1)).validate().is_err());
        assert!(caliper().rule(ParsingRule::delimited("", 1)).validate().is_err());
    }

    #[test]
    fn test_parse_line_settings() {
        assert_eq!("E".parse::<SerialParity>(), Ok(SerialParity::Even));
        assert_eq!("xonxoff".parse::<SerialFlowControl>(), Ok(SerialFlowControl::Software));
        assert!("mark".parse::<SerialParity>().is_err());
    }
}
