//! Parsing rules and measurement kinds
//!
//! A parsing rule describes how one instrument's sentences are framed and
//! where the value of interest sits inside each sentence. Rules are data, not
//! code: they are loaded from configuration once per session start.

use super::extract::TextEncoding;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unit of measurement reported by a device or expected by a measurement kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    /// Millimeters
    #[serde(rename = "mm", alias = "millimeters")]
    Millimeters,
    /// Centimeters
    #[serde(rename = "cm", alias = "centimeters")]
    Centimeters,
    /// Grams
    #[serde(rename = "g", alias = "grams")]
    Grams,
    /// Kilograms
    #[serde(rename = "kg", alias = "kilograms")]
    Kilograms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    Length,
    Mass,
}

impl Unit {
    /// Short symbol (`mm`, `cm`, `g`, `kg`)
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Millimeters => "mm",
            Self::Centimeters => "cm",
            Self::Grams => "g",
            Self::Kilograms => "kg",
        }
    }

    fn dimension(self) -> Dimension {
        match self {
            Self::Millimeters | Self::Centimeters => Dimension::Length,
            Self::Grams | Self::Kilograms => Dimension::Mass,
        }
    }

    /// Size of one unit expressed in the smallest unit of its dimension
    fn scale(self) -> f64 {
        match self {
            Self::Millimeters | Self::Grams => 1.0,
            Self::Centimeters => 10.0,
            Self::Kilograms => 1000.0,
        }
    }

    /// Conversion factor from `self` to `target`, `None` across dimensions
    pub fn factor_to(self, target: Unit) -> Option<f64> {
        if self.dimension() != target.dimension() {
            return None;
        }
        Some(self.scale() / target.scale())
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl std::str::FromStr for Unit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mm" | "millimeters" => Ok(Self::Millimeters),
            "cm" | "centimeters" => Ok(Self::Centimeters),
            "g" | "grams" => Ok(Self::Grams),
            "kg" | "kilograms" => Ok(Self::Kilograms),
            other => Err(format!("unknown unit: {other}")),
        }
    }
}

/// What a port measures, e.g. `Length` in centimeters or `Barcode`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeasurementKind {
    /// Display name of the measurement
    pub name: String,
    /// Unit consumers expect values in, if the measurement is dimensional
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
}

impl MeasurementKind {
    /// A measurement without a unit (barcodes, tag numbers)
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            unit: None,
        }
    }

    /// A measurement expressed in `unit`
    pub fn with_unit(name: &str, unit: Unit) -> Self {
        Self {
            name: name.to_string(),
            unit: Some(unit),
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            Some(unit) => write!(f, "{} ({})", self.name, unit),
            None => f.write_str(&self.name),
        }
    }
}

/// Where the value sits inside a sentence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RuleMode {
    /// Inclusive character columns
    Fixed {
        /// First character of the field
        start_offset: usize,
        /// Last character of the field (inclusive)
        end_offset: usize,
    },
    /// Field number after splitting on a delimiter
    Delimited {
        /// Field separator
        delimiter: String,
        /// Zero-based field number
        field_index: usize,
    },
}

/// What to do when a sentence does not contain the configured field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionPolicy {
    /// Emit the sentence with no value
    #[default]
    Emit,
    /// Treat the sentence as malformed and stop the session
    Fault,
}

/// Framing and extraction rule for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsingRule {
    /// Sentence terminator; empty disables framing
    #[serde(with = "escaped_bytes", default = "default_terminator")]
    pub line_terminator: Vec<u8>,
    /// Field location
    #[serde(flatten)]
    pub mode: RuleMode,
    /// Unit the device reports in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<Unit>,
    /// Text encoding of the device stream
    #[serde(default)]
    pub encoding: TextEncoding,
    /// Location failure handling
    #[serde(default)]
    pub on_extraction_error: ExtractionPolicy,
}

fn default_terminator() -> Vec<u8> {
    b"\r\n".to_vec()
}

impl ParsingRule {
    /// Fixed-column rule terminated by CRLF
    pub fn fixed(start_offset: usize, end_offset: usize) -> Self {
        Self {
            line_terminator: default_terminator(),
            mode: RuleMode::Fixed {
                start_offset,
                end_offset,
            },
            unit_of_measurement: None,
            encoding: TextEncoding::default(),
            on_extraction_error: ExtractionPolicy::default(),
        }
    }

    /// Delimited rule terminated by CRLF
    pub fn delimited(delimiter: &str, field_index: usize) -> Self {
        Self {
            line_terminator: default_terminator(),
            mode: RuleMode::Delimited {
                delimiter: delimiter.to_string(),
                field_index,
            },
            unit_of_measurement: None,
            encoding: TextEncoding::default(),
            on_extraction_error: ExtractionPolicy::default(),
        }
    }

    /// Set the terminator
    #[must_use]
    pub fn terminator(mut self, terminator: &[u8]) -> Self {
        self.line_terminator = terminator.to_vec();
        self
    }

    /// Set the device unit
    #[must_use]
    pub fn unit(mut self, unit: Unit) -> Self {
        self.unit_of_measurement = Some(unit);
        self
    }

    /// Set the stream encoding
    #[must_use]
    pub fn encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the extraction failure policy
    #[must_use]
    pub fn on_extraction_error(mut self, policy: ExtractionPolicy) -> Self {
        self.on_extraction_error = policy;
        self
    }
}

/// Expand `\r`, `\n`, `\t`, `\0`, `\\` and `\xNN` escapes.
///
/// Unknown escapes are kept verbatim. Real control characters pass through,
/// so TOML basic strings and literal strings both work.
pub fn unescape(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 >= bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes[i + 1] {
            b'r' => out.push(b'\r'),
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'0' => out.push(0),
            b'\\' => out.push(b'\\'),
            b'x' if i + 3 < bytes.len() => {
                match hex::decode(&bytes[i + 2..i + 4]) {
                    Ok(decoded) => out.extend_from_slice(&decoded),
                    Err(_) => out.extend_from_slice(&bytes[i..i + 4]),
                }
                i += 4;
                continue;
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
        i += 2;
    }

    out
}

/// Inverse of [`unescape`] for display and serialization
pub fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        match b {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7E => out.push(b as char),
            _ => {
                out.push_str("\\x");
                out.push_str(&hex::encode([b]));
            }
        }
    }
    out
}

mod escaped_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::escape(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(super::unescape(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_factors() {
        assert_eq!(Unit::Millimeters.factor_to(Unit::Centimeters), Some(0.1));
        assert_eq!(Unit::Kilograms.factor_to(Unit::Grams), Some(1000.0));
        assert_eq!(Unit::Grams.factor_to(Unit::Centimeters), None);
        assert_eq!("MM".parse::<Unit>(), Ok(Unit::Millimeters));
    }

    #[test]
    fn test_escapes() {
        assert_eq!(unescape("\\r\\n"), b"\r\n");
        assert_eq!(unescape("\r\n"), b"\r\n");
        assert_eq!(unescape("\\x03"), vec![0x03]);
        assert_eq!(unescape("\\q"), b"\\q");
        assert_eq!(escape(b"\r\n"), "\\r\\n");
        assert_eq!(escape(&[0x02]), "\\x02");
    }

    #[test]
    fn test_measurement_display() {
        let kind = MeasurementKind::with_unit("Length", Unit::Centimeters);
        assert_eq!(kind.to_string(), "Length (cm)");
        assert_eq!(MeasurementKind::new("Barcode").to_string(), "Barcode");
    }

    #[test]
    fn test_rule_builders() {
        let rule = ParsingRule::fixed(0, 4)
            .terminator(b"\n")
            .unit(Unit::Millimeters)
            .on_extraction_error(ExtractionPolicy::Fault);
        assert_eq!(rule.line_terminator, b"\n");
        assert_eq!(rule.unit_of_measurement, Some(Unit::Millimeters));
        assert_eq!(rule.on_extraction_error, ExtractionPolicy::Fault);
        assert!(matches!(rule.mode, RuleMode::Fixed { start_offset: 0, end_offset: 4 }));
    }
}
