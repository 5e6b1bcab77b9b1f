//! Field extraction
//!
//! Turns a complete sentence into the value of interest:
//! - Decoding sentence bytes under the device's text encoding
//! - Removing control characters left over from the wire
//! - Locating the field (fixed columns or delimited)
//! - Normalizing units (e.g. caliper millimeters to centimeters)

use super::rule::{ParsingRule, RuleMode, Unit};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Text encoding of a device stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TextEncoding {
    /// ISO-8859-1; every byte is a character, decoding never fails
    #[default]
    #[serde(rename = "iso-8859-1", alias = "latin1")]
    Latin1,
    /// 7-bit ASCII
    #[serde(rename = "ascii")]
    Ascii,
    /// UTF-8
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latin1 => write!(f, "ISO-8859-1"),
            Self::Ascii => write!(f, "ASCII"),
            Self::Utf8 => write!(f, "UTF-8"),
        }
    }
}

/// Sentence bytes that cannot be read under the configured encoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {encoding} byte 0x{byte:02X} at offset {offset}")]
pub struct DecodingError {
    /// Encoding in use
    pub encoding: TextEncoding,
    /// Offending byte
    pub byte: u8,
    /// Position of the byte in the sentence
    pub offset: usize,
}

impl TextEncoding {
    /// Decode sentence bytes into text
    pub fn decode(&self, bytes: &[u8]) -> Result<String, DecodingError> {
        match self {
            Self::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            Self::Ascii => match bytes.iter().position(|b| !b.is_ascii()) {
                Some(offset) => Err(DecodingError {
                    encoding: *self,
                    byte: bytes[offset],
                    offset,
                }),
                None => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            },
            Self::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_string)
                .map_err(|e| DecodingError {
                    encoding: *self,
                    byte: bytes[e.valid_up_to()],
                    offset: e.valid_up_to(),
                }),
        }
    }
}

/// Remove C0 and C1 control characters and DEL
pub fn sanitize(text: &str) -> String {
    text.chars().filter(|c| !c.is_control()).collect()
}

/// Per-sentence extraction failure; never fatal on its own
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionError {
    /// Fixed columns fall outside the sentence
    #[error("columns {start}..={end} out of range for a {len}-character sentence")]
    OutOfRange {
        /// Configured start column
        start: usize,
        /// Configured end column
        end: usize,
        /// Sentence length in characters
        len: usize,
    },

    /// Delimited field index not present
    #[error("field {index} missing, sentence has {fields} fields")]
    FieldMissing {
        /// Configured field index
        index: usize,
        /// Number of fields found
        fields: usize,
    },

    /// Unit normalization needed a number
    #[error("not a number: {payload:?}")]
    NotNumeric {
        /// Extracted text
        payload: String,
    },
}

/// Value extracted from a sentence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedValue {
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    number: Option<f64>,
}

impl ExtractedValue {
    /// Wrap extracted text, parsing it as a number when possible
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let number = text.parse::<f64>().ok().filter(|n| n.is_finite());
        Self { text, number }
    }

    /// Text as extracted (after normalization)
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Numeric value, if the text is a number
    pub fn as_f64(&self) -> Option<f64> {
        self.number
    }
}

impl fmt::Display for ExtractedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Extract the value of interest from a sanitized sentence.
///
/// `target` is the unit consumers expect; when the rule's device unit differs
/// but measures the same dimension, the value is scaled and formatted to two
/// decimals.
pub fn extract(
    sentence: &str,
    rule: &ParsingRule,
    target: Option<Unit>,
) -> Result<ExtractedValue, ExtractionError> {
    let field = locate(sentence, &rule.mode)?;

    let factor = match (rule.unit_of_measurement, target) {
        (Some(from), Some(to)) if from != to => from.factor_to(to),
        _ => None,
    };

    match factor {
        Some(factor) => normalize(&field, factor),
        None => Ok(ExtractedValue::new(field)),
    }
}

fn locate(sentence: &str, mode: &RuleMode) -> Result<String, ExtractionError> {
    match mode {
        RuleMode::Fixed {
            start_offset,
            end_offset,
        } => {
            let len = sentence.chars().count();
            if *start_offset >= len || end_offset < start_offset {
                return Err(ExtractionError::OutOfRange {
                    start: *start_offset,
                    end: *end_offset,
                    len,
                });
            }
            // An end column past the sentence is clamped to its last character.
            let field: String = sentence
                .chars()
                .skip(*start_offset)
                .take(end_offset - start_offset + 1)
                .collect();
            Ok(field.trim().to_string())
        }
        RuleMode::Delimited {
            delimiter,
            field_index,
        } => {
            if delimiter.is_empty() {
                return Err(ExtractionError::FieldMissing {
                    index: *field_index,
                    fields: 0,
                });
            }
            sentence
                .split(delimiter.as_str())
                .nth(*field_index)
                .map(|f| f.trim().to_string())
                .ok_or_else(|| ExtractionError::FieldMissing {
                    index: *field_index,
                    fields: sentence.split(delimiter.as_str()).count(),
                })
        }
    }
}

fn normalize(field: &str, factor: f64) -> Result<ExtractedValue, ExtractionError> {
    let value: f64 = field
        .trim()
        .parse()
        .map_err(|_| ExtractionError::NotNumeric {
            payload: field.to_string(),
        })?;
    Ok(ExtractedValue::new(format!("{:.2}", value * factor)))
}

/// Extraction bound to one port's rule and target unit
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    rule: ParsingRule,
    target: Option<Unit>,
}

impl FieldExtractor {
    /// Create an extractor
    pub fn new(rule: ParsingRule, target: Option<Unit>) -> Self {
        Self { rule, target }
    }

    /// The rule in use
    pub fn rule(&self) -> &ParsingRule {
        &self.rule
    }

    /// Decode and sanitize raw sentence bytes
    pub fn decode(&self, bytes: &[u8]) -> Result<String, DecodingError> {
        self.rule.encoding.decode(bytes).map(|text| sanitize(&text))
    }

    /// Extract from a decoded sentence
    pub fn extract(&self, sentence: &str) -> Result<ExtractedValue, ExtractionError> {
        extract(sentence, &self.rule, self.target)
    }
}
