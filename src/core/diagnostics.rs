//! Operator diagnostics
//!
//! Bounded, append-only record of recent raw sentences, health transitions and
//! faults, kept for troubleshooting instruments in the field.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default number of entries retained
pub const DEFAULT_CAPACITY: usize = 500;

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Plain text
    #[default]
    Text,
    /// CSV with timestamp
    Csv,
    /// JSON lines
    JsonLines,
}

impl LogFormat {
    /// Get file extension for format
    pub fn extension(&self) -> &'static str {
        match self {
            LogFormat::Text => "txt",
            LogFormat::Csv => "csv",
            LogFormat::JsonLines => "jsonl",
        }
    }
}

/// Kind of diagnostic entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Raw sentence received
    Sentence,
    /// Health transition
    Health,
    /// Session lifecycle
    Info,
    /// Recoverable data loss (overflow, drain)
    Warning,
    /// Session-fatal fault
    Fault,
}

impl EntryKind {
    fn tag(self) -> &'static str {
        match self {
            Self::Sentence => "RX",
            Self::Health => "HL",
            Self::Info => "##",
            Self::Warning => "!!",
            Self::Fault => "XX",
        }
    }
}

/// A single diagnostic entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    /// When the entry was recorded
    pub timestamp: DateTime<Local>,
    /// Port the entry concerns
    pub port: String,
    /// Entry kind
    pub kind: EntryKind,
    /// Human-readable line
    pub message: String,
}

impl DiagnosticEntry {
    /// Create an entry stamped now
    pub fn new(port: &str, kind: EntryKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            port: port.to_string(),
            kind,
            message: message.into(),
        }
    }

    /// Format as text
    pub fn to_text(&self, show_timestamp: bool) -> String {
        if show_timestamp {
            format!(
                "[{}] {} {}: {}",
                self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                self.kind.tag(),
                self.port,
                self.message
            )
        } else {
            format!("{} {}: {}", self.kind.tag(), self.port, self.message)
        }
    }

    /// Format as CSV
    pub fn to_csv(&self) -> String {
        format!(
            "\"{}\",\"{}\",\"{}\",\"{}\"",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.kind.tag(),
            self.port.replace('"', "\"\""),
            self.message.replace('"', "\"\"")
        )
    }

    /// Format as JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Receives diagnostics for operator display; no acknowledgment
pub trait DiagnosticSink: Send {
    /// Record one entry
    fn record(&mut self, entry: &DiagnosticEntry);
}

impl<F> DiagnosticSink for F
where
    F: FnMut(&DiagnosticEntry) + Send,
{
    fn record(&mut self, entry: &DiagnosticEntry) {
        self(entry);
    }
}

/// Ring buffer of recent diagnostics
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    entries: VecDeque<DiagnosticEntry>,
    capacity: usize,
    total: u64,
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DiagnosticLog {
    /// Create a log holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            total: 0,
        }
    }

    /// Append, evicting the oldest entry when full
    pub fn push(&mut self, entry: DiagnosticEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.total += 1;
    }

    /// Retained entries, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &DiagnosticEntry> {
        self.entries.iter()
    }

    /// The `n` most recent entries, oldest first
    pub fn recent(&self, n: usize) -> Vec<DiagnosticEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Retained entry count
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been retained
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ever recorded, including evicted ones
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Maximum retained entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Export retained entries
    pub fn export(&self, format: LogFormat) -> String {
        let mut result = String::new();

        if format == LogFormat::Csv {
            result.push_str("Timestamp,Kind,Port,Message\n");
        }

        for entry in &self.entries {
            let line = match format {
                LogFormat::Text => entry.to_text(true),
                LogFormat::Csv => entry.to_csv(),
                LogFormat::JsonLines => entry.to_json(),
            };
            result.push_str(&line);
            result.push('\n');
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_text() {
        let entry = DiagnosticEntry::new("COM3", EntryKind::Sentence, "12.34");
        assert_eq!(entry.to_text(false), "RX COM3: 12.34");
        assert!(entry.to_text(true).starts_with('['));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut log = DiagnosticLog::new(3);
        for i in 0..5 {
            log.push(DiagnosticEntry::new("COM1", EntryKind::Info, i.to_string()));
        }
        let kept: Vec<_> = log.entries().map(|e| e.message.clone()).collect();
        assert_eq!(kept, vec!["2", "3", "4"]);
        assert_eq!(log.total(), 5);
    }

    #[test]
    fn test_recent() {
        let mut log = DiagnosticLog::new(10);
        for i in 0..4 {
            log.push(DiagnosticEntry::new("COM1", EntryKind::Info, i.to_string()));
        }
        let recent: Vec<_> = log.recent(2).into_iter().map(|e| e.message).collect();
        assert_eq!(recent, vec!["2", "3"]);
    }

    #[test]
    fn test_csv_export_escapes_quotes() {
        let mut log = DiagnosticLog::new(2);
        log.push(DiagnosticEntry::new("COM1", EntryKind::Sentence, "say \"hi\""));
        let csv = log.export(LogFormat::Csv);
        assert!(csv.starts_with("Timestamp,Kind,Port,Message\n"));
        assert!(csv.contains("\"say \"\"hi\"\"\""));
    }

    #[test]
    fn test_closure_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = |entry: &DiagnosticEntry| seen.push(entry.message.clone());
            sink.record(&DiagnosticEntry::new("COM2", EntryKind::Fault, "gone"));
        }
        assert_eq!(seen, vec!["gone"]);
    }
}
