//! Rendering supervisor events for the terminal

use crate::core::supervisor::SupervisorEvent;
use clap::ValueEnum;

/// CLI output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON lines for scripting
    Json,
    /// CSV
    Csv,
}

/// CSV header matching [`format_event`] rows
pub const CSV_HEADER: &str = "received_at,port,equipment_id,measurement,value,sentence";

/// Render one event; `None` when the format has no row for it.
///
/// CSV carries measurements only.
pub fn format_event(event: &SupervisorEvent, format: OutputFormat) -> Option<String> {
    match format {
        OutputFormat::Text => Some(text_format(event)),
        OutputFormat::Json => Some(json_format(event)),
        OutputFormat::Csv => csv_format(event),
    }
}

fn text_format(event: &SupervisorEvent) -> String {
    match event {
        SupervisorEvent::Measurement(m) => {
            let value = match (&m.value, &m.error) {
                (Some(value), _) => value.to_string(),
                (None, Some(err)) => format!("<{err}>"),
                (None, None) => "<none>".to_string(),
            };
            format!(
                "[{}] {} {}: {} ({:?})",
                m.received_at.format("%H:%M:%S%.3f"),
                m.port,
                m.measurement,
                value,
                m.raw_sentence
            )
        }
        SupervisorEvent::Health { port, health } => {
            format!("{port}: link {health} ({})", health.color())
        }
        SupervisorEvent::Started {
            port,
            connection_info,
        } => format!("{port}: opened {connection_info}"),
        SupervisorEvent::Stopped { port, fault: None } => format!("{port}: stopped"),
        SupervisorEvent::Stopped {
            fault: Some(fault), ..
        } => fault.diagnostic_line(),
        SupervisorEvent::Diagnostic(entry) => entry.to_text(false),
    }
}

fn json_format(event: &SupervisorEvent) -> String {
    let value = match event {
        SupervisorEvent::Measurement(m) => serde_json::json!({
            "event": "measurement",
            "data": m,
        }),
        SupervisorEvent::Health { port, health } => serde_json::json!({
            "event": "health",
            "port": port,
            "health": health,
        }),
        SupervisorEvent::Started {
            port,
            connection_info,
        } => serde_json::json!({
            "event": "started",
            "port": port,
            "connection": connection_info,
        }),
        SupervisorEvent::Stopped { port, fault } => serde_json::json!({
            "event": "stopped",
            "port": port,
            "fault": fault,
        }),
        SupervisorEvent::Diagnostic(entry) => serde_json::json!({
            "event": "diagnostic",
            "data": entry,
        }),
    };
    value.to_string()
}

fn csv_format(event: &SupervisorEvent) -> Option<String> {
    let SupervisorEvent::Measurement(m) = event else {
        return None;
    };
    let value = m.value.as_ref().map(|v| v.to_string()).unwrap_or_default();
    Some(format!(
        "{},{},{},{},{},\"{}\"",
        m.received_at.to_rfc3339(),
        m.port,
        m.equipment_id,
        m.measurement,
        value,
        m.raw_sentence.replace('"', "\"\"")
    ))
}
