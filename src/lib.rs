//! # Instrulink Core Library
//!
//! Serial instrument ingestion for field data collection stations:
//! - Electronic scales
//! - Digital calipers and fish-meter boards
//! - Barcode scanners
//!
//! ## Features
//!
//! - One reader thread per instrument port
//! - Sentence framing on configurable terminators
//! - Fixed-column and delimited field extraction with unit normalization
//! - Per-port link health (Live / Degraded / Lost)
//! - Context-routed event dispatch
//! - Bounded diagnostics for operators
//! - TOML configuration
//!
//! ## Example
//!
//! ```rust,no_run
//! use instrulink_core::{
//!     Context, MeasurementKind, ParsingRule, PortConfig, Supervisor, SupervisorEvent,
//!     SupervisorSettings, Unit,
//! };
//! use std::time::Duration;
//!
//! fn main() -> anyhow::Result<()> {
//!     let supervisor = Supervisor::serial(SupervisorSettings::default());
//!     let caliper = PortConfig::new("COM7", 9600, 12, MeasurementKind::with_unit("Length", Unit::Centimeters))
//!         .rule(ParsingRule::fixed(0, 6).unit(Unit::Millimeters));
//!     supervisor.add_session(caliper)?;
//!
//!     supervisor.subscribe(Context::new("sampling"), |event: &SupervisorEvent| {
//!         if let SupervisorEvent::Measurement(m) = event {
//!             println!("{}: {:?}", m.port, m.value);
//!         }
//!     });
//!     supervisor.start_session("COM7")?;
//!
//!     let screen = || Some(Context::new("sampling"));
//!     loop {
//!         supervisor.pump_timeout(&screen, Duration::from_millis(100));
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::{AppConfig, ConfigError, PortConfigSource};
pub use crate::core::diagnostics::{DiagnosticEntry, DiagnosticSink, LogFormat};
pub use crate::core::health::LinkHealth;
pub use crate::core::link::{available_ports, ConnectionFault, FaultKind};
pub use crate::core::port::PortConfig;
pub use crate::core::rule::{MeasurementKind, ParsingRule, Unit};
pub use crate::core::session::MeasurementEvent;
pub use crate::core::supervisor::{
    Context, ContextProvider, EventConsumer, SessionInfo, Supervisor, SupervisorError,
    SupervisorEvent, SupervisorSettings,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
