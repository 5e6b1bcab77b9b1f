//! Core module containing the ingestion pipeline
//!
//! This module provides:
//! - Parsing rules and port configuration records
//! - Sentence framing over raw serial bytes
//! - Field extraction with unit normalization
//! - Link health tracking (Live / Degraded / Lost)
//! - Link layer over the serial driver
//! - Port sessions, one reader thread per instrument
//! - The supervisor owning every session and dispatching events
//! - Bounded operator diagnostics

pub mod diagnostics;
pub mod extract;
pub mod framing;
pub mod health;
pub mod link;
pub mod port;
pub mod rule;
pub mod session;
pub mod supervisor;

pub use diagnostics::{DiagnosticEntry, DiagnosticLog, DiagnosticSink, EntryKind, LogFormat};
pub use extract::{ExtractedValue, ExtractionError, FieldExtractor, TextEncoding};
pub use framing::{Frame, FramingBuffer};
pub use health::{LinkHealth, LinkHealthMonitor};
pub use link::{ConnectionFault, FaultKind, LinkOpener, SerialLink, SerialPortOpener};
pub use port::{PortConfig, SerialFlowControl, SerialParity};
pub use rule::{ExtractionPolicy, MeasurementKind, ParsingRule, RuleMode, Unit};
pub use session::{MeasurementEvent, PortSession, SessionEvent, SessionMessage, SessionSettings};
pub use supervisor::{
    Context, ContextProvider, EventConsumer, SessionInfo, Supervisor, SupervisorError,
    SupervisorEvent, SupervisorSettings,
};
