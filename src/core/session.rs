//! Port sessions
//!
//! A session owns one instrument connection on a dedicated thread. The read
//! loop turns raw bytes into sentences, sentences into measurements, and read
//! timeouts into health transitions; everything it learns travels to the
//! supervisor as [`SessionMessage`]s over a bounded channel.

use super::diagnostics::EntryKind;
use super::extract::{ExtractedValue, ExtractionError, FieldExtractor};
use super::framing::{Frame, FramingBuffer, DEFAULT_HIGH_WATER};
use super::health::{LinkHealth, LinkHealthMonitor, DEFAULT_DEGRADED_AFTER, DEFAULT_LOST_AFTER};
use super::link::{ConnectionFault, FaultKind, LinkOpener, SerialLink};
use super::port::PortConfig;
use super::rule::ExtractionPolicy;
use chrono::{DateTime, Local};
use crossbeam_channel::{SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// How long a blocked send waits before re-checking for a stop request
const SEND_RETRY: Duration = Duration::from_millis(50);

/// Read loop tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Blocking read timeout; also the health tick and worst-case stop latency
    pub read_timeout: Duration,
    /// Silence before Degraded
    pub degraded_after: Duration,
    /// Silence before Lost
    pub lost_after: Duration,
    /// OS input queue size that triggers a drain
    pub drain_threshold: u32,
    /// Bound on unterminated framing data
    pub framing_high_water: usize,
    /// Read buffer size
    pub read_chunk: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            degraded_after: DEFAULT_DEGRADED_AFTER,
            lost_after: DEFAULT_LOST_AFTER,
            drain_threshold: 10_000,
            framing_high_water: DEFAULT_HIGH_WATER,
            read_chunk: 1024,
        }
    }
}

/// A sentence and the value extracted from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementEvent {
    /// Port the sentence arrived on
    pub port: String,
    /// Equipment bound to the port
    pub equipment_id: u32,
    /// Measurement kind name
    pub measurement: String,
    /// Sanitized sentence text
    pub raw_sentence: String,
    /// Extracted value, `None` when extraction failed
    pub value: Option<ExtractedValue>,
    /// Why extraction failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExtractionError>,
    /// Receipt time
    pub received_at: DateTime<Local>,
}

/// What a session reports
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connection opened, read loop running
    Started {
        /// Line settings summary
        connection_info: String,
    },
    /// Sentence received
    Measurement(MeasurementEvent),
    /// Health changed
    Health(LinkHealth),
    /// Non-fatal notice (overflow, drain)
    Diagnostic {
        /// Entry kind
        kind: EntryKind,
        /// Human-readable line
        message: String,
    },
    /// Read loop exited; the connection handle has been released
    Stopped {
        /// Fault that ended the loop, `None` for a requested stop
        fault: Option<ConnectionFault>,
    },
}

/// Session event tagged with its origin
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMessage {
    /// Port key at the time the session ran
    pub port: String,
    /// Run the message belongs to
    pub run_id: u64,
    /// The event
    pub event: SessionEvent,
}

/// Session creation errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Port has no parsing rule
    #[error("{0} is write-only and has no parsing rule")]
    WriteOnly(String),

    /// Reader thread could not be spawned
    #[error("failed to spawn reader thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Handle to a running read loop
pub struct PortSession {
    port: String,
    run_id: u64,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PortSession {
    /// Spawn the reader thread for `config`.
    ///
    /// The connection is opened on the new thread; an open failure arrives as
    /// a `Stopped` message carrying the fault.
    pub fn spawn(
        config: PortConfig,
        settings: SessionSettings,
        opener: Arc<dyn LinkOpener>,
        tx: Sender<SessionMessage>,
        run_id: u64,
    ) -> Result<Self, SessionError> {
        let rule = config
            .rule
            .clone()
            .ok_or_else(|| SessionError::WriteOnly(config.port.clone()))?;

        let port = config.port.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let reporter = Reporter {
            tx,
            port: port.clone(),
            run_id,
            stop: Arc::clone(&stop),
            closed: false,
        };

        let handle = thread::Builder::new()
            .name(format!("port-{port}"))
            .spawn(move || {
                let monitor = LinkHealthMonitor::for_tick(
                    settings.read_timeout,
                    settings.degraded_after,
                    settings.lost_after,
                )
                .with_initial(LinkHealth::Lost);
                let handler = SentenceHandler {
                    extractor: FieldExtractor::new(rule.clone(), config.measurement.unit),
                    policy: rule.on_extraction_error,
                    monitor,
                    reporter,
                    config,
                };
                let framing = FramingBuffer::new(&rule.line_terminator)
                    .with_high_water(settings.framing_high_water);
                run(handler, framing, settings, opener.as_ref());
            })?;

        Ok(Self {
            port,
            run_id,
            stop,
            handle: Some(handle),
        })
    }

    /// Port key
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Run id assigned at spawn
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Ask the loop to exit at its next poll boundary; does not wait
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// True once the reader thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop and wait for the thread to release the connection.
    ///
    /// Waits at most about one read timeout.
    pub fn stop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(port = %self.port, "Reader thread panicked");
            }
        }
    }
}

impl Drop for PortSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PortSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortSession")
            .field("port", &self.port)
            .field("run_id", &self.run_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn run(
    mut handler: SentenceHandler,
    framing: FramingBuffer,
    settings: SessionSettings,
    opener: &dyn LinkOpener,
) {
    let outcome = match opener.open(&handler.config, settings.read_timeout) {
        Ok(link) => {
            info!(
                port = %handler.config.port,
                equipment = handler.config.equipment_id,
                "Opened {}",
                handler.config.connection_info()
            );
            handler.reporter.send(SessionEvent::Started {
                connection_info: handler.config.connection_info(),
            });
            let mut read_loop = ReadLoop {
                link,
                framing,
                handler,
                buf: vec![0u8; settings.read_chunk.max(1)],
                drain_threshold: settings.drain_threshold,
            };
            let outcome = read_loop.run();
            // Release the handle before anyone hears the session stopped.
            let ReadLoop { link, handler: h, .. } = read_loop;
            drop(link);
            handler = h;
            outcome
        }
        Err(fault) => Err(fault),
    };

    if let Some(to) = handler.monitor.force_lost() {
        handler.reporter.send(SessionEvent::Health(to));
    }

    match outcome {
        Ok(()) => {
            info!(port = %handler.config.port, "Reader stopped");
            handler.reporter.send(SessionEvent::Stopped { fault: None });
        }
        Err(fault) => {
            error!(port = %fault.port, kind = %fault.kind, "{}", fault.detail);
            handler.reporter.send(SessionEvent::Stopped { fault: Some(fault) });
        }
    }
}

struct ReadLoop {
    link: Box<dyn SerialLink>,
    framing: FramingBuffer,
    handler: SentenceHandler,
    buf: Vec<u8>,
    drain_threshold: u32,
}

impl ReadLoop {
    fn run(&mut self) -> Result<(), ConnectionFault> {
        while !self.handler.reporter.should_exit() {
            self.drain_if_backlogged()?;

            match self.link.read(&mut self.buf) {
                Ok(0) => {
                    return Err(ConnectionFault::new(
                        FaultKind::LinkLost,
                        &self.handler.config.port,
                        "port closed",
                    ))
                }
                Ok(n) => {
                    for frame in self.framing.feed(&self.buf[..n]) {
                        self.handler.on_frame(frame)?;
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                    self.handler.on_silence();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ConnectionFault::from_io(&self.handler.config.port, &e)),
            }
        }
        Ok(())
    }

    /// Discard the OS input queue when a chatty device outruns the consumer
    fn drain_if_backlogged(&mut self) -> Result<(), ConnectionFault> {
        let port = &self.handler.config.port;
        let queued = self
            .link
            .bytes_to_read()
            .map_err(|e| ConnectionFault::from_io(port, &e))?;
        if queued <= self.drain_threshold {
            return Ok(());
        }

        self.link
            .clear_input()
            .map_err(|e| ConnectionFault::from_io(port, &e))?;
        let pending = self.framing.pending_len();
        self.framing.clear();
        warn!(port = %port, queued, pending, "Input queue backlogged, discarded");
        let message = format!("input queue held {queued} bytes; discarded with {pending} pending");
        self.handler.reporter.send(SessionEvent::Diagnostic {
            kind: EntryKind::Warning,
            message,
        });
        Ok(())
    }
}

struct SentenceHandler {
    config: PortConfig,
    extractor: FieldExtractor,
    policy: ExtractionPolicy,
    monitor: LinkHealthMonitor,
    reporter: Reporter,
}

impl SentenceHandler {
    fn on_frame(&mut self, frame: Frame) -> Result<(), ConnectionFault> {
        match frame {
            Frame::Sentence(bytes) => self.on_sentence(&bytes),
            Frame::Overflow { discarded } => {
                self.reporter.send(SessionEvent::Diagnostic {
                    kind: EntryKind::Warning,
                    message: format!("no terminator in {discarded} bytes; framing buffer dropped"),
                });
                Ok(())
            }
        }
    }

    fn on_sentence(&mut self, bytes: &[u8]) -> Result<(), ConnectionFault> {
        let port = &self.config.port;
        let sentence = self.extractor.decode(bytes).map_err(|e| {
            ConnectionFault::new(
                FaultKind::DecodingError,
                port,
                format!("{e} in sentence {}", hex::encode(bytes)),
            )
        })?;
        if sentence.is_empty() {
            return Ok(());
        }

        let (value, error) = match self.extractor.extract(&sentence) {
            Ok(value) => (Some(value), None),
            Err(err) => {
                let escalate = self.policy == ExtractionPolicy::Fault
                    && !matches!(err, ExtractionError::NotNumeric { .. });
                if escalate {
                    return Err(ConnectionFault::new(
                        FaultKind::MalformedSentence,
                        port,
                        format!("{err}: {sentence}"),
                    ));
                }
                debug!(port = %port, sentence = %sentence, error = %err, "Extraction failed");
                (None, Some(err))
            }
        };

        if let Some(to) = self.monitor.on_sentence_parsed() {
            self.reporter.send(SessionEvent::Health(to));
        }

        debug!(port = %port, sentence = %sentence, value = ?value, "Sentence");
        let event = MeasurementEvent {
            port: port.clone(),
            equipment_id: self.config.equipment_id,
            measurement: self.config.measurement.name.clone(),
            raw_sentence: sentence,
            value,
            error,
            received_at: Local::now(),
        };
        self.reporter.send(SessionEvent::Measurement(event));
        Ok(())
    }

    fn on_silence(&mut self) {
        if let Some(to) = self.monitor.on_timeout_tick() {
            debug!(port = %self.config.port, health = %to, ticks = self.monitor.silent_ticks(), "Silence");
            self.reporter.send(SessionEvent::Health(to));
        }
    }
}

struct Reporter {
    tx: Sender<SessionMessage>,
    port: String,
    run_id: u64,
    stop: Arc<AtomicBool>,
    closed: bool,
}

impl Reporter {
    fn should_exit(&self) -> bool {
        self.closed || self.stop.load(Ordering::SeqCst)
    }

    /// Deliver in order, blocking while the channel is full unless a stop
    /// has been requested.
    fn send(&mut self, event: SessionEvent) {
        if self.closed {
            return;
        }
        let mut message = SessionMessage {
            port: self.port.clone(),
            run_id: self.run_id,
            event,
        };
        loop {
            match self.tx.send_timeout(message, SEND_RETRY) {
                Ok(()) => return,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if self.stop.load(Ordering::SeqCst) {
                        debug!(port = %self.port, "Dropping event after stop request");
                        return;
                    }
                    message = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    warn!(port = %self.port, "Supervisor channel closed");
                    self.closed = true;
                    return;
                }
            }
        }
    }
}
