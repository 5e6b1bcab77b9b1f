//! Port registry and supervisor
//!
//! Owns the set of port sessions keyed by port name. Sessions report over one
//! bounded channel; the supervisor drains it on the caller's thread, keeps
//! the session table current, records diagnostics, and forwards events to
//! the consumers registered for whatever context is active.

use super::diagnostics::{DiagnosticEntry, DiagnosticLog, DiagnosticSink, EntryKind, LogFormat};
use super::health::LinkHealth;
use super::link::{ConnectionFault, LinkOpener, SerialPortOpener};
use super::port::PortConfig;
use super::rule::MeasurementKind;
use super::session::{
    MeasurementEvent, PortSession, SessionError, SessionEvent, SessionMessage, SessionSettings,
};
use crate::config::{ConfigError, PortConfigSource};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Screen or workflow step that decides who hears about events
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Context(String);

impl Context {
    /// Create a context tag
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    /// Tag name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Context {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Answers which context is active; asked once per dispatch call
#[cfg_attr(test, mockall::automock)]
pub trait ContextProvider {
    /// Active context, `None` when no screen is listening
    fn current_context(&self) -> Option<Context>;
}

impl<F> ContextProvider for F
where
    F: Fn() -> Option<Context>,
{
    fn current_context(&self) -> Option<Context> {
        self()
    }
}

/// Receives dispatched events
pub trait EventConsumer: Send {
    /// Handle one event
    fn on_event(&mut self, event: &SupervisorEvent);
}

impl<F> EventConsumer for F
where
    F: FnMut(&SupervisorEvent) + Send,
{
    fn on_event(&mut self, event: &SupervisorEvent) {
        self(event);
    }
}

/// Event forwarded to consumers
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// Sentence received and extracted
    Measurement(MeasurementEvent),
    /// Link health changed
    Health {
        /// Port key
        port: String,
        /// New state
        health: LinkHealth,
    },
    /// Session opened its port
    Started {
        /// Port key
        port: String,
        /// Line settings summary
        connection_info: String,
    },
    /// Session ended
    Stopped {
        /// Port key
        port: String,
        /// Fault, `None` for a requested stop
        fault: Option<ConnectionFault>,
    },
    /// Non-fatal session notice
    Diagnostic(DiagnosticEntry),
}

impl SupervisorEvent {
    /// Port the event concerns
    pub fn port(&self) -> &str {
        match self {
            Self::Measurement(m) => &m.port,
            Self::Health { port, .. } | Self::Started { port, .. } | Self::Stopped { port, .. } => {
                port
            }
            Self::Diagnostic(entry) => &entry.port,
        }
    }
}

/// Snapshot of one session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    /// Port key
    pub port: String,
    /// Equipment bound to the port
    pub equipment_id: u32,
    /// Equipment display name
    pub equipment_name: String,
    /// What the port measures
    pub measurement: MeasurementKind,
    /// Last known health
    pub health: LinkHealth,
    /// Reader thread alive
    pub running: bool,
    /// Printer port
    pub write_only: bool,
    /// Fault that ended the last run
    pub last_fault: Option<ConnectionFault>,
}

/// Supervisor errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Port key already registered
    #[error("a session for {0} already exists")]
    DuplicateSession(String),

    /// No session under this key
    #[error("no session for {0}")]
    UnknownSession(String),

    /// Printer ports never read
    #[error("{0} is write-only and cannot be started")]
    WriteOnly(String),

    /// Port configuration rejected
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Port key
        port: String,
        /// What is wrong
        reason: String,
    },

    /// Reader thread could not be spawned
    #[error("failed to start session for {port}: {source}")]
    Spawn {
        /// Port key
        port: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Configuration source failed
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Supervisor tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Settings handed to every session
    pub session: SessionSettings,
    /// Bound of the session → supervisor channel
    pub channel_capacity: usize,
    /// Diagnostic entries retained
    pub diagnostic_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            channel_capacity: 1024,
            diagnostic_capacity: super::diagnostics::DEFAULT_CAPACITY,
        }
    }
}

struct SessionEntry {
    config: PortConfig,
    health: LinkHealth,
    session: Option<PortSession>,
    run_id: u64,
    last_fault: Option<ConnectionFault>,
}

impl SessionEntry {
    fn new(config: PortConfig) -> Self {
        Self {
            config,
            health: LinkHealth::Lost,
            session: None,
            run_id: 0,
            last_fault: None,
        }
    }

    fn is_running(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_finished())
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            port: self.config.port.clone(),
            equipment_id: self.config.equipment_id,
            equipment_name: self.config.equipment_name.clone(),
            measurement: self.config.measurement.clone(),
            health: self.health,
            running: self.is_running(),
            write_only: self.config.is_write_only(),
            last_fault: self.last_fault.clone(),
        }
    }

    /// Take the reader out of the entry. The caller stops it once the
    /// session table is unlocked.
    fn detach(&mut self) -> Option<PortSession> {
        let session = self.session.take()?;
        session.request_stop();
        self.health = LinkHealth::Lost;
        Some(session)
    }
}

/// Join detached readers; returns how many there were
fn halt_all(sessions: Vec<PortSession>) -> usize {
    let count = sessions.len();
    for mut session in sessions {
        session.stop();
    }
    count
}

/// The set of port sessions
pub struct Supervisor {
    opener: Arc<dyn LinkOpener>,
    settings: SupervisorSettings,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    tx: Sender<SessionMessage>,
    rx: Receiver<SessionMessage>,
    next_run: AtomicU64,
    routes: Mutex<HashMap<Context, Vec<Box<dyn EventConsumer>>>>,
    global: Mutex<Vec<Box<dyn EventConsumer>>>,
    log: Mutex<DiagnosticLog>,
    sink: Mutex<Option<Box<dyn DiagnosticSink>>>,
}

impl Supervisor {
    /// Create a supervisor opening links through `opener`
    pub fn new(opener: Arc<dyn LinkOpener>, settings: SupervisorSettings) -> Self {
        let (tx, rx) = bounded(settings.channel_capacity.max(1));
        let log = DiagnosticLog::new(settings.diagnostic_capacity);
        Self {
            opener,
            settings,
            sessions: Mutex::new(HashMap::new()),
            tx,
            rx,
            next_run: AtomicU64::new(1),
            routes: Mutex::new(HashMap::new()),
            global: Mutex::new(Vec::new()),
            log: Mutex::new(log),
            sink: Mutex::new(None),
        }
    }

    /// Supervisor over the host's serial ports
    pub fn serial(settings: SupervisorSettings) -> Self {
        Self::new(Arc::new(SerialPortOpener), settings)
    }

    /// Settings in use
    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Register a port; does not start it
    pub fn add_session(&self, config: PortConfig) -> Result<(), SupervisorError> {
        validate(&config)?;
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&config.port) {
            return Err(SupervisorError::DuplicateSession(config.port));
        }
        info!(port = %config.port, equipment = config.equipment_id, "Added session");
        sessions.insert(config.port.clone(), SessionEntry::new(config));
        Ok(())
    }

    /// Add every configuration a source supplies. Stops at the first error;
    /// ports added before it stay registered.
    pub fn load_from(&self, source: &dyn PortConfigSource) -> Result<usize, SupervisorError> {
        let configs = source.port_configs()?;
        let count = configs.len();
        for config in configs {
            self.add_session(config)?;
        }
        Ok(count)
    }

    /// Start reading a port. Starting a running session does nothing.
    pub fn start_session(&self, id: &str) -> Result<(), SupervisorError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| SupervisorError::UnknownSession(id.to_string()))?;
        self.launch(entry)
    }

    /// Stop reading a port and release its handle. Stopping a stopped session
    /// does nothing.
    pub fn stop_session(&self, id: &str) -> Result<(), SupervisorError> {
        let detached = self
            .sessions
            .lock()
            .get_mut(id)
            .ok_or_else(|| SupervisorError::UnknownSession(id.to_string()))?
            .detach();
        if let Some(mut session) = detached {
            session.stop();
            info!(port = %id, "Stopped session");
        }
        Ok(())
    }

    /// Replace a session's configuration, re-keying it when the port name
    /// changed. A running session is stopped first; `restart` starts it again
    /// under the new configuration unless the port became write-only.
    pub fn reconfigure_session(
        &self,
        id: &str,
        new_config: PortConfig,
        restart: bool,
    ) -> Result<(), SupervisorError> {
        validate(&new_config)?;
        let key = new_config.port.clone();
        let detached = {
            let mut sessions = self.sessions.lock();
            if !sessions.contains_key(id) {
                return Err(SupervisorError::UnknownSession(id.to_string()));
            }
            if key != id && sessions.contains_key(&key) {
                return Err(SupervisorError::DuplicateSession(key));
            }

            let Some(mut entry) = sessions.remove(id) else {
                return Err(SupervisorError::UnknownSession(id.to_string()));
            };
            let detached = entry.detach();
            entry.last_fault = None;
            entry.config = new_config;
            if key != id {
                info!(from = %id, to = %key, "Re-keyed session");
            }
            sessions.insert(key.clone(), entry);
            detached
        };
        // The old handle must be closed before the port is opened again.
        if let Some(mut session) = detached {
            session.stop();
        }

        if restart {
            let mut sessions = self.sessions.lock();
            let entry = sessions
                .get_mut(&key)
                .ok_or_else(|| SupervisorError::UnknownSession(key.clone()))?;
            if !entry.config.is_write_only() {
                self.launch(entry)?;
            }
        }
        Ok(())
    }

    /// Stop and forget a session, returning its configuration
    pub fn remove_session(&self, id: &str) -> Result<PortConfig, SupervisorError> {
        let mut entry = self
            .sessions
            .lock()
            .remove(id)
            .ok_or_else(|| SupervisorError::UnknownSession(id.to_string()))?;
        if let Some(mut session) = entry.detach() {
            session.stop();
        }
        info!(port = %id, "Removed session");
        Ok(entry.config)
    }

    /// Start every readable port; printers are skipped
    pub fn start_all(&self) -> Result<usize, SupervisorError> {
        let mut sessions = self.sessions.lock();
        let mut started = 0;
        for entry in sessions.values_mut() {
            if entry.config.is_write_only() || entry.is_running() {
                continue;
            }
            self.launch(entry)?;
            started += 1;
        }
        Ok(started)
    }

    /// Stop every session; returns how many were running
    pub fn stop_all(&self) -> usize {
        // Every reader is signalled before any is joined so the waits overlap.
        let detached: Vec<_> = self
            .sessions
            .lock()
            .values_mut()
            .filter_map(SessionEntry::detach)
            .collect();
        halt_all(detached)
    }

    /// Snapshot of every session, ordered by port
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut list: Vec<_> = self.sessions.lock().values().map(SessionEntry::info).collect();
        list.sort_by(|a, b| a.port.cmp(&b.port));
        list
    }

    /// Snapshot of one session
    pub fn session(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.lock().get(id).map(SessionEntry::info)
    }

    /// Write-only ports, ordered by port
    pub fn printers(&self) -> Vec<PortConfig> {
        let mut list: Vec<_> = self
            .sessions
            .lock()
            .values()
            .filter(|e| e.config.is_write_only())
            .map(|e| e.config.clone())
            .collect();
        list.sort_by(|a, b| a.port.cmp(&b.port));
        list
    }

    /// Deliver events to `consumer` while `context` is active
    pub fn subscribe(&self, context: Context, consumer: impl EventConsumer + 'static) {
        self.routes
            .lock()
            .entry(context)
            .or_default()
            .push(Box::new(consumer));
    }

    /// Deliver every event to `consumer` regardless of context
    pub fn subscribe_all(&self, consumer: impl EventConsumer + 'static) {
        self.global.lock().push(Box::new(consumer));
    }

    /// Mirror diagnostics to an external sink. The sink runs on the pumping
    /// thread after the session table is unlocked, so it may query sessions.
    pub fn set_diagnostic_sink(&self, sink: impl DiagnosticSink + 'static) {
        *self.sink.lock() = Some(Box::new(sink));
    }

    /// The `n` most recent diagnostic entries, oldest first
    pub fn diagnostics(&self, n: usize) -> Vec<DiagnosticEntry> {
        self.log.lock().recent(n)
    }

    /// Export the retained diagnostic entries
    pub fn export_diagnostics(&self, format: LogFormat) -> String {
        self.log.lock().export(format)
    }

    /// Dispatch everything already queued without blocking. Returns the number
    /// of session messages processed.
    pub fn pump(&self, provider: &dyn ContextProvider) -> usize {
        let context = provider.current_context();
        let mut count = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.process(message, context.as_ref());
            count += 1;
        }
        count
    }

    /// Wait up to `timeout` for the first message, then dispatch everything
    /// queued.
    pub fn pump_timeout(&self, provider: &dyn ContextProvider, timeout: Duration) -> usize {
        let first = match self.rx.recv_timeout(timeout) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return 0,
        };
        let context = provider.current_context();
        self.process(first, context.as_ref());
        let mut count = 1;
        while let Ok(message) = self.rx.try_recv() {
            self.process(message, context.as_ref());
            count += 1;
        }
        count
    }

    fn launch(&self, entry: &mut SessionEntry) -> Result<(), SupervisorError> {
        let port = entry.config.port.clone();
        if entry.config.is_write_only() {
            return Err(SupervisorError::WriteOnly(port));
        }
        if entry.is_running() {
            debug!(port = %port, "Session already running");
            return Ok(());
        }
        // Reap a reader that ended on a fault.
        entry.session = None;

        let run_id = self.next_run.fetch_add(1, Ordering::SeqCst);
        let session = PortSession::spawn(
            entry.config.clone(),
            self.settings.session.clone(),
            Arc::clone(&self.opener),
            self.tx.clone(),
            run_id,
        )
        .map_err(|e| match e {
            SessionError::WriteOnly(port) => SupervisorError::WriteOnly(port),
            SessionError::Spawn(source) => SupervisorError::Spawn {
                port: port.clone(),
                source,
            },
        })?;

        entry.session = Some(session);
        entry.run_id = run_id;
        entry.health = LinkHealth::Lost;
        entry.last_fault = None;
        info!(port = %port, run = run_id, "Started session");
        Ok(())
    }

    fn process(&self, message: SessionMessage, context: Option<&Context>) {
        let SessionMessage { port, run_id, event } = message;

        let (diagnostic, dispatched) = {
            let mut sessions = self.sessions.lock();
            match (sessions.get_mut(&port), event) {
                (Some(entry), event) if entry.run_id == run_id => Self::apply(entry, port, event),
                // A fault from an earlier run or a removed session still
                // surfaces; a re-registered entry only learns the fault.
                (entry, SessionEvent::Stopped { fault: Some(fault) }) => {
                    warn!(port = %port, run = run_id, kind = %fault.kind, "Earlier run faulted");
                    if let Some(entry) = entry {
                        entry.last_fault.get_or_insert_with(|| fault.clone());
                    }
                    Self::stopped(port, Some(fault))
                }
                _ => {
                    debug!(port = %port, run = run_id, "Stale message dropped");
                    return;
                }
            }
        };

        if let Some(diagnostic) = diagnostic {
            self.record(diagnostic);
        }
        self.dispatch(&dispatched, context);
    }

    /// Fold a current-run event into its entry
    fn apply(
        entry: &mut SessionEntry,
        port: String,
        event: SessionEvent,
    ) -> (Option<DiagnosticEntry>, SupervisorEvent) {
        match event {
            SessionEvent::Started { connection_info } => (
                Some(DiagnosticEntry::new(
                    &port,
                    EntryKind::Info,
                    format!("Opened {connection_info}"),
                )),
                SupervisorEvent::Started {
                    port,
                    connection_info,
                },
            ),
            SessionEvent::Measurement(measurement) => (
                Some(DiagnosticEntry::new(
                    &port,
                    EntryKind::Sentence,
                    measurement.raw_sentence.clone(),
                )),
                SupervisorEvent::Measurement(measurement),
            ),
            SessionEvent::Health(health) => {
                // A stopped session stays Lost whatever is still queued.
                if entry.session.is_some() || health == LinkHealth::Lost {
                    entry.health = health;
                }
                (
                    Some(DiagnosticEntry::new(
                        &port,
                        EntryKind::Health,
                        format!("{health} ({})", health.color()),
                    )),
                    SupervisorEvent::Health { port, health },
                )
            }
            SessionEvent::Diagnostic { kind, message } => {
                let diagnostic = DiagnosticEntry::new(&port, kind, message);
                (Some(diagnostic.clone()), SupervisorEvent::Diagnostic(diagnostic))
            }
            SessionEvent::Stopped { fault } => {
                entry.health = LinkHealth::Lost;
                // The reader has already released the handle.
                entry.session = None;
                if let Some(fault) = &fault {
                    warn!(port = %port, kind = %fault.kind, "Session faulted");
                    entry.last_fault = Some(fault.clone());
                }
                Self::stopped(port, fault)
            }
        }
    }

    fn stopped(
        port: String,
        fault: Option<ConnectionFault>,
    ) -> (Option<DiagnosticEntry>, SupervisorEvent) {
        let diagnostic = match &fault {
            Some(fault) => DiagnosticEntry::new(&port, EntryKind::Fault, fault.diagnostic_line()),
            None => DiagnosticEntry::new(&port, EntryKind::Info, "Stopped"),
        };
        (Some(diagnostic), SupervisorEvent::Stopped { port, fault })
    }

    fn record(&self, entry: DiagnosticEntry) {
        if let Some(sink) = self.sink.lock().as_mut() {
            sink.record(&entry);
        }
        self.log.lock().push(entry);
    }

    fn dispatch(&self, event: &SupervisorEvent, context: Option<&Context>) {
        if let Some(context) = context {
            if let Some(consumers) = self.routes.lock().get_mut(context) {
                for consumer in consumers.iter_mut() {
                    consumer.on_event(event);
                }
            }
        }
        for consumer in self.global.lock().iter_mut() {
            consumer.on_event(event);
        }
    }

    #[cfg(test)]
    fn inject(&self, message: SessionMessage) {
        let _ = self.tx.send(message);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn validate(config: &PortConfig) -> Result<(), SupervisorError> {
    config
        .validate()
        .map_err(|reason| SupervisorError::InvalidConfig {
            port: config.port.clone(),
            reason,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::link::scripted::{ScriptStep, ScriptedOpener};
    use crate::core::link::FaultKind;
    use crate::core::rule::{ParsingRule, Unit};
    use std::io;
    use std::time::Instant;

    fn fast_settings() -> SupervisorSettings {
        SupervisorSettings {
            session: SessionSettings {
                read_timeout: Duration::from_millis(10),
                degraded_after: Duration::from_millis(10),
                lost_after: Duration::from_secs(1),
                ..SessionSettings::default()
            },
            ..SupervisorSettings::default()
        }
    }

    fn caliper(port: &str) -> PortConfig {
        PortConfig::new(port, 9600, 3, MeasurementKind::with_unit("Length", Unit::Centimeters))
            .rule(ParsingRule::fixed(0, 4).unit(Unit::Millimeters))
    }

    fn printer(port: &str) -> PortConfig {
        PortConfig::new(port, 9600, 40, MeasurementKind::new("Label"))
    }

    fn supervisor() -> (Supervisor, Arc<ScriptedOpener>) {
        let opener = Arc::new(ScriptedOpener::new());
        let supervisor = Supervisor::new(Arc::clone(&opener) as Arc<dyn LinkOpener>, fast_settings());
        (supervisor, opener)
    }

    fn recorder(supervisor: &Supervisor) -> Arc<Mutex<Vec<SupervisorEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        supervisor.subscribe_all(move |event: &SupervisorEvent| sink.lock().push(event.clone()));
        seen
    }

    fn no_context() -> Option<Context> {
        None
    }

    /// Pump until `done` holds or five seconds pass
    fn pump_until(
        supervisor: &Supervisor,
        seen: &Mutex<Vec<SupervisorEvent>>,
        done: impl Fn(&[SupervisorEvent]) -> bool,
    ) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(seen.lock().as_slice()) {
            assert!(Instant::now() < deadline, "timed out waiting for events");
            supervisor.pump_timeout(&no_context, Duration::from_millis(20));
        }
    }

    /// Spin until `cond` holds; readers open their ports asynchronously
    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn stopped(events: &[SupervisorEvent]) -> bool {
        events.iter().any(|e| matches!(e, SupervisorEvent::Stopped { .. }))
    }

    #[test]
    fn test_add_duplicate() {
        let (supervisor, _) = supervisor();
        supervisor.add_session(caliper("COM3")).unwrap();
        assert!(matches!(
            supervisor.add_session(caliper("COM3")),
            Err(SupervisorError::DuplicateSession(port)) if port == "COM3"
        ));
    }

    #[test]
    fn test_start_errors() {
        let (supervisor, _) = supervisor();
        supervisor.add_session(printer("COM9")).unwrap();
        assert!(matches!(
            supervisor.start_session("COM1"),
            Err(SupervisorError::UnknownSession(_))
        ));
        assert!(matches!(
            supervisor.start_session("COM9"),
            Err(SupervisorError::WriteOnly(_))
        ));
        assert_eq!(supervisor.printers().len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (supervisor, _) = supervisor();
        let bad = caliper("COM3").data_bits(3);
        assert!(matches!(
            supervisor.add_session(bad),
            Err(SupervisorError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_measurement_reaches_consumers() {
        let (supervisor, opener) = supervisor();
        opener.script("COM3", vec![ScriptStep::data(b"12.34\r\n")]);
        supervisor.add_session(caliper("COM3")).unwrap();

        let sampling = Arc::new(Mutex::new(Vec::new()));
        let other = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sampling);
        supervisor.subscribe(Context::new("sampling"), move |e: &SupervisorEvent| {
            sink.lock().push(e.clone())
        });
        let sink = Arc::clone(&other);
        supervisor.subscribe(Context::new("tally"), move |e: &SupervisorEvent| {
            sink.lock().push(e.clone())
        });

        supervisor.start_session("COM3").unwrap();
        let provider = || Some(Context::new("sampling"));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !sampling
            .lock()
            .iter()
            .any(|e| matches!(e, SupervisorEvent::Measurement(_)))
        {
            assert!(Instant::now() < deadline);
            supervisor.pump_timeout(&provider, Duration::from_millis(20));
        }

        let measurement = sampling
            .lock()
            .iter()
            .find_map(|e| match e {
                SupervisorEvent::Measurement(m) => Some(m.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(measurement.value.unwrap().as_str(), "1.23");
        assert_eq!(measurement.equipment_id, 3);
        assert!(other.lock().is_empty());
        assert!(sampling
            .lock()
            .iter()
            .any(|e| matches!(e, SupervisorEvent::Health { health: LinkHealth::Live, .. })));
    }

    #[test]
    fn test_context_resolved_once_per_pump() {
        let (supervisor, _) = supervisor();
        supervisor.add_session(caliper("COM3")).unwrap();
        for _ in 0..3 {
            supervisor.inject(SessionMessage {
                port: "COM3".to_string(),
                run_id: 0,
                event: SessionEvent::Diagnostic {
                    kind: EntryKind::Warning,
                    message: "overflow".to_string(),
                },
            });
        }

        let mut provider = MockContextProvider::new();
        provider.expect_current_context().times(1).returning(|| None);
        assert_eq!(supervisor.pump(&provider), 3);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (supervisor, opener) = supervisor();
        supervisor.add_session(caliper("COM3")).unwrap();
        supervisor.start_session("COM3").unwrap();
        supervisor.start_session("COM3").unwrap();
        wait_for(|| opener.stats().opened() == 1);
        assert!(supervisor.session("COM3").unwrap().running);

        supervisor.stop_session("COM3").unwrap();
        supervisor.stop_session("COM3").unwrap();
        assert_eq!(opener.stats().open_now(), 0);
        supervisor.pump(&no_context);

        let stops = supervisor
            .diagnostics(100)
            .into_iter()
            .filter(|e| e.message == "Stopped")
            .count();
        assert_eq!(stops, 1);
        let info = supervisor.session("COM3").unwrap();
        assert!(!info.running);
        assert_eq!(info.health, LinkHealth::Lost);
    }

    #[test]
    fn test_reconfigure_rekeys_and_releases_handle() {
        let (supervisor, opener) = supervisor();
        let stats = opener.stats();
        supervisor.add_session(caliper("COM3")).unwrap();
        supervisor.add_session(caliper("COM4")).unwrap();
        supervisor.start_session("COM3").unwrap();

        assert!(matches!(
            supervisor.reconfigure_session("COM3", caliper("COM4"), true),
            Err(SupervisorError::DuplicateSession(_))
        ));
        assert!(supervisor.session("COM3").unwrap().running);

        supervisor
            .reconfigure_session("COM3", caliper("COM7"), true)
            .unwrap();
        assert!(supervisor.session("COM3").is_none());
        let info = supervisor.session("COM7").unwrap();
        assert!(info.running);
        wait_for(|| stats.opened() == 2);
        assert_eq!(stats.open_now(), 1);

        supervisor.remove_session("COM7").unwrap();
        assert_eq!(stats.open_now(), 0);
    }

    #[test]
    fn test_stale_run_ignored() {
        let (supervisor, _) = supervisor();
        supervisor.add_session(caliper("COM3")).unwrap();
        supervisor.start_session("COM3").unwrap();
        let seen = recorder(&supervisor);

        supervisor.inject(SessionMessage {
            port: "COM3".to_string(),
            run_id: 999,
            event: SessionEvent::Health(LinkHealth::Live),
        });
        supervisor.pump(&no_context);

        assert!(!seen
            .lock()
            .iter()
            .any(|e| matches!(e, SupervisorEvent::Health { health: LinkHealth::Live, .. })));
        assert_eq!(supervisor.session("COM3").unwrap().health, LinkHealth::Lost);
    }

    #[test]
    fn test_fault_recorded_and_restartable() {
        let (supervisor, opener) = supervisor();
        opener.script("COM3", vec![ScriptStep::Error(io::ErrorKind::BrokenPipe)]);
        supervisor.add_session(caliper("COM3")).unwrap();
        let seen = recorder(&supervisor);
        let mirrored = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&mirrored);
        supervisor.set_diagnostic_sink(move |e: &DiagnosticEntry| sink.lock().push(e.clone()));

        supervisor.start_session("COM3").unwrap();
        pump_until(&supervisor, &seen, stopped);

        let info = supervisor.session("COM3").unwrap();
        assert!(!info.running);
        assert_eq!(info.health, LinkHealth::Lost);
        assert_eq!(info.last_fault.unwrap().kind, FaultKind::LinkLost);
        assert!(mirrored
            .lock()
            .iter()
            .any(|e| e.kind == EntryKind::Fault && e.message.starts_with("Error: COM3 > ")));

        supervisor.start_session("COM3").unwrap();
        assert!(supervisor.session("COM3").unwrap().running);
        wait_for(|| opener.stats().opened() == 2);
    }

    fn faults(events: &[SupervisorEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, SupervisorEvent::Stopped { fault: Some(_), .. }))
            .count()
    }

    #[test]
    fn test_fault_survives_restart_before_pump() {
        let (supervisor, opener) = supervisor();
        opener.script("COM3", vec![ScriptStep::Error(io::ErrorKind::BrokenPipe)]);
        supervisor.add_session(caliper("COM3")).unwrap();
        let seen = recorder(&supervisor);

        supervisor.start_session("COM3").unwrap();
        wait_for(|| !supervisor.session("COM3").unwrap().running);
        supervisor.start_session("COM3").unwrap();
        wait_for(|| opener.stats().opened() == 2);
        pump_until(&supervisor, &seen, |events| faults(events) == 1);

        let logged = supervisor
            .diagnostics(100)
            .into_iter()
            .filter(|e| e.kind == EntryKind::Fault)
            .count();
        assert_eq!(logged, 1);
        let info = supervisor.session("COM3").unwrap();
        assert!(info.running);
        assert_eq!(info.last_fault.unwrap().kind, FaultKind::LinkLost);
    }

    #[test]
    fn test_fault_survives_removal_before_pump() {
        let (supervisor, opener) = supervisor();
        opener.script("COM3", vec![ScriptStep::Error(io::ErrorKind::BrokenPipe)]);
        supervisor.add_session(caliper("COM3")).unwrap();
        let seen = recorder(&supervisor);

        supervisor.start_session("COM3").unwrap();
        wait_for(|| !supervisor.session("COM3").unwrap().running);
        supervisor.remove_session("COM3").unwrap();
        pump_until(&supervisor, &seen, |events| faults(events) == 1);

        assert!(supervisor.session("COM3").is_none());
        assert!(supervisor
            .diagnostics(100)
            .iter()
            .any(|e| e.kind == EntryKind::Fault && e.port == "COM3"));
    }

    #[test]
    fn test_diagnostic_sink_may_query_sessions() {
        let (supervisor, _) = supervisor();
        let supervisor = Arc::new(supervisor);
        supervisor.add_session(caliper("COM3")).unwrap();
        let counts = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&counts);
        let weak = Arc::downgrade(&supervisor);
        supervisor.set_diagnostic_sink(move |_: &DiagnosticEntry| {
            if let Some(supervisor) = weak.upgrade() {
                sink.lock().push(supervisor.list_sessions().len());
            }
        });

        supervisor.inject(SessionMessage {
            port: "COM3".to_string(),
            run_id: 0,
            event: SessionEvent::Diagnostic {
                kind: EntryKind::Warning,
                message: "overflow".to_string(),
            },
        });
        assert_eq!(supervisor.pump(&no_context), 1);
        assert_eq!(*counts.lock(), vec![1]);
    }

    #[test]
    fn test_listing_not_blocked_while_stopping() {
        let opener = Arc::new(ScriptedOpener::new());
        let base = fast_settings();
        let settings = SupervisorSettings {
            session: SessionSettings {
                read_timeout: Duration::from_millis(400),
                ..base.session.clone()
            },
            ..base
        };
        let supervisor = Supervisor::new(Arc::clone(&opener) as Arc<dyn LinkOpener>, settings);
        supervisor.add_session(caliper("COM3")).unwrap();
        supervisor.start_session("COM3").unwrap();
        wait_for(|| opener.stats().opened() == 1);

        std::thread::scope(|scope| {
            scope.spawn(|| supervisor.stop_session("COM3").unwrap());
            std::thread::sleep(Duration::from_millis(50));
            let started = Instant::now();
            assert_eq!(supervisor.list_sessions().len(), 1);
            assert!(started.elapsed() < Duration::from_millis(200));
        });
        assert_eq!(opener.stats().open_now(), 0);
    }

    #[test]
    fn test_silence_reports_single_degraded() {
        let (supervisor, opener) = supervisor();
        let mut steps = vec![ScriptStep::data(b"10.00\r\n")];
        steps.extend(std::iter::repeat(ScriptStep::Silence).take(5));
        steps.push(ScriptStep::Error(io::ErrorKind::BrokenPipe));
        opener.script("COM3", steps);
        supervisor.add_session(caliper("COM3")).unwrap();
        let seen = recorder(&supervisor);

        supervisor.start_session("COM3").unwrap();
        pump_until(&supervisor, &seen, stopped);

        let healths: Vec<_> = seen
            .lock()
            .iter()
            .filter_map(|e| match e {
                SupervisorEvent::Health { health, .. } => Some(*health),
                _ => None,
            })
            .collect();
        assert_eq!(
            healths,
            vec![LinkHealth::Live, LinkHealth::Degraded, LinkHealth::Lost]
        );
    }

    #[test]
    fn test_start_all_skips_printers() {
        let (supervisor, opener) = supervisor();
        let loaded = supervisor
            .load_from(&vec![caliper("COM3"), caliper("COM4"), printer("COM9")])
            .unwrap();
        assert_eq!(loaded, 3);
        assert_eq!(supervisor.start_all().unwrap(), 2);
        wait_for(|| opener.stats().open_now() == 2);
        assert_eq!(supervisor.stop_all(), 2);
        assert_eq!(opener.stats().open_now(), 0);
        assert_eq!(supervisor.list_sessions().len(), 3);
    }
}
