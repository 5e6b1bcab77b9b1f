//! Scripted instrument links
//!
//! Replays a fixed script of reads for a port. Used to exercise sessions
//! without hardware and to simulate instruments on a workstation.

use super::{ConnectionFault, FaultKind, LinkOpener, SerialLink};
use crate::core::port::PortConfig;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// One scripted read
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Deliver these bytes
    Data(Vec<u8>),
    /// Wait out the read timeout with nothing received
    Silence,
    /// Fail the read
    Error(io::ErrorKind),
    /// Report this many bytes queued by the OS until the queue is cleared.
    /// The read itself returns `Interrupted`.
    Backlog(u32),
}

impl ScriptStep {
    /// Data step from a byte string
    pub fn data(bytes: &[u8]) -> Self {
        Self::Data(bytes.to_vec())
    }
}

/// Counters shared between an opener and the links it opened
#[derive(Debug, Default)]
pub struct LinkStats {
    opened: AtomicUsize,
    open_now: AtomicUsize,
    input_clears: AtomicUsize,
}

impl LinkStats {
    /// Links opened so far
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Links currently open (handles not yet released)
    pub fn open_now(&self) -> usize {
        self.open_now.load(Ordering::SeqCst)
    }

    /// Times the OS input queue was discarded
    pub fn input_clears(&self) -> usize {
        self.input_clears.load(Ordering::SeqCst)
    }
}

/// Link replaying a script
pub struct ScriptedLink {
    steps: VecDeque<ScriptStep>,
    pending: VecDeque<u8>,
    backlog: AtomicU32,
    timeout: Duration,
    stats: Arc<LinkStats>,
}

impl ScriptedLink {
    fn idle(&self) -> io::Error {
        thread::sleep(self.timeout);
        io::Error::new(io::ErrorKind::TimedOut, "read timed out")
    }
}

impl SerialLink for ScriptedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }

            match self.steps.pop_front() {
                Some(ScriptStep::Data(bytes)) => self.pending.extend(bytes),
                Some(ScriptStep::Backlog(n)) => {
                    self.backlog.store(n, Ordering::SeqCst);
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "backlog queued"));
                }
                Some(ScriptStep::Error(kind)) => {
                    return Err(io::Error::new(kind, "scripted read failure"))
                }
                Some(ScriptStep::Silence) | None => return Err(self.idle()),
            }
        }
    }

    fn bytes_to_read(&self) -> io::Result<u32> {
        Ok(self.backlog.load(Ordering::SeqCst))
    }

    fn clear_input(&self) -> io::Result<()> {
        self.backlog.store(0, Ordering::SeqCst);
        self.stats.input_clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for ScriptedLink {
    fn drop(&mut self) {
        self.stats.open_now.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Opener handing out scripted links per port name
#[derive(Default)]
pub struct ScriptedOpener {
    scripts: Mutex<HashMap<String, VecDeque<Vec<ScriptStep>>>>,
    failures: Mutex<HashMap<String, FaultKind>>,
    stats: Arc<LinkStats>,
}

impl ScriptedOpener {
    /// Create an opener with no scripts
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a script for the next open of `port`; later opens take later scripts
    pub fn script(&self, port: &str, steps: Vec<ScriptStep>) {
        self.scripts
            .lock()
            .entry(port.to_string())
            .or_default()
            .push_back(steps);
    }

    /// Make opens of `port` fail
    pub fn fail_open(&self, port: &str, kind: FaultKind) {
        self.failures.lock().insert(port.to_string(), kind);
    }

    /// Shared counters
    pub fn stats(&self) -> Arc<LinkStats> {
        Arc::clone(&self.stats)
    }
}

impl LinkOpener for ScriptedOpener {
    fn open(
        &self,
        config: &PortConfig,
        timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, ConnectionFault> {
        if let Some(kind) = self.failures.lock().get(&config.port) {
            return Err(ConnectionFault::new(*kind, &config.port, "scripted open failure"));
        }

        let steps = self
            .scripts
            .lock()
            .get_mut(&config.port)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();

        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        self.stats.open_now.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ScriptedLink {
            steps: steps.into(),
            pending: VecDeque::new(),
            backlog: AtomicU32::new(0),
            timeout,
            stats: Arc::clone(&self.stats),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::MeasurementKind;

    fn config(port: &str) -> PortConfig {
        PortConfig::new(port, 9600, 1, MeasurementKind::new("Weight"))
    }

    #[test]
    fn test_replays_script_in_order() {
        let opener = ScriptedOpener::new();
        opener.script(
            "COM1",
            vec![ScriptStep::data(b"abc"), ScriptStep::Error(io::ErrorKind::BrokenPipe)],
        );
        let mut link = opener.open(&config("COM1"), Duration::from_millis(1)).unwrap();

        let mut buf = [0u8; 2];
        assert_eq!(link.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(link.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'c');
        assert_eq!(link.read(&mut buf).unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(link.read(&mut buf).unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_tracks_open_handles() {
        let opener = ScriptedOpener::new();
        let stats = opener.stats();
        let link = opener.open(&config("COM1"), Duration::from_millis(1)).unwrap();
        assert_eq!(stats.open_now(), 1);
        drop(link);
        assert_eq!(stats.open_now(), 0);
        assert_eq!(stats.opened(), 1);
    }

    #[test]
    fn test_open_failure() {
        let opener = ScriptedOpener::new();
        opener.fail_open("COM4", FaultKind::PermissionDenied);
        let fault = opener
            .open(&config("COM4"), Duration::from_millis(1))
            .err()
            .unwrap();
        assert_eq!(fault.kind, FaultKind::PermissionDenied);
    }
}
