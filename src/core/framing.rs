//! Sentence framing
//!
//! Reassembles the raw byte stream of one port into device sentences. Partial
//! trailing fragments are held over between reads; a wedged device that never
//! sends a terminator cannot grow the buffer past its high-water mark.

use bytes::{Buf, BytesMut};
use tracing::{trace, warn};

/// Default bound on unterminated pending data
pub const DEFAULT_HIGH_WATER: usize = 4096;

/// Item produced while framing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete sentence with control bytes removed
    Sentence(Vec<u8>),
    /// Pending data exceeded the high-water mark and was discarded
    Overflow {
        /// Number of bytes dropped
        discarded: usize,
    },
}

impl Frame {
    /// Sentence bytes, if this is a sentence
    pub fn into_sentence(self) -> Option<Vec<u8>> {
        match self {
            Self::Sentence(bytes) => Some(bytes),
            Self::Overflow { .. } => None,
        }
    }
}

/// Per-port sentence reassembly buffer
#[derive(Debug)]
pub struct FramingBuffer {
    terminator: Vec<u8>,
    pending: BytesMut,
    /// Offset up to which `pending` is known to hold no terminator
    scanned: usize,
    high_water: usize,
}

impl FramingBuffer {
    /// Create a buffer splitting on `terminator`; empty disables framing
    pub fn new(terminator: &[u8]) -> Self {
        Self {
            terminator: terminator.to_vec(),
            pending: BytesMut::with_capacity(256),
            scanned: 0,
            high_water: DEFAULT_HIGH_WATER,
        }
    }

    /// Set the high-water mark
    #[must_use]
    pub fn with_high_water(mut self, high_water: usize) -> Self {
        self.high_water = high_water.max(1);
        self
    }

    /// Append bytes and iterate over the sentences now complete.
    ///
    /// The iterator is lazy: sentences it does not yield stay pending and come
    /// out of the next call.
    pub fn feed(&mut self, data: &[u8]) -> Frames<'_> {
        trace!(chunk_len = data.len(), pending = self.pending.len(), "Framing chunk");
        self.pending.extend_from_slice(data);
        Frames { buffer: self }
    }

    /// Bytes waiting for a terminator
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop pending bytes
    pub fn clear(&mut self) {
        self.pending.clear();
        self.scanned = 0;
    }

    fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if self.terminator.is_empty() {
                if self.pending.is_empty() {
                    return None;
                }
                let chunk = self.pending.split();
                let sentence = strip_controls(&chunk);
                if sentence.is_empty() {
                    continue;
                }
                return Some(Frame::Sentence(sentence));
            }

            match find(&self.pending[self.scanned..], &self.terminator) {
                Some(pos) => {
                    let line = self.pending.split_to(self.scanned + pos);
                    self.pending.advance(self.terminator.len());
                    self.scanned = 0;
                    let sentence = strip_controls(&line);
                    if sentence.is_empty() {
                        continue;
                    }
                    return Some(Frame::Sentence(sentence));
                }
                None => {
                    if self.pending.len() > self.high_water {
                        let discarded = self.pending.len();
                        warn!(
                            discarded,
                            high_water = self.high_water,
                            "Dropping unterminated framing buffer"
                        );
                        self.clear();
                        return Some(Frame::Overflow { discarded });
                    }
                    // A terminator may straddle the end; rescan its prefix next time.
                    self.scanned = self
                        .pending
                        .len()
                        .saturating_sub(self.terminator.len() - 1);
                    return None;
                }
            }
        }
    }
}

/// Lazy sequence of frames from one [`FramingBuffer::feed`] call
pub struct Frames<'a> {
    buffer: &'a mut FramingBuffer,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.buffer.next_frame()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Remove ASCII control bytes (0x00-0x1F, 0x7F).
///
/// C1 controls are left to the decoder since 0x80-0x9F are continuation
/// bytes in UTF-8.
fn strip_controls(data: &[u8]) -> Vec<u8> {
    data.iter()
        .copied()
        .filter(|&b| b >= 0x20 && b != 0x7F)
        .collect()
}
