//! Outbound send batching.
//!
//! Every transport keeps one packetizer per peer. `send` copies the frame
//! into the buffer and returns; the accumulated bytes go out when the
//! caller flushes explicitly, when another frame would push the buffer over
//! the MTU budget, or when the coalescing timer fires.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

/// Default UDP batch budget: stays below a 1500-byte MTU with headroom for
/// IP and UDP headers.
pub const DEFAULT_UDP_BUDGET: usize = 1416;

/// Default coalescing delay before an unflushed buffer goes out anyway.
pub const DEFAULT_COALESCE_DELAY: Duration = Duration::from_millis(5);

/// Result of pushing a frame into a packetizer.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame buffered; flush timer should be armed if not already.
    Buffered,
    /// Budget reached: these bytes must go out now, frame is buffered
    /// behind them.
    Flush(Bytes),
}

/// Per-peer outbound buffer with an MTU budget.
#[derive(Debug)]
pub struct Packetizer {
    buffer: BytesMut,
    budget: usize,
    armed_at: Option<Instant>,
}

impl Packetizer {
    /// A packetizer with the given byte budget.
    pub fn new(budget: usize) -> Self {
        Self { buffer: BytesMut::with_capacity(budget), budget, armed_at: None }
    }

    /// Copy `frame` in. Returns the previous contents when adding the frame
    /// would exceed the budget. Frames larger than the whole budget travel
    /// alone in an oversized batch.
    pub fn push(&mut self, frame: &[u8], now: Instant) -> PushOutcome {
        if !self.buffer.is_empty() && self.buffer.len() + frame.len() > self.budget {
            let flushed = self.buffer.split().freeze();
            self.buffer.extend_from_slice(frame);
            self.armed_at = Some(now);
            return PushOutcome::Flush(flushed);
        }
        if self.armed_at.is_none() {
            self.armed_at = Some(now);
        }
        self.buffer.extend_from_slice(frame);
        PushOutcome::Buffered
    }

    /// Take everything buffered (explicit flush or timer expiry).
    pub fn flush(&mut self) -> Option<Bytes> {
        self.armed_at = None;
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }

    /// When the oldest buffered byte was pushed, for timer arming.
    pub fn armed_at(&self) -> Option<Instant> {
        self.armed_at
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_until_budget() {
        let mut p = Packetizer::new(100);
        let now = Instant::now();
        assert_eq!(p.push(&[0u8; 40], now), PushOutcome::Buffered);
        assert_eq!(p.push(&[1u8; 40], now), PushOutcome::Buffered);
        assert_eq!(p.len(), 80);

        // 80 + 40 > 100: the first two frames go out, the third is buffered.
        match p.push(&[2u8; 40], now) {
            PushOutcome::Flush(bytes) => assert_eq!(bytes.len(), 80),
            PushOutcome::Buffered => unreachable!("budget exceeded"),
        }
        assert_eq!(p.len(), 40);
    }

    #[test]
    fn test_explicit_flush_drains() {
        let mut p = Packetizer::new(100);
        let now = Instant::now();
        p.push(&[0u8; 10], now);
        let flushed = p.flush().expect("buffered bytes");
        assert_eq!(flushed.len(), 10);
        assert!(p.is_empty());
        assert!(p.flush().is_none());
        assert!(p.armed_at().is_none());
    }

    #[test]
    fn test_oversized_frame_travels_alone() {
        let mut p = Packetizer::new(100);
        let now = Instant::now();
        assert_eq!(p.push(&[0u8; 150], now), PushOutcome::Buffered);
        assert_eq!(p.flush().expect("oversized batch").len(), 150);
    }

    #[test]
    fn test_armed_timestamp_tracks_oldest() {
        let mut p = Packetizer::new(100);
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(3);
        p.push(&[0u8; 10], t0);
        p.push(&[1u8; 10], t1);
        assert_eq!(p.armed_at(), Some(t0));
        p.flush();
        assert_eq!(p.armed_at(), None);
    }
}
