//! SOME/IP-TP segmentation and reassembly.
//!
//! Messages larger than a datagram are cut into segments. A segment is a
//! SOME/IP frame whose message type carries the TP bit and whose payload
//! starts with a 4-byte TP header:
//!
//! ```text
//! offset:28 | reserved:3 | more:1
//! ```
//!
//! The offset is a byte offset into the original payload and is always a
//! multiple of 16; `more = 0` marks the final segment. Reassembly is keyed
//! on `(message_id, request_id, source)` and bounded per source endpoint so
//! a hostile peer cannot grow buffers without limit.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use veho_types::{ClientId, Endpoint, MethodId, ServiceId, SessionId};

use crate::message::Message;
use crate::{Result, WireError};

/// Size of the TP header prefixed to every segment payload.
pub const TP_HEADER_SIZE: usize = 4;

/// Segment offsets and lengths (except the last) are multiples of this.
pub const TP_ALIGNMENT: usize = 16;

/// Default cap on buffered reassembly bytes per source endpoint (4 MiB).
pub const DEFAULT_PEER_CAP: usize = 4 * 1024 * 1024;

/// Default inactivity timeout after which a partial message is dropped.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Split `message` into TP segments of at most `max_segment` payload bytes.
///
/// `max_segment` is rounded down to the TP alignment; values below the
/// alignment are rounded up to it. Messages that already fit are returned
/// unsegmented.
pub fn segment(message: &Message, max_segment: usize) -> Vec<Message> {
    let chunk = (max_segment / TP_ALIGNMENT).max(1) * TP_ALIGNMENT;
    if message.payload.len() <= chunk {
        return vec![message.clone()];
    }

    let mut segments = Vec::with_capacity(message.payload.len().div_ceil(chunk));
    let mut offset = 0usize;
    while offset < message.payload.len() {
        let end = (offset + chunk).min(message.payload.len());
        let more = end < message.payload.len();

        let mut payload = BytesMut::with_capacity(TP_HEADER_SIZE + end - offset);
        let mut header = (offset as u32) & 0xFFFF_FFF0;
        if more {
            header |= 0x01;
        }
        payload.put_u32(header);
        payload.put_slice(&message.payload[offset..end]);

        let mut seg = message.clone();
        seg.message_type = message.message_type.with_tp();
        seg.payload = payload.freeze();
        segments.push(seg);

        offset = end;
    }
    segments
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct ReassemblyKey {
    service: ServiceId,
    method: MethodId,
    client: ClientId,
    session: SessionId,
    source: Option<Endpoint>,
}

struct Partial {
    segments: BTreeMap<u32, Bytes>,
    total_len: Option<usize>,
    buffered: usize,
    last_activity: Instant,
    template: Message,
}

/// Incremental TP reassembler.
///
/// Segments may arrive in any order; a message completes when every offset
/// from zero up to the final segment is covered. [`Reassembler::expire`]
/// must be called periodically to drop partials whose peer went silent.
pub struct Reassembler {
    partials: HashMap<ReassemblyKey, Partial>,
    peer_usage: HashMap<Option<Endpoint>, usize>,
    peer_cap: usize,
    timeout: Duration,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_PEER_CAP, DEFAULT_TIMEOUT)
    }
}

impl Reassembler {
    /// A reassembler with the given per-peer byte cap and inactivity timeout.
    pub fn new(peer_cap: usize, timeout: Duration) -> Self {
        Self {
            partials: HashMap::new(),
            peer_usage: HashMap::new(),
            peer_cap,
            timeout,
        }
    }

    /// Feed one TP segment.
    ///
    /// Returns the reassembled message once all segments have arrived.
    ///
    /// # Errors
    ///
    /// [`WireError::Malformed`] for frames without a TP header or with an
    /// unaligned offset, [`WireError::ReassemblyOverflow`] when the source
    /// endpoint exceeds its buffer cap (the partial is dropped).
    pub fn feed(&mut self, message: Message, now: Instant) -> Result<Option<Message>> {
        if !message.message_type.is_tp() {
            return Ok(Some(message));
        }
        if message.payload.len() < TP_HEADER_SIZE {
            return Err(WireError::Malformed("TP segment without header".into()));
        }

        let mut header_bytes = &message.payload[..TP_HEADER_SIZE];
        let header = header_bytes.get_u32();
        let offset = header & 0xFFFF_FFF0;
        let more = header & 0x01 != 0;
        let data = message.payload.slice(TP_HEADER_SIZE..);
        if more && data.len() % TP_ALIGNMENT != 0 {
            return Err(WireError::Malformed(format!(
                "non-final TP segment length {} not aligned to {TP_ALIGNMENT}",
                data.len()
            )));
        }

        let key = ReassemblyKey {
            service: message.service,
            method: message.method,
            client: message.client,
            session: message.session,
            source: message.source,
        };

        let usage = self.peer_usage.entry(key.source).or_insert(0);
        if *usage + data.len() > self.peer_cap {
            let used = *usage;
            self.drop_partial(&key);
            if self.peer_usage.get(&key.source) == Some(&0) {
                self.peer_usage.remove(&key.source);
            }
            return Err(WireError::ReassemblyOverflow { used, cap: self.peer_cap });
        }
        *usage += data.len();

        let partial = self.partials.entry(key).or_insert_with(|| Partial {
            segments: BTreeMap::new(),
            total_len: None,
            buffered: 0,
            last_activity: now,
            template: {
                let mut template = message.clone();
                template.message_type = message.message_type.without_tp();
                template
            },
        });
        partial.last_activity = now;
        partial.buffered += data.len();
        if !more {
            partial.total_len = Some(offset as usize + data.len());
        }
        if let Some(replaced) = partial.segments.insert(offset, data) {
            partial.buffered -= replaced.len();
            if let Some(usage) = self.peer_usage.get_mut(&key.source) {
                *usage = usage.saturating_sub(replaced.len());
            }
        }

        if let Some(total) = partial.total_len {
            let mut covered = 0usize;
            for (&seg_offset, seg) in &partial.segments {
                if seg_offset as usize != covered {
                    return Ok(None); // gap
                }
                covered += seg.len();
            }
            if covered == total {
                let mut assembled = BytesMut::with_capacity(total);
                for seg in partial.segments.values() {
                    assembled.put_slice(seg);
                }
                let mut complete = partial.template.clone();
                complete.payload = assembled.freeze();
                self.drop_partial(&key);
                return Ok(Some(complete));
            }
        }
        Ok(None)
    }

    /// Drop partials that have been inactive longer than the timeout.
    ///
    /// Returns the number of dropped partial messages.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<ReassemblyKey> = self
            .partials
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_activity) >= self.timeout)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.drop_partial(key);
        }
        expired.len()
    }

    /// Bytes currently buffered for a source endpoint.
    pub fn buffered_for(&self, source: Option<Endpoint>) -> usize {
        self.peer_usage.get(&source).copied().unwrap_or(0)
    }

    fn drop_partial(&mut self, key: &ReassemblyKey) {
        if let Some(partial) = self.partials.remove(key) {
            if let Some(usage) = self.peer_usage.get_mut(&key.source) {
                *usage = usage.saturating_sub(partial.buffered);
                if *usage == 0 {
                    self.peer_usage.remove(&key.source);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veho_types::MessageType;

    fn large_message(len: usize) -> Message {
        let mut m = Message::request(0x1111, 0x0001, Bytes::from(vec![0xAB; len]));
        m.client = 0x0010;
        m.session = 0x0007;
        m
    }

    #[test]
    fn test_small_message_not_segmented() {
        let m = large_message(32);
        let segments = segment(&m, 1392);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0], m);
    }

    #[test]
    fn test_segment_and_reassemble_in_order() {
        let m = large_message(4000);
        let segments = segment(&m, 1392);
        assert!(segments.len() > 1);
        assert!(segments.iter().all(|s| s.message_type == MessageType::TpRequest));

        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        let mut result = None;
        for seg in segments {
            result = reassembler.feed(seg, now).expect("feed");
        }
        let complete = result.expect("complete");
        assert_eq!(complete.message_type, MessageType::Request);
        assert_eq!(complete.payload, m.payload);
        assert_eq!(reassembler.buffered_for(None), 0);
    }

    #[test]
    fn test_reassemble_out_of_order() {
        let m = large_message(5000);
        let mut segments = segment(&m, 1392);
        segments.reverse();

        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        let mut complete = None;
        for seg in segments {
            if let Some(done) = reassembler.feed(seg, now).expect("feed") {
                complete = Some(done);
            }
        }
        assert_eq!(complete.expect("complete").payload, m.payload);
    }

    #[test]
    fn test_missing_segment_expires() {
        let m = large_message(4000);
        let mut segments = segment(&m, 1392);
        segments.remove(1);

        let mut reassembler = Reassembler::new(DEFAULT_PEER_CAP, Duration::from_secs(5));
        let start = Instant::now();
        for seg in segments {
            assert!(reassembler.feed(seg, start).expect("feed").is_none());
        }
        assert_eq!(reassembler.expire(start + Duration::from_secs(1)), 0);
        assert_eq!(reassembler.expire(start + Duration::from_secs(6)), 1);
        assert_eq!(reassembler.buffered_for(None), 0);
    }

    #[test]
    fn test_peer_cap_enforced() {
        let m = large_message(4000);
        let segments = segment(&m, 1392);

        let mut reassembler = Reassembler::new(2000, Duration::from_secs(5));
        let now = Instant::now();
        let mut overflowed = false;
        for seg in segments {
            match reassembler.feed(seg, now) {
                Ok(_) => {}
                Err(WireError::ReassemblyOverflow { .. }) => {
                    overflowed = true;
                    break;
                }
                Err(other) => {
                    unreachable!("unexpected error: {other}");
                }
            }
        }
        assert!(overflowed);
        assert_eq!(reassembler.buffered_for(None), 0);
    }

    #[test]
    fn test_unaligned_nonfinal_segment_rejected() {
        let mut seg = large_message(0);
        seg.message_type = MessageType::TpRequest;
        let mut payload = BytesMut::new();
        payload.put_u32(0x01); // offset 0, more set
        payload.put_slice(&[0u8; 10]); // not a multiple of 16
        seg.payload = payload.freeze();

        let mut reassembler = Reassembler::default();
        let err = reassembler.feed(seg, Instant::now()).expect_err("unaligned");
        assert!(matches!(err, WireError::Malformed(_)));
    }
}
