//! Stream framing with magic-cookie resynchronization.
//!
//! On a stream transport the decoder extracts one SOME/IP frame at a time
//! using the declared length. When decoding fails, or a declared length
//! exceeds the per-transport ceiling, the decoder scans forward for the
//! next magic cookie, discards everything before and including it, and
//! resumes with the following frame.

use bytes::{Buf, BytesMut};

use veho_types::SOMEIP_HEADER_SIZE;
use veho_wire::{Message, WireError, MAGIC_COOKIE_CLIENT, MAGIC_COOKIE_SERVER};

/// Incremental decoder for one stream connection.
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: BytesMut,
    max_message_size: usize,
    resyncing: bool,
    dropped_bytes: u64,
}

impl StreamDecoder {
    /// A decoder enforcing the given message size ceiling.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_message_size,
            resyncing: false,
            dropped_bytes: 0,
        }
    }

    /// Append received bytes and decode every complete frame.
    ///
    /// Magic cookies are consumed silently; garbage triggers resync.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Message> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.resyncing && !self.try_resync() {
                return frames;
            }

            match Message::decode(&self.buffer) {
                Ok((message, consumed)) => {
                    if consumed > self.max_message_size {
                        self.enter_resync();
                        continue;
                    }
                    self.buffer.advance(consumed);
                    if !message.is_magic_cookie() {
                        frames.push(message);
                    }
                }
                Err(WireError::Truncated { needed, .. }) => {
                    if needed > self.max_message_size {
                        self.enter_resync();
                        continue;
                    }
                    return frames; // wait for more data
                }
                Err(_) => {
                    self.enter_resync();
                }
            }
        }
    }

    /// Total bytes discarded across all resynchronizations.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    fn enter_resync(&mut self) {
        if !self.resyncing {
            tracing::debug!(buffered = self.buffer.len(), "stream decoder lost sync");
            self.resyncing = true;
        }
    }

    /// Scan for a magic cookie; discard everything up to and including it.
    /// Returns true once sync is re-established.
    fn try_resync(&mut self) -> bool {
        let haystack = &self.buffer[..];
        if let Some(position) = find_cookie(haystack) {
            let discard = position + SOMEIP_HEADER_SIZE;
            self.dropped_bytes += discard as u64;
            self.buffer.advance(discard);
            self.resyncing = false;
            tracing::debug!(discarded = discard, "stream decoder resynchronized");
            return true;
        }
        // Keep one cookie length minus one byte: a cookie may be split
        // across reads.
        let keep = SOMEIP_HEADER_SIZE - 1;
        if self.buffer.len() > keep {
            let discard = self.buffer.len() - keep;
            self.dropped_bytes += discard as u64;
            self.buffer.advance(discard);
        }
        false
    }
}

fn find_cookie(haystack: &[u8]) -> Option<usize> {
    if haystack.len() < SOMEIP_HEADER_SIZE {
        return None;
    }
    (0..=haystack.len() - SOMEIP_HEADER_SIZE).find(|&i| {
        let window = &haystack[i..i + SOMEIP_HEADER_SIZE];
        window == MAGIC_COOKIE_CLIENT || window == MAGIC_COOKIE_SERVER
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(payload_len: usize) -> Message {
        let mut m = Message::request(0x1111, 0x3333, Bytes::from(vec![0x55; payload_len]));
        m.client = 0x0010;
        m.session = 0x0001;
        m
    }

    #[test]
    fn test_clean_stream_decodes_frames() {
        let mut decoder = StreamDecoder::new(4096);
        let a = frame(8);
        let b = frame(16);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&a.encode());
        wire.extend_from_slice(&b.encode());

        let frames = decoder.feed(&wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload.len(), 8);
        assert_eq!(frames[1].payload.len(), 16);
        assert_eq!(decoder.dropped_bytes(), 0);
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut decoder = StreamDecoder::new(4096);
        let a = frame(32);
        let wire = a.encode();
        assert!(decoder.feed(&wire[..10]).is_empty());
        let frames = decoder.feed(&wire[10..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], a);
    }

    #[test]
    fn test_garbage_then_cookie_then_frame() {
        // 17 bytes of garbage, then a client cookie, then one 32-byte frame.
        let mut decoder = StreamDecoder::new(4096);
        let valid = frame(16); // 16 header + 16 payload = 32 bytes
        assert_eq!(valid.encoded_len(), 32);

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&[0xEE; 17]);
        wire.extend_from_slice(&MAGIC_COOKIE_CLIENT);
        wire.extend_from_slice(&valid.encode());

        let frames = decoder.feed(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], valid);
        // 17 garbage bytes plus the cookie were discarded.
        assert_eq!(decoder.dropped_bytes(), 17 + 16);
    }

    #[test]
    fn test_cookie_between_frames_is_skipped() {
        let mut decoder = StreamDecoder::new(4096);
        let a = frame(4);
        let b = frame(8);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&a.encode());
        wire.extend_from_slice(&MAGIC_COOKIE_SERVER);
        wire.extend_from_slice(&b.encode());

        let frames = decoder.feed(&wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(decoder.dropped_bytes(), 0);
    }

    #[test]
    fn test_oversized_length_triggers_resync() {
        let mut decoder = StreamDecoder::new(64);
        // Header declaring a 1 MiB payload.
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&[0x11, 0x11, 0x33, 0x33]);
        wire.extend_from_slice(&(0x0010_0000u32).to_be_bytes());
        wire.extend_from_slice(&[0x00, 0x10, 0x00, 0x01, 0x01, 0x01, 0x00, 0x00]);
        wire.extend_from_slice(&MAGIC_COOKIE_CLIENT);
        let valid = frame(8);
        wire.extend_from_slice(&valid.encode());

        let frames = decoder.feed(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], valid);
        assert!(decoder.dropped_bytes() > 0);
    }

    #[test]
    fn test_cookie_split_across_reads() {
        let mut decoder = StreamDecoder::new(4096);
        let valid = frame(8);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&[0xEE; 5]);
        wire.extend_from_slice(&MAGIC_COOKIE_CLIENT);
        wire.extend_from_slice(&valid.encode());

        // Feed in slices that split the cookie.
        let mid = 5 + 7;
        assert!(decoder.feed(&wire[..mid]).is_empty());
        let frames = decoder.feed(&wire[mid..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], valid);
    }
}
