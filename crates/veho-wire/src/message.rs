//! SOME/IP frame codec.
//!
//! ## Wire format
//!
//! ```text
//! service_id:16 | method_id:16 | length:32 |
//! client_id:16 | session_id:16 | protocol_version:8 | interface_version:8 |
//! message_type:8 | return_code:8 | payload[length - 8]
//! ```
//!
//! All fields big-endian. `length` covers the eight header bytes after the
//! length field plus the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use veho_types::{
    ClientId, Endpoint, InstanceId, MajorVersion, MessageType, MethodId, ReturnCode, ServiceId,
    SessionId, PROTOCOL_VERSION, SOMEIP_HEADER_SIZE, SOMEIP_LENGTH_BASE,
};

use crate::{Result, WireError};

/// Resynchronization frame sent by clients on stream transports.
pub const MAGIC_COOKIE_CLIENT: [u8; 16] = [
    0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x01, 0x01,
    0x00,
];

/// Resynchronization frame sent by servers on stream transports.
pub const MAGIC_COOKIE_SERVER: [u8; 16] = [
    0xFF, 0xFF, 0x80, 0x00, 0x00, 0x00, 0x00, 0x08, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x01, 0x02,
    0x00,
];

/// A decoded SOME/IP frame plus its routing attributes.
///
/// The wire fields round-trip bit-exactly through [`Message::encode`] and
/// [`Message::decode`]. The routing attributes (`instance`, `is_reliable`,
/// `is_initial`, `source`, `target`) never appear on the network; they travel
/// in the IPC envelope or are derived from the receiving socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Service id.
    pub service: ServiceId,
    /// Method or event id.
    pub method: MethodId,
    /// Client id of the sender.
    pub client: ClientId,
    /// Session id of the sender.
    pub session: SessionId,
    /// Interface (major) version of the addressed service.
    pub interface_version: MajorVersion,
    /// Message type octet.
    pub message_type: MessageType,
    /// Return code octet.
    pub return_code: ReturnCode,
    /// Payload bytes, immutable once published.
    pub payload: Bytes,

    /// Instance the message addresses (not on the wire).
    pub instance: InstanceId,
    /// Whether the message travels on the reliable transport.
    pub is_reliable: bool,
    /// Marks the replay of a cached field value to a new subscriber.
    pub is_initial: bool,
    /// Endpoint the message arrived from, when received.
    pub source: Option<Endpoint>,
    /// Endpoint the message was addressed to, when received.
    pub target: Option<Endpoint>,
}

impl Message {
    /// A REQUEST with empty routing attributes.
    pub fn request(service: ServiceId, method: MethodId, payload: Bytes) -> Self {
        Self {
            service,
            method,
            client: 0,
            session: 0,
            interface_version: PROTOCOL_VERSION,
            message_type: MessageType::Request,
            return_code: ReturnCode::Ok,
            payload,
            instance: 0,
            is_reliable: false,
            is_initial: false,
            source: None,
            target: None,
        }
    }

    /// A NOTIFICATION for an event id.
    pub fn notification(service: ServiceId, event: MethodId, payload: Bytes) -> Self {
        Self {
            message_type: MessageType::Notification,
            ..Self::request(service, event, payload)
        }
    }

    /// The RESPONSE answering `request`, with the given payload.
    pub fn response_to(request: &Message, payload: Bytes) -> Self {
        Self {
            service: request.service,
            method: request.method,
            client: request.client,
            session: request.session,
            interface_version: request.interface_version,
            message_type: MessageType::Response,
            return_code: ReturnCode::Ok,
            payload,
            instance: request.instance,
            is_reliable: request.is_reliable,
            is_initial: false,
            source: None,
            target: request.source,
        }
    }

    /// The ERROR answering `request`, with the given return code.
    pub fn error_to(request: &Message, return_code: ReturnCode) -> Self {
        Self {
            message_type: MessageType::Error,
            return_code,
            payload: Bytes::new(),
            ..Self::response_to(request, Bytes::new())
        }
    }

    /// Message id `(service, method)`.
    pub fn message_id(&self) -> (ServiceId, MethodId) {
        (self.service, self.method)
    }

    /// Request id `(client, session)`.
    pub fn request_id(&self) -> (ClientId, SessionId) {
        (self.client, self.session)
    }

    /// The wire `length` field value for this message.
    pub fn wire_length(&self) -> u32 {
        SOMEIP_LENGTH_BASE + self.payload.len() as u32
    }

    /// Total encoded size including the full header.
    pub fn encoded_len(&self) -> usize {
        SOMEIP_HEADER_SIZE + self.payload.len()
    }

    /// Append the encoded frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u16(self.service);
        dst.put_u16(self.method);
        dst.put_u32(self.wire_length());
        dst.put_u16(self.client);
        dst.put_u16(self.session);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(self.interface_version);
        dst.put_u8(self.message_type as u8);
        dst.put_u8(self.return_code as u8);
        dst.put_slice(&self.payload);
    }

    /// Encode the frame into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut dst);
        dst.freeze()
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns the message and the number of bytes consumed; a datagram
    /// carrying several concatenated frames is decoded by repeated calls.
    ///
    /// # Errors
    ///
    /// [`WireError::Truncated`] when `src` holds less than the declared
    /// frame, [`WireError::Malformed`] when the length field undercuts the
    /// header, [`WireError::UnsupportedProtocolVersion`] and
    /// [`WireError::UnknownMessageType`] for bad octets.
    pub fn decode(src: &[u8]) -> Result<(Self, usize)> {
        if src.len() < SOMEIP_HEADER_SIZE {
            return Err(WireError::Truncated {
                needed: SOMEIP_HEADER_SIZE,
                available: src.len(),
            });
        }
        let mut buf = src;
        let service = buf.get_u16();
        let method = buf.get_u16();
        let length = buf.get_u32();
        if length < SOMEIP_LENGTH_BASE {
            return Err(WireError::Malformed(format!(
                "length field {length} below minimum {SOMEIP_LENGTH_BASE}"
            )));
        }
        let total = 8 + length as usize;
        if src.len() < total {
            return Err(WireError::Truncated {
                needed: total,
                available: src.len(),
            });
        }
        let client = buf.get_u16();
        let session = buf.get_u16();
        let protocol_version = buf.get_u8();
        if protocol_version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedProtocolVersion(protocol_version));
        }
        let interface_version = buf.get_u8();
        let message_type_raw = buf.get_u8();
        let message_type = MessageType::from_u8(message_type_raw)
            .ok_or(WireError::UnknownMessageType(message_type_raw))?;
        let return_code = ReturnCode::from_u8(buf.get_u8());
        let payload = Bytes::copy_from_slice(&src[SOMEIP_HEADER_SIZE..total]);

        Ok((
            Self {
                service,
                method,
                client,
                session,
                interface_version,
                message_type,
                return_code,
                payload,
                instance: 0,
                is_reliable: false,
                is_initial: false,
                source: None,
                target: None,
            },
            total,
        ))
    }

    /// True if the encoded form equals one of the magic cookies.
    pub fn is_magic_cookie(&self) -> bool {
        self.service == 0xFFFF
            && (self.method == 0x0000 || self.method == 0x8000)
            && self.client == 0xDEAD
            && self.session == 0xBEEF
            && self.payload.is_empty()
    }
}
