//! Local IPC command envelope.
//!
//! Commands between applications and the routing host travel in a tagged
//! envelope over the host-local socket:
//!
//! ```text
//! START_TAG:32 | sender_client_id:32 | command:8 | payload_size:32 |
//! payload[payload_size] | END_TAG:32
//! ```
//!
//! The framing fields (`sender_client_id`, `payload_size`) are little-endian:
//! the envelope never leaves the host. SOME/IP frames embedded in a
//! `SomeIpMessage` payload keep their big-endian wire form untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use veho_types::{
    ClientId, EventgroupId, InstanceId, MajorVersion, MinorVersion, RoutingState, ServiceId, Ttl,
};

use crate::{Result, WireError};

/// Envelope start tag.
pub const START_TAG: [u8; 4] = [0xAB, 0xAB, 0xAB, 0xAB];
/// Envelope end tag.
pub const END_TAG: [u8; 4] = [0xBA, 0xBA, 0xBA, 0xBA];

/// Fixed envelope overhead: tags + sender + command + payload size.
pub const ENVELOPE_OVERHEAD: usize = 4 + 4 + 1 + 4 + 4;

/// Default maximum encoded command size (64 KiB).
pub const DEFAULT_MAX_COMMAND_SIZE: usize = 64 * 1024;

/// Flag bit marking an embedded frame as reliable.
const FLAG_RELIABLE: u8 = 0x01;
/// Flag bit marking an embedded frame as an initial field replay.
const FLAG_INITIAL: u8 = 0x02;

/// A command on the local IPC bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Application announces itself and its private queue name.
    RegisterApplication {
        /// Application name (used for static client id allocation).
        name: String,
        /// Name of the application's private queue.
        queue_name: String,
    },
    /// Host confirms a registration and assigns the client id.
    RegisterApplicationAck {
        /// Allocated client id.
        client: ClientId,
    },
    /// Application leaves the bus.
    DeregisterApplication,
    /// Liveness probe from the host.
    Ping,
    /// Liveness answer from the application.
    Pong,
    /// Application starts offering a service instance.
    OfferService {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Major version.
        major: MajorVersion,
        /// Minor version.
        minor: MinorVersion,
    },
    /// Application withdraws an offer.
    StopOfferService {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Major version.
        major: MajorVersion,
        /// Minor version.
        minor: MinorVersion,
    },
    /// Application requests availability of a service instance.
    RequestService {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Requested major version.
        major: MajorVersion,
        /// Requested minor version.
        minor: MinorVersion,
    },
    /// Application releases a requested service.
    ReleaseService {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
    },
    /// Application subscribes to an eventgroup.
    Subscribe {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Eventgroup id.
        eventgroup: EventgroupId,
        /// Major version.
        major: MajorVersion,
        /// Subscription ttl in seconds.
        ttl: Ttl,
    },
    /// Application drops an eventgroup subscription.
    Unsubscribe {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Eventgroup id.
        eventgroup: EventgroupId,
    },
    /// Host confirms a subscription.
    SubscribeAck {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Eventgroup id.
        eventgroup: EventgroupId,
    },
    /// Host rejects a subscription.
    SubscribeNack {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Eventgroup id.
        eventgroup: EventgroupId,
    },
    /// A SOME/IP frame in transit between application and host.
    SomeIpMessage {
        /// Addressed instance.
        instance: InstanceId,
        /// Frame travels on the reliable transport.
        reliable: bool,
        /// Frame replays a cached field to a new subscriber.
        initial: bool,
        /// The encoded SOME/IP frame, big-endian as on the network.
        frame: Bytes,
    },
    /// A field value published by the offering application.
    SomeIpField {
        /// Addressed instance.
        instance: InstanceId,
        /// The encoded SOME/IP notification carrying the field value.
        frame: Bytes,
    },
    /// Routing state change requested by the embedding process.
    SetRoutingState {
        /// Requested state.
        state: RoutingState,
    },
}

impl Command {
    /// The command identifier octet.
    pub fn id(&self) -> u8 {
        match self {
            Self::RegisterApplication { .. } => 0x00,
            Self::RegisterApplicationAck { .. } => 0x01,
            Self::DeregisterApplication => 0x02,
            Self::Ping => 0x03,
            Self::Pong => 0x04,
            Self::OfferService { .. } => 0x10,
            Self::StopOfferService { .. } => 0x11,
            Self::RequestService { .. } => 0x12,
            Self::ReleaseService { .. } => 0x13,
            Self::Subscribe { .. } => 0x14,
            Self::Unsubscribe { .. } => 0x15,
            Self::SubscribeAck { .. } => 0x16,
            Self::SubscribeNack { .. } => 0x17,
            Self::SomeIpMessage { .. } => 0x20,
            Self::SomeIpField { .. } => 0x21,
            Self::SetRoutingState { .. } => 0x30,
        }
    }

    fn encode_payload(&self, dst: &mut BytesMut) {
        match self {
            Self::RegisterApplication { name, queue_name } => {
                dst.put_u16_le(name.len() as u16);
                dst.put_slice(name.as_bytes());
                dst.put_u16_le(queue_name.len() as u16);
                dst.put_slice(queue_name.as_bytes());
            }
            Self::RegisterApplicationAck { client } => dst.put_u16_le(*client),
            Self::DeregisterApplication | Self::Ping | Self::Pong => {}
            Self::OfferService { service, instance, major, minor }
            | Self::StopOfferService { service, instance, major, minor }
            | Self::RequestService { service, instance, major, minor } => {
                dst.put_u16_le(*service);
                dst.put_u16_le(*instance);
                dst.put_u8(*major);
                dst.put_u32_le(*minor);
            }
            Self::ReleaseService { service, instance } => {
                dst.put_u16_le(*service);
                dst.put_u16_le(*instance);
            }
            Self::Subscribe { service, instance, eventgroup, major, ttl } => {
                dst.put_u16_le(*service);
                dst.put_u16_le(*instance);
                dst.put_u16_le(*eventgroup);
                dst.put_u8(*major);
                dst.put_u32_le(*ttl);
            }
            Self::Unsubscribe { service, instance, eventgroup }
            | Self::SubscribeAck { service, instance, eventgroup }
            | Self::SubscribeNack { service, instance, eventgroup } => {
                dst.put_u16_le(*service);
                dst.put_u16_le(*instance);
                dst.put_u16_le(*eventgroup);
            }
            Self::SomeIpMessage { instance, reliable, initial, frame } => {
                dst.put_u16_le(*instance);
                let mut flags = 0;
                if *reliable {
                    flags |= FLAG_RELIABLE;
                }
                if *initial {
                    flags |= FLAG_INITIAL;
                }
                dst.put_u8(flags);
                dst.put_slice(frame);
            }
            Self::SomeIpField { instance, frame } => {
                dst.put_u16_le(*instance);
                dst.put_slice(frame);
            }
            Self::SetRoutingState { state } => dst.put_u8(routing_state_octet(*state)),
        }
    }

    fn decode_payload(id: u8, mut buf: &[u8]) -> Result<Self> {
        let need = |n: usize, buf: &[u8]| -> Result<()> {
            if buf.len() < n {
                Err(WireError::Truncated { needed: n, available: buf.len() })
            } else {
                Ok(())
            }
        };
        let command = match id {
            0x00 => {
                need(2, buf)?;
                let name_len = buf.get_u16_le() as usize;
                need(name_len, buf)?;
                let name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
                buf.advance(name_len);
                need(2, buf)?;
                let queue_len = buf.get_u16_le() as usize;
                need(queue_len, buf)?;
                let queue_name = String::from_utf8_lossy(&buf[..queue_len]).into_owned();
                Self::RegisterApplication { name, queue_name }
            }
            0x01 => {
                need(2, buf)?;
                Self::RegisterApplicationAck { client: buf.get_u16_le() }
            }
            0x02 => Self::DeregisterApplication,
            0x03 => Self::Ping,
            0x04 => Self::Pong,
            0x10 | 0x11 | 0x12 => {
                need(9, buf)?;
                let service = buf.get_u16_le();
                let instance = buf.get_u16_le();
                let major = buf.get_u8();
                let minor = buf.get_u32_le();
                match id {
                    0x10 => Self::OfferService { service, instance, major, minor },
                    0x11 => Self::StopOfferService { service, instance, major, minor },
                    _ => Self::RequestService { service, instance, major, minor },
                }
            }
            0x13 => {
                need(4, buf)?;
                Self::ReleaseService { service: buf.get_u16_le(), instance: buf.get_u16_le() }
            }
            0x14 => {
                need(11, buf)?;
                Self::Subscribe {
                    service: buf.get_u16_le(),
                    instance: buf.get_u16_le(),
                    eventgroup: buf.get_u16_le(),
                    major: buf.get_u8(),
                    ttl: buf.get_u32_le(),
                }
            }
            0x15 | 0x16 | 0x17 => {
                need(6, buf)?;
                let service = buf.get_u16_le();
                let instance = buf.get_u16_le();
                let eventgroup = buf.get_u16_le();
                match id {
                    0x15 => Self::Unsubscribe { service, instance, eventgroup },
                    0x16 => Self::SubscribeAck { service, instance, eventgroup },
                    _ => Self::SubscribeNack { service, instance, eventgroup },
                }
            }
            0x20 => {
                need(3, buf)?;
                let instance = buf.get_u16_le();
                let flags = buf.get_u8();
                Self::SomeIpMessage {
                    instance,
                    reliable: flags & FLAG_RELIABLE != 0,
                    initial: flags & FLAG_INITIAL != 0,
                    frame: Bytes::copy_from_slice(buf),
                }
            }
            0x21 => {
                need(2, buf)?;
                let instance = buf.get_u16_le();
                Self::SomeIpField { instance, frame: Bytes::copy_from_slice(buf) }
            }
            0x30 => {
                need(1, buf)?;
                Self::SetRoutingState { state: routing_state_from_octet(buf.get_u8())? }
            }
            other => return Err(WireError::UnknownCommand(other)),
        };
        Ok(command)
    }
}

fn routing_state_octet(state: RoutingState) -> u8 {
    match state {
        RoutingState::Running => 0x00,
        RoutingState::Suspended => 0x01,
        RoutingState::Resumed => 0x02,
        RoutingState::Diagnosis => 0x03,
        RoutingState::Shutdown => 0x04,
    }
}

fn routing_state_from_octet(octet: u8) -> Result<RoutingState> {
    match octet {
        0x00 => Ok(RoutingState::Running),
        0x01 => Ok(RoutingState::Suspended),
        0x02 => Ok(RoutingState::Resumed),
        0x03 => Ok(RoutingState::Diagnosis),
        0x04 => Ok(RoutingState::Shutdown),
        other => Err(WireError::Malformed(format!("unknown routing state {other:#04x}"))),
    }
}

/// Encode `command` from `sender` into one envelope.
///
/// # Errors
///
/// [`WireError::MaxCommandSizeExceeded`] when the envelope would exceed
/// `max_size`.
pub fn encode_envelope(sender: ClientId, command: &Command, max_size: usize) -> Result<Bytes> {
    let mut payload = BytesMut::new();
    command.encode_payload(&mut payload);

    let total = ENVELOPE_OVERHEAD + payload.len();
    if total > max_size {
        return Err(WireError::MaxCommandSizeExceeded { size: total, max: max_size });
    }

    let mut dst = BytesMut::with_capacity(total);
    dst.put_slice(&START_TAG);
    dst.put_u32_le(u32::from(sender));
    dst.put_u8(command.id());
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(&payload);
    dst.put_slice(&END_TAG);
    Ok(dst.freeze())
}

/// Decode one envelope from the front of `src`.
///
/// Returns sender, command and bytes consumed. [`WireError::Truncated`]
/// means more stream data is needed; [`WireError::BadTag`] means the stream
/// is corrupt and the connection must be dropped.
pub fn decode_envelope(src: &[u8]) -> Result<(ClientId, Command, usize)> {
    if src.len() < ENVELOPE_OVERHEAD {
        return Err(WireError::Truncated { needed: ENVELOPE_OVERHEAD, available: src.len() });
    }
    if src[0..4] != START_TAG {
        return Err(WireError::BadTag);
    }
    let mut buf = &src[4..];
    let sender = buf.get_u32_le();
    let id = buf.get_u8();
    let payload_size = buf.get_u32_le() as usize;
    let total = ENVELOPE_OVERHEAD + payload_size;
    if src.len() < total {
        return Err(WireError::Truncated { needed: total, available: src.len() });
    }
    let payload = &src[13..13 + payload_size];
    if src[total - 4..total] != END_TAG {
        return Err(WireError::BadTag);
    }
    let command = Command::decode_payload(id, payload)?;
    Ok((sender as ClientId, command, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(command: Command) {
        let bytes = encode_envelope(0x1234, &command, DEFAULT_MAX_COMMAND_SIZE).expect("encode");
        let (sender, decoded, consumed) = decode_envelope(&bytes).expect("decode");
        assert_eq!(sender, 0x1234);
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_command_roundtrips() {
        roundtrip(Command::RegisterApplication {
            name: "hello_client".to_string(),
            queue_name: "/vsomeip-107.0".to_string(),
        });
        roundtrip(Command::RegisterApplicationAck { client: 0x0101 });
        roundtrip(Command::DeregisterApplication);
        roundtrip(Command::Ping);
        roundtrip(Command::Pong);
        roundtrip(Command::OfferService { service: 0x1111, instance: 0x2222, major: 1, minor: 0 });
        roundtrip(Command::StopOfferService {
            service: 0x1111,
            instance: 0x2222,
            major: 1,
            minor: 0,
        });
        roundtrip(Command::RequestService {
            service: 0x1111,
            instance: 0x2222,
            major: 0xFF,
            minor: 0xFFFF_FFFF,
        });
        roundtrip(Command::ReleaseService { service: 0x1111, instance: 0x2222 });
        roundtrip(Command::Subscribe {
            service: 0x1111,
            instance: 0x2222,
            eventgroup: 0x0001,
            major: 1,
            ttl: 0xFFFFFF,
        });
        roundtrip(Command::Unsubscribe { service: 1, instance: 2, eventgroup: 3 });
        roundtrip(Command::SubscribeAck { service: 1, instance: 2, eventgroup: 3 });
        roundtrip(Command::SubscribeNack { service: 1, instance: 2, eventgroup: 3 });
        roundtrip(Command::SomeIpMessage {
            instance: 0x2222,
            reliable: true,
            initial: false,
            frame: Bytes::from_static(&[0x11; 24]),
        });
        roundtrip(Command::SomeIpField { instance: 0x2222, frame: Bytes::from_static(&[0x22; 20]) });
        roundtrip(Command::SetRoutingState { state: RoutingState::Suspended });
    }

    #[test]
    fn test_envelope_layout() {
        let bytes = encode_envelope(0x0010, &Command::Ping, DEFAULT_MAX_COMMAND_SIZE)
            .expect("encode");
        assert_eq!(&bytes[0..4], &START_TAG);
        assert_eq!(&bytes[4..8], &[0x10, 0x00, 0x00, 0x00]);
        assert_eq!(bytes[8], 0x03);
        assert_eq!(&bytes[9..13], &[0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&bytes[13..17], &END_TAG);
    }

    #[test]
    fn test_bad_tags_rejected() {
        let mut bytes = BytesMut::from(
            &encode_envelope(1, &Command::Ping, DEFAULT_MAX_COMMAND_SIZE).expect("encode")[..],
        );
        bytes[0] = 0x00;
        assert!(matches!(decode_envelope(&bytes), Err(WireError::BadTag)));

        let mut bytes = BytesMut::from(
            &encode_envelope(1, &Command::Ping, DEFAULT_MAX_COMMAND_SIZE).expect("encode")[..],
        );
        let last = bytes.len() - 1;
        bytes[last] = 0x00;
        assert!(matches!(decode_envelope(&bytes), Err(WireError::BadTag)));
    }

    #[test]
    fn test_truncated_needs_more_data() {
        let bytes = encode_envelope(
            1,
            &Command::SomeIpMessage {
                instance: 1,
                reliable: false,
                initial: false,
                frame: Bytes::from_static(&[0u8; 32]),
            },
            DEFAULT_MAX_COMMAND_SIZE,
        )
        .expect("encode");
        let err = decode_envelope(&bytes[..bytes.len() / 2]).expect_err("partial");
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn test_max_command_size_enforced() {
        let command = Command::SomeIpMessage {
            instance: 1,
            reliable: false,
            initial: false,
            frame: Bytes::from(vec![0u8; 256]),
        };
        let err = encode_envelope(1, &command, 128).expect_err("too large");
        assert!(matches!(err, WireError::MaxCommandSizeExceeded { .. }));
    }

    #[test]
    fn test_back_to_back_envelopes() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&encode_envelope(1, &Command::Ping, 1024).expect("encode"));
        stream.extend_from_slice(&encode_envelope(1, &Command::Pong, 1024).expect("encode"));
        let (_, first, used) = decode_envelope(&stream).expect("first");
        assert_eq!(first, Command::Ping);
        let (_, second, used2) = decode_envelope(&stream[used..]).expect("second");
        assert_eq!(second, Command::Pong);
        assert_eq!(used + used2, stream.len());
    }
}
