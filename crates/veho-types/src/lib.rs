//! # veho-types
//!
//! Shared identifier types, wire constants and state enums used across the
//! veho workspace. Everything here is plain data; protocol encoding lives in
//! `veho-wire` and behavior in the routing, discovery and endpoint crates.

pub mod endpoint;
pub mod message;
pub mod state;

pub use endpoint::{Endpoint, IpVersion, TransportProtocol};
pub use message::{EventKind, MessageType, ReturnCode};
pub use state::{ApplicationState, AvailabilityState, RoutingState, SubscriptionState};

/// Service identifier (16 bit, big-endian on the wire).
pub type ServiceId = u16;
/// Service instance identifier (16 bit).
pub type InstanceId = u16;
/// Method or event identifier (16 bit; events have the top bit set).
pub type MethodId = u16;
/// Event identifier (alias of [`MethodId`] with the top bit set).
pub type EventId = u16;
/// Eventgroup identifier (16 bit).
pub type EventgroupId = u16;
/// Client identifier, host-unique (16 bit).
pub type ClientId = u16;
/// Session identifier, per-client monotonic (16 bit, skips 0).
pub type SessionId = u16;
/// Interface major version (8 bit).
pub type MajorVersion = u8;
/// Interface minor version (32 bit).
pub type MinorVersion = u32;
/// Service discovery time-to-live in seconds (24 bit on the wire).
pub type Ttl = u32;

/// Wildcard service id.
pub const ANY_SERVICE: ServiceId = 0xFFFF;
/// Wildcard instance id.
pub const ANY_INSTANCE: InstanceId = 0xFFFF;
/// Wildcard method id.
pub const ANY_METHOD: MethodId = 0xFFFF;
/// Wildcard event id.
pub const ANY_EVENT: EventId = 0xFFFF;
/// Wildcard eventgroup id.
pub const ANY_EVENTGROUP: EventgroupId = 0xFFFF;
/// Wildcard major version.
pub const ANY_MAJOR: MajorVersion = 0xFF;
/// Wildcard minor version.
pub const ANY_MINOR: MinorVersion = 0xFFFF_FFFF;

/// Default major version for services that do not declare one.
pub const DEFAULT_MAJOR: MajorVersion = 0x00;
/// Default minor version for services that do not declare one.
pub const DEFAULT_MINOR: MinorVersion = 0x0000_0000;

/// SOME/IP protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Size of the full SOME/IP header in bytes.
pub const SOMEIP_HEADER_SIZE: usize = 16;
/// The `length` header field covers the 8 header bytes following it plus the
/// payload.
pub const SOMEIP_LENGTH_BASE: u32 = 8;

/// Service id of all SOME/IP-SD messages.
pub const SD_SERVICE_ID: ServiceId = 0xFFFF;
/// Method id of all SOME/IP-SD messages.
pub const SD_METHOD_ID: MethodId = 0x8100;
/// Instance id under which service discovery itself is addressed.
pub const SD_INSTANCE_ID: InstanceId = 0x0000;
/// Default SOME/IP-SD port.
pub const SD_DEFAULT_PORT: u16 = 30490;
/// Default SOME/IP-SD multicast group.
pub const SD_DEFAULT_MULTICAST: &str = "224.244.224.245";

/// Client id of the routing host itself.
pub const ROUTING_CLIENT_ID: ClientId = 0x0000;

/// The session counter value immediately after a wrap (0 is skipped).
pub const SESSION_ID_AFTER_WRAP: SessionId = 0x0001;

/// Events and selective events carry the top bit of the method id.
pub const EVENT_ID_FLAG: MethodId = 0x8000;

/// Returns true if the method id designates an event or field notification.
pub fn is_event_id(method: MethodId) -> bool {
    method & EVENT_ID_FLAG != 0
}

/// Advance a per-client session counter, skipping 0 on wrap.
///
/// Returns the next session id and whether the counter wrapped (callers flip
/// the reboot flag exactly on the wrap).
pub fn next_session_id(current: SessionId) -> (SessionId, bool) {
    if current == 0xFFFF {
        (SESSION_ID_AFTER_WRAP, true)
    } else {
        (current + 1, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_flag() {
        assert!(is_event_id(0x8001));
        assert!(is_event_id(0xFFFF));
        assert!(!is_event_id(0x7FFF));
        assert!(!is_event_id(0x0001));
    }

    #[test]
    fn test_session_wrap_skips_zero() {
        assert_eq!(next_session_id(1), (2, false));
        assert_eq!(next_session_id(0xFFFE), (0xFFFF, false));
        assert_eq!(next_session_id(0xFFFF), (1, true));
    }
}
