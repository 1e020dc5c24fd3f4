//! SOME/IP-SD payload codec.
//!
//! An SD message is an ordinary SOME/IP frame (service `0xFFFF`, method
//! `0x8100`) whose payload is:
//!
//! ```text
//! flags:8 | reserved:24 | entries_length:32 | entries[] |
//! options_length:32 | options[]
//! ```
//!
//! Entries are fixed 16-byte records; options are TLV with a 16-bit length
//! that covers everything after the type octet. Each entry addresses up to
//! two contiguous runs in the options array.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use veho_types::{
    Endpoint, EventgroupId, InstanceId, MajorVersion, MinorVersion, ServiceId,
    TransportProtocol, Ttl,
};

use crate::{Result, WireError};

/// Reboot flag bit in the SD flags octet.
pub const FLAG_REBOOT: u8 = 0x80;
/// Unicast-capable flag bit in the SD flags octet.
pub const FLAG_UNICAST: u8 = 0x40;

/// L4 protocol identifier for TCP in endpoint options.
pub const L4_TCP: u8 = 0x06;
/// L4 protocol identifier for UDP in endpoint options.
pub const L4_UDP: u8 = 0x11;

const ENTRY_SIZE: usize = 16;

/// SD entry type octet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SdEntryType {
    /// Find a service (client side).
    FindService = 0x00,
    /// Offer a service; ttl 0 turns it into a stop-offer.
    OfferService = 0x01,
    /// Subscribe to an eventgroup; ttl 0 turns it into a stop-subscribe.
    SubscribeEventgroup = 0x06,
    /// Acknowledge a subscription; ttl 0 turns it into a nack.
    SubscribeEventgroupAck = 0x07,
}

impl SdEntryType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::FindService),
            0x01 => Some(Self::OfferService),
            0x06 => Some(Self::SubscribeEventgroup),
            0x07 => Some(Self::SubscribeEventgroupAck),
            _ => None,
        }
    }

    /// True for the service entry layout (minor version in the last word).
    pub fn is_service_entry(self) -> bool {
        matches!(self, Self::FindService | Self::OfferService)
    }
}

/// References into the options array: up to two contiguous runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptionRuns {
    /// Index of the first run.
    pub index1: u8,
    /// Length of the first run.
    pub count1: u8,
    /// Index of the second run.
    pub index2: u8,
    /// Length of the second run.
    pub count2: u8,
}

impl OptionRuns {
    /// A single run starting at `index` with `count` options.
    pub fn single(index: u8, count: u8) -> Self {
        Self { index1: index, count1: count, index2: 0, count2: 0 }
    }
}

/// One 16-byte SD entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SdEntry {
    /// Entry type.
    pub entry_type: SdEntryType,
    /// Option references.
    pub options: OptionRuns,
    /// Service id.
    pub service: ServiceId,
    /// Instance id.
    pub instance: InstanceId,
    /// Major version.
    pub major: MajorVersion,
    /// Time to live in seconds (24 bit; 0 encodes stop/nack).
    pub ttl: Ttl,
    /// Minor version (service entries only).
    pub minor: MinorVersion,
    /// Subscription counter (eventgroup entries only, 4 bit).
    pub counter: u8,
    /// Eventgroup id (eventgroup entries only).
    pub eventgroup: EventgroupId,
}

impl SdEntry {
    /// An OFFER entry (ttl 0 = stop-offer).
    pub fn offer(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
    ) -> Self {
        Self {
            entry_type: SdEntryType::OfferService,
            options: OptionRuns::default(),
            service,
            instance,
            major,
            ttl,
            minor,
            counter: 0,
            eventgroup: 0,
        }
    }

    /// A FIND entry.
    pub fn find(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
    ) -> Self {
        Self { entry_type: SdEntryType::FindService, ..Self::offer(service, instance, major, minor, ttl) }
    }

    /// A SUBSCRIBE_EVENTGROUP entry (ttl 0 = stop-subscribe).
    pub fn subscribe(
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        ttl: Ttl,
        counter: u8,
    ) -> Self {
        Self {
            entry_type: SdEntryType::SubscribeEventgroup,
            options: OptionRuns::default(),
            service,
            instance,
            major,
            ttl,
            minor: 0,
            counter,
            eventgroup,
        }
    }

    /// The SUBSCRIBE_EVENTGROUP_ACK answering `subscribe` (ttl 0 = nack).
    pub fn subscribe_ack(subscribe: &SdEntry, ttl: Ttl) -> Self {
        Self {
            entry_type: SdEntryType::SubscribeEventgroupAck,
            options: OptionRuns::default(),
            ttl,
            ..subscribe.clone()
        }
    }

    /// True when ttl 0 marks this entry as a stop/nack.
    pub fn is_stop(&self) -> bool {
        self.ttl == 0
    }

    fn encode_into(&self, dst: &mut BytesMut) {
        dst.put_u8(self.entry_type as u8);
        dst.put_u8(self.options.index1);
        dst.put_u8(self.options.index2);
        dst.put_u8((self.options.count1 << 4) | (self.options.count2 & 0x0F));
        dst.put_u16(self.service);
        dst.put_u16(self.instance);
        dst.put_u32((u32::from(self.major) << 24) | (self.ttl & 0x00FF_FFFF));
        if self.entry_type.is_service_entry() {
            dst.put_u32(self.minor);
        } else {
            dst.put_u32((u32::from(self.counter & 0x0F) << 16) | u32::from(self.eventgroup));
        }
    }

    fn decode(mut buf: &[u8]) -> Result<Self> {
        let type_raw = buf.get_u8();
        let entry_type = SdEntryType::from_u8(type_raw)
            .ok_or_else(|| WireError::Malformed(format!("unknown SD entry type {type_raw:#04x}")))?;
        let index1 = buf.get_u8();
        let index2 = buf.get_u8();
        let counts = buf.get_u8();
        let service = buf.get_u16();
        let instance = buf.get_u16();
        let major_ttl = buf.get_u32();
        let attribute = buf.get_u32();

        let (minor, counter, eventgroup) = if entry_type.is_service_entry() {
            (attribute, 0, 0)
        } else {
            (0, ((attribute >> 16) & 0x0F) as u8, (attribute & 0xFFFF) as u16)
        };

        Ok(Self {
            entry_type,
            options: OptionRuns {
                index1,
                count1: counts >> 4,
                index2,
                count2: counts & 0x0F,
            },
            service,
            instance,
            major: (major_ttl >> 24) as u8,
            ttl: major_ttl & 0x00FF_FFFF,
            minor,
            counter,
            eventgroup,
        })
    }
}

/// One SD option.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SdOption {
    /// Key/value configuration items.
    Configuration(Vec<(String, String)>),
    /// Load balancing priority and weight.
    LoadBalancing {
        /// Lower value wins.
        priority: u16,
        /// Relative weight among equal priorities.
        weight: u16,
    },
    /// Protection (alive counter + crc).
    Protection {
        /// Alive counter.
        alive_counter: u32,
        /// CRC over the protected fields.
        crc: u32,
    },
    /// IPv4 unicast endpoint.
    Ipv4Endpoint {
        /// Address.
        address: Ipv4Addr,
        /// L4 protocol ([`L4_TCP`] or [`L4_UDP`]).
        protocol: u8,
        /// Port.
        port: u16,
    },
    /// IPv6 unicast endpoint.
    Ipv6Endpoint {
        /// Address.
        address: Ipv6Addr,
        /// L4 protocol.
        protocol: u8,
        /// Port.
        port: u16,
    },
    /// IPv4 multicast endpoint.
    Ipv4Multicast {
        /// Group address.
        address: Ipv4Addr,
        /// L4 protocol (UDP).
        protocol: u8,
        /// Port.
        port: u16,
    },
    /// IPv6 multicast endpoint.
    Ipv6Multicast {
        /// Group address.
        address: Ipv6Addr,
        /// L4 protocol (UDP).
        protocol: u8,
        /// Port.
        port: u16,
    },
    /// Unrecognized option, preserved byte-exactly.
    Unknown {
        /// Type octet.
        option_type: u8,
        /// Everything after the type octet (including the reserved byte).
        data: Bytes,
    },
}

impl SdOption {
    /// An endpoint option matching the transport of `endpoint`.
    pub fn from_endpoint(endpoint: &Endpoint) -> Self {
        let protocol = match endpoint.protocol {
            TransportProtocol::Tcp => L4_TCP,
            _ => L4_UDP,
        };
        match endpoint.address {
            IpAddr::V4(address) if address.is_multicast() => {
                Self::Ipv4Multicast { address, protocol, port: endpoint.port }
            }
            IpAddr::V4(address) => Self::Ipv4Endpoint { address, protocol, port: endpoint.port },
            IpAddr::V6(address) if address.is_multicast() => {
                Self::Ipv6Multicast { address, protocol, port: endpoint.port }
            }
            IpAddr::V6(address) => Self::Ipv6Endpoint { address, protocol, port: endpoint.port },
        }
    }

    /// The transport endpoint described by this option, if it is one.
    pub fn to_endpoint(&self) -> Option<Endpoint> {
        match *self {
            Self::Ipv4Endpoint { address, protocol, port }
            | Self::Ipv4Multicast { address, protocol, port } => Some(Endpoint {
                address: IpAddr::V4(address),
                port,
                protocol: if protocol == L4_TCP {
                    TransportProtocol::Tcp
                } else {
                    TransportProtocol::Udp
                },
            }),
            Self::Ipv6Endpoint { address, protocol, port }
            | Self::Ipv6Multicast { address, protocol, port } => Some(Endpoint {
                address: IpAddr::V6(address),
                port,
                protocol: if protocol == L4_TCP {
                    TransportProtocol::Tcp
                } else {
                    TransportProtocol::Udp
                },
            }),
            _ => None,
        }
    }

    fn type_octet(&self) -> u8 {
        match self {
            Self::Configuration(_) => 0x01,
            Self::LoadBalancing { .. } => 0x02,
            Self::Protection { .. } => 0x03,
            Self::Ipv4Endpoint { .. } => 0x04,
            Self::Ipv6Endpoint { .. } => 0x06,
            Self::Ipv4Multicast { .. } => 0x14,
            Self::Ipv6Multicast { .. } => 0x16,
            Self::Unknown { option_type, .. } => *option_type,
        }
    }

    fn encode_into(&self, dst: &mut BytesMut) {
        match self {
            Self::Configuration(items) => {
                let mut body = BytesMut::new();
                body.put_u8(0x00); // reserved
                for (key, value) in items {
                    let item = format!("{key}={value}");
                    body.put_u8(item.len() as u8);
                    body.put_slice(item.as_bytes());
                }
                body.put_u8(0x00); // terminator
                dst.put_u16(body.len() as u16);
                dst.put_u8(self.type_octet());
                dst.put_slice(&body);
            }
            Self::LoadBalancing { priority, weight } => {
                dst.put_u16(5);
                dst.put_u8(self.type_octet());
                dst.put_u8(0x00);
                dst.put_u16(*priority);
                dst.put_u16(*weight);
            }
            Self::Protection { alive_counter, crc } => {
                dst.put_u16(9);
                dst.put_u8(self.type_octet());
                dst.put_u8(0x00);
                dst.put_u32(*alive_counter);
                dst.put_u32(*crc);
            }
            Self::Ipv4Endpoint { address, protocol, port }
            | Self::Ipv4Multicast { address, protocol, port } => {
                dst.put_u16(9);
                dst.put_u8(self.type_octet());
                dst.put_u8(0x00);
                dst.put_slice(&address.octets());
                dst.put_u8(0x00);
                dst.put_u8(*protocol);
                dst.put_u16(*port);
            }
            Self::Ipv6Endpoint { address, protocol, port }
            | Self::Ipv6Multicast { address, protocol, port } => {
                dst.put_u16(21);
                dst.put_u8(self.type_octet());
                dst.put_u8(0x00);
                dst.put_slice(&address.octets());
                dst.put_u8(0x00);
                dst.put_u8(*protocol);
                dst.put_u16(*port);
            }
            Self::Unknown { data, .. } => {
                dst.put_u16(data.len() as u16);
                dst.put_u8(self.type_octet());
                dst.put_slice(data);
            }
        }
    }

    fn decode(src: &[u8]) -> Result<(Self, usize)> {
        if src.len() < 3 {
            return Err(WireError::Truncated { needed: 3, available: src.len() });
        }
        let mut buf = src;
        let length = buf.get_u16() as usize;
        let option_type = buf.get_u8();
        if buf.len() < length {
            return Err(WireError::Truncated { needed: 3 + length, available: src.len() });
        }
        let body = &buf[..length];
        let consumed = 3 + length;

        let option = match option_type {
            0x01 => {
                if body.is_empty() {
                    return Err(WireError::Malformed("empty configuration option".into()));
                }
                let mut items = Vec::new();
                let mut rest = &body[1..]; // skip reserved
                loop {
                    if rest.is_empty() {
                        return Err(WireError::Malformed(
                            "configuration option missing terminator".into(),
                        ));
                    }
                    let item_len = rest[0] as usize;
                    rest = &rest[1..];
                    if item_len == 0 {
                        break;
                    }
                    if rest.len() < item_len {
                        return Err(WireError::Malformed("configuration item truncated".into()));
                    }
                    let item = String::from_utf8_lossy(&rest[..item_len]);
                    let (key, value) = match item.split_once('=') {
                        Some((k, v)) => (k.to_string(), v.to_string()),
                        None => (item.to_string(), String::new()),
                    };
                    items.push((key, value));
                    rest = &rest[item_len..];
                }
                Self::Configuration(items)
            }
            0x02 => {
                if length != 5 {
                    return Err(WireError::Malformed(format!(
                        "load balancing option length {length}, expected 5"
                    )));
                }
                let mut b = &body[1..];
                Self::LoadBalancing { priority: b.get_u16(), weight: b.get_u16() }
            }
            0x03 => {
                if length != 9 {
                    return Err(WireError::Malformed(format!(
                        "protection option length {length}, expected 9"
                    )));
                }
                let mut b = &body[1..];
                Self::Protection { alive_counter: b.get_u32(), crc: b.get_u32() }
            }
            0x04 | 0x14 => {
                if length != 9 {
                    return Err(WireError::Malformed(format!(
                        "IPv4 option length {length}, expected 9"
                    )));
                }
                let mut b = &body[1..];
                let mut octets = [0u8; 4];
                b.copy_to_slice(&mut octets);
                b.advance(1); // reserved
                let protocol = b.get_u8();
                let port = b.get_u16();
                let address = Ipv4Addr::from(octets);
                if option_type == 0x04 {
                    Self::Ipv4Endpoint { address, protocol, port }
                } else {
                    Self::Ipv4Multicast { address, protocol, port }
                }
            }
            0x06 | 0x16 => {
                if length != 21 {
                    return Err(WireError::Malformed(format!(
                        "IPv6 option length {length}, expected 21"
                    )));
                }
                let mut b = &body[1..];
                let mut octets = [0u8; 16];
                b.copy_to_slice(&mut octets);
                b.advance(1);
                let protocol = b.get_u8();
                let port = b.get_u16();
                let address = Ipv6Addr::from(octets);
                if option_type == 0x06 {
                    Self::Ipv6Endpoint { address, protocol, port }
                } else {
                    Self::Ipv6Multicast { address, protocol, port }
                }
            }
            other => Self::Unknown {
                option_type: other,
                data: Bytes::copy_from_slice(body),
            },
        };

        Ok((option, consumed))
    }
}

/// A decoded SOME/IP-SD payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SdPayload {
    /// Flags octet (see [`FLAG_REBOOT`], [`FLAG_UNICAST`]).
    pub flags: u8,
    /// Entries in wire order.
    pub entries: Vec<SdEntry>,
    /// Options in wire order.
    pub options: Vec<SdOption>,
}

impl SdPayload {
    /// A payload with the given flag bits and no entries.
    pub fn new(reboot: bool, unicast: bool) -> Self {
        let mut flags = 0;
        if reboot {
            flags |= FLAG_REBOOT;
        }
        if unicast {
            flags |= FLAG_UNICAST;
        }
        Self { flags, entries: Vec::new(), options: Vec::new() }
    }

    /// Reboot flag.
    pub fn reboot(&self) -> bool {
        self.flags & FLAG_REBOOT != 0
    }

    /// Unicast-capable flag.
    pub fn unicast(&self) -> bool {
        self.flags & FLAG_UNICAST != 0
    }

    /// Append an entry referencing a freshly appended run of options.
    pub fn push_entry_with_options(&mut self, mut entry: SdEntry, options: Vec<SdOption>) {
        if !options.is_empty() {
            entry.options = OptionRuns::single(self.options.len() as u8, options.len() as u8);
            self.options.extend(options);
        }
        self.entries.push(entry);
    }

    /// Encode the payload.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        dst.put_u8(self.flags);
        dst.put_u8(0);
        dst.put_u16(0); // reserved:24 total
        dst.put_u32((self.entries.len() * ENTRY_SIZE) as u32);
        for entry in &self.entries {
            entry.encode_into(&mut dst);
        }
        let mut options = BytesMut::new();
        for option in &self.options {
            option.encode_into(&mut options);
        }
        dst.put_u32(options.len() as u32);
        dst.put_slice(&options);
        dst.freeze()
    }

    /// Decode an SD payload (the SOME/IP payload of an SD frame).
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < 12 {
            return Err(WireError::Truncated { needed: 12, available: src.len() });
        }
        let mut buf = src;
        let flags = buf.get_u8();
        buf.advance(3); // reserved
        let entries_length = buf.get_u32() as usize;
        if entries_length % ENTRY_SIZE != 0 {
            return Err(WireError::Malformed(format!(
                "entries length {entries_length} not a multiple of {ENTRY_SIZE}"
            )));
        }
        if buf.len() < entries_length + 4 {
            return Err(WireError::Truncated {
                needed: 12 + entries_length + 4,
                available: src.len(),
            });
        }
        let mut entries = Vec::with_capacity(entries_length / ENTRY_SIZE);
        for chunk in buf[..entries_length].chunks_exact(ENTRY_SIZE) {
            entries.push(SdEntry::decode(chunk)?);
        }
        buf.advance(entries_length);
        let options_length = buf.get_u32() as usize;
        if buf.len() < options_length {
            return Err(WireError::Truncated {
                needed: 12 + entries_length + 4 + options_length,
                available: src.len(),
            });
        }
        let mut options = Vec::new();
        let mut opt_buf = &buf[..options_length];
        while !opt_buf.is_empty() {
            let (option, used) = SdOption::decode(opt_buf)?;
            options.push(option);
            opt_buf = &opt_buf[used..];
        }

        let payload = Self { flags, entries, options };
        for entry in &payload.entries {
            payload.resolve_options(entry)?;
        }
        Ok(payload)
    }

    /// Resolve the options referenced by `entry`, validating both runs.
    pub fn resolve_options(&self, entry: &SdEntry) -> Result<Vec<&SdOption>> {
        let mut resolved = Vec::new();
        for (index, count) in [
            (entry.options.index1, entry.options.count1),
            (entry.options.index2, entry.options.count2),
        ] {
            if count == 0 {
                continue;
            }
            let start = index as usize;
            let end = start + count as usize;
            if end > self.options.len() {
                return Err(WireError::InvalidOptionReference(format!(
                    "run [{start}, {end}) outside {} options",
                    self.options.len()
                )));
            }
            resolved.extend(&self.options[start..end]);
        }
        Ok(resolved)
    }

    /// The endpoints referenced by `entry` through endpoint options.
    pub fn resolve_endpoints(&self, entry: &SdEntry) -> Result<Vec<Endpoint>> {
        Ok(self
            .resolve_options(entry)?
            .into_iter()
            .filter_map(SdOption::to_endpoint)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_roundtrip() {
        let mut payload = SdPayload::new(true, true);
        payload.push_entry_with_options(
            SdEntry::offer(0x0001, 0x0001, 1, 0, 3),
            vec![SdOption::Ipv4Endpoint {
                address: Ipv4Addr::new(192, 168, 1, 9),
                protocol: L4_UDP,
                port: 30509,
            }],
        );
        let bytes = payload.encode();
        let decoded = SdPayload::decode(&bytes).expect("decode");
        assert_eq!(decoded, payload);
        assert_eq!(decoded.encode(), bytes);
        assert!(decoded.reboot());
        assert!(decoded.unicast());

        let endpoints = decoded.resolve_endpoints(&decoded.entries[0]).expect("options");
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].port, 30509);
        assert_eq!(endpoints[0].protocol, TransportProtocol::Udp);
    }

    #[test]
    fn test_entry_layout() {
        let mut payload = SdPayload::new(false, true);
        payload.entries.push(SdEntry::subscribe(0x1111, 0x2222, 0x0001, 2, 300, 5));
        let bytes = payload.encode();
        // 12 bytes SD header, then the entry.
        let entry = &bytes[12..28];
        assert_eq!(entry[0], 0x06);
        assert_eq!(&entry[4..8], &[0x11, 0x11, 0x22, 0x22]);
        // major 2, ttl 300
        assert_eq!(&entry[8..12], &[0x02, 0x00, 0x01, 0x2C]);
        // reserved, counter 5, eventgroup 1
        assert_eq!(&entry[12..16], &[0x00, 0x05, 0x00, 0x01]);
    }

    #[test]
    fn test_two_option_runs() {
        let mut payload = SdPayload::new(false, true);
        payload.options = vec![
            SdOption::Ipv4Endpoint {
                address: Ipv4Addr::new(10, 0, 0, 1),
                protocol: L4_TCP,
                port: 30510,
            },
            SdOption::Ipv4Endpoint {
                address: Ipv4Addr::new(10, 0, 0, 1),
                protocol: L4_UDP,
                port: 30509,
            },
        ];
        let mut entry = SdEntry::offer(0x0001, 0x0001, 1, 0, 3);
        entry.options = OptionRuns { index1: 0, count1: 1, index2: 1, count2: 1 };
        payload.entries.push(entry);

        let decoded = SdPayload::decode(&payload.encode()).expect("decode");
        let endpoints = decoded.resolve_endpoints(&decoded.entries[0]).expect("resolve");
        assert_eq!(endpoints.len(), 2);
        assert!(endpoints[0].is_reliable());
        assert!(!endpoints[1].is_reliable());
    }

    #[test]
    fn test_dangling_option_reference_rejected() {
        let mut payload = SdPayload::new(false, true);
        let mut entry = SdEntry::offer(0x0001, 0x0001, 1, 0, 3);
        entry.options = OptionRuns::single(2, 1);
        payload.entries.push(entry);
        let bytes = payload.encode();
        let err = SdPayload::decode(&bytes).expect_err("dangling reference");
        assert!(matches!(err, WireError::InvalidOptionReference(_)));
    }

    #[test]
    fn test_configuration_option_roundtrip() {
        let mut payload = SdPayload::new(false, true);
        payload.options.push(SdOption::Configuration(vec![
            ("name".to_string(), "veho".to_string()),
            ("rev".to_string(), "5".to_string()),
        ]));
        let decoded = SdPayload::decode(&payload.encode()).expect("decode");
        assert_eq!(decoded.options, payload.options);
    }

    #[test]
    fn test_unknown_option_preserved() {
        let mut payload = SdPayload::new(false, true);
        payload.options.push(SdOption::Unknown {
            option_type: 0x42,
            data: Bytes::from_static(&[0x00, 0xAA, 0xBB]),
        });
        let bytes = payload.encode();
        let decoded = SdPayload::decode(&bytes).expect("decode");
        assert_eq!(decoded, payload);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_stop_offer_is_ttl_zero() {
        let offer = SdEntry::offer(0x0001, 0x0001, 1, 0, 0);
        assert!(offer.is_stop());
        let ack = SdEntry::subscribe_ack(&SdEntry::subscribe(1, 1, 1, 1, 3, 0), 0);
        assert!(ack.is_stop());
        assert_eq!(ack.entry_type, SdEntryType::SubscribeEventgroupAck);
    }

    #[test]
    fn test_ipv6_endpoint_roundtrip() {
        let mut payload = SdPayload::new(false, true);
        payload.options.push(SdOption::Ipv6Endpoint {
            address: Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0x09),
            protocol: L4_TCP,
            port: 30510,
        });
        let decoded = SdPayload::decode(&payload.encode()).expect("decode");
        assert_eq!(decoded.options, payload.options);
    }
}
