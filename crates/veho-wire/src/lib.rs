//! # veho-wire
//!
//! Bit-exact encoding and decoding of everything veho puts on a wire:
//!
//! - **SOME/IP frames** (Header Format v1) via [`message`]
//! - **SOME/IP-SD payloads** (entries and options) via [`sd`]
//! - **Local IPC command envelopes** via [`ipc`]
//! - **TP segmentation and reassembly** via [`tp`]
//!
//! All SOME/IP fields are big-endian. The IPC envelope is host-local and
//! uses little-endian framing fields. No serde on any of these paths: the
//! layouts are fixed by the protocol, not by us.

pub mod ipc;
pub mod message;
pub mod sd;
pub mod tp;

pub use message::{Message, MAGIC_COOKIE_CLIENT, MAGIC_COOKIE_SERVER};

/// Codec errors. Transports translate these into drop/resync decisions.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Fewer bytes available than the layout requires.
    #[error("truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the layout requires.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// The declared length contradicts the layout.
    #[error("malformed: {0}")]
    Malformed(String),

    /// Envelope start or end tag mismatch.
    #[error("envelope tag mismatch")]
    BadTag,

    /// Unassigned message type octet.
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    /// Protocol version other than 1.
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u8),

    /// Unassigned IPC command octet.
    #[error("unknown command {0:#04x}")]
    UnknownCommand(u8),

    /// A command would exceed the queue slot capacity.
    #[error("command size {size} exceeds maximum {max}")]
    MaxCommandSizeExceeded {
        /// Encoded command size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// An SD entry references an option outside the options array, or an
    /// option of an incompatible type.
    #[error("invalid option reference: {0}")]
    InvalidOptionReference(String),

    /// A message exceeds the configured maximum size.
    #[error("message size {size} exceeds maximum {max}")]
    MaxMessageSizeExceeded {
        /// Message size including header.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// TP reassembly exceeded the per-peer buffer cap.
    #[error("reassembly buffer full: {used} of {cap} bytes in use")]
    ReassemblyOverflow {
        /// Bytes currently buffered for the peer.
        used: usize,
        /// Per-peer cap.
        cap: usize,
    },
}

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, WireError>;
