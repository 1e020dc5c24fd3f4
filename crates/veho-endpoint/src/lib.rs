//! # veho-endpoint
//!
//! The transport adapters of the middleware. Each adapter owns its sockets
//! and read/write loops and hides per-transport framing behind the same
//! shape: a handle with `send(peer, bytes, flush)` and a stream of
//! [`EndpointEvent`]s carrying decoded frames and connection transitions.
//!
//! Three variants:
//!
//! - [`udp::UdpEndpoint`]: one bound datagram socket shared by all peers,
//!   outbound batching up to an MTU budget with a coalescing flush timer,
//!   no connection state.
//! - [`tcp`]: per-peer stream connections with reconnect backoff, per-peer
//!   FIFO queues and magic-cookie resynchronization on the read side.
//! - [`local`]: host-local sockets carrying the IPC command envelope
//!   between routing host and applications, with peer credentials.

pub mod framing;
pub mod local;
pub mod packetizer;
pub mod tcp;
pub mod udp;

use veho_types::Endpoint;
use veho_wire::Message;

/// Transport errors surfaced to the routing core.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Local queue backpressure; the caller retries on the next send.
    #[error("would block")]
    WouldBlock,

    /// The endpoint was stopped; pending operations complete with this.
    #[error("cancelled")]
    Cancelled,

    /// The peer is not connected and cannot be reached right now.
    #[error("peer {0} not reachable")]
    NotReachable(Endpoint),

    /// Frame rejected before transmission.
    #[error(transparent)]
    Wire(#[from] veho_wire::WireError),
}

/// Result type alias for endpoint operations.
pub type Result<T> = std::result::Result<T, EndpointError>;

/// What a transport reports upward.
#[derive(Debug)]
pub enum EndpointEvent {
    /// A decoded SOME/IP frame with source/target metadata filled in.
    Frame(Message),
    /// A reliable connection reached CONNECTED.
    PeerUp(Endpoint),
    /// A reliable connection was lost; subscriptions referencing the
    /// endpoint must be invalidated.
    PeerDown(Endpoint),
}
