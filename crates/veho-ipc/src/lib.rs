//! # veho-ipc
//!
//! The local message bus between the routing host and every application on
//! the same machine. The transport (Unix sockets carrying the tagged
//! command envelope) lives in `veho-endpoint`; this crate adds the bus
//! semantics:
//!
//! - registration with client id allocation (static from configuration,
//!   dynamic otherwise) and explicit rejection of collisions,
//! - ping/pong liveness with eviction of silent applications,
//! - bounded queues surfacing `WouldBlock` to senders,
//! - the well-known queue naming scheme.

pub mod host;
pub mod proxy;

pub use host::{HostConfig, HostEvent, IpcHost};
pub use proxy::{IpcProxy, ProxyConfig};

use std::path::{Path, PathBuf};

/// Queue name of the routing host.
pub const ROUTING_QUEUE_NAME: &str = "/vsomeip-0";

/// Errors of the IPC bus.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Transport failure underneath the bus.
    #[error(transparent)]
    Endpoint(#[from] veho_endpoint::EndpointError),

    /// Registration was rejected (client id collision or policy).
    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    /// The routing host did not answer within the deadline.
    #[error("routing host not responding")]
    HostUnavailable,

    /// The addressed client is not registered.
    #[error("client {0:#06x} not registered")]
    UnknownClient(veho_types::ClientId),
}

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, IpcError>;

/// Queue name of a client application: `/vsomeip-<pid>.<seq>`.
pub fn client_queue_name(pid: u32, seq: u32) -> String {
    format!("/vsomeip-{pid}.{seq}")
}

/// Filesystem path of a named queue under the base directory.
pub fn queue_path(base: &Path, queue_name: &str) -> PathBuf {
    base.join(queue_name.trim_start_matches('/'))
}

/// Default base directory for queue sockets.
pub fn default_base_dir() -> PathBuf {
    std::env::temp_dir()
}
