//! # veho-routing
//!
//! The routing core: authoritative service/subscription tables, message
//! dispatch between local applications and the network, session and client
//! id bookkeeping, and the public [`Runtime`]/[`Application`] facade.
//!
//! One process per host runs the [`host::RoutingHost`]; it owns every
//! external socket and the local IPC bus. All other processes attach as
//! proxies through [`Application`].

pub mod application;
pub mod host;
pub mod tables;

pub use application::{Application, Runtime};
pub use host::{HostOptions, RoutingHost};
pub use tables::{Provider, RoutingTables, ServiceRecord};

use veho_types::{ClientId, InstanceId, ServiceId};

/// Errors surfaced by the routing core's public API.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// The routing state rejects outbound traffic.
    #[error("routing not running")]
    NotRunning,

    /// Local queue backpressure; retry on the next send.
    #[error("would block")]
    WouldBlock,

    /// The addressed service instance is unknown.
    #[error("unknown service {0:#06x}.{1:#06x}")]
    UnknownService(ServiceId, InstanceId),

    /// An offer was rejected (older minor or foreign provider).
    #[error("offer rejected for {0:#06x}.{1:#06x}")]
    OfferRejected(ServiceId, InstanceId),

    /// The operation was denied by policy.
    #[error("permission denied")]
    PermissionDenied,

    /// No response arrived within the request deadline.
    #[error("request timed out")]
    Timeout,

    /// The addressed client is not registered.
    #[error("unknown client {0:#06x}")]
    UnknownClient(ClientId),

    /// Bus failure underneath.
    #[error(transparent)]
    Ipc(#[from] veho_ipc::IpcError),

    /// Transport failure underneath.
    #[error(transparent)]
    Endpoint(#[from] veho_endpoint::EndpointError),

    /// Codec failure.
    #[error(transparent)]
    Wire(#[from] veho_wire::WireError),

    /// Configuration rejected at startup.
    #[error(transparent)]
    Config(#[from] veho_config::ConfigError),

    /// The security policy source was rejected at startup.
    #[error(transparent)]
    Policy(#[from] veho_policy::PolicyError),

    /// The runtime or host task is gone.
    #[error("routing stopped")]
    Stopped,
}

/// Result type alias for routing operations.
pub type Result<T> = std::result::Result<T, RoutingError>;
