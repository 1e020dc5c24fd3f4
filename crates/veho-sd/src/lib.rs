//! # veho-sd
//!
//! SOME/IP service discovery: the offer/find state machines announcing and
//! locating services, the eventgroup subscription state machine, reboot
//! detection and the runtime task tying them to timers and the SD socket.
//!
//! The state machines are plain enums with explicit transition functions;
//! every transition returns the actions to perform. Timers are not an
//! action: they are derived from the state via `next_wakeup`. This keeps
//! the protocol logic synchronous and testable; only the
//! [`runtime::ServiceDiscovery`] task touches sockets and clocks.

pub mod fsm;
pub mod reboot;
pub mod runtime;
pub mod subscription;

pub use fsm::{FindFsm, OfferFsm, SdAction};
pub use reboot::{RebootTracker, SessionSender};
pub use runtime::{SdCommand, SdEvent, SdHandle, SdRuntimeConfig, ServiceDiscovery};
pub use subscription::{SubscribeAction, SubscribeConfig, SubscriptionFsm};

use std::time::Duration;

/// Timing parameters of one discovery domain (from the `service-discovery`
/// configuration section).
#[derive(Clone, Debug)]
pub struct SdTiming {
    /// Lower bound of the random delay before the first offer/find.
    pub initial_delay_min: Duration,
    /// Upper bound of the random delay before the first offer/find.
    pub initial_delay_max: Duration,
    /// Base delay of the repetition phase, doubled each run.
    pub repetition_base_delay: Duration,
    /// Number of repetition runs.
    pub repetition_max: u8,
    /// Period of the cyclic announce phase.
    pub cyclic_offer_delay: Duration,
    /// TTL announced in offer entries (seconds).
    pub ttl: u32,
    /// Lower bound of the delay before answering a multicast find.
    pub request_response_delay_min: Duration,
    /// Upper bound of the delay before answering a multicast find.
    pub request_response_delay_max: Duration,
}

impl Default for SdTiming {
    fn default() -> Self {
        Self {
            initial_delay_min: Duration::ZERO,
            initial_delay_max: Duration::from_millis(3000),
            repetition_base_delay: Duration::from_millis(10),
            repetition_max: 3,
            cyclic_offer_delay: Duration::from_millis(1000),
            ttl: 0xFFFFFF,
            request_response_delay_min: Duration::ZERO,
            request_response_delay_max: Duration::from_millis(1500),
        }
    }
}

/// Errors of the discovery subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SdError {
    /// The SD socket failed.
    #[error(transparent)]
    Endpoint(#[from] veho_endpoint::EndpointError),

    /// An inbound SD payload could not be decoded.
    #[error(transparent)]
    Wire(#[from] veho_wire::WireError),

    /// The runtime task is gone.
    #[error("service discovery stopped")]
    Stopped,
}

/// Result type alias for discovery operations.
pub type Result<T> = std::result::Result<T, SdError>;
