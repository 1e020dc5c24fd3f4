//! Shared state enums of the routing core, IPC bus and subscriptions.

use serde::{Deserialize, Serialize};

/// Availability of a (service, instance) as seen by the routing core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AvailabilityState {
    /// Not offered anywhere.
    #[default]
    Down,
    /// Offered, origin not yet classified.
    Up,
    /// Offered by an application on this host.
    UpLocal,
    /// Offered by a remote host, learned through service discovery.
    UpRemote,
}

impl AvailabilityState {
    /// True for any of the up states.
    pub fn is_up(self) -> bool {
        !matches!(self, Self::Down)
    }
}

/// Global routing state, controlled by the embedding process or signals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutingState {
    /// Normal operation.
    #[default]
    Running,
    /// Discovery silenced, outbound traffic rejected with `NotRunning`.
    Suspended,
    /// Transitional state entered on resume before reaching `Running`.
    Resumed,
    /// Notifications suppressed, request/response still served.
    Diagnosis,
    /// Final state during teardown.
    Shutdown,
}

impl RoutingState {
    /// True if outbound non-SD messages may leave the host.
    pub fn allows_sending(self) -> bool {
        matches!(self, Self::Running | Self::Resumed | Self::Diagnosis)
    }

    /// True if outbound notifications may leave the host.
    pub fn allows_notifications(self) -> bool {
        matches!(self, Self::Running | Self::Resumed)
    }

    /// True if service discovery timers run and SD frames are sent.
    pub fn allows_discovery(self) -> bool {
        matches!(self, Self::Running | Self::Resumed)
    }
}

/// Lifecycle of a registered application on the IPC bus.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationState {
    /// Registration received, ack not yet sent.
    #[default]
    New,
    /// Ack sent, application not yet started.
    Initialized,
    /// Application event loop running.
    Started,
    /// Deregistered or lost (pong deadline missed).
    Stopped,
}

/// Per-client state of an eventgroup subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// No SUBSCRIBE sent yet, or ttl expired.
    #[default]
    Unknown,
    /// SUBSCRIBE sent, no ack within the window, or a nack arrived.
    NotAcknowledged,
    /// SUBSCRIBE acknowledged by the offering host.
    Acknowledged,
    /// Transport recovered, re-subscription in flight.
    Resubscribing,
    /// Re-subscription sent and not yet acknowledged.
    ResubscribingNotAcknowledged,
}

impl SubscriptionState {
    /// True while the subscriber may receive event traffic.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Acknowledged)
    }
}
