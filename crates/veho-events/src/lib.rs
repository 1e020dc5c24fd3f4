//! # veho-events
//!
//! Event distribution: eventgroup membership, cached field values, debounce
//! filters and cyclic notification.
//!
//! The [`EventDistributor`] is the pure bookkeeping core: it owns the event
//! and subscriber tables and turns every `notify`/`subscribe` into a list of
//! [`Delivery`] records. Actually moving those deliveries to local queues or
//! network endpoints is the routing core's job, as is draining
//! [`EventDistributor::poll_due`] on a timer so buffered debounced updates
//! flush. The [`notifier`] module adds a task-per-event driver for cyclic
//! re-notification on top.

pub mod debounce;
pub mod event;
pub mod notifier;
mod registry;

pub use debounce::DebounceFilter;
pub use event::{ChangePredicate, EventSpec};
pub use registry::{Delivery, EventDistributor, SubscriberKey};

use veho_types::{EventId, EventgroupId, InstanceId, ServiceId};

/// Errors of the event distribution subsystem.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The event is not registered for the service instance.
    #[error("unknown event {service:#06x}.{instance:#06x}/{event:#06x}")]
    UnknownEvent {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Event id.
        event: EventId,
    },

    /// The eventgroup is not registered for the service instance.
    #[error("unknown eventgroup {service:#06x}.{instance:#06x}/{eventgroup:#06x}")]
    UnknownEventgroup {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Eventgroup id.
        eventgroup: EventgroupId,
    },
}

/// Result type alias for event distribution operations.
pub type Result<T> = std::result::Result<T, EventError>;
