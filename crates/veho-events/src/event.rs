//! Per-event state: kind, notification strategy and the cached value.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use veho_types::{EventId, EventKind};

/// User-supplied change predicate: `true` if `new` differs from `old`
/// enough to count as a change.
pub type ChangePredicate = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

/// Registration data and runtime state of one event.
#[derive(Clone)]
pub struct EventSpec {
    /// Event id (top bit set).
    pub id: EventId,
    /// Event, field or selective event.
    pub kind: EventKind,
    /// Prefer the reliable transport for notifications.
    pub reliable: bool,
    /// Cyclic emission period; zero disables cyclic notification.
    pub cycle: Duration,
    /// Restart the cycle timer whenever the value changes.
    pub change_resets_cycle: bool,
    /// Notify on change (in addition to any cycle).
    pub update_on_change: bool,
    /// Change predicate; byte inequality when absent.
    pub epsilon: Option<ChangePredicate>,
    /// Most recent payload written via notify. Replayed to new
    /// subscribers when `kind` is [`EventKind::Field`].
    pub cached: Option<Bytes>,
}

impl std::fmt::Debug for EventSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSpec")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("reliable", &self.reliable)
            .field("cycle", &self.cycle)
            .field("cached", &self.cached.as_ref().map(Bytes::len))
            .finish()
    }
}

impl EventSpec {
    /// A plain event with on-change notification.
    pub fn event(id: EventId) -> Self {
        Self {
            id,
            kind: EventKind::Event,
            reliable: false,
            cycle: Duration::ZERO,
            change_resets_cycle: false,
            update_on_change: true,
            epsilon: None,
            cached: None,
        }
    }

    /// A field: cached value, replayed on subscription.
    pub fn field(id: EventId) -> Self {
        Self { kind: EventKind::Field, ..Self::event(id) }
    }

    /// Builder-style reliability hint.
    pub fn with_reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    /// Builder-style cyclic emission.
    pub fn with_cycle(mut self, cycle: Duration) -> Self {
        self.cycle = cycle;
        self
    }

    /// Builder-style change predicate.
    pub fn with_epsilon(mut self, epsilon: ChangePredicate) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    /// True for fields.
    pub fn is_field(&self) -> bool {
        self.kind == EventKind::Field
    }

    /// Store a new payload and report whether it counts as a change.
    ///
    /// The first write is always a change. Later writes consult the epsilon
    /// predicate, or byte inequality when none is set.
    pub fn store(&mut self, payload: Bytes) -> bool {
        let changed = match &self.cached {
            None => true,
            Some(old) => match &self.epsilon {
                Some(predicate) => predicate(old, &payload),
                None => *old != payload,
            },
        };
        self.cached = Some(payload);
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_store_is_change() {
        let mut spec = EventSpec::event(0x8001);
        assert!(spec.store(Bytes::from_static(&[1])));
        assert!(!spec.store(Bytes::from_static(&[1])));
        assert!(spec.store(Bytes::from_static(&[2])));
    }

    #[test]
    fn test_epsilon_overrides_equality() {
        // Treat values within 2 as unchanged.
        let epsilon: ChangePredicate =
            Arc::new(|old, new| old[0].abs_diff(new[0]) > 2);
        let mut spec = EventSpec::field(0x8001).with_epsilon(epsilon);
        assert!(spec.store(Bytes::from_static(&[10])));
        assert!(!spec.store(Bytes::from_static(&[11])));
        // The 11 was stored, so 13 is compared against 11.
        assert!(!spec.store(Bytes::from_static(&[13])));
        assert!(spec.store(Bytes::from_static(&[16])));
    }

    #[test]
    fn test_field_kind() {
        assert!(EventSpec::field(0x8001).is_field());
        assert!(!EventSpec::event(0x8001).is_field());
    }
}
