//! Eventgroup tables and delivery fan-out.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use bytes::Bytes;

use veho_types::{ClientId, Endpoint, EventId, EventgroupId, InstanceId, ServiceId};

use crate::debounce::DebounceFilter;
use crate::event::EventSpec;
use crate::{EventError, Result};

/// Who a delivery goes to: a local client or a remote endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberKey {
    /// Local client id (0 for purely remote subscribers).
    pub client: ClientId,
    /// Remote endpoint, when the subscriber sits on another host.
    pub endpoint: Option<Endpoint>,
}

impl SubscriberKey {
    /// A subscriber on this host.
    pub fn local(client: ClientId) -> Self {
        Self { client, endpoint: None }
    }

    /// A subscriber on a remote host.
    pub fn remote(endpoint: Endpoint) -> Self {
        Self { client: 0, endpoint: Some(endpoint) }
    }
}

struct Subscription {
    key: SubscriberKey,
    filter: Option<DebounceFilter>,
    // Event whose update is currently buffered in the filter.
    pending_event: Option<EventId>,
}

/// One pending delivery produced by the distributor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Recipient.
    pub subscriber: SubscriberKey,
    /// Service id.
    pub service: ServiceId,
    /// Instance id.
    pub instance: InstanceId,
    /// Event id.
    pub event: EventId,
    /// Payload to deliver.
    pub payload: Bytes,
    /// True when this replays a cached field to a new subscriber.
    pub is_initial: bool,
    /// Reliability hint of the event.
    pub reliable: bool,
}

/// The event/eventgroup/subscriber tables of one host.
///
/// Single-writer: the routing core drives all mutations from its own task.
#[derive(Default)]
pub struct EventDistributor {
    events: HashMap<(ServiceId, InstanceId, EventId), EventSpec>,
    groups: HashMap<(ServiceId, InstanceId, EventgroupId), BTreeSet<EventId>>,
    subscribers: HashMap<(ServiceId, InstanceId, EventgroupId), Vec<Subscription>>,
}

impl EventDistributor {
    /// An empty distributor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event for a service instance. Re-registration keeps the
    /// existing cached value.
    pub fn register_event(&mut self, service: ServiceId, instance: InstanceId, spec: EventSpec) {
        let key = (service, instance, spec.id);
        match self.events.get_mut(&key) {
            Some(existing) => {
                let cached = existing.cached.take();
                *existing = spec;
                if existing.cached.is_none() {
                    existing.cached = cached;
                }
            }
            None => {
                self.events.insert(key, spec);
            }
        }
    }

    /// Register an eventgroup as a set of event ids.
    pub fn register_eventgroup(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        events: impl IntoIterator<Item = EventId>,
    ) {
        self.groups
            .entry((service, instance, eventgroup))
            .or_default()
            .extend(events);
    }

    /// Events of an eventgroup.
    pub fn eventgroup_events(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> Option<&BTreeSet<EventId>> {
        self.groups.get(&(service, instance, eventgroup))
    }

    /// Cyclically emitted events with their periods.
    pub fn cyclic_events(&self) -> Vec<(ServiceId, InstanceId, EventId, Duration)> {
        self.events
            .iter()
            .filter(|(_, spec)| !spec.cycle.is_zero())
            .map(|(&(service, instance, event), spec)| (service, instance, event, spec.cycle))
            .collect()
    }

    /// Cycle period and whether changes restart it, for one event.
    pub fn cycle_of(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
    ) -> Option<(Duration, bool)> {
        self.events
            .get(&(service, instance, event))
            .filter(|spec| !spec.cycle.is_zero())
            .map(|spec| (spec.cycle, spec.change_resets_cycle))
    }

    /// Add a subscriber to an eventgroup.
    ///
    /// Returns the initial deliveries: for every FIELD in the group with a
    /// cached value, one `is_initial` notification. Subscribing again with
    /// the same key keeps the existing subscription and produces no
    /// deliveries.
    pub fn subscribe(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: SubscriberKey,
        filter: Option<DebounceFilter>,
        now: Instant,
    ) -> Result<Vec<Delivery>> {
        let events = self
            .groups
            .get(&(service, instance, eventgroup))
            .ok_or(EventError::UnknownEventgroup { service, instance, eventgroup })?
            .clone();

        let subscriptions = self.subscribers.entry((service, instance, eventgroup)).or_default();
        if subscriptions.iter().any(|s| s.key == subscriber) {
            return Ok(Vec::new());
        }
        subscriptions.push(Subscription { key: subscriber, filter, pending_event: None });

        let index = subscriptions.len() - 1;
        let mut initial = Vec::new();
        for event in events {
            let Some(spec) = self.events.get(&(service, instance, event)) else {
                continue;
            };
            if !spec.is_field() {
                continue;
            }
            let Some(cached) = spec.cached.clone() else {
                continue;
            };
            let reliable = spec.reliable;
            let subscriptions = self
                .subscribers
                .get_mut(&(service, instance, eventgroup))
                .ok_or(EventError::UnknownEventgroup { service, instance, eventgroup })?;
            let admitted = match &mut subscriptions[index].filter {
                Some(filter) => filter.admit(&cached, now),
                None => true,
            };
            if admitted {
                initial.push(Delivery {
                    subscriber,
                    service,
                    instance,
                    event,
                    payload: cached,
                    is_initial: true,
                    reliable,
                });
            }
        }
        Ok(initial)
    }

    /// Remove a subscriber from an eventgroup.
    pub fn unsubscribe(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: &SubscriberKey,
    ) {
        if let Some(subscriptions) = self.subscribers.get_mut(&(service, instance, eventgroup)) {
            subscriptions.retain(|s| s.key != *subscriber);
        }
    }

    /// Drop every subscription riding on `endpoint` (transport loss).
    pub fn unsubscribe_endpoint(&mut self, endpoint: &Endpoint) -> usize {
        let mut removed = 0;
        for subscriptions in self.subscribers.values_mut() {
            let before = subscriptions.len();
            subscriptions.retain(|s| s.key.endpoint.as_ref() != Some(endpoint));
            removed += before - subscriptions.len();
        }
        removed
    }

    /// Drop every subscription held by a local client (application loss).
    pub fn unsubscribe_client(&mut self, client: ClientId) -> usize {
        let mut removed = 0;
        for subscriptions in self.subscribers.values_mut() {
            let before = subscriptions.len();
            subscriptions.retain(|s| !(s.key.endpoint.is_none() && s.key.client == client));
            removed += before - subscriptions.len();
        }
        removed
    }

    /// Publish a new payload for an event.
    ///
    /// Returns whether the write counted as a change with at least one
    /// notification fired, plus the deliveries to perform. With
    /// `force = true` (cyclic emission) unchanged values are delivered too.
    pub fn notify(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Bytes,
        force: bool,
        now: Instant,
    ) -> Result<(bool, Vec<Delivery>)> {
        let spec = self
            .events
            .get_mut(&(service, instance, event))
            .ok_or(EventError::UnknownEvent { service, instance, event })?;
        let changed = spec.store(payload.clone());
        let reliable = spec.reliable;
        let update_on_change = spec.update_on_change;

        if !force && (!changed || !update_on_change) {
            return Ok((false, Vec::new()));
        }

        let mut deliveries = Vec::new();
        for (&(s, i, _group), subscriptions) in self.subscribers.iter_mut() {
            if s != service || i != instance {
                continue;
            }
            let group_has_event = self
                .groups
                .get(&(s, i, _group))
                .is_some_and(|events| events.contains(&event));
            if !group_has_event {
                continue;
            }
            for subscription in subscriptions.iter_mut() {
                let admitted = match &mut subscription.filter {
                    Some(filter) => {
                        let admitted = filter.admit(&payload, now);
                        if !admitted && filter.has_pending() {
                            subscription.pending_event = Some(event);
                        }
                        admitted
                    }
                    None => true,
                };
                if admitted {
                    subscription.pending_event = None;
                    deliveries.push(Delivery {
                        subscriber: subscription.key,
                        service,
                        instance,
                        event,
                        payload: payload.clone(),
                        is_initial: false,
                        reliable,
                    });
                }
            }
        }
        Ok((changed && !deliveries.is_empty(), deliveries))
    }

    /// Flush debounced updates whose interval has elapsed.
    pub fn poll_due(&mut self, now: Instant) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for (&(service, instance, _group), subscriptions) in self.subscribers.iter_mut() {
            for subscription in subscriptions.iter_mut() {
                let Some(filter) = &mut subscription.filter else {
                    continue;
                };
                let Some(event) = subscription.pending_event else {
                    continue;
                };
                if let Some(payload) = filter.take_due(now) {
                    subscription.pending_event = None;
                    let reliable = self
                        .events
                        .get(&(service, instance, event))
                        .is_some_and(|spec| spec.reliable);
                    deliveries.push(Delivery {
                        subscriber: subscription.key,
                        service,
                        instance,
                        event,
                        payload,
                        is_initial: false,
                        reliable,
                    });
                }
            }
        }
        deliveries
    }

    /// True if the event is registered for the service instance.
    pub fn has_event(&self, service: ServiceId, instance: InstanceId, event: EventId) -> bool {
        self.events.contains_key(&(service, instance, event))
    }

    /// The cached payload of an event, if any.
    pub fn cached_value(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
    ) -> Option<&Bytes> {
        self.events.get(&(service, instance, event)).and_then(|spec| spec.cached.as_ref())
    }

    /// Current subscriber count of an eventgroup.
    pub fn subscriber_count(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> usize {
        self.subscribers
            .get(&(service, instance, eventgroup))
            .map_or(0, Vec::len)
    }

    /// Remove all state of a service instance (stop-offer, crash cleanup).
    pub fn remove_instance(&mut self, service: ServiceId, instance: InstanceId) {
        self.events.retain(|&(s, i, _), _| !(s == service && i == instance));
        self.groups.retain(|&(s, i, _), _| !(s == service && i == instance));
        self.subscribers.retain(|&(s, i, _), _| !(s == service && i == instance));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distributor_with_field() -> EventDistributor {
        let mut d = EventDistributor::new();
        d.register_event(0x1111, 0x2222, EventSpec::field(0x8001));
        d.register_eventgroup(0x1111, 0x2222, 0x0001, [0x8001]);
        d
    }

    #[test]
    fn test_late_subscribe_receives_cached_field() {
        let mut d = distributor_with_field();
        let now = Instant::now();
        let (_, deliveries) = d
            .notify(0x1111, 0x2222, 0x8001, Bytes::from_static(&[0x01]), false, now)
            .expect("notify");
        assert!(deliveries.is_empty(), "no subscribers yet");

        let initial = d
            .subscribe(0x1111, 0x2222, 0x0001, SubscriberKey::local(0x0101), None, now)
            .expect("subscribe");
        assert_eq!(initial.len(), 1);
        assert!(initial[0].is_initial);
        assert_eq!(initial[0].event, 0x8001);
        assert_eq!(initial[0].payload, Bytes::from_static(&[0x01]));
    }

    #[test]
    fn test_subscribe_without_cached_value_has_no_initial() {
        let mut d = distributor_with_field();
        let initial = d
            .subscribe(0x1111, 0x2222, 0x0001, SubscriberKey::local(0x0101), None, Instant::now())
            .expect("subscribe");
        assert!(initial.is_empty());
    }

    #[test]
    fn test_initial_delivered_once_per_subscribe_cycle() {
        let mut d = distributor_with_field();
        let now = Instant::now();
        d.notify(0x1111, 0x2222, 0x8001, Bytes::from_static(&[0x01]), false, now)
            .expect("notify");
        let key = SubscriberKey::local(0x0101);
        let first = d.subscribe(0x1111, 0x2222, 0x0001, key, None, now).expect("subscribe");
        assert_eq!(first.len(), 1);
        // Identical re-subscribe returns the existing subscription.
        let again = d.subscribe(0x1111, 0x2222, 0x0001, key, None, now).expect("subscribe");
        assert!(again.is_empty());
        // A fresh subscribe cycle replays the cached value again.
        d.unsubscribe(0x1111, 0x2222, 0x0001, &key);
        let fresh = d.subscribe(0x1111, 0x2222, 0x0001, key, None, now).expect("subscribe");
        assert_eq!(fresh.len(), 1);
    }

    #[test]
    fn test_notify_fans_out_to_subscribers() {
        let mut d = distributor_with_field();
        let now = Instant::now();
        d.subscribe(0x1111, 0x2222, 0x0001, SubscriberKey::local(0x0101), None, now)
            .expect("subscribe");
        d.subscribe(
            0x1111,
            0x2222,
            0x0001,
            SubscriberKey::remote(Endpoint::udp([10u8, 0, 0, 2].into(), 30509)),
            None,
            now,
        )
        .expect("subscribe");

        let (fired, deliveries) = d
            .notify(0x1111, 0x2222, 0x8001, Bytes::from_static(&[0x07]), false, now)
            .expect("notify");
        assert!(fired);
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries.iter().all(|del| !del.is_initial));
    }

    #[test]
    fn test_unchanged_value_not_redelivered() {
        let mut d = distributor_with_field();
        let now = Instant::now();
        d.subscribe(0x1111, 0x2222, 0x0001, SubscriberKey::local(0x0101), None, now)
            .expect("subscribe");
        let (fired, deliveries) = d
            .notify(0x1111, 0x2222, 0x8001, Bytes::from_static(&[0x07]), false, now)
            .expect("notify");
        assert!(fired && deliveries.len() == 1);
        let (fired, deliveries) = d
            .notify(0x1111, 0x2222, 0x8001, Bytes::from_static(&[0x07]), false, now)
            .expect("notify");
        assert!(!fired);
        assert!(deliveries.is_empty());
        // Cyclic emission forces unchanged values out.
        let (_, forced) = d
            .notify(0x1111, 0x2222, 0x8001, Bytes::from_static(&[0x07]), true, now)
            .expect("notify");
        assert_eq!(forced.len(), 1);
    }

    #[test]
    fn test_disabled_debounce_suppresses_everything() {
        let mut d = distributor_with_field();
        let now = Instant::now();
        d.notify(0x1111, 0x2222, 0x8001, Bytes::from_static(&[0x00]), false, now)
            .expect("notify");
        let initial = d
            .subscribe(
                0x1111,
                0x2222,
                0x0001,
                SubscriberKey::local(0x0101),
                Some(DebounceFilter::new(-1, false, None)),
                now,
            )
            .expect("subscribe");
        assert!(initial.is_empty(), "initial is filtered too");

        for i in 0..100u8 {
            let (_, deliveries) = d
                .notify(0x1111, 0x2222, 0x8001, Bytes::copy_from_slice(&[i]), false, now)
                .expect("notify");
            assert!(deliveries.is_empty());
        }
    }

    #[test]
    fn test_endpoint_loss_drops_subscriptions() {
        let mut d = distributor_with_field();
        let now = Instant::now();
        let endpoint = Endpoint::udp([10u8, 0, 0, 2].into(), 30509);
        d.subscribe(0x1111, 0x2222, 0x0001, SubscriberKey::remote(endpoint), None, now)
            .expect("subscribe");
        assert_eq!(d.subscriber_count(0x1111, 0x2222, 0x0001), 1);
        assert_eq!(d.unsubscribe_endpoint(&endpoint), 1);
        assert_eq!(d.subscriber_count(0x1111, 0x2222, 0x0001), 0);
    }

    #[test]
    fn test_unknown_eventgroup_rejected() {
        let mut d = EventDistributor::new();
        let err = d
            .subscribe(1, 1, 1, SubscriberKey::local(1), None, Instant::now())
            .expect_err("unknown group");
        assert!(matches!(err, EventError::UnknownEventgroup { .. }));
    }
}
