//! The authoritative routing tables.
//!
//! Plain data guarded by the host task; every mutation goes through methods
//! that enforce the offer and session rules. No I/O here.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use veho_types::{
    next_session_id, AvailabilityState, ClientId, Endpoint, InstanceId, MajorVersion,
    MinorVersion, ServiceId, SessionId,
};

/// Who provides a service instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    /// An application on this host.
    Local {
        /// The offering client.
        client: ClientId,
    },
    /// A remote host, learned through service discovery.
    Remote,
}

/// One row of the service table.
#[derive(Clone, Debug)]
pub struct ServiceRecord {
    /// Offered major version.
    pub major: MajorVersion,
    /// Offered minor version.
    pub minor: MinorVersion,
    /// Who offers it.
    pub provider: Provider,
    /// Reliable endpoint (remote provider, or local service's server port).
    pub reliable: Option<Endpoint>,
    /// Unreliable endpoint.
    pub unreliable: Option<Endpoint>,
}

/// A pending request awaiting its response.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    /// The local client that sent the request.
    pub requester: ClientId,
    /// When a TIMEOUT error is synthesized.
    pub deadline: Instant,
    /// Remote endpoint the request went to, if it left the host.
    pub target: Option<Endpoint>,
}

/// Outcome of an offer attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum OfferOutcome {
    /// New offer accepted.
    Accepted,
    /// Identical to the valid offer: no-op.
    Unchanged,
    /// Rejected (lower minor, or another provider holds the instance).
    Rejected,
}

/// The tables owned by the routing host task.
#[derive(Default)]
pub struct RoutingTables {
    services: HashMap<(ServiceId, InstanceId), ServiceRecord>,
    requests: HashMap<ClientId, HashSet<(ServiceId, InstanceId)>>,
    availability: HashMap<(ServiceId, InstanceId), AvailabilityState>,
    pending: HashMap<(ClientId, SessionId), PendingRequest>,
    remote_pending: HashMap<(ClientId, SessionId), (Endpoint, bool)>,
    sessions: HashMap<ClientId, SessionId>,
}

impl RoutingTables {
    /// Empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to install an offer. At most one offer per (service, instance)
    /// is valid on the host; a newer offer wins only with an equal or
    /// higher minor version from the same kind of provider.
    pub fn offer(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        record: ServiceRecord,
    ) -> OfferOutcome {
        match self.services.get(&(service, instance)) {
            None => {
                self.set_availability_for(service, instance, &record.provider);
                self.services.insert((service, instance), record);
                OfferOutcome::Accepted
            }
            Some(existing) => {
                if existing.provider == record.provider
                    && existing.major == record.major
                    && existing.minor == record.minor
                {
                    // Re-offer with identical parameters: refresh endpoints.
                    self.services.insert((service, instance), record);
                    return OfferOutcome::Unchanged;
                }
                if record.minor >= existing.minor {
                    self.set_availability_for(service, instance, &record.provider);
                    self.services.insert((service, instance), record);
                    OfferOutcome::Accepted
                } else {
                    OfferOutcome::Rejected
                }
            }
        }
    }

    fn set_availability_for(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        provider: &Provider,
    ) {
        let state = match provider {
            Provider::Local { .. } => AvailabilityState::UpLocal,
            Provider::Remote => AvailabilityState::UpRemote,
        };
        self.availability.insert((service, instance), state);
    }

    /// Withdraw an offer. No-op when the instance was never offered.
    pub fn stop_offer(&mut self, service: ServiceId, instance: InstanceId) -> Option<ServiceRecord> {
        self.availability.insert((service, instance), AvailabilityState::Down);
        self.services.remove(&(service, instance))
    }

    /// Look up a service record.
    pub fn service(&self, service: ServiceId, instance: InstanceId) -> Option<&ServiceRecord> {
        self.services.get(&(service, instance))
    }

    /// Availability of a service instance.
    pub fn availability(&self, service: ServiceId, instance: InstanceId) -> AvailabilityState {
        self.availability
            .get(&(service, instance))
            .copied()
            .unwrap_or(AvailabilityState::Down)
    }

    /// Record that `client` requests (service, instance).
    pub fn add_request(&mut self, client: ClientId, service: ServiceId, instance: InstanceId) {
        self.requests.entry(client).or_default().insert((service, instance));
    }

    /// Drop one request of `client`.
    pub fn release_request(&mut self, client: ClientId, service: ServiceId, instance: InstanceId) {
        if let Some(set) = self.requests.get_mut(&client) {
            set.remove(&(service, instance));
        }
    }

    /// The clients currently requesting (service, instance).
    pub fn requesters(&self, service: ServiceId, instance: InstanceId) -> Vec<ClientId> {
        self.requests
            .iter()
            .filter(|(_, set)| set.contains(&(service, instance)))
            .map(|(&client, _)| client)
            .collect()
    }

    /// Next session id for `client` (skips 0, wraps at 0xFFFF).
    pub fn next_session(&mut self, client: ClientId) -> SessionId {
        let session = self.sessions.entry(client).or_insert(0);
        let (next, _) = next_session_id(*session);
        *session = next;
        next
    }

    /// Track a locally originated request.
    pub fn add_pending(
        &mut self,
        client: ClientId,
        session: SessionId,
        requester: ClientId,
        deadline: Instant,
        target: Option<Endpoint>,
    ) {
        self.pending.insert((client, session), PendingRequest { requester, deadline, target });
    }

    /// Resolve a response to its local requester. Each pending entry
    /// resolves exactly once.
    pub fn take_pending(&mut self, client: ClientId, session: SessionId) -> Option<PendingRequest> {
        self.pending.remove(&(client, session))
    }

    /// Track a request from a remote peer being served locally, so the
    /// response finds its way back.
    pub fn add_remote_pending(
        &mut self,
        client: ClientId,
        session: SessionId,
        source: Endpoint,
        reliable: bool,
    ) {
        self.remote_pending.insert((client, session), (source, reliable));
    }

    /// Resolve a locally produced response to the remote requester.
    pub fn take_remote_pending(
        &mut self,
        client: ClientId,
        session: SessionId,
    ) -> Option<(Endpoint, bool)> {
        self.remote_pending.remove(&(client, session))
    }

    /// Pending requests whose deadline has passed.
    pub fn expired_pending(&mut self, now: Instant) -> Vec<(ClientId, SessionId, PendingRequest)> {
        let expired: Vec<(ClientId, SessionId)> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(&key, _)| key)
            .collect();
        expired
            .into_iter()
            .filter_map(|(client, session)| {
                self.pending
                    .remove(&(client, session))
                    .map(|pending| (client, session, pending))
            })
            .collect()
    }

    /// Pending requests that were sent to `endpoint`, removed for abort
    /// with NOT_REACHABLE when the endpoint goes down.
    pub fn take_pending_for_endpoint(
        &mut self,
        endpoint: &Endpoint,
    ) -> Vec<(ClientId, SessionId, PendingRequest)> {
        let keys: Vec<(ClientId, SessionId)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.target.as_ref() == Some(endpoint))
            .map(|(&key, _)| key)
            .collect();
        keys.into_iter()
            .filter_map(|(client, session)| {
                self.pending
                    .remove(&(client, session))
                    .map(|pending| (client, session, pending))
            })
            .collect()
    }

    /// Everything a dead application owned: its offers and requests.
    /// Returns the (service, instance) pairs whose offers were withdrawn.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<(ServiceId, InstanceId)> {
        let offered: Vec<(ServiceId, InstanceId)> = self
            .services
            .iter()
            .filter(|(_, record)| record.provider == Provider::Local { client })
            .map(|(&key, _)| key)
            .collect();
        for &(service, instance) in &offered {
            self.stop_offer(service, instance);
        }
        self.requests.remove(&client);
        self.sessions.remove(&client);
        self.pending.retain(|_, p| p.requester != client);
        offered
    }

    /// Offers provided by remote hosts (dropped when discovery reports the
    /// peer gone).
    pub fn remote_services(&self) -> Vec<(ServiceId, InstanceId)> {
        self.services
            .iter()
            .filter(|(_, record)| record.provider == Provider::Remote)
            .map(|(&key, _)| key)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local_record(client: ClientId, minor: MinorVersion) -> ServiceRecord {
        ServiceRecord {
            major: 1,
            minor,
            provider: Provider::Local { client },
            reliable: None,
            unreliable: Some(Endpoint::udp([127u8, 0, 0, 1].into(), 30509)),
        }
    }

    #[test]
    fn test_offer_upgrade_rules() {
        let mut tables = RoutingTables::new();
        assert_eq!(tables.offer(1, 1, local_record(0x10, 0)), OfferOutcome::Accepted);
        // Identical re-offer is a no-op.
        assert_eq!(tables.offer(1, 1, local_record(0x10, 0)), OfferOutcome::Unchanged);
        // Higher minor replaces.
        assert_eq!(tables.offer(1, 1, local_record(0x10, 1)), OfferOutcome::Accepted);
        // Lower minor is rejected.
        assert_eq!(tables.offer(1, 1, local_record(0x10, 0)), OfferOutcome::Rejected);
        assert_eq!(tables.service(1, 1).map(|r| r.minor), Some(1));
    }

    #[test]
    fn test_availability_transitions() {
        let mut tables = RoutingTables::new();
        assert_eq!(tables.availability(1, 1), AvailabilityState::Down);
        tables.offer(1, 1, local_record(0x10, 0));
        assert_eq!(tables.availability(1, 1), AvailabilityState::UpLocal);
        tables.stop_offer(1, 1);
        assert_eq!(tables.availability(1, 1), AvailabilityState::Down);
        // Stop on a never-offered instance is a no-op.
        assert!(tables.stop_offer(9, 9).is_none());
    }

    #[test]
    fn test_session_counter_skips_zero() {
        let mut tables = RoutingTables::new();
        assert_eq!(tables.next_session(0x10), 1);
        assert_eq!(tables.next_session(0x10), 2);
        // Independent per client.
        assert_eq!(tables.next_session(0x11), 1);

        // Force a wrap.
        tables.sessions.insert(0x10, 0xFFFF);
        assert_eq!(tables.next_session(0x10), 1);
    }

    #[test]
    fn test_pending_resolves_exactly_once() {
        let mut tables = RoutingTables::new();
        let now = Instant::now();
        tables.add_pending(0x10, 1, 0x10, now + Duration::from_secs(5), None);
        assert!(tables.take_pending(0x10, 1).is_some());
        assert!(tables.take_pending(0x10, 1).is_none());
    }

    #[test]
    fn test_pending_expiry() {
        let mut tables = RoutingTables::new();
        let now = Instant::now();
        tables.add_pending(0x10, 1, 0x10, now + Duration::from_secs(5), None);
        tables.add_pending(0x10, 2, 0x10, now + Duration::from_secs(1), None);
        let expired = tables.expired_pending(now + Duration::from_secs(2));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].1, 2);
        // The expired entry is gone, the other remains.
        assert!(tables.take_pending(0x10, 2).is_none());
        assert!(tables.take_pending(0x10, 1).is_some());
    }

    #[test]
    fn test_dead_client_cleanup_is_idempotent() {
        let mut tables = RoutingTables::new();
        tables.offer(1, 1, local_record(0x10, 0));
        tables.add_request(0x10, 2, 2);
        tables.add_pending(0x10, 1, 0x10, Instant::now(), None);

        let withdrawn = tables.remove_client(0x10);
        assert_eq!(withdrawn, vec![(1, 1)]);
        assert_eq!(tables.availability(1, 1), AvailabilityState::Down);
        assert!(tables.requesters(2, 2).is_empty());

        // Running cleanup again changes nothing.
        assert!(tables.remove_client(0x10).is_empty());
    }

    #[test]
    fn test_requesters_lookup() {
        let mut tables = RoutingTables::new();
        tables.add_request(0x10, 1, 1);
        tables.add_request(0x11, 1, 1);
        tables.add_request(0x12, 2, 1);
        let mut requesters = tables.requesters(1, 1);
        requesters.sort_unstable();
        assert_eq!(requesters, vec![0x10, 0x11]);
        tables.release_request(0x10, 1, 1);
        assert_eq!(tables.requesters(1, 1), vec![0x11]);
    }
}
