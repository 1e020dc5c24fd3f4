//! # veho-policy
//!
//! Thin gateway between the routing core and an external access-control
//! backend. The core never interprets policies itself; it asks the gateway
//! whether a sender identity may offer, request, or address a member of a
//! service, and the gateway consults whatever [`PolicyBackend`] is plugged
//! in.
//!
//! In audit mode every predicate answers allow while denials are still
//! logged, so a deployment can observe the effect of a policy set before
//! enforcing it.

mod rules;

pub use rules::{IdRange, PolicyRule, StaticPolicy};

use std::net::IpAddr;
use std::sync::Arc;

use veho_types::{InstanceId, MethodId, ServiceId};

/// Errors of the policy subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// No policy source was found at initialization.
    #[error("no policy source found")]
    NotFound,

    /// The policy source exists but cannot be interpreted.
    #[error("invalid policy: {0}")]
    Invalid(String),
}

/// The identity a predicate judges: credentials plus network origin.
///
/// `port == 0` marks a host-local sender whose uid/gid were taken from the
/// peer credentials of the local socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    /// User id of the sending process (host-local senders only).
    pub uid: u32,
    /// Group id of the sending process (host-local senders only).
    pub gid: u32,
    /// Source address.
    pub address: IpAddr,
    /// Source port; 0 for host-local senders.
    pub port: u16,
}

impl Identity {
    /// A host-local identity from peer credentials.
    pub fn local(uid: u32, gid: u32) -> Self {
        Self { uid, gid, address: IpAddr::from([127u8, 0, 0, 1]), port: 0 }
    }

    /// A remote identity; credentials are unknown over the network.
    pub fn remote(address: IpAddr, port: u16) -> Self {
        Self { uid: u32::MAX, gid: u32::MAX, address, port }
    }

    /// True for host-local senders.
    pub fn is_local(&self) -> bool {
        self.port == 0
    }
}

/// Outcome of a predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Access granted.
    Allow,
    /// Access denied.
    Deny,
}

impl Decision {
    /// True for [`Decision::Allow`].
    pub fn is_allowed(self) -> bool {
        self == Self::Allow
    }
}

/// The predicates an access-control backend must answer.
pub trait PolicyBackend: Send + Sync {
    /// Load or refresh the policy source.
    fn initialize(&self) -> Result<(), PolicyError>;

    /// May `identity` connect to the routing host at all?
    fn authenticate_router(&self, identity: &Identity) -> Decision;

    /// May `identity` offer (service, instance)?
    fn is_offer_allowed(&self, identity: &Identity, service: ServiceId, instance: InstanceId)
        -> Decision;

    /// May `identity` request (service, instance)?
    fn is_request_allowed(
        &self,
        identity: &Identity,
        service: ServiceId,
        instance: InstanceId,
    ) -> Decision;

    /// May `identity` address `member` of (service, instance)?
    fn is_member_allowed(
        &self,
        identity: &Identity,
        service: ServiceId,
        instance: InstanceId,
        member: MethodId,
    ) -> Decision;

    /// May `identity` push a policy update touching `services`?
    fn is_policy_update_allowed(&self, identity: &Identity, services: &[ServiceId]) -> Decision;
}

/// A backend that allows everything. Used when security is disabled.
#[derive(Debug, Default)]
pub struct AllowAll;

impl PolicyBackend for AllowAll {
    fn initialize(&self) -> Result<(), PolicyError> {
        Ok(())
    }

    fn authenticate_router(&self, _identity: &Identity) -> Decision {
        Decision::Allow
    }

    fn is_offer_allowed(&self, _: &Identity, _: ServiceId, _: InstanceId) -> Decision {
        Decision::Allow
    }

    fn is_request_allowed(&self, _: &Identity, _: ServiceId, _: InstanceId) -> Decision {
        Decision::Allow
    }

    fn is_member_allowed(&self, _: &Identity, _: ServiceId, _: InstanceId, _: MethodId) -> Decision {
        Decision::Allow
    }

    fn is_policy_update_allowed(&self, _: &Identity, _: &[ServiceId]) -> Decision {
        Decision::Allow
    }
}

/// The gateway consulted by routing and service discovery.
#[derive(Clone)]
pub struct PolicyGateway {
    backend: Arc<dyn PolicyBackend>,
    enforcing: bool,
}

impl PolicyGateway {
    /// A gateway over `backend`. With `enforcing = false` (audit mode)
    /// denials are logged but reported as allowed.
    pub fn new(backend: Arc<dyn PolicyBackend>, enforcing: bool) -> Self {
        Self { backend, enforcing }
    }

    /// A gateway that allows everything (security disabled).
    pub fn permissive() -> Self {
        Self::new(Arc::new(AllowAll), false)
    }

    /// Initialize the backend.
    pub fn initialize(&self) -> Result<(), PolicyError> {
        self.backend.initialize()
    }

    /// True when denials are enforced rather than only logged.
    pub fn is_enforcing(&self) -> bool {
        self.enforcing
    }

    /// See [`PolicyBackend::authenticate_router`].
    pub fn authenticate_router(&self, identity: &Identity) -> Decision {
        self.filter(self.backend.authenticate_router(identity), "authenticate", identity, 0, 0)
    }

    /// See [`PolicyBackend::is_offer_allowed`].
    pub fn is_offer_allowed(
        &self,
        identity: &Identity,
        service: ServiceId,
        instance: InstanceId,
    ) -> Decision {
        self.filter(
            self.backend.is_offer_allowed(identity, service, instance),
            "offer",
            identity,
            service,
            instance,
        )
    }

    /// See [`PolicyBackend::is_request_allowed`].
    pub fn is_request_allowed(
        &self,
        identity: &Identity,
        service: ServiceId,
        instance: InstanceId,
    ) -> Decision {
        self.filter(
            self.backend.is_request_allowed(identity, service, instance),
            "request",
            identity,
            service,
            instance,
        )
    }

    /// See [`PolicyBackend::is_member_allowed`].
    pub fn is_member_allowed(
        &self,
        identity: &Identity,
        service: ServiceId,
        instance: InstanceId,
        member: MethodId,
    ) -> Decision {
        self.filter(
            self.backend.is_member_allowed(identity, service, instance, member),
            "member",
            identity,
            service,
            instance,
        )
    }

    /// See [`PolicyBackend::is_policy_update_allowed`].
    pub fn is_policy_update_allowed(&self, identity: &Identity, services: &[ServiceId]) -> Decision {
        self.filter(
            self.backend.is_policy_update_allowed(identity, services),
            "policy-update",
            identity,
            0,
            0,
        )
    }

    fn filter(
        &self,
        decision: Decision,
        action: &str,
        identity: &Identity,
        service: ServiceId,
        instance: InstanceId,
    ) -> Decision {
        if decision == Decision::Deny {
            tracing::warn!(
                action,
                uid = identity.uid,
                gid = identity.gid,
                address = %identity.address,
                service = format_args!("{service:#06x}"),
                instance = format_args!("{instance:#06x}"),
                enforcing = self.enforcing,
                "policy denial"
            );
            if !self.enforcing {
                return Decision::Allow;
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyAll;

    impl PolicyBackend for DenyAll {
        fn initialize(&self) -> Result<(), PolicyError> {
            Ok(())
        }
        fn authenticate_router(&self, _: &Identity) -> Decision {
            Decision::Deny
        }
        fn is_offer_allowed(&self, _: &Identity, _: ServiceId, _: InstanceId) -> Decision {
            Decision::Deny
        }
        fn is_request_allowed(&self, _: &Identity, _: ServiceId, _: InstanceId) -> Decision {
            Decision::Deny
        }
        fn is_member_allowed(
            &self,
            _: &Identity,
            _: ServiceId,
            _: InstanceId,
            _: MethodId,
        ) -> Decision {
            Decision::Deny
        }
        fn is_policy_update_allowed(&self, _: &Identity, _: &[ServiceId]) -> Decision {
            Decision::Deny
        }
    }

    #[test]
    fn test_enforcing_gateway_denies() {
        let gateway = PolicyGateway::new(Arc::new(DenyAll), true);
        let identity = Identity::local(1000, 1000);
        assert_eq!(gateway.is_offer_allowed(&identity, 1, 1), Decision::Deny);
        assert_eq!(gateway.is_request_allowed(&identity, 1, 1), Decision::Deny);
    }

    #[test]
    fn test_audit_mode_allows_but_would_deny() {
        let gateway = PolicyGateway::new(Arc::new(DenyAll), false);
        let identity = Identity::local(1000, 1000);
        assert_eq!(gateway.is_offer_allowed(&identity, 1, 1), Decision::Allow);
        assert!(!gateway.is_enforcing());
    }

    #[test]
    fn test_identity_locality() {
        assert!(Identity::local(0, 0).is_local());
        assert!(!Identity::remote(IpAddr::from([10u8, 0, 0, 1]), 30509).is_local());
    }
}
