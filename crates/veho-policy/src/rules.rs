//! Static policy backend built from the `security` configuration section.
//!
//! Each policy entry binds credentials (uid/gid) to the service instances
//! the holder may offer or request. Identities are matched on credentials,
//! so only host-local senders are judged here; network-level access control
//! is a transport concern outside this backend.

use serde::Deserialize;

use veho_types::{InstanceId, MethodId, ServiceId, ANY_INSTANCE};

use crate::{Decision, Identity, PolicyBackend, PolicyError};

/// A (service, instance-range) a rule grants access to.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct IdRange {
    /// Service id.
    pub service: ServiceId,
    /// First allowed instance (defaults to 0).
    #[serde(default)]
    pub first_instance: InstanceId,
    /// Last allowed instance (defaults to the wildcard).
    #[serde(default = "any_instance")]
    pub last_instance: InstanceId,
}

fn any_instance() -> InstanceId {
    ANY_INSTANCE
}

impl IdRange {
    fn matches(&self, service: ServiceId, instance: InstanceId) -> bool {
        self.service == service
            && instance >= self.first_instance
            && instance <= self.last_instance
    }
}

/// Credentials of a policy rule.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// User id the rule applies to (any when absent).
    #[serde(default)]
    pub uid: Option<u32>,
    /// Group id the rule applies to (any when absent).
    #[serde(default)]
    pub gid: Option<u32>,
}

/// Grants of a policy rule.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct Grants {
    /// Service instances the holder may offer.
    #[serde(default)]
    pub offers: Vec<IdRange>,
    /// Service instances the holder may request.
    #[serde(default)]
    pub requests: Vec<IdRange>,
}

/// One policy entry.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct PolicyRule {
    /// Credentials this rule applies to.
    #[serde(default)]
    pub credentials: Credentials,
    /// What the credentials are allowed to do.
    #[serde(default)]
    pub allow: Grants,
}

impl PolicyRule {
    fn applies_to(&self, identity: &Identity) -> bool {
        self.credentials.uid.map_or(true, |uid| uid == identity.uid)
            && self.credentials.gid.map_or(true, |gid| gid == identity.gid)
    }
}

/// Policy backend over a fixed rule set and update whitelist.
#[derive(Debug, Default)]
pub struct StaticPolicy {
    rules: Vec<PolicyRule>,
    whitelist_uids: Vec<u32>,
    whitelist_services: Vec<ServiceId>,
    check_whitelist: bool,
}

impl StaticPolicy {
    /// Build from already-parsed rules.
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules, ..Self::default() }
    }

    /// Parse rules from the raw JSON values of the `policies` config list.
    pub fn from_json(values: &[serde_json::Value]) -> Result<Self, PolicyError> {
        let mut rules = Vec::with_capacity(values.len());
        for value in values {
            let rule: PolicyRule = serde_json::from_value(value.clone())
                .map_err(|e| PolicyError::Invalid(e.to_string()))?;
            rules.push(rule);
        }
        Ok(Self::new(rules))
    }

    /// Attach the policy-update whitelist.
    pub fn with_whitelist(mut self, uids: Vec<u32>, services: Vec<ServiceId>, check: bool) -> Self {
        self.whitelist_uids = uids;
        self.whitelist_services = services;
        self.check_whitelist = check;
        self
    }

    fn check(&self, identity: &Identity, pick: impl Fn(&PolicyRule) -> &[IdRange],
        service: ServiceId, instance: InstanceId) -> Decision {
        // Network senders carry no credentials; transport-level access
        // control is not this backend's concern.
        if !identity.is_local() {
            return Decision::Allow;
        }
        for rule in &self.rules {
            if rule.applies_to(identity)
                && pick(rule).iter().any(|range| range.matches(service, instance))
            {
                return Decision::Allow;
            }
        }
        Decision::Deny
    }
}

impl PolicyBackend for StaticPolicy {
    fn initialize(&self) -> Result<(), PolicyError> {
        if self.rules.is_empty() && self.check_whitelist {
            return Err(PolicyError::NotFound);
        }
        Ok(())
    }

    fn authenticate_router(&self, identity: &Identity) -> Decision {
        // Any identity with at least one rule may attach to the host.
        if !identity.is_local() || self.rules.iter().any(|rule| rule.applies_to(identity)) {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }

    fn is_offer_allowed(
        &self,
        identity: &Identity,
        service: ServiceId,
        instance: InstanceId,
    ) -> Decision {
        self.check(identity, |rule| &rule.allow.offers, service, instance)
    }

    fn is_request_allowed(
        &self,
        identity: &Identity,
        service: ServiceId,
        instance: InstanceId,
    ) -> Decision {
        self.check(identity, |rule| &rule.allow.requests, service, instance)
    }

    fn is_member_allowed(
        &self,
        identity: &Identity,
        service: ServiceId,
        instance: InstanceId,
        _member: MethodId,
    ) -> Decision {
        // Member access rides on the request grant; per-method ranges are a
        // policy-source extension the static table does not carry.
        self.is_request_allowed(identity, service, instance)
    }

    fn is_policy_update_allowed(&self, identity: &Identity, services: &[ServiceId]) -> Decision {
        if !self.check_whitelist {
            return Decision::Allow;
        }
        if !self.whitelist_uids.contains(&identity.uid) {
            return Decision::Deny;
        }
        if services.iter().all(|s| self.whitelist_services.contains(s)) {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_policy() -> StaticPolicy {
        StaticPolicy::from_json(&[serde_json::json!({
            "credentials": { "uid": 1000, "gid": 1000 },
            "allow": {
                "offers": [ { "service": 4369, "first_instance": 1, "last_instance": 16 } ],
                "requests": [ { "service": 4369 } ]
            }
        })])
        .expect("parse")
    }

    #[test]
    fn test_offer_instance_range() {
        let policy = sample_policy();
        let identity = Identity::local(1000, 1000);
        assert_eq!(policy.is_offer_allowed(&identity, 0x1111, 1), Decision::Allow);
        assert_eq!(policy.is_offer_allowed(&identity, 0x1111, 16), Decision::Allow);
        assert_eq!(policy.is_offer_allowed(&identity, 0x1111, 17), Decision::Deny);
        assert_eq!(policy.is_offer_allowed(&identity, 0x2222, 1), Decision::Deny);
    }

    #[test]
    fn test_unmatched_credentials_denied() {
        let policy = sample_policy();
        let other = Identity::local(1001, 1001);
        assert_eq!(policy.is_offer_allowed(&other, 0x1111, 1), Decision::Deny);
        assert_eq!(policy.authenticate_router(&other), Decision::Deny);
        assert_eq!(policy.authenticate_router(&Identity::local(1000, 1000)), Decision::Allow);
    }

    #[test]
    fn test_remote_identity_not_judged() {
        let policy = sample_policy();
        let remote = Identity::remote([10u8, 0, 0, 9].into(), 30509);
        assert_eq!(policy.is_request_allowed(&remote, 0x7777, 1), Decision::Allow);
    }

    #[test]
    fn test_update_whitelist() {
        let policy = sample_policy().with_whitelist(vec![0], vec![0x1111], true);
        let root = Identity::local(0, 0);
        let user = Identity::local(1000, 1000);
        assert_eq!(policy.is_policy_update_allowed(&root, &[0x1111]), Decision::Allow);
        assert_eq!(policy.is_policy_update_allowed(&root, &[0x2222]), Decision::Deny);
        assert_eq!(policy.is_policy_update_allowed(&user, &[0x1111]), Decision::Deny);
    }

    #[test]
    fn test_invalid_policy_json_rejected() {
        let err = StaticPolicy::from_json(&[serde_json::json!({ "allow": 7 })])
            .expect_err("invalid");
        assert!(matches!(err, PolicyError::Invalid(_)));
    }
}
