//! # eRx Policy
//!
//! Role-to-scope authorization policy, consumed by every service.
//!
//! The policy is two static tables held as data (YAML), not code: a role ->
//! scope-set table and a resource -> action -> required-scope table. A
//! built-in document ships with the crate; deployments may load a revised
//! document from disk at startup without touching the decision logic.
//!
//! Decision defaults are asymmetric and deliberate:
//! - a resource with no rule table at all is *unregulated* and allowed;
//! - a listed resource with an unlisted action is denied.
//!
//! Service behaviour depends on this asymmetry; do not "fix" it to uniform
//! default-deny without a policy version bump.

use erx_types::{Identity, LicenseNumber, Role};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// The universal scope. An identity holding it passes every check.
pub const ADMIN_SCOPE: &str = "admin";

const BUILTIN_POLICY: &str = include_str!("../policy.yaml");

/// Errors that can occur when loading a policy document.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to read policy file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse policy document: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unsupported policy version {0}")]
    UnsupportedVersion(u32),
    #[error("policy document must define the physician role (unknown-role floor)")]
    MissingPhysicianRole,
}

/// The outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

#[derive(Debug, Deserialize)]
struct PolicyDoc {
    version: u32,
    roles: BTreeMap<String, BTreeSet<String>>,
    resources: BTreeMap<String, BTreeMap<String, String>>,
}

/// The authorization decision engine.
///
/// Constructed once at startup and shared read-only across services.
pub struct PolicyEngine {
    doc: PolicyDoc,
}

impl PolicyEngine {
    /// Loads the built-in policy document shipped with this crate.
    pub fn builtin() -> Self {
        Self::from_yaml(BUILTIN_POLICY).expect("built-in policy document is valid")
    }

    /// Parses a policy document from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, PolicyError> {
        let doc: PolicyDoc = serde_yaml::from_str(yaml)?;
        if doc.version != 1 {
            return Err(PolicyError::UnsupportedVersion(doc.version));
        }
        if !doc.roles.contains_key(Role::Physician.as_str()) {
            return Err(PolicyError::MissingPhysicianRole);
        }
        Ok(Self { doc })
    }

    /// Loads a policy document from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Returns the scope set granted to a role.
    ///
    /// Unknown or unmapped roles resolve to the physician set. This is the
    /// documented least-trusted-known-role floor, not a silent bug: an
    /// unexpected role claim still yields a bounded, audited capability set
    /// rather than failing closed.
    pub fn scopes_for_role(&self, role: Role) -> BTreeSet<String> {
        if let Some(scopes) = self.doc.roles.get(role.as_str()) {
            return scopes.clone();
        }
        tracing::debug!(role = %role, "unmapped role, falling back to physician scope set");
        self.doc
            .roles
            .get(Role::Physician.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Decides whether `identity` may perform `action` on `resource`.
    pub fn authorize(&self, identity: &Identity, resource: &str, action: &str) -> Decision {
        if identity.scopes.contains(ADMIN_SCOPE) {
            return Decision::Allow;
        }
        // No rule table for the resource: unregulated, allowed.
        let Some(actions) = self.doc.resources.get(resource) else {
            return Decision::Allow;
        };
        // Listed resource, unlisted action: denied.
        let Some(required) = actions.get(action) else {
            return Decision::Deny;
        };
        if identity.scopes.contains(required) {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

/// Ownership check for prescription-scoped mutations.
///
/// Signing and cancelling require, on top of the scope check, that the caller
/// holds the prescribing license.
pub fn owns_prescription(identity: &Identity, prescriber: &LicenseNumber) -> bool {
    identity.holds_license(prescriber)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn identity_with(role: Role, scopes: &[&str]) -> Identity {
        Identity {
            id: "idp-user-1".into(),
            license: Some(LicenseNumber::parse("MD-10234").unwrap()),
            name: "Dana Osei".into(),
            role,
            specialty: None,
            facility_id: None,
            facility_name: None,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            issued_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    fn identity_for_role(engine: &PolicyEngine, role: Role) -> Identity {
        let scopes = engine.scopes_for_role(role);
        let mut identity = identity_with(role, &[]);
        identity.scopes = scopes;
        identity
    }

    #[test]
    fn nurse_cannot_sign_prescriptions() {
        let engine = PolicyEngine::builtin();
        let nurse = identity_for_role(&engine, Role::Nurse);
        assert_eq!(
            engine.authorize(&nurse, "Prescription", "sign"),
            Decision::Deny
        );
    }

    #[test]
    fn physician_can_create_and_sign() {
        let engine = PolicyEngine::builtin();
        let physician = identity_for_role(&engine, Role::Physician);
        assert!(engine
            .authorize(&physician, "Prescription", "create")
            .is_allowed());
        assert!(engine
            .authorize(&physician, "Prescription", "sign")
            .is_allowed());
    }

    #[test]
    fn unregistered_resource_is_allowed() {
        let engine = PolicyEngine::builtin();
        let nurse = identity_for_role(&engine, Role::Nurse);
        assert!(engine
            .authorize(&nurse, "ReportTemplate", "read")
            .is_allowed());
    }

    #[test]
    fn listed_resource_with_unlisted_action_is_denied() {
        let engine = PolicyEngine::builtin();
        let physician = identity_for_role(&engine, Role::Physician);
        assert_eq!(
            engine.authorize(&physician, "Prescription", "purge"),
            Decision::Deny
        );
    }

    #[test]
    fn admin_scope_overrides_everything() {
        let engine = PolicyEngine::builtin();
        let admin = identity_with(Role::Admin, &[ADMIN_SCOPE]);
        assert!(engine
            .authorize(&admin, "Prescription", "purge")
            .is_allowed());
        assert!(engine.authorize(&admin, "AuditTrail", "read").is_allowed());
    }

    #[test]
    fn unknown_role_falls_back_to_physician_floor() {
        let engine = PolicyEngine::builtin();
        let scopes = engine.scopes_for_role(Role::Unknown);
        assert_eq!(scopes, engine.scopes_for_role(Role::Physician));
    }

    #[test]
    fn ownership_requires_matching_license() {
        let engine = PolicyEngine::builtin();
        let physician = identity_for_role(&engine, Role::Physician);
        let own = LicenseNumber::parse("MD-10234").unwrap();
        let other = LicenseNumber::parse("MD-55555").unwrap();
        assert!(owns_prescription(&physician, &own));
        assert!(!owns_prescription(&physician, &other));
    }

    #[test]
    fn licenseless_identity_owns_nothing() {
        let engine = PolicyEngine::builtin();
        let mut integrator = identity_for_role(&engine, Role::Integrator);
        integrator.license = None;
        let license = LicenseNumber::parse("MD-10234").unwrap();
        assert!(!owns_prescription(&integrator, &license));
    }

    #[test]
    fn rejects_documents_without_physician_role() {
        let yaml = "version: 1\nroles:\n  nurse: [prescription.read]\nresources: {}\n";
        assert!(matches!(
            PolicyEngine::from_yaml(yaml),
            Err(PolicyError::MissingPhysicianRole)
        ));
    }

    #[test]
    fn rejects_unsupported_versions() {
        let yaml = "version: 2\nroles:\n  physician: []\nresources: {}\n";
        assert!(matches!(
            PolicyEngine::from_yaml(yaml),
            Err(PolicyError::UnsupportedVersion(2))
        ));
    }
}
