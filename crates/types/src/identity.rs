//! The authenticated caller identity.

use crate::{LicenseNumber, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An authenticated identity, as assembled at login and embedded in access
/// tokens.
///
/// Immutable once embedded in a token; on verification it is reconstructed
/// from the token's claims without any external round-trip. Scopes are a set:
/// order carries no meaning and duplicates are impossible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject identifier from the identity provider.
    pub id: String,
    /// Practitioner license, absent for non-practitioner accounts.
    pub license: Option<LicenseNumber>,
    pub name: String,
    pub role: Role,
    pub specialty: Option<String>,
    pub facility_id: Option<String>,
    pub facility_name: Option<String>,
    /// Capability strings granted to this identity (e.g. `prescription.sign`).
    pub scopes: BTreeSet<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Identity {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Returns true if this identity holds the given prescriber license.
    ///
    /// Ownership checks for sign/cancel are layered on top of scope checks;
    /// an identity without a license never owns a prescription.
    pub fn holds_license(&self, license: &LicenseNumber) -> bool {
        self.license.as_ref() == Some(license)
    }
}
