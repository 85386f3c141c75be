//! Platform roles.

use serde::{Deserialize, Serialize};

/// The closed set of roles the platform recognises.
///
/// Roles arrive as free-form strings in identity provider claims; anything
/// outside the known set deserialises to [`Role::Unknown`]. The authorization
/// policy maps an unknown role to the physician scope set as an explicit,
/// documented floor (see the policy crate), so `Unknown` is representable
/// rather than an error here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Physician,
    Pharmacist,
    Nurse,
    Regulator,
    Admin,
    Integrator,
    #[serde(other)]
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Physician => "physician",
            Role::Pharmacist => "pharmacist",
            Role::Nurse => "nurse",
            Role::Regulator => "regulator",
            Role::Admin => "admin",
            Role::Integrator => "integrator",
            Role::Unknown => "unknown",
        }
    }

    /// Maps a provider role claim to a known role, if any.
    pub fn from_claim(claim: &str) -> Option<Role> {
        match claim.trim().to_ascii_lowercase().as_str() {
            "physician" => Some(Role::Physician),
            "pharmacist" => Some(Role::Pharmacist),
            "nurse" => Some(Role::Nurse),
            "regulator" => Some(Role::Regulator),
            "admin" => Some(Role::Admin),
            "integrator" => Some(Role::Integrator),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_role_claims_deserialise_to_unknown() {
        let role: Role = serde_json::from_str("\"locum\"").unwrap();
        assert_eq!(role, Role::Unknown);
    }

    #[test]
    fn known_roles_round_trip() {
        let json = serde_json::to_string(&Role::Pharmacist).unwrap();
        assert_eq!(json, "\"pharmacist\"");
        let back: Role = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Role::Pharmacist);
    }

    #[test]
    fn from_claim_is_case_insensitive() {
        assert_eq!(Role::from_claim(" Physician "), Some(Role::Physician));
        assert_eq!(Role::from_claim("locum"), None);
    }
}
