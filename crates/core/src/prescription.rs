//! Prescription records and lifecycle states.

use crate::signing::SignatureRecord;
use chrono::{DateTime, Utc};
use erx_types::LicenseNumber;
use serde::{Deserialize, Serialize};

/// Lifecycle states of a prescription.
///
/// `Draft` is the only initial state. `Completed`, `Cancelled` and
/// `EnteredInError` are terminal; records in a terminal state are retained
/// for audit and never physically deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrescriptionStatus {
    Draft,
    Active,
    OnHold,
    Completed,
    Cancelled,
    EnteredInError,
}

impl PrescriptionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PrescriptionStatus::Completed
                | PrescriptionStatus::Cancelled
                | PrescriptionStatus::EnteredInError
        )
    }

    /// States from which a dispense may be recorded.
    pub fn permits_dispense(&self) -> bool {
        matches!(self, PrescriptionStatus::Active | PrescriptionStatus::OnHold)
    }

    /// States from which cancellation is permitted.
    pub fn permits_cancel(&self) -> bool {
        matches!(self, PrescriptionStatus::Draft | PrescriptionStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PrescriptionStatus::Draft => "draft",
            PrescriptionStatus::Active => "active",
            PrescriptionStatus::OnHold => "on-hold",
            PrescriptionStatus::Completed => "completed",
            PrescriptionStatus::Cancelled => "cancelled",
            PrescriptionStatus::EnteredInError => "entered-in-error",
        }
    }
}

impl std::fmt::Display for PrescriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One prescribed medication line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicationItem {
    /// Catalog code for the medication.
    pub code: String,
    /// Human-readable medication name.
    pub display: String,
    /// Free-text dosage instruction.
    pub dosage: String,
}

/// A prescription record.
///
/// Invariants maintained by the lifecycle service:
/// - `0 <= remaining_dispenses <= allowed_dispenses`
/// - `signature` is attached at the draft -> active transition and never
///   removed afterwards
/// - `status` only moves along the lifecycle transition table
/// - once `expires_at` has passed, no new dispenses are recorded regardless
///   of status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prescription {
    pub id: String,
    pub prescription_number: String,
    pub status: PrescriptionStatus,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub prescriber_license: LicenseNumber,
    pub prescriber_name: Option<String>,
    pub facility_id: Option<String>,
    pub facility_name: Option<String>,
    pub medications: Vec<MedicationItem>,
    pub allowed_dispenses: u32,
    pub remaining_dispenses: u32,
    pub signature: Option<SignatureRecord>,
    pub signed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Prescription {
    /// Returns true once the validity window has closed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serialises_as_kebab_case() {
        let json = serde_json::to_string(&PrescriptionStatus::EnteredInError).unwrap();
        assert_eq!(json, "\"entered-in-error\"");
        let json = serde_json::to_string(&PrescriptionStatus::OnHold).unwrap();
        assert_eq!(json, "\"on-hold\"");
    }

    #[test]
    fn terminal_states_do_not_permit_dispense_or_cancel() {
        for status in [
            PrescriptionStatus::Completed,
            PrescriptionStatus::Cancelled,
            PrescriptionStatus::EnteredInError,
        ] {
            assert!(status.is_terminal());
            assert!(!status.permits_dispense());
            assert!(!status.permits_cancel());
        }
    }

    #[test]
    fn on_hold_permits_dispense_but_not_cancel() {
        assert!(PrescriptionStatus::OnHold.permits_dispense());
        assert!(!PrescriptionStatus::OnHold.permits_cancel());
    }
}
