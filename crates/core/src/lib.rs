//! # eRx Core
//!
//! Core business logic for the eRx prescription platform:
//! - the prescription lifecycle state machine with concurrency-safe dispense
//!   accounting (`lifecycle`)
//! - digital signing of prescriptions at activation time (`signing`)
//! - the repository abstraction over prescription storage (`repository`)
//! - the credential gate orchestrating login, refresh and logout against the
//!   external identity provider and credential registry (`gate`)
//!
//! **No API concerns**: HTTP routing, wire DTOs and status-code mapping
//! belong in `api-rest`. Everything here speaks the shared
//! [`erx_types::ServiceError`] taxonomy.

pub mod gate;
pub mod lifecycle;
pub mod prescription;
pub mod repository;
pub mod signing;

pub use gate::{
    CredentialGate, CredentialRecord, CredentialRegistry, CredentialStatus,
    CredentialVerification, IdentityProvider, ProviderClaims, ProviderToken,
};
pub use lifecycle::{Dispensability, NewPrescription, PrescriptionService};
pub use prescription::{MedicationItem, Prescription, PrescriptionStatus};
pub use repository::{MemoryPrescriptionStore, PrescriptionRepository};
pub use signing::{PrescriptionSigner, SignatureRecord};
