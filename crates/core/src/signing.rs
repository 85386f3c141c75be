//! Digital signing of prescriptions.
//!
//! A prescription is signed exactly once, at the draft -> active transition.
//! The signature record is immutable: it captures the ECDSA P-256 signature,
//! the signing certificate identifier, and a canonical SHA-256 content hash
//! of the prescription at signing time so the signature can be re-verified
//! later against the stored record.

use crate::prescription::{MedicationItem, Prescription};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use erx_types::LicenseNumber;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::DecodePrivateKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Signature algorithm identifier recorded alongside every signature.
pub const SIGNATURE_ALGORITHM: &str = "ecdsa-p256-sha256";

/// Errors that can occur while signing or verifying.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("failed to parse signing key: {0}")]
    KeyParse(String),
    #[error("failed to canonicalise prescription content: {0}")]
    Canonicalize(#[from] serde_json::Error),
    #[error("signature does not verify against the stored content hash")]
    VerificationFailed,
}

/// An immutable signature record, created once per sign operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Base64 raw 64-byte ECDSA signature (`r || s`).
    pub signature_data: String,
    pub algorithm: String,
    /// Identifier of the signing certificate.
    pub certificate_id: String,
    pub signed_at: DateTime<Utc>,
    pub signer_license: LicenseNumber,
    pub signer_name: String,
    /// Hex SHA-256 over the canonical prescription content at signing time.
    pub document_hash: String,
}

/// Canonical content covered by the signature.
///
/// Field order is fixed by this struct, which makes the serialised JSON a
/// stable canonical form. Mutable bookkeeping fields (`updated_at`,
/// `remaining_dispenses`) are deliberately excluded.
#[derive(Serialize)]
struct SignedContent<'a> {
    id: &'a str,
    prescription_number: &'a str,
    patient_id: &'a str,
    prescriber_license: &'a str,
    medications: &'a [MedicationItem],
    allowed_dispenses: u32,
    created_at: &'a DateTime<Utc>,
    expires_at: &'a Option<DateTime<Utc>>,
}

fn canonical_content(prescription: &Prescription) -> Result<Vec<u8>, SigningError> {
    let content = SignedContent {
        id: &prescription.id,
        prescription_number: &prescription.prescription_number,
        patient_id: &prescription.patient_id,
        prescriber_license: prescription.prescriber_license.as_str(),
        medications: &prescription.medications,
        allowed_dispenses: prescription.allowed_dispenses,
        created_at: &prescription.created_at,
        expires_at: &prescription.expires_at,
    };
    Ok(serde_json::to_vec(&content)?)
}

/// Signs prescription content with a process-wide ECDSA P-256 key.
pub struct PrescriptionSigner {
    key: SigningKey,
    certificate_id: String,
}

impl PrescriptionSigner {
    /// Generates an ephemeral signing key. Intended for tests and local
    /// development; production deployments load a provisioned key.
    pub fn generate(certificate_id: impl Into<String>) -> Self {
        Self {
            key: SigningKey::random(&mut rand::thread_rng()),
            certificate_id: certificate_id.into(),
        }
    }

    /// Loads a PKCS#8 PEM-encoded P-256 private key.
    pub fn from_pkcs8_pem(
        pem: &str,
        certificate_id: impl Into<String>,
    ) -> Result<Self, SigningError> {
        let key =
            SigningKey::from_pkcs8_pem(pem).map_err(|e| SigningError::KeyParse(e.to_string()))?;
        Ok(Self {
            key,
            certificate_id: certificate_id.into(),
        })
    }

    /// Produces the signature record for a prescription at signing time.
    pub fn sign(
        &self,
        prescription: &Prescription,
        signer_license: LicenseNumber,
        signer_name: impl Into<String>,
    ) -> Result<SignatureRecord, SigningError> {
        let content = canonical_content(prescription)?;
        let document_hash = hex::encode(Sha256::digest(&content));
        let signature: Signature = self.key.sign(&content);

        Ok(SignatureRecord {
            signature_data: general_purpose::STANDARD.encode(signature.to_bytes()),
            algorithm: SIGNATURE_ALGORITHM.to_owned(),
            certificate_id: self.certificate_id.clone(),
            signed_at: Utc::now(),
            signer_license,
            signer_name: signer_name.into(),
            document_hash,
        })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.key.verifying_key()
    }
}

/// Re-verifies a signature record against a stored prescription.
///
/// Checks both that the current canonical content still matches the recorded
/// document hash and that the ECDSA signature verifies over that content.
pub fn verify_signature(
    record: &SignatureRecord,
    prescription: &Prescription,
    verifying_key: &VerifyingKey,
) -> Result<(), SigningError> {
    let content = canonical_content(prescription)?;
    if hex::encode(Sha256::digest(&content)) != record.document_hash {
        return Err(SigningError::VerificationFailed);
    }

    let raw = general_purpose::STANDARD
        .decode(&record.signature_data)
        .map_err(|_| SigningError::VerificationFailed)?;
    let signature =
        Signature::from_slice(&raw).map_err(|_| SigningError::VerificationFailed)?;
    verifying_key
        .verify(&content, &signature)
        .map_err(|_| SigningError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prescription::PrescriptionStatus;

    fn draft() -> Prescription {
        Prescription {
            id: "rx-1".into(),
            prescription_number: "RX-000001".into(),
            status: PrescriptionStatus::Draft,
            patient_id: "pat-1".into(),
            patient_name: Some("Alex Byrne".into()),
            prescriber_license: LicenseNumber::parse("MD-10234").unwrap(),
            prescriber_name: Some("Dana Osei".into()),
            facility_id: None,
            facility_name: None,
            medications: vec![MedicationItem {
                code: "AMOX-500".into(),
                display: "Amoxicillin 500mg".into(),
                dosage: "1 capsule three times daily".into(),
            }],
            allowed_dispenses: 3,
            remaining_dispenses: 3,
            signature: None,
            signed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let signer = PrescriptionSigner::generate("cert-1");
        let prescription = draft();
        let record = signer
            .sign(
                &prescription,
                prescription.prescriber_license.clone(),
                "Dana Osei",
            )
            .unwrap();

        assert_eq!(record.algorithm, SIGNATURE_ALGORITHM);
        assert_eq!(record.certificate_id, "cert-1");
        verify_signature(&record, &prescription, &signer.verifying_key()).unwrap();
    }

    #[test]
    fn verification_fails_when_content_changes() {
        let signer = PrescriptionSigner::generate("cert-1");
        let prescription = draft();
        let record = signer
            .sign(
                &prescription,
                prescription.prescriber_license.clone(),
                "Dana Osei",
            )
            .unwrap();

        let mut altered = prescription.clone();
        altered.medications[0].dosage = "2 capsules three times daily".into();
        let err = verify_signature(&record, &altered, &signer.verifying_key());
        assert!(matches!(err, Err(SigningError::VerificationFailed)));
    }

    #[test]
    fn bookkeeping_fields_do_not_affect_the_hash() {
        let signer = PrescriptionSigner::generate("cert-1");
        let prescription = draft();
        let record = signer
            .sign(
                &prescription,
                prescription.prescriber_license.clone(),
                "Dana Osei",
            )
            .unwrap();

        // Dispense accounting mutates the record but not the signed content.
        let mut dispensed = prescription.clone();
        dispensed.remaining_dispenses = 1;
        dispensed.status = PrescriptionStatus::Active;
        dispensed.updated_at = Utc::now();
        verify_signature(&record, &dispensed, &signer.verifying_key()).unwrap();
    }

    #[test]
    fn foreign_key_does_not_verify() {
        let signer = PrescriptionSigner::generate("cert-1");
        let other = PrescriptionSigner::generate("cert-2");
        let prescription = draft();
        let record = signer
            .sign(
                &prescription,
                prescription.prescriber_license.clone(),
                "Dana Osei",
            )
            .unwrap();
        let err = verify_signature(&record, &prescription, &other.verifying_key());
        assert!(matches!(err, Err(SigningError::VerificationFailed)));
    }
}
