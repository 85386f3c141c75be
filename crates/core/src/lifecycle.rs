//! The prescription lifecycle state machine.
//!
//! All mutations of a prescription record go through [`PrescriptionService`]:
//! create, sign, cancel and dispense recording, plus the read-only
//! dispensability check. The authorization policy gates every transition, and
//! ownership (the prescribing license) gates sign and cancel on top of the
//! scope check.
//!
//! ## Dispense accounting
//!
//! `record_dispense` is the one operation with a true race window: two
//! concurrent dispense attempts against the same prescription must never both
//! succeed when only one unit remains. The service holds an exclusive
//! per-prescription-id lock across the read-compute-write cycle against the
//! repository; dispenses against different prescriptions do not block each
//! other.

use crate::gate::{ensure_active, CredentialRegistry};
use crate::prescription::{MedicationItem, Prescription, PrescriptionStatus};
use crate::repository::PrescriptionRepository;
use crate::signing::PrescriptionSigner;
use chrono::{DateTime, Utc};
use erx_policy::{owns_prescription, PolicyEngine};
use erx_types::{Identity, ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Request payload for creating a prescription.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPrescription {
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub medications: Vec<MedicationItem>,
    pub allowed_dispenses: u32,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of the read-only dispensability check.
#[derive(Debug, Clone, Serialize)]
pub struct Dispensability {
    pub allowed: bool,
    pub reason: Option<String>,
    pub remaining_dispenses: u32,
}

/// Per-prescription exclusive locks.
///
/// The outer map lock is held only long enough to fetch or create the entry;
/// the per-id mutex is then held across the full read-compute-write cycle.
#[derive(Default)]
struct LockMap {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockMap {
    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().await;
        map.entry(id.to_owned()).or_default().clone()
    }

    /// Drops the entry once no task holds its lock any more.
    ///
    /// Callers must have released both the per-id guard and their `Arc`
    /// before calling this. The strong count is read under the map lock,
    /// the same lock `lock_for` clones under, so a concurrent caller either
    /// cloned first (count > 1, entry retained) or will create a fresh
    /// entry after removal; mutual exclusion holds either way.
    async fn release(&self, id: &str) {
        let mut map = self.inner.lock().await;
        if map.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(id);
        }
    }
}

/// Executes prescription lifecycle transitions; see the module docs.
pub struct PrescriptionService {
    repo: Arc<dyn PrescriptionRepository>,
    registry: Arc<dyn CredentialRegistry>,
    policy: Arc<PolicyEngine>,
    signer: Arc<PrescriptionSigner>,
    locks: LockMap,
}

impl PrescriptionService {
    pub fn new(
        repo: Arc<dyn PrescriptionRepository>,
        registry: Arc<dyn CredentialRegistry>,
        policy: Arc<PolicyEngine>,
        signer: Arc<PrescriptionSigner>,
    ) -> Self {
        Self {
            repo,
            registry,
            policy,
            signer,
            locks: LockMap::default(),
        }
    }

    /// Creates a new prescription in `draft` with a full dispense allowance.
    pub async fn create(
        &self,
        identity: &Identity,
        request: NewPrescription,
    ) -> ServiceResult<Prescription> {
        self.check_scope(identity, "Prescription", "create")?;
        let Some(license) = identity.license.clone() else {
            return Err(ServiceError::forbidden(
                "a prescriber license is required to create prescriptions",
            ));
        };
        validate_new_prescription(&request)?;

        let now = Utc::now();
        let id = Uuid::new_v4();
        let prescription = Prescription {
            id: id.to_string(),
            prescription_number: prescription_number(&id),
            status: PrescriptionStatus::Draft,
            patient_id: request.patient_id.trim().to_owned(),
            patient_name: request.patient_name,
            prescriber_license: license,
            prescriber_name: Some(identity.name.clone()),
            facility_id: identity.facility_id.clone(),
            facility_name: identity.facility_name.clone(),
            medications: request.medications,
            allowed_dispenses: request.allowed_dispenses,
            remaining_dispenses: request.allowed_dispenses,
            signature: None,
            signed_at: None,
            created_at: now,
            updated_at: now,
            expires_at: request.expires_at,
        };

        self.repo.insert(prescription.clone()).await?;
        tracing::info!(
            prescription = %prescription.prescription_number,
            prescriber = %prescription.prescriber_license,
            "prescription created"
        );
        Ok(prescription)
    }

    /// Signs a draft prescription, moving it to `active`.
    ///
    /// Requires ownership and a verified, active registry credential. The
    /// signature and document hash are computed over the prescription content
    /// at sign time and attached immutably.
    pub async fn sign(&self, identity: &Identity, id: &str) -> ServiceResult<Prescription> {
        self.check_scope(identity, "Prescription", "sign")?;
        let mut prescription = self.fetch(id).await?;

        if !owns_prescription(identity, &prescription.prescriber_license) {
            return Err(ServiceError::forbidden(
                "only the prescriber may sign this prescription",
            ));
        }
        if prescription.status != PrescriptionStatus::Draft {
            return Err(ServiceError::conflict(format!(
                "cannot sign a prescription in status {}",
                prescription.status
            )));
        }

        let license = prescription.prescriber_license.clone();
        ensure_active(self.registry.as_ref(), &license).await?;

        let record = self
            .signer
            .sign(&prescription, license, identity.name.clone())
            .map_err(|err| ServiceError::internal(format!("signing failed: {err}")))?;

        let now = Utc::now();
        prescription.signed_at = Some(record.signed_at);
        prescription.signature = Some(record);
        prescription.status = PrescriptionStatus::Active;
        prescription.updated_at = now;

        self.repo.update(prescription.clone()).await?;
        tracing::info!(
            prescription = %prescription.prescription_number,
            "prescription signed"
        );
        Ok(prescription)
    }

    /// Cancels a draft or active prescription. Owner only.
    pub async fn cancel(&self, identity: &Identity, id: &str) -> ServiceResult<Prescription> {
        self.check_scope(identity, "Prescription", "cancel")?;
        let mut prescription = self.fetch(id).await?;

        if !owns_prescription(identity, &prescription.prescriber_license) {
            return Err(ServiceError::forbidden(
                "only the prescriber may cancel this prescription",
            ));
        }
        if !prescription.status.permits_cancel() {
            return Err(ServiceError::conflict(format!(
                "cannot cancel a prescription in status {}",
                prescription.status
            )));
        }

        prescription.status = PrescriptionStatus::Cancelled;
        prescription.updated_at = Utc::now();
        self.repo.update(prescription.clone()).await?;
        tracing::info!(
            prescription = %prescription.prescription_number,
            "prescription cancelled"
        );
        Ok(prescription)
    }

    /// Records one dispense against a prescription.
    ///
    /// Atomic per record: the per-id lock is held from the read to the write,
    /// so concurrent attempts serialise and the remaining counter can never
    /// go below zero. The final dispense completes the prescription; a
    /// partial fulfilment signalled by the caller puts it on hold; otherwise
    /// the status is left unchanged.
    pub async fn record_dispense(
        &self,
        identity: &Identity,
        id: &str,
        is_partial: bool,
    ) -> ServiceResult<Prescription> {
        self.check_scope(identity, "Dispense", "create")?;

        let lock = self.locks.lock_for(id).await;
        let guard = lock.lock().await;
        let result = self.dispense_locked(id, is_partial).await;
        drop(guard);
        drop(lock);
        self.locks.release(id).await;
        result
    }

    async fn dispense_locked(&self, id: &str, is_partial: bool) -> ServiceResult<Prescription> {
        let mut prescription = self.fetch(id).await?;
        let now = Utc::now();

        if !prescription.status.permits_dispense() {
            return Err(ServiceError::conflict(format!(
                "cannot dispense a prescription in status {}",
                prescription.status
            )));
        }
        if prescription.is_expired(now) {
            return Err(ServiceError::conflict("prescription has expired"));
        }
        if prescription.remaining_dispenses == 0 {
            // Unreachable while the status invariant holds (zero remaining
            // implies completed), but the counter must never underflow.
            return Err(ServiceError::conflict("no dispenses remaining"));
        }

        prescription.remaining_dispenses -= 1;
        if prescription.remaining_dispenses == 0 {
            prescription.status = PrescriptionStatus::Completed;
        } else if is_partial {
            prescription.status = PrescriptionStatus::OnHold;
        }
        prescription.updated_at = now;

        self.repo.update(prescription.clone()).await?;
        tracing::debug!(
            prescription = %prescription.prescription_number,
            remaining = prescription.remaining_dispenses,
            status = %prescription.status,
            "dispense recorded"
        );
        Ok(prescription)
    }

    /// Read-only check of whether a dispense would currently be permitted.
    pub async fn verify_dispensable(
        &self,
        identity: &Identity,
        id: &str,
    ) -> ServiceResult<Dispensability> {
        self.check_scope(identity, "Dispense", "read")?;
        let prescription = self.fetch(id).await?;
        let now = Utc::now();

        let reason = if !prescription.status.permits_dispense() {
            Some(format!(
                "prescription is in status {}",
                prescription.status
            ))
        } else if prescription.is_expired(now) {
            Some("prescription has expired".to_owned())
        } else if prescription.remaining_dispenses == 0 {
            Some("no dispenses remaining".to_owned())
        } else {
            None
        };

        Ok(Dispensability {
            allowed: reason.is_none(),
            reason,
            remaining_dispenses: prescription.remaining_dispenses,
        })
    }

    async fn fetch(&self, id: &str) -> ServiceResult<Prescription> {
        self.repo
            .find(id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("prescription {id} does not exist")))
    }

    fn check_scope(&self, identity: &Identity, resource: &str, action: &str) -> ServiceResult<()> {
        if self.policy.authorize(identity, resource, action).is_allowed() {
            Ok(())
        } else {
            Err(ServiceError::forbidden(format!(
                "identity lacks the scope required for {action} on {resource}"
            )))
        }
    }
}

fn prescription_number(id: &Uuid) -> String {
    let hex = id.simple().to_string();
    format!("RX-{}", hex[..10].to_ascii_uppercase())
}

fn validate_new_prescription(request: &NewPrescription) -> ServiceResult<()> {
    if request.patient_id.trim().is_empty() {
        return Err(ServiceError::invalid_request("patient_id is required"));
    }
    if request.medications.is_empty() {
        return Err(ServiceError::invalid_request(
            "at least one medication is required",
        ));
    }
    for item in &request.medications {
        if item.code.trim().is_empty() || item.display.trim().is_empty() {
            return Err(ServiceError::invalid_request(
                "medication entries require a code and a display name",
            ));
        }
    }
    if request.allowed_dispenses == 0 {
        return Err(ServiceError::invalid_request(
            "allowed_dispenses must be at least 1",
        ));
    }
    Ok(())
}
