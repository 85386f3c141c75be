//! Prescription storage abstraction.
//!
//! The lifecycle service is written against [`PrescriptionRepository`], an
//! injected trait, so the backing store can be swapped (in-memory for a
//! single process, relational or key-value for shared deployments) without
//! touching lifecycle logic. Records are never physically deleted; terminal
//! states are retained for audit, so the trait deliberately has no delete.

use crate::prescription::Prescription;
use async_trait::async_trait;
use erx_types::{ServiceError, ServiceResult};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Storage interface for prescription records.
#[async_trait]
pub trait PrescriptionRepository: Send + Sync {
    /// Inserts a new record. Fails with `Conflict` if the id already exists.
    async fn insert(&self, prescription: Prescription) -> ServiceResult<()>;

    /// Looks up a record by id.
    async fn find(&self, id: &str) -> ServiceResult<Option<Prescription>>;

    /// Replaces an existing record. Fails with `NotFound` if it is missing.
    async fn update(&self, prescription: Prescription) -> ServiceResult<()>;
}

/// Process-local in-memory store.
///
/// Suitable for a single instance; shared deployments inject a durable
/// implementation instead.
#[derive(Default)]
pub struct MemoryPrescriptionStore {
    records: RwLock<HashMap<String, Prescription>>,
}

impl MemoryPrescriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PrescriptionRepository for MemoryPrescriptionStore {
    async fn insert(&self, prescription: Prescription) -> ServiceResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&prescription.id) {
            return Err(ServiceError::conflict(format!(
                "prescription {} already exists",
                prescription.id
            )));
        }
        records.insert(prescription.id.clone(), prescription);
        Ok(())
    }

    async fn find(&self, id: &str) -> ServiceResult<Option<Prescription>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn update(&self, prescription: Prescription) -> ServiceResult<()> {
        let mut records = self.records.write().await;
        match records.get_mut(&prescription.id) {
            Some(slot) => {
                *slot = prescription;
                Ok(())
            }
            None => Err(ServiceError::not_found(format!(
                "prescription {} does not exist",
                prescription.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prescription::{MedicationItem, PrescriptionStatus};
    use chrono::Utc;
    use erx_types::{ErrorKind, LicenseNumber};

    fn sample(id: &str) -> Prescription {
        Prescription {
            id: id.into(),
            prescription_number: format!("RX-{id}"),
            status: PrescriptionStatus::Draft,
            patient_id: "pat-1".into(),
            patient_name: None,
            prescriber_license: LicenseNumber::parse("MD-10234").unwrap(),
            prescriber_name: None,
            facility_id: None,
            facility_name: None,
            medications: vec![MedicationItem {
                code: "AMOX-500".into(),
                display: "Amoxicillin 500mg".into(),
                dosage: "1 capsule three times daily".into(),
            }],
            allowed_dispenses: 2,
            remaining_dispenses: 2,
            signature: None,
            signed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn insert_then_find() {
        let store = MemoryPrescriptionStore::new();
        store.insert(sample("rx-1")).await.unwrap();
        let found = store.find("rx-1").await.unwrap().unwrap();
        assert_eq!(found.id, "rx-1");
        assert!(store.find("rx-404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let store = MemoryPrescriptionStore::new();
        store.insert(sample("rx-1")).await.unwrap();
        let err = store.insert(sample("rx-1")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn update_missing_record_is_not_found() {
        let store = MemoryPrescriptionStore::new();
        let err = store.update(sample("rx-9")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
