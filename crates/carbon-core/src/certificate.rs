//! On-chain certificate registry.
//!
//! One [`CertificateRecord`] per issued certificate, keyed by id. The
//! counters move monotonically with the best chain: `CertificateAssign`
//! raises `assigned_amount`, `Compensation` raises `compensated_amount`, and
//! rollback reverses both symmetrically. Records are never deleted except by
//! rolling the issuing block out.
//!
//! Invariants enforced by every mutation:
//! `0 ≤ assigned ≤ total` and `0 ≤ compensated ≤ assigned`.
//!
//! Like the UTXO set, the registry is not internally locked; the chain
//! manager's writer lock covers both so readers observe a consistent pair.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CertificateError;
use crate::types::{CertificateId, CertificatePayload, CertificateRecord};

/// Query filter for [`CertificateRegistry::list`]. Empty filter matches all.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct CertificateFilter {
    pub project_id: Option<String>,
    pub vintage_year: Option<u16>,
    pub issuer: Option<String>,
}

impl CertificateFilter {
    fn matches(&self, record: &CertificateRecord) -> bool {
        self.project_id
            .as_ref()
            .is_none_or(|p| &record.project_id == p)
            && self.vintage_year.is_none_or(|v| record.vintage_year == v)
            && self.issuer.as_ref().is_none_or(|i| &record.issuer == i)
    }
}

/// Point-in-time copy of the registry, consumed by `restore`.
#[derive(Clone)]
pub struct RegistrySnapshot {
    records: HashMap<CertificateId, CertificateRecord>,
}

/// Registry of issued certificates and their assignment/retirement counters.
#[derive(Clone, Default)]
pub struct CertificateRegistry {
    records: HashMap<CertificateId, CertificateRecord>,
}

impl CertificateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &CertificateId) -> Option<&CertificateRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &CertificateId) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Register a new certificate. Ids are globally unique.
    pub fn issue(
        &mut self,
        payload: &CertificatePayload,
        issued_at: i64,
    ) -> Result<(), CertificateError> {
        if self.records.contains_key(&payload.certificate_id) {
            return Err(CertificateError::CertificateDuplicate(
                payload.certificate_id.to_string(),
            ));
        }
        self.records.insert(
            payload.certificate_id.clone(),
            CertificateRecord::from_payload(payload, issued_at),
        );
        Ok(())
    }

    /// Raise `assigned_amount` by `amount`, bounded by `total_amount`.
    pub fn assign(&mut self, id: &CertificateId, amount: u64) -> Result<(), CertificateError> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| CertificateError::UnknownCertificate(id.to_string()))?;
        let new_assigned = record
            .assigned_amount
            .checked_add(amount)
            .filter(|a| *a <= record.total_amount)
            .ok_or_else(|| CertificateError::CertificateExhausted {
                id: id.to_string(),
                assigned: record.assigned_amount,
                requested: amount,
                total: record.total_amount,
            })?;
        record.assigned_amount = new_assigned;
        Ok(())
    }

    /// Raise `compensated_amount` by `amount`, bounded by `assigned_amount`.
    pub fn compensate(&mut self, id: &CertificateId, amount: u64) -> Result<(), CertificateError> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| CertificateError::UnknownCertificate(id.to_string()))?;
        let new_compensated = record
            .compensated_amount
            .checked_add(amount)
            .filter(|c| *c <= record.assigned_amount)
            .ok_or_else(|| CertificateError::CompensationAlreadyUsed {
                id: id.to_string(),
                requested: amount,
                remaining: record.remaining_certified(),
            })?;
        record.compensated_amount = new_compensated;
        Ok(())
    }

    /// Undo an issue during rollback. The certificate must have no
    /// outstanding assignments (assign/compensation transactions in the same
    /// block roll back first, in reverse order).
    pub fn revert_issue(&mut self, id: &CertificateId) -> Result<(), CertificateError> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| CertificateError::UnknownCertificate(id.to_string()))?;
        debug_assert_eq!(record.assigned_amount, 0);
        self.records.remove(id);
        Ok(())
    }

    /// Undo an assignment during rollback.
    pub fn revert_assign(&mut self, id: &CertificateId, amount: u64) -> Result<(), CertificateError> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| CertificateError::UnknownCertificate(id.to_string()))?;
        record.assigned_amount = record.assigned_amount.saturating_sub(amount);
        debug_assert!(record.compensated_amount <= record.assigned_amount);
        Ok(())
    }

    /// Undo a compensation during rollback.
    pub fn revert_compensate(
        &mut self,
        id: &CertificateId,
        amount: u64,
    ) -> Result<(), CertificateError> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| CertificateError::UnknownCertificate(id.to_string()))?;
        record.compensated_amount = record.compensated_amount.saturating_sub(amount);
        Ok(())
    }

    /// Records matching the filter, in unspecified order.
    pub fn list(&self, filter: &CertificateFilter) -> Vec<CertificateRecord> {
        self.records
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CertificateRecord> {
        self.records.values()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            records: self.records.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: RegistrySnapshot) {
        self.records = snapshot.records;
    }
}
