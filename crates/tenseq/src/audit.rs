//! Post-run verification of the allocation invariants.
//!
//! For every tenant the committed serials must be exactly `1..=count`: no
//! value twice and no value skipped.

use crate::{
    error::Result,
    model::{SerialId, TenantId},
    store::{Connection, SequenceStore, Transaction},
};
use std::collections::BTreeMap;

/// Serial number health of one tenant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantAudit {
    pub tenant_id: TenantId,
    /// Number of user rows.
    pub count: usize,
    pub max: SerialId,
    /// Serials held by more than one user, ascending.
    pub duplicates: Vec<SerialId>,
    /// Serials in `1..=max` held by no user, ascending.
    pub missing: Vec<SerialId>,
}

impl TenantAudit {
    /// Builds the audit of one tenant from its serials, in any order.
    pub fn from_serials(tenant_id: TenantId, serials: impl IntoIterator<Item = SerialId>) -> Self {
        let mut seen: BTreeMap<SerialId, usize> = BTreeMap::new();
        let mut count = 0;
        for serial in serials {
            *seen.entry(serial).or_default() += 1;
            count += 1;
        }

        let max = seen.keys().next_back().copied().unwrap_or(SerialId::ZERO);
        let duplicates = seen
            .iter()
            .filter(|&(_, &n)| n > 1)
            .map(|(&serial, _)| serial)
            .collect();
        let missing = (1..=max.0)
            .map(SerialId)
            .filter(|serial| !seen.contains_key(serial))
            .collect();

        Self {
            tenant_id,
            count,
            max,
            duplicates,
            missing,
        }
    }

    /// `true` when the serials are exactly `1..=count`.
    pub fn is_dense(&self) -> bool {
        self.duplicates.is_empty() && self.missing.is_empty() && self.max.0 == self.count as i64
    }
}

/// Store-wide audit.
#[derive(Clone, Debug)]
pub struct AuditReport {
    pub tenants: Vec<TenantAudit>,
    pub tenant_rows: usize,
    pub lock_rows: usize,
    pub total_users: u64,
}

impl AuditReport {
    /// `true` when every tenant is dense and owns exactly one lock row.
    pub fn is_consistent(&self) -> bool {
        self.tenant_rows == self.lock_rows && self.tenants.iter().all(TenantAudit::is_dense)
    }

    pub fn tenant(&self, tenant_id: TenantId) -> Option<&TenantAudit> {
        self.tenants.iter().find(|audit| audit.tenant_id == tenant_id)
    }
}

/// Reads every tenant's users in one transaction and audits their serials.
///
/// # Errors
///
/// Propagates store errors (connectivity, missing relations).
pub async fn audit<S>(store: &S) -> Result<AuditReport>
where
    S: SequenceStore,
{
    let mut conn = store.connect().await?;
    let mut tx = conn.begin().await?;

    let tenants = tx.tenants().await?;
    let lock_rows = tx.tenant_locks().await?.len();
    let total_users = tx.count_users().await?;

    let mut audits = Vec::with_capacity(tenants.len());
    for tenant in &tenants {
        let users = tx.users(tenant.id).await?;
        audits.push(TenantAudit::from_serials(
            tenant.id,
            users.into_iter().map(|user| user.tenant_serial_id),
        ));
    }
    tx.rollback().await?;

    Ok(AuditReport {
        tenants: audits,
        tenant_rows: tenants.len(),
        lock_rows,
        total_users,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serials(values: &[i64]) -> Vec<SerialId> {
        values.iter().copied().map(SerialId).collect()
    }

    #[test]
    fn dense_serials_pass() {
        let audit = TenantAudit::from_serials(TenantId(1), serials(&[3, 1, 2]));
        assert!(audit.is_dense());
        assert_eq!(audit.count, 3);
        assert_eq!(audit.max, SerialId(3));
    }

    #[test]
    fn empty_tenant_is_dense() {
        let audit = TenantAudit::from_serials(TenantId(1), []);
        assert!(audit.is_dense());
        assert_eq!(audit.max, SerialId::ZERO);
    }

    #[test]
    fn duplicates_and_gaps_are_reported() {
        let audit = TenantAudit::from_serials(TenantId(2), serials(&[1, 2, 2, 5]));
        assert!(!audit.is_dense());
        assert_eq!(audit.duplicates, serials(&[2]));
        assert_eq!(audit.missing, serials(&[3, 4]));
    }

    #[test]
    fn duplicates_without_gaps_are_not_dense() {
        let audit = TenantAudit::from_serials(TenantId(1), serials(&[1, 1]));
        assert!(audit.missing.is_empty());
        assert!(!audit.is_dense());
    }
}
