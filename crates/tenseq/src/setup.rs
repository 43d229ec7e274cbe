//! One-shot schema and tenant setup.
//!
//! Runs once, single-threaded, before any worker starts. Everything happens
//! in one transaction so a failed setup leaves the previous relations
//! untouched.

use crate::{
    error::{Error, Result},
    model::{Tenant, TenantId, TenantLock},
    store::{Connection, SequenceStore, Transaction},
};

/// Drops and recreates `tenants`, `user_tenant_locks` and `users`, then
/// inserts `tenant_count` tenants (ids `1..=tenant_count`) with one lock row
/// each.
///
/// Re-running it yields an empty `users` relation and exactly
/// `tenant_count` tenant and lock rows.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] if `tenant_count` is zero or does not
/// fit a tenant id, or any store error raised while connecting, running the
/// statements, or committing.
pub async fn setup<S>(store: &S, tenant_count: usize) -> Result<()>
where
    S: SequenceStore,
{
    if tenant_count == 0 {
        return Err(Error::InvalidRequest {
            reason: "tenant count must be greater than 0".to_string(),
        });
    }
    let last = i32::try_from(tenant_count).map_err(|_| Error::InvalidRequest {
        reason: format!("tenant count {tenant_count} exceeds the tenant id range"),
    })?;

    let mut conn = store.connect().await?;
    let mut tx = conn.begin().await?;

    tx.drop_relations().await?;
    tx.create_relations().await?;

    for id in (1..=last).map(TenantId) {
        tx.insert_tenant(Tenant::named(id)).await?;
    }
    for tenant_id in (1..=last).map(TenantId) {
        tx.insert_tenant_lock(TenantLock { tenant_id }).await?;
    }

    tx.commit().await?;

    #[cfg(feature = "tracing")]
    tracing::info!(tenants = tenant_count, "Relations recreated");

    Ok(())
}
