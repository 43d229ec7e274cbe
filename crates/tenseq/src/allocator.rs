//! Tenant-scoped serial number allocation.
//!
//! [`allocate`] is the critical section of the whole system. Within the
//! caller's transaction it:
//!
//! 1. locks the tenant's row in `user_tenant_locks` (`SELECT ... FOR UPDATE`),
//! 2. reads `COALESCE(MAX(tenant_serial_id), 0)` for the tenant,
//! 3. inserts a user carrying `max + 1`.
//!
//! The lock is never released here. It is held from step 1 until the
//! enclosing transaction commits or rolls back, which covers both the read
//! and the insert. Releasing it any earlier lets two transactions observe
//! the same maximum and hand out the same serial.
//!
//! Any error leaves the transaction uncommitted; the caller is expected to
//! roll it back (or drop it). Nothing is retried.

use crate::{
    error::Result,
    model::{NewUser, SerialId, TenantId},
    store::Transaction,
};

/// Assigns the next serial number of `tenant_id` to a new user named `name`.
///
/// Returns the serial that was inserted. It only becomes visible to other
/// transactions once `tx` commits.
///
/// # Errors
///
/// Propagates any store error raised while locking, reading or inserting.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip(tx, name)))]
pub async fn allocate<T>(tx: &mut T, tenant_id: TenantId, name: &str) -> Result<SerialId>
where
    T: Transaction,
{
    tx.lock_tenant(tenant_id).await?;

    let serial = tx.max_serial(tenant_id).await?.next();
    tx.insert_user(NewUser {
        tenant_id,
        tenant_serial_id: serial,
        name: name.to_string(),
    })
    .await?;

    Ok(serial)
}
