//! Row types for the three relations the protocol touches.
//!
//! - `tenants(id, name)`
//! - `user_tenant_locks(tenant_id)`
//! - `users(id, tenant_id, tenant_serial_id, name)`

use core::fmt;

/// Identity of a tenant. Tenant ids start at 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantId(pub i32);

impl TenantId {
    /// Tenant owning the zero-based work unit `unit` when `tenant_count`
    /// tenants share the workload round-robin.
    ///
    /// `tenant_count` must be in `1..=i32::MAX`; `setup` and the dispatcher
    /// reject anything else before calling this.
    pub fn for_unit(unit: usize, tenant_count: usize) -> Self {
        Self((unit % tenant_count) as i32 + 1)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tenant-local sequence number (`users.tenant_serial_id`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SerialId(pub i64);

impl SerialId {
    /// The value `MAX(tenant_serial_id)` takes for a tenant with no users.
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SerialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned primary key of a user row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(pub i64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
}

impl Tenant {
    /// Builds the tenant row created at setup (`tenant{id}`).
    pub fn named(id: TenantId) -> Self {
        Self {
            id,
            name: format!("tenant{id}"),
        }
    }
}

/// A row whose only role is to be locked. Its content never changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TenantLock {
    pub tenant_id: TenantId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub tenant_id: TenantId,
    pub tenant_serial_id: SerialId,
    pub name: String,
}

/// Insert payload for `users`; the store assigns the id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewUser {
    pub tenant_id: TenantId,
    pub tenant_serial_id: SerialId,
    pub name: String,
}

/// Deterministic display name for work unit `unit`.
pub fn unit_name(unit: usize) -> String {
    format!("user{unit}")
}
