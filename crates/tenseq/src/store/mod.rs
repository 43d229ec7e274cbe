//! The relational store collaborator.
//!
//! The allocation protocol only needs a handful of capabilities from its
//! backing store, captured by three traits:
//!
//! - [`SequenceStore`] opens connections.
//! - [`Connection`] is an exclusively owned handle that starts transactions.
//! - [`Transaction`] runs the statements the protocol and setup issue, then
//!   commits or rolls back.
//!
//! Every statement takes typed parameters. Nothing is ever spliced into
//! statement text, so implementations backed by a SQL engine must bind
//! parameters rather than format them.
//!
//! Implementations: [`memory::MemoryStore`] (always available) and
//! `postgres::PostgresStore` (feature `postgres`).
//!
//! Futures returned by these traits are `Send` so workers can run on a
//! multi-threaded runtime.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::{
    error::Result,
    model::{NewUser, SerialId, Tenant, TenantId, TenantLock, UserId, UserRecord},
};

pub use memory::{MemoryStore, MemoryStoreConfig};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresStore, PostgresStoreConfig};

/// Source of store connections.
pub trait SequenceStore: Send + Sync + 'static {
    type Conn: Connection;

    /// Opens a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connectivity`] if the store cannot accept another
    /// connection.
    ///
    /// [`Error::Connectivity`]: crate::Error::Connectivity
    fn connect(&self) -> impl Future<Output = Result<Self::Conn>> + Send;
}

/// A single store connection. Dropping it releases the connection.
pub trait Connection: Send + 'static {
    type Tx: Transaction;

    /// Starts a new transaction on this connection.
    fn begin(&mut self) -> impl Future<Output = Result<Self::Tx>> + Send;
}

/// An open transaction.
///
/// Dropping a transaction without calling [`commit`](Transaction::commit)
/// rolls it back and releases every row lock it holds.
pub trait Transaction: Send + 'static {
    /// `SELECT 1 FROM user_tenant_locks WHERE tenant_id = $1 FOR UPDATE`
    ///
    /// Waits until no other transaction holds the tenant's lock row. The lock
    /// is held until this transaction ends. Locking a row this transaction
    /// already holds returns immediately.
    fn lock_tenant(&mut self, tenant_id: TenantId) -> impl Future<Output = Result<()>> + Send;

    /// `SELECT COALESCE(MAX(tenant_serial_id), 0) FROM users WHERE tenant_id = $1`
    fn max_serial(&mut self, tenant_id: TenantId) -> impl Future<Output = Result<SerialId>> + Send;

    /// `INSERT INTO users (tenant_id, tenant_serial_id, name) VALUES ($1, $2, $3) RETURNING id`
    fn insert_user(&mut self, user: NewUser) -> impl Future<Output = Result<UserId>> + Send;

    /// `DROP TABLE IF EXISTS` for `users`, `user_tenant_locks` and `tenants`.
    fn drop_relations(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// `CREATE TABLE` for `tenants`, `user_tenant_locks` and `users`.
    fn create_relations(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn insert_tenant(&mut self, tenant: Tenant) -> impl Future<Output = Result<()>> + Send;

    fn insert_tenant_lock(&mut self, lock: TenantLock)
    -> impl Future<Output = Result<()>> + Send;

    /// All tenants ordered by id.
    fn tenants(&mut self) -> impl Future<Output = Result<Vec<Tenant>>> + Send;

    /// All lock rows ordered by tenant id.
    fn tenant_locks(&mut self) -> impl Future<Output = Result<Vec<TenantLock>>> + Send;

    /// Users of one tenant in insertion order.
    fn users(&mut self, tenant_id: TenantId)
    -> impl Future<Output = Result<Vec<UserRecord>>> + Send;

    /// `SELECT COUNT(*) FROM users`
    fn count_users(&mut self) -> impl Future<Output = Result<u64>> + Send;

    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    fn rollback(self) -> impl Future<Output = Result<()>> + Send;
}
