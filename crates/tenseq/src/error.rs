//! Error types for tenant-scoped sequence allocation.
//!
//! [`Error`] follows the store collaborator's failure taxonomy: connectivity,
//! transaction lifecycle and query failures, plus the pool and dispatcher
//! conditions layered on top of them. Every failure is returned as a value so
//! the dispatcher can decide whether a batch continues or aborts.
//!
//! ## Error Cases
//! - `Connectivity`: a store connection could not be opened.
//! - `Transaction`: begin, commit or rollback failed.
//! - `Query`: a statement was rejected by the store (see [`QueryError`]).
//! - `LockTimeout`: waiting for a tenant lock row exceeded the store's limit.
//! - `InvalidRequest`: parameters were out of range (e.g. zero tenants).
//! - `ChannelError`: the intake or completion conduit failed.
//! - `PoolShutdown`: a task was submitted after the intake was closed.
//! - `WorkerPanicked`: a worker task terminated abnormally.
//! - `BatchAborted`: the dispatcher stopped a batch after a failed unit.

use crate::model::TenantId;
use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the allocation protocol and its workers.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The store refused or could not open a connection.
    #[error("Connectivity error: {context}")]
    Connectivity { context: String },

    /// A transaction could not be started, committed or rolled back.
    #[error("Transaction error: {context}")]
    Transaction { context: String },

    /// A statement failed inside an open transaction.
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// The tenant lock row stayed held by another transaction for longer than
    /// the store allows a lock wait to take.
    #[error("Timed out after {waited:?} waiting for lock on tenant {tenant_id}")]
    LockTimeout { tenant_id: TenantId, waited: Duration },

    /// A caller passed parameters the operation cannot run with.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Internal channel send/receive failure.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The pool's intake conduit is closed.
    #[error("Worker pool is shut down")]
    PoolShutdown,

    /// A worker task panicked or was aborted.
    #[error("Worker {worker_id} panicked")]
    WorkerPanicked { worker_id: usize },

    /// The dispatcher stopped submitting after `unit` failed.
    #[error("Batch aborted at unit {unit} (tenant {tenant_id}): {source}")]
    BatchAborted {
        unit: usize,
        tenant_id: TenantId,
        source: Box<Error>,
    },
}

impl Error {
    /// Returns `true` when re-running the unit in a fresh transaction may
    /// succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

/// Statement-level failures reported by the store.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum QueryError {
    /// The relations have not been created (or were dropped).
    #[error("relation \"{relation}\" does not exist")]
    UndefinedRelation { relation: &'static str },

    /// `SELECT ... FOR UPDATE` matched no lock row for the tenant.
    #[error("no lock row for tenant {tenant_id}")]
    MissingLockRow { tenant_id: TenantId },

    /// A row referenced a tenant that does not exist.
    #[error("insert into \"{relation}\" violates foreign key: tenant {tenant_id} not present")]
    ForeignKeyViolation {
        relation: &'static str,
        tenant_id: TenantId,
    },

    /// `CREATE TABLE` on a relation that already exists.
    #[error("relation \"{relation}\" already exists")]
    DuplicateRelation { relation: &'static str },

    /// A primary key value was inserted twice.
    #[error("duplicate key value in \"{relation}\": {key}")]
    DuplicateKey { relation: &'static str, key: i64 },

    /// Any other statement failure, identified by its SQLSTATE.
    #[error("statement rejected ({code}): {message}")]
    Rejected { code: String, message: String },
}
