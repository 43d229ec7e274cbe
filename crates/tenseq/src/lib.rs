#![doc = include_str!("../README.md")]

pub mod allocator;
pub mod audit;
pub mod dispatcher;
mod error;
pub mod model;
pub mod pool;
pub mod setup;
pub mod store;
pub mod task;

pub use crate::allocator::allocate;
pub use crate::audit::{AuditReport, TenantAudit, audit};
pub use crate::dispatcher::{
    DispatchPlan, DispatchReport, FailurePolicy, TaskFailure, dispatch, dispatch_until,
};
pub use crate::error::*;
pub use crate::model::*;
pub use crate::pool::{Intake, PoolConfig, RetryPolicy, StoreTx, WorkerPool};
pub use crate::setup::setup;
pub use crate::store::{
    Connection, SequenceStore, Transaction,
    memory::{MemoryConnection, MemoryStore, MemoryStoreConfig, MemoryTransaction},
};
#[cfg(feature = "postgres")]
pub use crate::store::postgres::{
    PostgresConnection, PostgresStore, PostgresStoreConfig, PostgresTransaction,
};
pub use crate::task::{AllocatorTask, TaskOutcome, TxOperation};
