//! Units of work and their completion signals.

use crate::{
    allocator::allocate,
    error::{Error, Result},
    model::TenantId,
    store::Transaction,
};
use futures::{FutureExt, future::BoxFuture};

/// An operation run by a worker inside a transaction it owns.
///
/// The worker begins the transaction before calling the operation and
/// commits it afterwards. `FnMut` lets a worker re-run the operation in a
/// fresh transaction when a retry policy allows it.
pub type TxOperation<Tx> =
    Box<dyn for<'tx> FnMut(&'tx mut Tx) -> BoxFuture<'tx, Result<()>> + Send + 'static>;

/// A unit of work bound to one tenant. Consumed exactly once by a worker.
pub struct AllocatorTask<Tx> {
    pub unit: usize,
    pub tenant_id: TenantId,
    pub(crate) op: TxOperation<Tx>,
}

impl<Tx> AllocatorTask<Tx>
where
    Tx: Transaction,
{
    /// Wraps an arbitrary transactional operation.
    pub fn new<F>(unit: usize, tenant_id: TenantId, op: F) -> Self
    where
        F: for<'tx> FnMut(&'tx mut Tx) -> BoxFuture<'tx, Result<()>> + Send + 'static,
    {
        Self {
            unit,
            tenant_id,
            op: Box::new(op),
        }
    }

    /// The standard unit: allocate the tenant's next serial for a user named
    /// `name`.
    pub fn allocate(unit: usize, tenant_id: TenantId, name: String) -> Self {
        Self::new(unit, tenant_id, move |tx: &mut Tx| {
            let name = name.clone();
            async move { allocate(tx, tenant_id, &name).await.map(|_| ()) }.boxed()
        })
    }

    pub(crate) fn run<'tx>(&mut self, tx: &'tx mut Tx) -> BoxFuture<'tx, Result<()>> {
        (self.op)(tx)
    }
}

/// Completion signal emitted by a worker for every task it consumed.
///
/// Success is emitted only after the transaction committed. A failed task
/// has been rolled back and left no rows behind.
#[derive(Debug)]
pub struct TaskOutcome {
    pub unit: usize,
    pub tenant_id: TenantId,
    pub worker_id: usize,
    /// Number of transactions the task was run in.
    pub attempts: u32,
    pub result: Result<()>,
}

impl TaskOutcome {
    pub const fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }
}
