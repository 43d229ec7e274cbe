//! Workload generation and completion tracking.
//!
//! [`dispatch`] turns a [`DispatchPlan`] into one [`AllocatorTask`] per unit,
//! feeds them to a [`WorkerPool`] and waits for exactly one completion signal
//! per submitted task.
//!
//! Submission runs on a fixed number of producer tasks. Producer `p` of `P`
//! submits units `p, p + P, p + 2P, ...`, so the order in which units reach
//! the queue is not the unit order. That is fine: only the per-tenant lock
//! decides serial order.

use crate::{
    error::{Error, Result},
    model::{TenantId, unit_name},
    pool::{Intake, StoreTx, WorkerPool},
    store::SequenceStore,
    task::{AllocatorTask, TaskOutcome},
};
use core::time::Duration;
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What the dispatcher does when a unit fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop submitting, wait for tasks already queued, and return
    /// [`Error::BatchAborted`].
    #[default]
    Abort,
    /// Record the failure and keep going.
    Continue,
}

/// Parameters of one batch.
#[derive(Clone, Copy, Debug)]
pub struct DispatchPlan {
    /// Total number of units of work.
    pub units: usize,
    /// Number of tenants; unit `i` belongs to tenant `i % tenants + 1`.
    pub tenants: usize,
    /// Number of concurrent producers feeding the intake queue.
    pub submitters: usize,
    pub failure_policy: FailurePolicy,
}

impl DispatchPlan {
    pub fn new(units: usize, tenants: usize) -> Self {
        Self {
            units,
            tenants,
            submitters: 1,
            failure_policy: FailurePolicy::default(),
        }
    }

    #[must_use]
    pub const fn with_submitters(mut self, submitters: usize) -> Self {
        self.submitters = submitters;
        self
    }

    #[must_use]
    pub const fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }
}

/// A unit that did not commit.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub unit: usize,
    pub tenant_id: TenantId,
    pub worker_id: usize,
    pub attempts: u32,
    pub error: Error,
}

/// Tally of a finished batch.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Tasks accepted by the intake queue.
    pub submitted: usize,
    /// Tasks whose transaction committed.
    pub completed: usize,
    pub failures: Vec<TaskFailure>,
    /// Committed tasks per tenant.
    pub per_tenant: BTreeMap<TenantId, usize>,
    /// `true` if the caller's token stopped submission before every unit was
    /// queued.
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Runs a whole batch to completion.
///
/// # Errors
///
/// See [`dispatch_until`].
pub async fn dispatch<S>(
    pool: &WorkerPool<S>,
    completions: &mut mpsc::Receiver<TaskOutcome>,
    plan: DispatchPlan,
) -> Result<DispatchReport>
where
    S: SequenceStore,
{
    dispatch_until(pool, completions, plan, CancellationToken::new()).await
}

/// Runs a batch until it completes or `cancel` fires.
///
/// Cancelling stops further submission; tasks already queued still run and
/// are tallied, and the report is returned with `cancelled` set.
///
/// # Errors
///
/// - [`Error::InvalidRequest`] for a plan with zero submitters, or a tenant
///   count that is zero or does not fit a tenant id.
/// - [`Error::BatchAborted`] when a unit fails under [`FailurePolicy::Abort`].
/// - [`Error::PoolShutdown`] or [`Error::ChannelError`] if the pool stops
///   accepting tasks or delivering completions.
pub async fn dispatch_until<S>(
    pool: &WorkerPool<S>,
    completions: &mut mpsc::Receiver<TaskOutcome>,
    plan: DispatchPlan,
    cancel: CancellationToken,
) -> Result<DispatchReport>
where
    S: SequenceStore,
{
    if plan.tenants == 0 {
        return Err(Error::InvalidRequest {
            reason: "tenant count must be greater than 0".to_string(),
        });
    }
    if i32::try_from(plan.tenants).is_err() {
        return Err(Error::InvalidRequest {
            reason: format!("tenant count {} exceeds the tenant id range", plan.tenants),
        });
    }
    if plan.submitters == 0 {
        return Err(Error::InvalidRequest {
            reason: "submitter count must be greater than 0".to_string(),
        });
    }

    #[cfg(feature = "tracing")]
    tracing::info!(
        units = plan.units,
        tenants = plan.tenants,
        submitters = plan.submitters,
        "Dispatching batch"
    );

    let start = Instant::now();
    let stop = cancel.child_token();
    let submitted = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..plan.submitters)
        .map(|index| {
            tokio::spawn(submit_units::<S>(
                pool.intake(),
                index,
                plan,
                stop.clone(),
                Arc::clone(&submitted),
            ))
        })
        .collect();
    let mut producers = std::pin::pin!(futures::future::join_all(handles));

    let mut report = DispatchReport::default();
    let mut abort: Option<TaskFailure> = None;
    let mut submit_err: Option<Error> = None;
    let mut producing = true;
    let mut interrupted = false;
    let mut received = 0;

    loop {
        if !producing && received == submitted.load(Ordering::Acquire) {
            break;
        }

        tokio::select! {
            results = &mut producers, if producing => {
                producing = false;
                for result in results {
                    let err = match result {
                        Ok(Ok(stopped)) => {
                            interrupted |= stopped;
                            continue;
                        }
                        Ok(Err(e)) => e,
                        Err(e) => Error::ChannelError {
                            context: format!("submitter terminated abnormally: {e}"),
                        },
                    };
                    submit_err.get_or_insert(err);
                }
            }
            outcome = completions.recv() => {
                let Some(outcome) = outcome else {
                    stop.cancel();
                    return Err(Error::ChannelError {
                        context: "completion channel closed".to_string(),
                    });
                };
                received += 1;
                match outcome.result {
                    Ok(()) => {
                        report.completed += 1;
                        *report.per_tenant.entry(outcome.tenant_id).or_default() += 1;
                    }
                    Err(error) => {
                        let failure = TaskFailure {
                            unit: outcome.unit,
                            tenant_id: outcome.tenant_id,
                            worker_id: outcome.worker_id,
                            attempts: outcome.attempts,
                            error,
                        };
                        if plan.failure_policy == FailurePolicy::Abort && abort.is_none() {
                            #[cfg(feature = "tracing")]
                            tracing::error!(
                                unit = failure.unit,
                                tenant = %failure.tenant_id,
                                "Aborting batch: {}", failure.error
                            );
                            stop.cancel();
                            abort = Some(failure.clone());
                        }
                        report.failures.push(failure);
                    }
                }
            }
        }
    }

    report.submitted = submitted.load(Ordering::Acquire);
    // Only a token that actually cut submission short counts.
    report.cancelled = interrupted && cancel.is_cancelled();
    report.elapsed = start.elapsed();

    if let Some(failure) = abort {
        return Err(Error::BatchAborted {
            unit: failure.unit,
            tenant_id: failure.tenant_id,
            source: Box::new(failure.error),
        });
    }
    if let Some(err) = submit_err {
        return Err(err);
    }

    #[cfg(feature = "tracing")]
    tracing::info!(
        completed = report.completed,
        failed = report.failures.len(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Batch finished"
    );

    Ok(report)
}

/// Producer `index`: submits every `plan.submitters`-th unit starting at
/// `index` until done or stopped. Returns `true` if it stopped before
/// submitting its last unit.
async fn submit_units<S>(
    intake: Intake<StoreTx<S>>,
    index: usize,
    plan: DispatchPlan,
    stop: CancellationToken,
    submitted: Arc<AtomicUsize>,
) -> Result<bool>
where
    S: SequenceStore,
{
    for unit in (index..plan.units).step_by(plan.submitters) {
        let tenant_id = TenantId::for_unit(unit, plan.tenants);
        let task = AllocatorTask::allocate(unit, tenant_id, unit_name(unit));

        tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(true),
            result = intake.submit(task) => {
                result?;
                submitted.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
    Ok(false)
}
