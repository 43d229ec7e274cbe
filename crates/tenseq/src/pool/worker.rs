use crate::{
    error::Result,
    pool::RetryPolicy,
    store::{Connection, Transaction},
    task::{AllocatorTask, TaskOutcome},
};
use core::time::Duration;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// Worker task that runs [`AllocatorTask`]s on the connection it owns.
///
/// For every task received from the shared `queue` the worker begins a
/// transaction, runs the task's operation, commits, and then emits one
/// [`TaskOutcome`] on `done`. A failed operation is rolled back and reported
/// as a failed outcome; the worker moves on to the next task.
///
/// The loop ends once the intake is closed and the queue is drained. The
/// connection is dropped on exit.
///
/// # Arguments
///
/// - `worker_id`: Index of this worker (used in outcomes and logs).
/// - `conn`: The connection owned by this worker for its whole lifetime.
/// - `queue`: Receiving end of the intake queue, shared by all workers.
/// - `done`: Completion signal conduit.
/// - `retry`: Policy for re-running tasks that failed transiently.
pub async fn worker_loop<C>(
    worker_id: usize,
    mut conn: C,
    queue: Arc<Mutex<mpsc::Receiver<AllocatorTask<C::Tx>>>>,
    done: mpsc::Sender<TaskOutcome>,
    retry: RetryPolicy,
) where
    C: Connection,
{
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started");

    loop {
        let next = queue.lock().await.recv().await;
        let Some(mut task) = next else {
            break;
        };

        let (attempts, result) = run_task(worker_id, &mut conn, &mut task, retry).await;

        #[cfg(feature = "tracing")]
        if let Err(e) = &result {
            tracing::warn!(
                unit = task.unit,
                tenant = %task.tenant_id,
                attempts,
                "Worker {worker_id} task failed: {e}"
            );
        }

        let outcome = TaskOutcome {
            unit: task.unit,
            tenant_id: task.tenant_id,
            worker_id,
            attempts,
            result,
        };
        if done.send(outcome).await.is_err() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Worker {worker_id} has no completion receiver");
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} stopped");
}

/// Runs `task` until it succeeds, fails permanently, or exhausts the retry
/// policy. Returns the number of attempts made and the last result.
async fn run_task<C>(
    _worker_id: usize,
    conn: &mut C,
    task: &mut AllocatorTask<C::Tx>,
    retry: RetryPolicy,
) -> (u32, Result<()>)
where
    C: Connection,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match run_once(conn, task).await {
            Err(e) if e.is_transient() && attempt < max_attempts => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    unit = task.unit,
                    "Worker {_worker_id} retrying after transient error: {e}"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = e;
                tokio::time::sleep(backoff_delay(retry.backoff, attempt)).await;
            }
            result => return (attempt, result),
        }
    }
}

/// Linear backoff before attempt `attempt + 1`, saturating at
/// [`Duration::MAX`].
fn backoff_delay(backoff: Duration, attempt: u32) -> Duration {
    backoff.saturating_mul(attempt)
}

/// `BEGIN`, run, `COMMIT`. Rolls back when the operation fails.
async fn run_once<C>(conn: &mut C, task: &mut AllocatorTask<C::Tx>) -> Result<()>
where
    C: Connection,
{
    let mut tx = conn.begin().await?;
    if let Err(e) = task.run(&mut tx).await {
        if let Err(_rollback) = tx.rollback().await {
            #[cfg(feature = "tracing")]
            tracing::warn!("Rollback failed: {_rollback}");
        }
        return Err(e);
    }
    tx.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly() {
        let step = Duration::from_millis(10);
        assert_eq!(backoff_delay(step, 1), step);
        assert_eq!(backoff_delay(step, 3), Duration::from_millis(30));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let step = Duration::from_secs(u64::MAX / 2 + 1);
        assert_eq!(backoff_delay(step, 2), Duration::MAX);
        assert_eq!(backoff_delay(Duration::MAX, u32::MAX), Duration::MAX);
    }
}
