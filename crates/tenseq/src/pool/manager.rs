//! Worker pool lifecycle.
//!
//! [`WorkerPool::start`] opens every connection up front, so a store that
//! cannot serve `num_workers` connections fails the start before any worker
//! runs. Each worker then owns its connection until it exits.

use crate::{
    error::{Error, Result},
    pool::{PoolConfig, worker::worker_loop},
    store::{Connection, SequenceStore},
    task::{AllocatorTask, TaskOutcome},
};
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};

/// Transaction type produced by a store's connections.
pub type StoreTx<S> = <<S as SequenceStore>::Conn as Connection>::Tx;

/// Cloneable handle for submitting tasks to a [`WorkerPool`].
pub struct Intake<Tx> {
    tx: mpsc::Sender<AllocatorTask<Tx>>,
}

impl<Tx> Clone for Intake<Tx> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Tx> Intake<Tx> {
    /// Queues a task, waiting while the intake queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolShutdown`] if every worker has exited.
    pub async fn submit(&self, task: AllocatorTask<Tx>) -> Result<()> {
        self.tx.send(task).await.map_err(|_| Error::PoolShutdown)
    }
}

/// A running pool of workers.
///
/// Completion signals are delivered on the receiver returned by
/// [`WorkerPool::start`]. Workers wait while that channel is full, so the
/// receiver must be drained while tasks are outstanding.
pub struct WorkerPool<S>
where
    S: SequenceStore,
{
    intake: Intake<StoreTx<S>>,
    workers: Vec<JoinHandle<()>>,
}

impl<S> WorkerPool<S>
where
    S: SequenceStore,
{
    /// Opens `num_workers` connections and spawns one worker per
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for a zero worker count or queue
    /// capacity, or the store's connectivity error. In both cases no worker
    /// has been spawned and every connection opened so far is released.
    pub async fn start(
        store: &S,
        config: PoolConfig,
    ) -> Result<(Self, mpsc::Receiver<TaskOutcome>)> {
        if config.num_workers == 0 {
            return Err(Error::InvalidRequest {
                reason: "worker count must be greater than 0".to_string(),
            });
        }
        if config.queue_capacity == 0 {
            return Err(Error::InvalidRequest {
                reason: "queue capacity must be greater than 0".to_string(),
            });
        }

        let mut connections = Vec::with_capacity(config.num_workers);
        for _ in 0..config.num_workers {
            connections.push(store.connect().await?);
        }

        let (task_tx, task_rx) = mpsc::channel(config.queue_capacity);
        let (done_tx, done_rx) = mpsc::channel(config.num_workers);
        let queue = Arc::new(Mutex::new(task_rx));

        let workers = connections
            .into_iter()
            .enumerate()
            .map(|(worker_id, conn)| {
                tokio::spawn(worker_loop(
                    worker_id,
                    conn,
                    Arc::clone(&queue),
                    done_tx.clone(),
                    config.retry,
                ))
            })
            .collect();

        #[cfg(feature = "tracing")]
        tracing::info!(
            workers = config.num_workers,
            queue_capacity = config.queue_capacity,
            "Worker pool started"
        );

        let pool = Self {
            intake: Intake { tx: task_tx },
            workers,
        };
        Ok((pool, done_rx))
    }

    /// Returns a new submit handle.
    ///
    /// Workers only exit once every handle (and the pool) is gone, so drop
    /// handles before calling [`shutdown`](Self::shutdown).
    pub fn intake(&self) -> Intake<StoreTx<S>> {
        self.intake.clone()
    }

    /// Queues a task, waiting while the intake queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolShutdown`] if every worker has exited.
    pub async fn submit(&self, task: AllocatorTask<StoreTx<S>>) -> Result<()> {
        self.intake.submit(task).await
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Closes the intake and waits for every worker to drain the queue and
    /// release its connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerPanicked`] for the first worker that did not
    /// exit cleanly. All workers are joined regardless.
    pub async fn shutdown(self) -> Result<()> {
        let Self { intake, workers } = self;
        drop(intake);

        #[cfg(feature = "tracing")]
        tracing::debug!("Intake closed, waiting for workers to drain");

        let mut first_err = None;
        for (worker_id, handle) in workers.into_iter().enumerate() {
            if let Err(_e) = handle.await {
                #[cfg(feature = "tracing")]
                tracing::error!("Worker {worker_id} terminated abnormally: {_e}");
                first_err.get_or_insert(Error::WorkerPanicked { worker_id });
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool shutdown complete");

        first_err.map_or(Ok(()), Err)
    }
}
