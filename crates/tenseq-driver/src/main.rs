#![doc = include_str!("../README.md")]

mod config;
mod telemetry;

use anyhow::{Context, bail};
use clap::Parser;
use config::{Backend, CliArgs, RunConfig};
use telemetry::init_telemetry;
#[cfg(feature = "postgres")]
use tenseq::PostgresStore;
use tenseq::{
    AuditReport, DispatchReport, MemoryStore, SequenceStore, WorkerPool, audit, dispatch_until,
    setup,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = RunConfig::try_from(args)?;

    init_telemetry()?;
    log_startup_info(&config);

    match config.backend.clone() {
        Backend::Memory(store) => run(MemoryStore::new(store), &config).await,
        #[cfg(feature = "postgres")]
        Backend::Postgres(store) => run(PostgresStore::new(store), &config).await,
    }
}

/// Setup, batch, shutdown and audit against `store`.
async fn run<S>(store: S, config: &RunConfig) -> anyhow::Result<()>
where
    S: SequenceStore,
{
    setup(&store, config.plan.tenants)
        .await
        .context("failed to prepare relations")?;
    tracing::info!("Setup complete");

    let (pool, mut completions) = WorkerPool::start(&store, config.pool)
        .await
        .context("failed to start worker pool")?;

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(shutdown_signal(cancel.clone()));

    let dispatched = dispatch_until(&pool, &mut completions, config.plan, cancel).await;
    signals.abort();

    // Workers are joined even when the batch failed so every connection is
    // released before the audit opens its own.
    let shutdown = pool.shutdown().await;
    let report = dispatched.context("batch did not complete")?;
    shutdown.context("worker pool did not shut down cleanly")?;
    log_dispatch_report(&report);

    let audit = audit(&store).await.context("failed to audit serials")?;
    log_audit_report(&audit);

    if !audit.is_consistent() {
        bail!("serial numbers are not gap-free");
    }
    if !report.failures.is_empty() {
        bail!("{} of {} units failed", report.failures.len(), report.submitted);
    }
    if report.cancelled {
        bail!(
            "batch cancelled after {} of {} units",
            report.completed,
            config.plan.units
        );
    }
    Ok(())
}

fn log_startup_info(config: &RunConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting batch with full config: {:#?}", config);
    } else {
        let backend = match config.backend {
            Backend::Memory(_) => "in-memory store",
            #[cfg(feature = "postgres")]
            Backend::Postgres(_) => "PostgreSQL",
        };
        tracing::info!(
            "Starting batch of {} units over {} tenants with {} workers on {backend}",
            config.plan.units,
            config.plan.tenants,
            config.pool.num_workers
        );
    }
}

fn log_dispatch_report(report: &DispatchReport) {
    let secs = report.elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        report.completed as f64 / secs
    } else {
        0.0
    };
    tracing::info!(
        submitted = report.submitted,
        completed = report.completed,
        failed = report.failures.len(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Inserted {} users ({rate:.0}/s)",
        report.completed
    );
    for (tenant_id, count) in &report.per_tenant {
        tracing::info!(tenant = %tenant_id, committed = count, "Tenant batch");
    }
    for failure in &report.failures {
        tracing::warn!(
            unit = failure.unit,
            tenant = %failure.tenant_id,
            worker = failure.worker_id,
            attempts = failure.attempts,
            "Unit failed: {}", failure.error
        );
    }
}

fn log_audit_report(report: &AuditReport) {
    for tenant in &report.tenants {
        if tenant.is_dense() {
            tracing::info!(
                tenant = %tenant.tenant_id,
                users = tenant.count,
                max_serial = %tenant.max,
                "Serials are dense"
            );
        } else {
            tracing::error!(
                tenant = %tenant.tenant_id,
                users = tenant.count,
                max_serial = %tenant.max,
                duplicates = tenant.duplicates.len(),
                missing = tenant.missing.len(),
                "Serials are not dense"
            );
        }
    }
    tracing::info!(
        tenants = report.tenant_rows,
        locks = report.lock_rows,
        users = report.total_users,
        "Audit finished"
    );
}

/// Cancels `cancel` on Ctrl+C or SIGTERM. Units already queued still finish.
async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Stopping submission, draining queued units...");
    cancel.cancel();
}
