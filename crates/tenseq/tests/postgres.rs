//! Runs the protocol against a real PostgreSQL server.
//!
//! Set `TENSEQ_TEST_DATABASE_URL` to a scratch database; every test drops and
//! recreates `tenants`, `user_tenant_locks` and `users` there. Without it the
//! tests return early.
#![cfg(feature = "postgres")]

use core::time::Duration;
use tenseq::{
    Connection, DispatchPlan, Error, PoolConfig, PostgresStore, PostgresStoreConfig,
    SequenceStore, SerialId, TenantId, Transaction, WorkerPool, allocate, audit, dispatch, setup,
};
use tokio::sync::{Mutex, MutexGuard};

// The tests share one database.
static DATABASE: Mutex<()> = Mutex::const_new(());

async fn seeded(
    tenants: usize,
    lock_timeout: Option<Duration>,
) -> Option<(PostgresStore, MutexGuard<'static, ()>)> {
    let Ok(url) = std::env::var("TENSEQ_TEST_DATABASE_URL") else {
        eprintln!("TENSEQ_TEST_DATABASE_URL is not set; skipping");
        return None;
    };
    let guard = DATABASE.lock().await;
    let config = PostgresStoreConfig::from_url(&url)
        .unwrap()
        .with_lock_timeout(lock_timeout);
    let store = PostgresStore::new(config);
    setup(&store, tenants).await.unwrap();
    Some((store, guard))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_tenants_are_dense_after_a_concurrent_batch() {
    let Some((store, _db)) = seeded(2, None).await else {
        return;
    };

    let (pool, mut completions) = WorkerPool::start(&store, PoolConfig::with_workers(8))
        .await
        .unwrap();
    let report = dispatch(
        &pool,
        &mut completions,
        DispatchPlan::new(2_000, 2).with_submitters(8),
    )
    .await
    .unwrap();
    pool.shutdown().await.unwrap();

    assert_eq!(report.completed, 2_000);
    let audit = audit(&store).await.unwrap();
    assert!(audit.is_consistent());
    assert_eq!(audit.total_users, 2_000);
    assert_eq!(audit.tenant(TenantId(1)).unwrap().max, SerialId(1_000));
    assert_eq!(audit.tenant(TenantId(2)).unwrap().max, SerialId(1_000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn row_lock_blocks_only_the_same_tenant() {
    let Some((store, _db)) = seeded(2, None).await else {
        return;
    };
    let mut a = store.connect().await.unwrap();
    let mut b = store.connect().await.unwrap();

    let mut tx_a = a.begin().await.unwrap();
    assert_eq!(
        allocate(&mut tx_a, TenantId(1), "user0").await.unwrap(),
        SerialId(1)
    );

    let mut tx_b = b.begin().await.unwrap();
    assert_eq!(
        allocate(&mut tx_b, TenantId(2), "user1").await.unwrap(),
        SerialId(1)
    );
    tx_b.commit().await.unwrap();

    let mut tx_b = b.begin().await.unwrap();
    let waiting = tokio::spawn(async move {
        let serial = allocate(&mut tx_b, TenantId(1), "user2").await;
        tx_b.commit().await.unwrap();
        serial
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiting.is_finished());

    tx_a.commit().await.unwrap();
    assert_eq!(waiting.await.unwrap().unwrap(), SerialId(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lock_wait_past_the_timeout_is_transient() {
    let Some((store, _db)) = seeded(1, Some(Duration::from_millis(100))).await else {
        return;
    };
    let mut a = store.connect().await.unwrap();
    let mut b = store.connect().await.unwrap();

    let mut tx_a = a.begin().await.unwrap();
    tx_a.lock_tenant(TenantId(1)).await.unwrap();

    let mut tx_b = b.begin().await.unwrap();
    let err = tx_b.lock_tenant(TenantId(1)).await.unwrap_err();
    assert!(err.is_transient());
    assert!(matches!(
        err,
        Error::LockTimeout {
            tenant_id: TenantId(1),
            ..
        }
    ));
    tx_b.rollback().await.unwrap();
    tx_a.rollback().await.unwrap();

    // The connection is usable again after the failed transaction.
    let mut tx_b = b.begin().await.unwrap();
    assert_eq!(
        allocate(&mut tx_b, TenantId(1), "user0").await.unwrap(),
        SerialId(1)
    );
    tx_b.commit().await.unwrap();
}

#[tokio::test]
async fn dropped_transaction_is_rolled_back_on_next_begin() {
    let Some((store, _db)) = seeded(1, None).await else {
        return;
    };
    let mut conn = store.connect().await.unwrap();

    let mut tx = conn.begin().await.unwrap();
    allocate(&mut tx, TenantId(1), "ghost").await.unwrap();
    drop(tx);

    let mut tx = conn.begin().await.unwrap();
    assert_eq!(tx.count_users().await.unwrap(), 0);
    tx.rollback().await.unwrap();
}
