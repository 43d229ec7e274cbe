//! In-process transactional store.
//!
//! [`MemoryStore`] keeps the three relations in memory and provides the
//! guarantees the allocation protocol relies on:
//!
//! - **Row-level locks.** Every `user_tenant_locks` row owns its own
//!   [`tokio::sync::Mutex`]. [`Transaction::lock_tenant`] waits on that mutex
//!   and keeps the owned guard until the transaction ends, so two tenants
//!   never contend with each other.
//! - **Atomic commit.** Writes are buffered in the transaction and applied in
//!   one step under the catalog write lock. A rolled-back or dropped
//!   transaction leaves no trace apart from consumed `users.id` values.
//! - **Read your writes.** Reads combine committed rows with the
//!   transaction's own buffered writes.
//!
//! Locks are released only after the commit has been applied, so the next
//! holder of a tenant's lock always observes the previous holder's insert.

use crate::{
    error::{Error, QueryError, Result},
    model::{NewUser, SerialId, Tenant, TenantId, TenantLock, UserId, UserRecord},
    store::{Connection, SequenceStore, Transaction},
};
use core::time::Duration;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicUsize, Ordering},
    },
};
use tokio::sync::{Mutex, OwnedMutexGuard};

const TENANTS: &str = "tenants";
const TENANT_LOCKS: &str = "user_tenant_locks";
const USERS: &str = "users";

/// Tunables for [`MemoryStore`].
#[derive(Clone, Debug, Default)]
pub struct MemoryStoreConfig {
    /// Maximum number of simultaneously open connections. `None` is
    /// unlimited.
    pub max_connections: Option<usize>,
    /// Longest time [`Transaction::lock_tenant`] waits before failing with
    /// [`Error::LockTimeout`]. `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// Simulated round trip applied before every statement.
    pub statement_latency: Option<Duration>,
}

/// A shareable handle to an in-memory database.
///
/// Cloning the handle does not copy the data; all clones see the same
/// relations.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    config: MemoryStoreConfig,
    catalog: RwLock<Catalog>,
    open_connections: AtomicUsize,
}

#[derive(Default)]
struct Catalog {
    /// Bumped every time relations are dropped or created.
    generation: u64,
    relations: Option<Relations>,
}

struct Relations {
    tenants: BTreeMap<TenantId, Tenant>,
    locks: BTreeMap<TenantId, Arc<Mutex<()>>>,
    users: Vec<UserRecord>,
    /// `MAX(tenant_serial_id)` per tenant, maintained on commit.
    max_serial: HashMap<TenantId, SerialId>,
    /// Sequence backing `users.id`. Values are consumed at insert time, so
    /// rolled-back inserts leave holes in `users.id` (never in serials).
    user_ids: Arc<AtomicI64>,
}

impl Relations {
    fn new(user_ids: Arc<AtomicI64>) -> Self {
        Self {
            tenants: BTreeMap::new(),
            locks: BTreeMap::new(),
            users: Vec::new(),
            max_serial: HashMap::new(),
            user_ids,
        }
    }
}

/// A buffered write, applied on commit.
enum Write {
    DropRelations,
    CreateRelations { user_ids: Arc<AtomicI64> },
    Tenant(Tenant),
    TenantLock(TenantLock),
    User(UserRecord),
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                catalog: RwLock::new(Catalog::default()),
                open_connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of connections currently open against this store.
    pub fn open_connections(&self) -> usize {
        self.shared.open_connections.load(Ordering::Acquire)
    }
}

impl SequenceStore for MemoryStore {
    type Conn = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection> {
        let limit = self.shared.config.max_connections.unwrap_or(usize::MAX);
        self.shared
            .open_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < limit).then_some(open + 1)
            })
            .map_err(|open| Error::Connectivity {
                context: format!("too many connections ({open} open, limit {limit})"),
            })?;

        Ok(MemoryConnection {
            shared: Arc::clone(&self.shared),
        })
    }
}

/// A connection to a [`MemoryStore`]. Dropping it frees its slot.
pub struct MemoryConnection {
    shared: Arc<Shared>,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shared.open_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Connection for MemoryConnection {
    type Tx = MemoryTransaction;

    async fn begin(&mut self) -> Result<MemoryTransaction> {
        let generation = self.shared.catalog.read().generation;
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            generation,
            pending: Vec::new(),
            staged: Staged::default(),
            held: HashMap::new(),
        })
    }
}

/// An open transaction against a [`MemoryStore`].
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    /// Catalog generation observed at `BEGIN`.
    generation: u64,
    pending: Vec<Write>,
    staged: Staged,
    held: HashMap<TenantId, OwnedMutexGuard<()>>,
}

/// Position and outcome of the last DDL statement in `pending`.
#[derive(Clone, Copy)]
struct Ddl {
    at: usize,
    exists: bool,
}

/// Keys buffered since the transaction's last DDL statement.
#[derive(Default)]
struct Staged {
    /// Set once the transaction dropped or created the relations. Committed
    /// rows are invisible to it from then on.
    ddl: Option<Ddl>,
    tenants: HashSet<TenantId>,
    locks: HashSet<TenantId>,
}

impl MemoryTransaction {
    async fn round_trip(&self) {
        if let Some(latency) = self.shared.config.statement_latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Validates `write` against the transaction's view and buffers it.
    fn stage(&mut self, write: Write) -> Result<()> {
        {
            let catalog = self.shared.catalog.read();
            View::new(&catalog, &self.pending, &self.staged).check(&write)?;
        }
        match &write {
            Write::DropRelations => {
                // Nothing buffered before a drop can survive it.
                self.pending.clear();
                self.staged = Staged {
                    ddl: Some(Ddl {
                        at: 0,
                        exists: false,
                    }),
                    ..Staged::default()
                };
            }
            Write::CreateRelations { .. } => {
                self.staged = Staged {
                    ddl: Some(Ddl {
                        at: self.pending.len(),
                        exists: true,
                    }),
                    ..Staged::default()
                };
            }
            Write::Tenant(tenant) => {
                self.staged.tenants.insert(tenant.id);
            }
            Write::TenantLock(lock) => {
                self.staged.locks.insert(lock.tenant_id);
            }
            Write::User(_) => {}
        }
        self.pending.push(write);
        Ok(())
    }

    /// Re-checks, under the catalog write lock, what concurrent commits may
    /// have invalidated since the writes were staged. Only the keys this
    /// transaction wrote are looked up.
    fn revalidate(&self, catalog: &Catalog, pending: &[Write]) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        if self.staged.ddl.is_some() {
            // A leading CREATE without a DROP raced with another creator.
            if matches!(pending.first(), Some(Write::CreateRelations { .. }))
                && catalog.relations.is_some()
            {
                return Err(QueryError::DuplicateRelation { relation: TENANTS }.into());
            }
            return Ok(());
        }

        if catalog.generation != self.generation {
            return Err(Error::Transaction {
                context: "relations were recreated by a concurrent transaction".to_string(),
            });
        }
        let relations = catalog
            .relations
            .as_ref()
            .ok_or(QueryError::UndefinedRelation { relation: TENANTS })?;
        for write in pending {
            match write {
                Write::Tenant(tenant) if relations.tenants.contains_key(&tenant.id) => {
                    return Err(QueryError::DuplicateKey {
                        relation: TENANTS,
                        key: i64::from(tenant.id.0),
                    }
                    .into());
                }
                Write::TenantLock(lock) if relations.locks.contains_key(&lock.tenant_id) => {
                    return Err(QueryError::DuplicateKey {
                        relation: TENANT_LOCKS,
                        key: i64::from(lock.tenant_id.0),
                    }
                    .into());
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Transaction for MemoryTransaction {
    async fn lock_tenant(&mut self, tenant_id: TenantId) -> Result<()> {
        self.round_trip().await;
        if self.held.contains_key(&tenant_id) {
            return Ok(());
        }

        let row = {
            let catalog = self.shared.catalog.read();
            let view = View::new(&catalog, &self.pending, &self.staged);
            view.require(TENANT_LOCKS)?;
            if view.pending_lock(tenant_id) {
                // Uncommitted rows are invisible to everyone else.
                return Ok(());
            }
            view.base
                .and_then(|relations| relations.locks.get(&tenant_id))
                .map(Arc::clone)
                .ok_or(QueryError::MissingLockRow { tenant_id })?
        };

        let guard = match self.shared.config.lock_timeout {
            Some(waited) => tokio::time::timeout(waited, row.lock_owned())
                .await
                .map_err(|_| Error::LockTimeout { tenant_id, waited })?,
            None => row.lock_owned().await,
        };
        self.held.insert(tenant_id, guard);
        Ok(())
    }

    async fn max_serial(&mut self, tenant_id: TenantId) -> Result<SerialId> {
        self.round_trip().await;
        let catalog = self.shared.catalog.read();
        let view = View::new(&catalog, &self.pending, &self.staged);
        view.require(USERS)?;

        let committed = view
            .base
            .and_then(|relations| relations.max_serial.get(&tenant_id).copied())
            .unwrap_or(SerialId::ZERO);
        let own = view
            .pending_users()
            .filter(|user| user.tenant_id == tenant_id)
            .map(|user| user.tenant_serial_id)
            .max()
            .unwrap_or(SerialId::ZERO);
        Ok(committed.max(own))
    }

    async fn insert_user(&mut self, user: NewUser) -> Result<UserId> {
        self.round_trip().await;
        let id = {
            let catalog = self.shared.catalog.read();
            let view = View::new(&catalog, &self.pending, &self.staged);
            view.require(USERS)?;
            let user_ids = view
                .user_ids()
                .ok_or(QueryError::UndefinedRelation { relation: USERS })?;
            UserId(user_ids.fetch_add(1, Ordering::Relaxed) + 1)
        };

        self.stage(Write::User(UserRecord {
            id,
            tenant_id: user.tenant_id,
            tenant_serial_id: user.tenant_serial_id,
            name: user.name,
        }))?;
        Ok(id)
    }

    async fn drop_relations(&mut self) -> Result<()> {
        self.round_trip().await;
        self.stage(Write::DropRelations)
    }

    async fn create_relations(&mut self) -> Result<()> {
        self.round_trip().await;
        self.stage(Write::CreateRelations {
            user_ids: Arc::new(AtomicI64::new(0)),
        })
    }

    async fn insert_tenant(&mut self, tenant: Tenant) -> Result<()> {
        self.round_trip().await;
        self.stage(Write::Tenant(tenant))
    }

    async fn insert_tenant_lock(&mut self, lock: TenantLock) -> Result<()> {
        self.round_trip().await;
        self.stage(Write::TenantLock(lock))
    }

    async fn tenants(&mut self) -> Result<Vec<Tenant>> {
        self.round_trip().await;
        let catalog = self.shared.catalog.read();
        let view = View::new(&catalog, &self.pending, &self.staged);
        view.require(TENANTS)?;

        let mut rows: BTreeMap<TenantId, Tenant> = view
            .base
            .map(|relations| relations.tenants.clone())
            .unwrap_or_default();
        for write in view.writes {
            if let Write::Tenant(tenant) = write {
                rows.insert(tenant.id, tenant.clone());
            }
        }
        Ok(rows.into_values().collect())
    }

    async fn tenant_locks(&mut self) -> Result<Vec<TenantLock>> {
        self.round_trip().await;
        let catalog = self.shared.catalog.read();
        let view = View::new(&catalog, &self.pending, &self.staged);
        view.require(TENANT_LOCKS)?;

        let mut ids: Vec<TenantId> = view
            .base
            .map(|relations| relations.locks.keys().copied().collect())
            .unwrap_or_default();
        ids.extend(view.writes.iter().filter_map(|write| match write {
            Write::TenantLock(lock) => Some(lock.tenant_id),
            _ => None,
        }));
        ids.sort_unstable();
        Ok(ids
            .into_iter()
            .map(|tenant_id| TenantLock { tenant_id })
            .collect())
    }

    async fn users(&mut self, tenant_id: TenantId) -> Result<Vec<UserRecord>> {
        self.round_trip().await;
        let catalog = self.shared.catalog.read();
        let view = View::new(&catalog, &self.pending, &self.staged);
        view.require(USERS)?;

        let committed = view
            .base
            .into_iter()
            .flat_map(|relations| relations.users.iter());
        Ok(committed
            .chain(view.pending_users())
            .filter(|user| user.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn count_users(&mut self) -> Result<u64> {
        self.round_trip().await;
        let catalog = self.shared.catalog.read();
        let view = View::new(&catalog, &self.pending, &self.staged);
        view.require(USERS)?;

        let committed = view.base.map_or(0, |relations| relations.users.len());
        Ok((committed + view.pending_users().count()) as u64)
    }

    async fn commit(mut self) -> Result<()> {
        self.round_trip().await;
        let pending = core::mem::take(&mut self.pending);
        {
            let mut catalog = self.shared.catalog.write();
            self.revalidate(&catalog, &pending)?;
            apply(&mut catalog, pending);
        }
        // Row locks are released here, after the writes became visible.
        drop(self);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        drop(self);
        Ok(())
    }
}

/// The state a transaction reads: committed relations overlaid with its own
/// buffered writes. A buffered DDL statement hides everything committed.
struct View<'a> {
    base: Option<&'a Relations>,
    exists: bool,
    writes: &'a [Write],
    staged: &'a Staged,
}

impl<'a> View<'a> {
    fn new(catalog: &'a Catalog, pending: &'a [Write], staged: &'a Staged) -> Self {
        match staged.ddl {
            Some(ddl) => Self {
                base: None,
                exists: ddl.exists,
                writes: &pending[ddl.at..],
                staged,
            },
            None => Self {
                base: catalog.relations.as_ref(),
                exists: catalog.relations.is_some(),
                writes: pending,
                staged,
            },
        }
    }

    fn require(&self, relation: &'static str) -> core::result::Result<(), QueryError> {
        if self.exists {
            Ok(())
        } else {
            Err(QueryError::UndefinedRelation { relation })
        }
    }

    fn has_tenant(&self, tenant_id: TenantId) -> bool {
        self.staged.tenants.contains(&tenant_id)
            || self
                .base
                .is_some_and(|relations| relations.tenants.contains_key(&tenant_id))
    }

    fn has_lock(&self, tenant_id: TenantId) -> bool {
        self.pending_lock(tenant_id)
            || self
                .base
                .is_some_and(|relations| relations.locks.contains_key(&tenant_id))
    }

    fn pending_lock(&self, tenant_id: TenantId) -> bool {
        self.staged.locks.contains(&tenant_id)
    }

    fn require_tenant(
        &self,
        relation: &'static str,
        tenant_id: TenantId,
    ) -> core::result::Result<(), QueryError> {
        if self.has_tenant(tenant_id) {
            Ok(())
        } else {
            Err(QueryError::ForeignKeyViolation {
                relation,
                tenant_id,
            })
        }
    }

    /// Constraint check for one more write on top of this view.
    fn check(&self, write: &Write) -> core::result::Result<(), QueryError> {
        match write {
            Write::DropRelations => {}
            Write::CreateRelations { .. } => {
                if self.exists {
                    return Err(QueryError::DuplicateRelation { relation: TENANTS });
                }
            }
            Write::Tenant(tenant) => {
                self.require(TENANTS)?;
                if self.has_tenant(tenant.id) {
                    return Err(QueryError::DuplicateKey {
                        relation: TENANTS,
                        key: i64::from(tenant.id.0),
                    });
                }
            }
            Write::TenantLock(lock) => {
                self.require(TENANT_LOCKS)?;
                self.require_tenant(TENANT_LOCKS, lock.tenant_id)?;
                if self.has_lock(lock.tenant_id) {
                    return Err(QueryError::DuplicateKey {
                        relation: TENANT_LOCKS,
                        key: i64::from(lock.tenant_id.0),
                    });
                }
            }
            Write::User(user) => {
                self.require(USERS)?;
                self.require_tenant(USERS, user.tenant_id)?;
            }
        }
        Ok(())
    }

    fn pending_users(&self) -> impl Iterator<Item = &'a UserRecord> + use<'a> {
        let writes: &'a [Write] = self.writes;
        writes.iter().filter_map(|write| match write {
            Write::User(user) => Some(user),
            _ => None,
        })
    }

    fn user_ids(&self) -> Option<&'a Arc<AtomicI64>> {
        match self.writes.first() {
            Some(Write::CreateRelations { user_ids }) => Some(user_ids),
            _ => self.base.map(|relations| &relations.user_ids),
        }
    }
}

/// Applies validated writes to the catalog.
fn apply(catalog: &mut Catalog, writes: Vec<Write>) {
    for write in writes {
        match write {
            Write::DropRelations => {
                catalog.relations = None;
                catalog.generation += 1;
            }
            Write::CreateRelations { user_ids } => {
                catalog.relations = Some(Relations::new(user_ids));
                catalog.generation += 1;
            }
            Write::Tenant(tenant) => {
                if let Some(relations) = catalog.relations.as_mut() {
                    relations.tenants.insert(tenant.id, tenant);
                }
            }
            Write::TenantLock(lock) => {
                if let Some(relations) = catalog.relations.as_mut() {
                    relations
                        .locks
                        .insert(lock.tenant_id, Arc::new(Mutex::new(())));
                }
            }
            Write::User(user) => {
                if let Some(relations) = catalog.relations.as_mut() {
                    let max = relations
                        .max_serial
                        .entry(user.tenant_id)
                        .or_insert(SerialId::ZERO);
                    *max = (*max).max(user.tenant_serial_id);
                    relations.users.push(user);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::setup;

    async fn seeded(config: MemoryStoreConfig, tenants: usize) -> MemoryStore {
        let store = MemoryStore::new(config);
        setup(&store, tenants).await.unwrap();
        store
    }

    fn user(tenant: i32, serial: i64, name: &str) -> NewUser {
        NewUser {
            tenant_id: TenantId(tenant),
            tenant_serial_id: SerialId(serial),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn statements_fail_before_relations_exist() {
        let store = MemoryStore::default();
        let mut conn = store.connect().await.unwrap();
        let mut tx = conn.begin().await.unwrap();

        let err = tx.max_serial(TenantId(1)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Query(QueryError::UndefinedRelation { relation: "users" })
        ));
        let err = tx.lock_tenant(TenantId(1)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Query(QueryError::UndefinedRelation { .. })
        ));
    }

    #[tokio::test]
    async fn max_serial_is_zero_for_a_fresh_tenant() {
        let store = seeded(MemoryStoreConfig::default(), 2).await;
        let mut conn = store.connect().await.unwrap();
        let mut tx = conn.begin().await.unwrap();
        assert_eq!(tx.max_serial(TenantId(2)).await.unwrap(), SerialId::ZERO);
    }

    #[tokio::test]
    async fn reads_see_own_writes_but_not_others_uncommitted() {
        let store = seeded(MemoryStoreConfig::default(), 1).await;
        let mut a = store.connect().await.unwrap();
        let mut b = store.connect().await.unwrap();

        let mut tx_a = a.begin().await.unwrap();
        tx_a.insert_user(user(1, 1, "user0")).await.unwrap();
        assert_eq!(tx_a.max_serial(TenantId(1)).await.unwrap(), SerialId(1));
        assert_eq!(tx_a.count_users().await.unwrap(), 1);

        let mut tx_b = b.begin().await.unwrap();
        assert_eq!(tx_b.max_serial(TenantId(1)).await.unwrap(), SerialId::ZERO);

        tx_a.commit().await.unwrap();
        assert_eq!(tx_b.max_serial(TenantId(1)).await.unwrap(), SerialId(1));
        assert_eq!(tx_b.users(TenantId(1)).await.unwrap()[0].name, "user0");
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = seeded(MemoryStoreConfig::default(), 1).await;
        let mut conn = store.connect().await.unwrap();

        let mut tx = conn.begin().await.unwrap();
        tx.insert_user(user(1, 1, "user0")).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = conn.begin().await.unwrap();
        tx.insert_user(user(1, 1, "user1")).await.unwrap();
        drop(tx);

        let mut tx = conn.begin().await.unwrap();
        assert_eq!(tx.count_users().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn user_ids_autoincrement_across_transactions() {
        let store = seeded(MemoryStoreConfig::default(), 2).await;
        let mut conn = store.connect().await.unwrap();

        for (expected, (tenant, serial)) in [(1, 1), (2, 1), (1, 2)].into_iter().enumerate() {
            let mut tx = conn.begin().await.unwrap();
            let id = tx.insert_user(user(tenant, serial, "u")).await.unwrap();
            assert_eq!(id, UserId(expected as i64 + 1));
            tx.commit().await.unwrap();
        }

        let mut tx = conn.begin().await.unwrap();
        let ids: Vec<_> = tx
            .users(TenantId(1))
            .await
            .unwrap()
            .into_iter()
            .map(|user| user.id)
            .collect();
        assert_eq!(ids, [UserId(1), UserId(3)]);
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let store = seeded(MemoryStoreConfig::default(), 1).await;
        let mut conn = store.connect().await.unwrap();
        let mut tx = conn.begin().await.unwrap();

        let err = tx.insert_user(user(9, 1, "ghost")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Query(QueryError::ForeignKeyViolation {
                relation: "users",
                tenant_id: TenantId(9)
            })
        ));
        let err = tx
            .insert_tenant_lock(TenantLock {
                tenant_id: TenantId(9),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Query(QueryError::ForeignKeyViolation { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_tenant_rows_are_rejected() {
        let store = seeded(MemoryStoreConfig::default(), 1).await;
        let mut conn = store.connect().await.unwrap();
        let mut tx = conn.begin().await.unwrap();

        let err = tx.insert_tenant(Tenant::named(TenantId(1))).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Query(QueryError::DuplicateKey {
                relation: "tenants",
                key: 1
            })
        ));
    }

    #[tokio::test]
    async fn locking_an_unknown_tenant_fails() {
        let store = seeded(MemoryStoreConfig::default(), 1).await;
        let mut conn = store.connect().await.unwrap();
        let mut tx = conn.begin().await.unwrap();

        let err = tx.lock_tenant(TenantId(2)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Query(QueryError::MissingLockRow {
                tenant_id: TenantId(2)
            })
        ));
    }

    #[tokio::test]
    async fn lock_is_reentrant_within_a_transaction() {
        let store = seeded(MemoryStoreConfig::default(), 1).await;
        let mut conn = store.connect().await.unwrap();
        let mut tx = conn.begin().await.unwrap();

        tx.lock_tenant(TenantId(1)).await.unwrap();
        tx.lock_tenant(TenantId(1)).await.unwrap();
    }

    #[tokio::test]
    async fn lock_blocks_same_tenant_until_commit() {
        let store = seeded(
            MemoryStoreConfig {
                lock_timeout: Some(Duration::from_millis(50)),
                ..MemoryStoreConfig::default()
            },
            2,
        )
        .await;
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

        // A different tenant's row is independent.
        tx_b.lock_tenant(TenantId(2)).await.unwrap();

        tx_a.commit().await.unwrap();
        tx_b.lock_tenant(TenantId(1)).await.unwrap();
    }

    #[tokio::test]
    async fn dropping_a_transaction_releases_its_locks() {
        let store = seeded(
            MemoryStoreConfig {
                lock_timeout: Some(Duration::from_millis(50)),
                ..MemoryStoreConfig::default()
            },
            1,
        )
        .await;
        let mut a = store.connect().await.unwrap();
        let mut b = store.connect().await.unwrap();

        let mut tx_a = a.begin().await.unwrap();
        tx_a.lock_tenant(TenantId(1)).await.unwrap();
        drop(tx_a);

        let mut tx_b = b.begin().await.unwrap();
        tx_b.lock_tenant(TenantId(1)).await.unwrap();
    }

    #[tokio::test]
    async fn connection_limit_is_a_connectivity_error() {
        let store = MemoryStore::new(MemoryStoreConfig {
            max_connections: Some(1),
            ..MemoryStoreConfig::default()
        });
        let first = store.connect().await.unwrap();
        assert!(matches!(
            store.connect().await,
            Err(Error::Connectivity { .. })
        ));
        assert_eq!(store.open_connections(), 1);

        drop(first);
        assert_eq!(store.open_connections(), 0);
        assert!(store.connect().await.is_ok());
    }

    #[tokio::test]
    async fn commit_after_recreate_is_rejected() {
        let store = seeded(MemoryStoreConfig::default(), 1).await;
        let mut conn = store.connect().await.unwrap();
        let mut tx = conn.begin().await.unwrap();
        tx.insert_user(user(1, 1, "stale")).await.unwrap();

        setup(&store, 1).await.unwrap();

        assert!(matches!(
            tx.commit().await,
            Err(Error::Transaction { .. })
        ));
        let mut tx = conn.begin().await.unwrap();
        assert_eq!(tx.count_users().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn seeding_many_tenants_does_not_slow_other_tenants() {
        const TENANT_COUNT: usize = 50_000;

        let store = tokio::time::timeout(
            Duration::from_secs(30),
            seeded(MemoryStoreConfig::default(), TENANT_COUNT),
        )
        .await
        .expect("setup should be linear in the tenant count");

        let mut conn = store.connect().await.unwrap();
        let mut tx = conn.begin().await.unwrap();
        assert_eq!(tx.tenant_locks().await.unwrap().len(), TENANT_COUNT);
        tx.rollback().await.unwrap();

        let allocations = async {
            for serial in 1..=500 {
                for tenant in [1, 2] {
                    let mut tx = conn.begin().await.unwrap();
                    tx.lock_tenant(TenantId(tenant)).await.unwrap();
                    tx.insert_user(user(tenant, serial, "u")).await.unwrap();
                    tx.commit().await.unwrap();
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), allocations)
            .await
            .expect("allocations should not scan unrelated tenants");
    }

    #[tokio::test]
    async fn duplicate_keys_are_caught_within_and_across_transactions() {
        let store = seeded(MemoryStoreConfig::default(), 1).await;
        let mut a = store.connect().await.unwrap();
        let mut b = store.connect().await.unwrap();

        let mut tx_a = a.begin().await.unwrap();
        let mut tx_b = b.begin().await.unwrap();
        tx_a.insert_tenant(Tenant::named(TenantId(5))).await.unwrap();
        assert!(matches!(
            tx_a.insert_tenant(Tenant::named(TenantId(5))).await,
            Err(Error::Query(QueryError::DuplicateKey { key: 5, .. }))
        ));
        tx_b.insert_tenant(Tenant::named(TenantId(5))).await.unwrap();

        tx_a.commit().await.unwrap();
        assert!(matches!(
            tx_b.commit().await,
            Err(Error::Query(QueryError::DuplicateKey {
                relation: "tenants",
                key: 5
            }))
        ));
    }

    #[tokio::test]
    async fn concurrent_creates_conflict_at_commit() {
        let store = MemoryStore::default();
        let mut a = store.connect().await.unwrap();
        let mut b = store.connect().await.unwrap();

        let mut tx_a = a.begin().await.unwrap();
        let mut tx_b = b.begin().await.unwrap();
        tx_a.create_relations().await.unwrap();
        tx_b.create_relations().await.unwrap();

        tx_a.commit().await.unwrap();
        assert!(matches!(
            tx_b.commit().await,
            Err(Error::Query(QueryError::DuplicateRelation { .. }))
        ));
    }

    #[tokio::test]
    async fn drop_discards_earlier_writes_in_the_transaction() {
        let store = seeded(MemoryStoreConfig::default(), 1).await;
        let mut conn = store.connect().await.unwrap();
        let mut tx = conn.begin().await.unwrap();

        tx.insert_user(user(1, 1, "gone")).await.unwrap();
        tx.drop_relations().await.unwrap();
        tx.create_relations().await.unwrap();
        assert!(tx.tenants().await.unwrap().is_empty());
        assert_eq!(tx.count_users().await.unwrap(), 0);
        tx.insert_tenant(Tenant::named(TenantId(1))).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = conn.begin().await.unwrap();
        assert_eq!(tx.tenants().await.unwrap().len(), 1);
        assert!(tx.tenant_locks().await.unwrap().is_empty());
        assert_eq!(tx.count_users().await.unwrap(), 0);
    }
}
