//! PostgreSQL store backed by `tokio-postgres`.
//!
//! Every statement is parameterized; only the fixed DDL runs as plain text.
//! `lock_tenant` is a real `SELECT ... FOR UPDATE`, so the allocation protocol
//! runs against the server's own row locks.
//!
//! A [`PostgresTransaction`] issues `BEGIN` / `COMMIT` / `ROLLBACK` on the
//! connection it came from. Dropping one without ending it leaves the server
//! transaction open until the connection begins its next transaction (which
//! rolls it back first) or is closed.

use crate::{
    error::{Error, QueryError, Result},
    model::{NewUser, SerialId, Tenant, TenantId, TenantLock, UserId, UserRecord},
    store::{Connection, SequenceStore, Transaction},
};
use core::{fmt, time::Duration};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_postgres::{Client, NoTls, Row, error::SqlState};

const TENANTS: &str = "tenants";
const TENANT_LOCKS: &str = "user_tenant_locks";
const USERS: &str = "users";

const DROP_RELATIONS: &str = "DROP TABLE IF EXISTS users, user_tenant_locks, tenants";

const CREATE_RELATIONS: &str = "
    CREATE TABLE tenants (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL
    );
    CREATE TABLE user_tenant_locks (
        tenant_id INTEGER PRIMARY KEY REFERENCES tenants (id)
    );
    CREATE TABLE users (
        id BIGSERIAL PRIMARY KEY,
        tenant_id INTEGER NOT NULL REFERENCES tenants (id),
        tenant_serial_id BIGINT NOT NULL,
        name TEXT NOT NULL
    );
    CREATE INDEX users_tenant_serial_idx ON users (tenant_id, tenant_serial_id);
";

/// Connection settings for [`PostgresStore`].
///
/// The `Debug` output never includes the password.
#[derive(Clone)]
pub struct PostgresStoreConfig {
    pg: tokio_postgres::Config,
    /// Server-side `lock_timeout` for every connection. `None` keeps the
    /// server default (wait forever).
    pub lock_timeout: Option<Duration>,
}

impl PostgresStoreConfig {
    /// Parses a `postgres://` URL or a `key=value` connection string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the string does not parse.
    pub fn from_url(url: &str) -> Result<Self> {
        let pg = url.parse().map_err(|e| Error::InvalidRequest {
            reason: format!("invalid connection string: {e}"),
        })?;
        Ok(Self {
            pg,
            lock_timeout: None,
        })
    }

    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: Option<Duration>) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

impl fmt::Debug for PostgresStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStoreConfig")
            .field("hosts", &self.pg.get_hosts())
            .field("dbname", &self.pg.get_dbname())
            .field("user", &self.pg.get_user())
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

/// A PostgreSQL database reachable with one [`PostgresStoreConfig`].
#[derive(Clone, Debug)]
pub struct PostgresStore {
    config: PostgresStoreConfig,
}

impl PostgresStore {
    pub const fn new(config: PostgresStoreConfig) -> Self {
        Self { config }
    }
}

impl SequenceStore for PostgresStore {
    type Conn = PostgresConnection;

    async fn connect(&self) -> Result<PostgresConnection> {
        let (client, connection) =
            self.config
                .pg
                .connect(NoTls)
                .await
                .map_err(|e| Error::Connectivity {
                    context: format!("failed to connect: {e}"),
                })?;

        tokio::spawn(async move {
            if let Err(_e) = connection.await {
                #[cfg(feature = "tracing")]
                tracing::error!("PostgreSQL connection closed with error: {_e}");
            }
        });

        if let Some(timeout) = self.config.lock_timeout {
            let value = format!("{}ms", timeout.as_millis().max(1));
            client
                .query_one("SELECT set_config('lock_timeout', $1, false)", &[&value])
                .await
                .map_err(|e| Error::Connectivity {
                    context: format!("failed to set lock_timeout: {e}"),
                })?;
        }

        Ok(PostgresConnection {
            client: Arc::new(client),
            in_transaction: Arc::new(AtomicBool::new(false)),
            lock_timeout: self.config.lock_timeout,
        })
    }
}

/// One server session. Dropping the last handle to it closes the session.
pub struct PostgresConnection {
    client: Arc<Client>,
    /// Set between `BEGIN` and `COMMIT`/`ROLLBACK`.
    in_transaction: Arc<AtomicBool>,
    lock_timeout: Option<Duration>,
}

impl Connection for PostgresConnection {
    type Tx = PostgresTransaction;

    async fn begin(&mut self) -> Result<PostgresTransaction> {
        if self.in_transaction.swap(false, Ordering::AcqRel) {
            // A dropped transaction never ended.
            self.client
                .batch_execute("ROLLBACK")
                .await
                .map_err(lifecycle_error)?;
        }
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(lifecycle_error)?;
        self.in_transaction.store(true, Ordering::Release);

        Ok(PostgresTransaction {
            client: Arc::clone(&self.client),
            in_transaction: Arc::clone(&self.in_transaction),
            lock_timeout: self.lock_timeout,
        })
    }
}

/// An open server transaction.
pub struct PostgresTransaction {
    client: Arc<Client>,
    in_transaction: Arc<AtomicBool>,
    lock_timeout: Option<Duration>,
}

impl PostgresTransaction {
    async fn end(self, statement: &str) -> Result<()> {
        let result = self.client.batch_execute(statement).await;
        self.in_transaction.store(false, Ordering::Release);
        result.map_err(lifecycle_error)
    }
}

impl Transaction for PostgresTransaction {
    async fn lock_tenant(&mut self, tenant_id: TenantId) -> Result<()> {
        let row = self
            .client
            .query_opt(
                "SELECT 1 FROM user_tenant_locks WHERE tenant_id = $1 FOR UPDATE",
                &[&tenant_id.0],
            )
            .await
            .map_err(|e| {
                StatementError::new(TENANT_LOCKS)
                    .tenant(tenant_id)
                    .lock_wait(self.lock_timeout)
                    .map(&e)
            })?;
        row.map(|_| ())
            .ok_or_else(|| QueryError::MissingLockRow { tenant_id }.into())
    }

    async fn max_serial(&mut self, tenant_id: TenantId) -> Result<SerialId> {
        let row = self
            .client
            .query_one(
                "SELECT COALESCE(MAX(tenant_serial_id), 0)::BIGINT FROM users WHERE tenant_id = $1",
                &[&tenant_id.0],
            )
            .await
            .map_err(|e| StatementError::new(USERS).tenant(tenant_id).map(&e))?;
        let max: i64 = row
            .try_get(0)
            .map_err(|e| StatementError::new(USERS).map(&e))?;
        Ok(SerialId(max))
    }

    async fn insert_user(&mut self, user: NewUser) -> Result<UserId> {
        let row = self
            .client
            .query_one(
                "INSERT INTO users (tenant_id, tenant_serial_id, name) VALUES ($1, $2, $3) RETURNING id",
                &[&user.tenant_id.0, &user.tenant_serial_id.0, &user.name],
            )
            .await
            .map_err(|e| StatementError::new(USERS).tenant(user.tenant_id).map(&e))?;
        let id: i64 = row
            .try_get(0)
            .map_err(|e| StatementError::new(USERS).map(&e))?;
        Ok(UserId(id))
    }

    async fn drop_relations(&mut self) -> Result<()> {
        self.client
            .batch_execute(DROP_RELATIONS)
            .await
            .map_err(|e| StatementError::new(TENANTS).map(&e))
    }

    async fn create_relations(&mut self) -> Result<()> {
        self.client
            .batch_execute(CREATE_RELATIONS)
            .await
            .map_err(|e| StatementError::new(TENANTS).map(&e))
    }

    async fn insert_tenant(&mut self, tenant: Tenant) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO tenants (id, name) VALUES ($1, $2)",
                &[&tenant.id.0, &tenant.name],
            )
            .await
            .map_err(|e| StatementError::new(TENANTS).tenant(tenant.id).map(&e))?;
        Ok(())
    }

    async fn insert_tenant_lock(&mut self, lock: TenantLock) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO user_tenant_locks (tenant_id) VALUES ($1)",
                &[&lock.tenant_id.0],
            )
            .await
            .map_err(|e| {
                StatementError::new(TENANT_LOCKS)
                    .tenant(lock.tenant_id)
                    .map(&e)
            })?;
        Ok(())
    }

    async fn tenants(&mut self) -> Result<Vec<Tenant>> {
        let rows = self
            .client
            .query("SELECT id, name FROM tenants ORDER BY id", &[])
            .await
            .map_err(|e| StatementError::new(TENANTS).map(&e))?;
        rows.iter()
            .map(tenant_from_row)
            .collect::<core::result::Result<_, _>>()
            .map_err(|e| StatementError::new(TENANTS).map(&e))
    }

    async fn tenant_locks(&mut self) -> Result<Vec<TenantLock>> {
        let rows = self
            .client
            .query(
                "SELECT tenant_id FROM user_tenant_locks ORDER BY tenant_id",
                &[],
            )
            .await
            .map_err(|e| StatementError::new(TENANT_LOCKS).map(&e))?;
        rows.iter()
            .map(tenant_lock_from_row)
            .collect::<core::result::Result<_, _>>()
            .map_err(|e| StatementError::new(TENANT_LOCKS).map(&e))
    }

    async fn users(&mut self, tenant_id: TenantId) -> Result<Vec<UserRecord>> {
        let rows = self
            .client
            .query(
                "SELECT id, tenant_id, tenant_serial_id, name FROM users WHERE tenant_id = $1 ORDER BY id",
                &[&tenant_id.0],
            )
            .await
            .map_err(|e| StatementError::new(USERS).tenant(tenant_id).map(&e))?;
        rows.iter()
            .map(user_from_row)
            .collect::<core::result::Result<_, _>>()
            .map_err(|e| StatementError::new(USERS).map(&e))
    }

    async fn count_users(&mut self) -> Result<u64> {
        let row = self
            .client
            .query_one("SELECT COUNT(*) FROM users", &[])
            .await
            .map_err(|e| StatementError::new(USERS).map(&e))?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| StatementError::new(USERS).map(&e))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn commit(self) -> Result<()> {
        self.end("COMMIT").await
    }

    async fn rollback(self) -> Result<()> {
        self.end("ROLLBACK").await
    }
}

type RowResult<T> = core::result::Result<T, tokio_postgres::Error>;

fn tenant_from_row(row: &Row) -> RowResult<Tenant> {
    Ok(Tenant {
        id: TenantId(row.try_get(0)?),
        name: row.try_get(1)?,
    })
}

fn tenant_lock_from_row(row: &Row) -> RowResult<TenantLock> {
    Ok(TenantLock {
        tenant_id: TenantId(row.try_get(0)?),
    })
}

fn user_from_row(row: &Row) -> RowResult<UserRecord> {
    Ok(UserRecord {
        id: UserId(row.try_get(0)?),
        tenant_id: TenantId(row.try_get(1)?),
        tenant_serial_id: SerialId(row.try_get(2)?),
        name: row.try_get(3)?,
    })
}

fn lifecycle_error(e: tokio_postgres::Error) -> Error {
    if e.is_closed() {
        Error::Connectivity {
            context: e.to_string(),
        }
    } else {
        Error::Transaction {
            context: e.to_string(),
        }
    }
}

/// What a failed statement was about, used to translate its SQLSTATE.
#[derive(Clone, Copy)]
struct StatementError {
    relation: &'static str,
    tenant_id: Option<TenantId>,
    lock_wait: Option<Duration>,
}

impl StatementError {
    const fn new(relation: &'static str) -> Self {
        Self {
            relation,
            tenant_id: None,
            lock_wait: None,
        }
    }

    const fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    const fn lock_wait(mut self, lock_timeout: Option<Duration>) -> Self {
        self.lock_wait = lock_timeout;
        self
    }

    fn map(self, e: &tokio_postgres::Error) -> Error {
        match e.as_db_error() {
            Some(db) => self.classify(db.code(), db.message()),
            None if e.is_closed() => Error::Connectivity {
                context: e.to_string(),
            },
            None => Error::Transaction {
                context: e.to_string(),
            },
        }
    }

    fn classify(self, code: &SqlState, message: &str) -> Error {
        let relation = self.relation;
        let query = if *code == SqlState::UNDEFINED_TABLE {
            QueryError::UndefinedRelation { relation }
        } else if *code == SqlState::DUPLICATE_TABLE {
            QueryError::DuplicateRelation { relation }
        } else if let (true, Some(tenant_id)) =
            (*code == SqlState::FOREIGN_KEY_VIOLATION, self.tenant_id)
        {
            QueryError::ForeignKeyViolation {
                relation,
                tenant_id,
            }
        } else if let (true, Some(tenant_id)) = (*code == SqlState::UNIQUE_VIOLATION, self.tenant_id)
        {
            QueryError::DuplicateKey {
                relation,
                key: i64::from(tenant_id.0),
            }
        } else if let (true, Some(tenant_id)) =
            (*code == SqlState::LOCK_NOT_AVAILABLE, self.tenant_id)
        {
            return Error::LockTimeout {
                tenant_id,
                waited: self.lock_wait.unwrap_or_default(),
            };
        } else {
            QueryError::Rejected {
                code: code.code().to_string(),
                message: message.to_string(),
            }
        };
        query.into()
    }
}
