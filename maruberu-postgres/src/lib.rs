//! PostgreSQL resource storage for maruberu
//!
//! Resources are stored one row per key. Exclusive access to a key is a
//! transaction holding `pg_try_advisory_xact_lock` on a hash of the key:
//!
//! - the lock is polled with jittered sleeps until it is granted or the lease
//!   timeout elapses, giving [`StorageError::LeaseTimeout`]
//! - each locking transaction sets `idle_in_transaction_session_timeout` to
//!   the lease, so the server ends a stalled holder's session and frees its
//!   lock without any cooperation from the holder
//! - committing a scope updates the row and commits; dropping it rolls the
//!   transaction back, which releases the lock without writing

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use maruberu::errors::{Operation, StorageError, StorageResult};
use maruberu::resource::BellResource;
use maruberu::storage::{ResourceScope, ResourceStorage};
use maruberu::types::ResourceId;
use maruberu::DatabaseAddress;
use nutype::nutype;
use rand::Rng;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{query, query_scalar, Pool, Postgres, Row, Transaction};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Prefix of the advisory lock key for every resource.
const LOCK_NAMESPACE: &str = "maruberu.lock.";

/// Errors raised while setting up the storage.
#[derive(Debug, Error)]
pub enum PostgresStorageError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// The schema migrations could not be applied.
    #[error("failed to apply postgres migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),

    /// A waiter could sleep past its own lease between lock attempts.
    #[error(
        "lease timeout {lease_timeout:?} must be at least 1ms and longer than twice the poll interval {poll_interval:?}"
    )]
    InvalidLease {
        /// Requested lease
        lease_timeout: Duration,
        /// Requested poll interval
        poll_interval: Duration,
    },
}

/// Maximum number of database connections in the pool.
///
/// Must be at least 1, enforced by using `NonZeroU32` as the underlying type.
/// Every open scope pins one connection for its lifetime, so the pool size
/// bounds how many keys can be held at once.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(NonZeroU32);

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: NonZeroU32 = match NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
        }
    }
}

/// Bounds on waiting for and holding a key lock.
///
/// A waiter sleeps up to twice the poll interval between attempts while its
/// own transaction sits idle, so the lease must outlast that sleep or the
/// server would end the waiter's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    lease_timeout: Duration,
    poll_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl LeaseConfig {
    /// Validates and builds lease bounds.
    ///
    /// `lease_timeout` is how long to wait for a key before giving up, and
    /// how long a holder may sit idle before the server ends its session.
    /// `poll_interval` is the base delay between lock attempts; each sleep
    /// adds up to this much random jitter.
    pub fn new(
        lease_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, PostgresStorageError> {
        // idle_in_transaction_session_timeout is set in whole milliseconds, and 0 disables it
        if poll_interval.is_zero()
            || lease_timeout.as_millis() == 0
            || lease_timeout <= poll_interval.saturating_mul(2)
        {
            return Err(PostgresStorageError::InvalidLease {
                lease_timeout,
                poll_interval,
            });
        }

        Ok(Self {
            lease_timeout,
            poll_interval,
        })
    }

    /// How long to wait for a key, and how long a holder may idle (default: 10 seconds)
    pub const fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// Base delay between lock attempts (default: 100 milliseconds)
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn next_delay(&self) -> Duration {
        let max_jitter = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX);
        let jitter = rand::rng().random_range(0..=max_jitter);
        self.poll_interval + Duration::from_millis(jitter)
    }
}

fn connect_options(address: &DatabaseAddress) -> PgConnectOptions {
    let options = PgConnectOptions::new()
        .host(address.host())
        .port(address.port())
        .database(address.dbname());
    let options = match address.username() {
        Some(username) => options.username(username),
        None => options,
    };
    match address.password() {
        Some(password) => options.password(password),
        None => options,
    }
}

fn pool_options(config: &PostgresConfig) -> PgPoolOptions {
    let max_connections: NonZeroU32 = config.max_connections.into();
    PgPoolOptions::new()
        .max_connections(max_connections.get())
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
}

fn lock_key(id: &ResourceId) -> String {
    format!("{LOCK_NAMESPACE}{id}")
}

fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> StorageError {
    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    StorageError::StoreFailure { operation }
}

fn decode(id: &ResourceId, record: Value) -> StorageResult<BellResource> {
    let mut resource: BellResource =
        serde_json::from_value(record).map_err(|error| StorageError::Deserialization {
            id: id.clone(),
            detail: error.to_string(),
        })?;
    resource.clear_validation_cache();
    Ok(resource)
}

fn encode(resource: &BellResource) -> StorageResult<Value> {
    serde_json::to_value(resource).map_err(|error| StorageError::Serialization {
        id: resource.id().clone(),
        detail: error.to_string(),
    })
}

/// Resource storage on a shared PostgreSQL database.
#[derive(Debug, Clone)]
pub struct PostgresResourceStorage {
    pool: Pool<Postgres>,
    lease: LeaseConfig,
}

impl PostgresResourceStorage {
    /// Create a new storage with default configuration.
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresStorageError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Create a new storage for a configured database address.
    pub async fn connect(address: &DatabaseAddress) -> Result<Self, PostgresStorageError> {
        info!(
            host = address.host(),
            dbname = address.dbname(),
            "[postgres.connect] connecting to resource database"
        );
        let pool = pool_options(&PostgresConfig::default())
            .connect_with(connect_options(address))
            .await
            .map_err(PostgresStorageError::ConnectionFailed)?;
        Ok(Self::from_pool(pool))
    }

    /// Create a new storage with custom pool configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresStorageError> {
        let connection_string = connection_string.into();
        let pool = pool_options(&config)
            .connect(&connection_string)
            .await
            .map_err(PostgresStorageError::ConnectionFailed)?;
        Ok(Self::from_pool(pool))
    }

    /// Create a storage from an existing connection pool.
    ///
    /// Use this when you need full control over pool configuration or want to
    /// share a pool across multiple components.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            lease: LeaseConfig::default(),
        }
    }

    /// Replaces the lease bounds.
    #[must_use]
    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    /// Current lease bounds.
    pub const fn lease(&self) -> LeaseConfig {
        self.lease
    }

    /// Applies pending schema migrations.
    pub async fn migrate(&self) -> Result<(), PostgresStorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresStorageError::MigrationFailed)
    }

    /// Opens a transaction that holds the advisory lock for `id`.
    async fn begin_locked(&self, id: &ResourceId) -> StorageResult<Transaction<'static, Postgres>> {
        let started = Instant::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

        let lease_ms = self.lease.lease_timeout.as_millis().to_string();
        query("SELECT set_config('idle_in_transaction_session_timeout', $1, true)")
            .bind(lease_ms)
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::AcquireLock))?;

        let key = lock_key(id);
        loop {
            let acquired: bool =
                query_scalar("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0))")
                    .bind(key.as_str())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|error| map_sqlx_error(error, Operation::AcquireLock))?;
            if acquired {
                return Ok(tx);
            }

            let waited = started.elapsed();
            if waited >= self.lease.lease_timeout {
                warn!(
                    resource = %id,
                    waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    "[postgres.lease_timeout] gave up waiting for resource lock"
                );
                return Err(StorageError::LeaseTimeout {
                    id: id.clone(),
                    waited,
                });
            }

            let delay = self.lease.next_delay();
            tokio::time::sleep(delay).await;
        }
    }
}

/// Exclusive access to one key, backed by an open transaction.
pub struct PostgresScope {
    id: ResourceId,
    resource: Option<BellResource>,
    // None once the lock has been released for an absent key
    tx: Option<Transaction<'static, Postgres>>,
}

impl std::fmt::Debug for PostgresScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresScope")
            .field("id", &self.id)
            .field("resource", &self.resource)
            .field("locked", &self.tx.is_some())
            .finish()
    }
}

impl ResourceScope for PostgresScope {
    fn id(&self) -> &ResourceId {
        &self.id
    }

    fn resource(&self) -> Option<&BellResource> {
        self.resource.as_ref()
    }

    fn resource_mut(&mut self) -> Option<&mut BellResource> {
        self.resource.as_mut()
    }

    fn take(&mut self) -> Option<BellResource> {
        self.resource.take()
    }

    #[instrument(name = "postgres.commit", skip(self), fields(resource = %self.id))]
    async fn commit(self) -> StorageResult<()> {
        let Self { id, resource, tx } = self;
        let Some(mut tx) = tx else {
            return Ok(());
        };

        if let Some(mut resource) = resource {
            resource.clear_validation_cache();
            let record = encode(&resource)?;
            query("UPDATE maruberu_resources SET record = $2, created_at = $3 WHERE uuid = $1")
                .bind(id.as_ref())
                .bind(record)
                .bind(resource.created_at())
                .execute(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::SaveResource))?;
            debug!("[postgres.commit] resource written back");
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))
    }
}

impl ResourceStorage for PostgresResourceStorage {
    type Scope = PostgresScope;

    #[instrument(name = "postgres.scoped_resource", skip(self))]
    async fn scoped_resource(&self, id: &ResourceId) -> StorageResult<PostgresScope> {
        let mut tx = self.begin_locked(id).await?;

        let row = query("SELECT record FROM maruberu_resources WHERE uuid = $1")
            .bind(id.as_ref())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::LoadResource))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|error| map_sqlx_error(error, Operation::ReleaseLock))?;
            return Ok(PostgresScope {
                id: id.clone(),
                resource: None,
                tx: None,
            });
        };

        let record: Value = row
            .try_get("record")
            .map_err(|error| map_sqlx_error(error, Operation::LoadResource))?;
        let resource = decode(id, record)?;

        Ok(PostgresScope {
            id: id.clone(),
            resource: Some(resource),
            tx: Some(tx),
        })
    }

    #[instrument(name = "postgres.create_resource", skip(self, resource), fields(resource = %resource.id()))]
    async fn create_resource(&self, mut resource: BellResource) -> StorageResult<()> {
        resource.clear_validation_cache();
        let record = encode(&resource)?;
        let mut tx = self.begin_locked(resource.id()).await?;

        let inserted = query(
            "INSERT INTO maruberu_resources (uuid, record, created_at) VALUES ($1, $2, $3) \
             ON CONFLICT (uuid) DO NOTHING",
        )
        .bind(resource.id().as_ref())
        .bind(record)
        .bind(resource.created_at())
        .execute(&mut *tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::CreateResource))?;

        if inserted.rows_affected() == 0 {
            return Err(StorageError::AlreadyExists(resource.id().clone()));
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;
        debug!("[postgres.create_resource] resource created");
        Ok(())
    }

    #[instrument(name = "postgres.delete_resource", skip(self))]
    async fn delete_resource(&self, id: &ResourceId) -> StorageResult<BellResource> {
        let mut tx = self.begin_locked(id).await?;

        let row = query("DELETE FROM maruberu_resources WHERE uuid = $1 RETURNING record")
            .bind(id.as_ref())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::DeleteResource))?
            .ok_or_else(|| StorageError::NotFound(id.clone()))?;

        let record: Value = row
            .try_get("record")
            .map_err(|error| map_sqlx_error(error, Operation::DeleteResource))?;
        let resource = decode(id, record)?;

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;
        debug!("[postgres.delete_resource] resource deleted");
        Ok(resource)
    }

    #[instrument(name = "postgres.list_resources", skip(self))]
    async fn list_resources(
        &self,
        start_key: Option<&ResourceId>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<BellResource>> {
        let since = match start_key {
            Some(key) => Some(
                query_scalar::<_, chrono::DateTime<chrono::Utc>>(
                    "SELECT created_at FROM maruberu_resources WHERE uuid = $1",
                )
                .bind(key.as_ref())
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::ListResources))?
                .ok_or_else(|| StorageError::NotFound(key.clone()))?,
            ),
            None => None,
        };
        let limit = limit.map(|limit| i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = query(
            "SELECT uuid, record FROM maruberu_resources \
             WHERE $1::TIMESTAMPTZ IS NULL OR created_at >= $1 \
             ORDER BY created_at ASC, seq ASC \
             LIMIT $2",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::ListResources))?;

        let mut resources = Vec::with_capacity(rows.len());
        for row in rows {
            let uuid: String = row
                .try_get("uuid")
                .map_err(|error| map_sqlx_error(error, Operation::ListResources))?;
            let record: Value = row
                .try_get("record")
                .map_err(|error| map_sqlx_error(error, Operation::ListResources))?;
            let id = ResourceId::try_new(uuid.clone()).map_err(|error| {
                error!(key = %uuid, error = %error, "[postgres.list_resources] stored key is not a resource id");
                StorageError::StoreFailure {
                    operation: Operation::ListResources,
                }
            })?;
            resources.push(decode(&id, record)?);
        }

        resources.reverse();
        Ok(resources)
    }
}
