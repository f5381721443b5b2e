//! Read/write database connection pools for one environment

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{MySql, MySqlConnection, MySqlPool};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{DatabaseConfig, DatabasePoolConfig, DatabasePoolSettings, DatabaseSides};
use crate::health::{DatabaseProbe, ProbeResult};
use crate::query::{classify_sql_error, execute_statement, QueryOutcome};
use crate::stats::{DatabasePoolStats, DatabasePoolStatsSnapshot, SideStats};
use crate::{PoolError, Result};

/// Statement used to validate new pools and probe existing ones
const PING_SQL: &str = "SELECT 1";

/// Which pool a statement is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Read,
    Write,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Read => f.write_str("read"),
            Side::Write => f.write_str("write"),
        }
    }
}

/// Occupancy of one side
#[derive(Debug, Clone, Serialize)]
pub struct SideSnapshot {
    pub size: u32,
    pub idle: usize,
    pub connection_limit: u32,
    pub queue_limit: u32,
    pub waiting: u32,
}

/// Occupancy and statistics of an environment's database pools
#[derive(Debug, Clone, Serialize)]
pub struct DatabasePoolSnapshot {
    pub environment: String,
    pub read: Option<SideSnapshot>,
    pub write: Option<SideSnapshot>,
    pub stats: DatabasePoolStatsSnapshot,
}

struct PoolSide {
    side: Side,
    pool: MySqlPool,
    config: DatabaseConfig,
    settings: DatabasePoolSettings,
    /// Callers currently inside `acquire`
    waiting: AtomicU32,
}

/// Decrements the waiter count when the acquire attempt ends
struct Waiter<'a>(&'a AtomicU32);

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PoolSide {
    fn saturated(&self) -> bool {
        self.pool.num_idle() == 0 && self.pool.size() >= self.settings.connection_limit
    }

    /// Enforce `queue_limit` before joining the wait for a connection.
    /// Only callers that find the side saturated are counted as waiting.
    fn enter_queue(&self, environment: &str, stats: &SideStats) -> Result<Option<Waiter<'_>>> {
        if !self.saturated() {
            return Ok(None);
        }
        let waiting = self.waiting.fetch_add(1, Ordering::SeqCst);
        let waiter = Waiter(&self.waiting);

        let limit = self.settings.queue_limit;
        if limit > 0 && waiting >= limit {
            stats.record_rejected();
            return Err(PoolError::resource_exhaustion(
                format!("{} database pool for environment '{}'", self.side, environment),
                Some(format!(
                    "{} connections in use, {} callers waiting (queue limit {})",
                    self.pool.size(),
                    waiting,
                    limit
                )),
            ));
        }
        Ok(Some(waiter))
    }

    fn map_acquire_error(&self, environment: &str, err: sqlx::Error, stats: &SideStats) -> PoolError {
        match err {
            sqlx::Error::PoolTimedOut => {
                stats.record_acquire_timeout();
                PoolError::acquire_timeout(environment, self.settings.acquire_timeout().as_millis() as u64)
            }
            other => classify_sql_error(environment, PING_SQL, other),
        }
    }

    async fn acquire(&self, environment: &str, stats: &SideStats) -> Result<PoolConnection<MySql>> {
        let _waiter = self.enter_queue(environment, stats)?;
        self.pool
            .acquire()
            .await
            .map_err(|e| self.map_acquire_error(environment, e, stats))
    }

    async fn ping(&self, timeout: Duration) -> ProbeResult {
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, sqlx::query(PING_SQL).fetch_one(&self.pool)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(_)) => ProbeResult::healthy(latency_ms),
            Ok(Err(e)) => ProbeResult::failed(latency_ms, e.to_string()),
            Err(_) => ProbeResult::failed(latency_ms, format!("no response within {}ms", timeout.as_millis())),
        }
    }

    fn snapshot(&self) -> SideSnapshot {
        SideSnapshot {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            connection_limit: self.settings.connection_limit,
            queue_limit: self.settings.queue_limit,
            waiting: self.waiting.load(Ordering::SeqCst),
        }
    }
}

/// Independent read and write pools for one environment
pub struct DatabaseConnectionPool {
    environment: String,
    read: Option<PoolSide>,
    write: Option<PoolSide>,
    stats: Arc<DatabasePoolStats>,
}

impl DatabaseConnectionPool {
    /// Create and validate every configured side.
    /// Nothing is left open when any configured side fails.
    pub async fn initialize_pools(
        environment: impl Into<String>,
        sides: &DatabaseSides,
        pool_config: &DatabasePoolConfig,
        stats: Arc<DatabasePoolStats>,
    ) -> Result<Self> {
        let environment = environment.into();

        if !sides.is_configured() {
            return Err(PoolError::configuration_error(
                format!("environments.{}.database", environment),
                "At least one of read or write must be configured",
            ));
        }
        if let Some(read) = &sides.read {
            read.validate(&environment, "read")?;
            pool_config.read.validate(&environment, "read")?;
        }
        if let Some(write) = &sides.write {
            write.validate(&environment, "write")?;
            pool_config.write.validate(&environment, "write")?;
        }

        info!("Initializing database pools for environment '{}'", environment);

        let read = match &sides.read {
            Some(config) => Some(Self::create_side(&environment, Side::Read, config, &pool_config.read).await?),
            None => None,
        };

        let write = match &sides.write {
            Some(config) => match Self::create_side(&environment, Side::Write, config, &pool_config.write).await {
                Ok(side) => Some(side),
                Err(e) => {
                    if let Some(read) = read {
                        read.pool.close().await;
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        info!(
            "Database pools ready for environment '{}' (read: {}, write: {})",
            environment,
            read.is_some(),
            write.is_some()
        );

        Ok(Self {
            environment,
            read,
            write,
            stats,
        })
    }

    async fn create_side(
        environment: &str,
        side: Side,
        config: &DatabaseConfig,
        settings: &DatabasePoolSettings,
    ) -> Result<PoolSide> {
        debug!(
            "Creating {} pool for environment '{}' with URL: {}",
            side,
            environment,
            config.masked_connection_url()
        );

        let connect_options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(&config.password)
            .database(&config.database);

        let pool = MySqlPoolOptions::new()
            .max_connections(settings.connection_limit)
            .acquire_timeout(settings.acquire_timeout())
            .idle_timeout(Some(settings.idle_timeout()))
            .connect_lazy_with(connect_options);

        // Round trip before accepting the pool
        let validated = tokio::time::timeout(config.connect_timeout(), sqlx::query(PING_SQL).fetch_one(&pool)).await;
        let failure = match validated {
            Ok(Ok(_)) => None,
            Ok(Err(sqlx::Error::PoolTimedOut)) | Err(_) => Some(PoolError::transport_error(
                environment,
                format!(
                    "{} database {} did not respond within {}s",
                    side,
                    config.masked_connection_url(),
                    config.connect_timeout_secs.min(settings.acquire_timeout_secs)
                ),
            )),
            Ok(Err(e)) => Some(classify_sql_error(environment, PING_SQL, e)),
        };

        if let Some(e) = failure {
            error!(
                "Failed to create {} pool for environment '{}': {}",
                side,
                environment,
                e.detailed_message()
            );
            pool.close().await;
            return Err(e);
        }

        Ok(PoolSide {
            side,
            pool,
            config: config.clone(),
            settings: settings.clone(),
            waiting: AtomicU32::new(0),
        })
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn stats(&self) -> &Arc<DatabasePoolStats> {
        &self.stats
    }

    pub fn has_side(&self, side: Side) -> bool {
        match side {
            Side::Read => self.read.is_some(),
            Side::Write => self.write.is_some(),
        }
    }

    /// Configuration a side was created from
    pub fn side_config(&self, side: Side) -> Option<&DatabaseConfig> {
        match side {
            Side::Read => self.read.as_ref().map(|s| &s.config),
            Side::Write => self.write.as_ref().map(|s| &s.config),
        }
    }

    fn pool_side(&self, side: Side) -> Result<&PoolSide> {
        let found = match side {
            Side::Read => self.read.as_ref(),
            Side::Write => self.write.as_ref(),
        };
        found.ok_or_else(|| PoolError::not_found(&self.environment, format!("{} database pool", side)))
    }

    fn side_stats(&self, side: Side) -> &SideStats {
        match side {
            Side::Read => &self.stats.read,
            Side::Write => &self.stats.write,
        }
    }

    /// Borrow a connection from one side
    pub async fn acquire(&self, side: Side) -> Result<PoolConnection<MySql>> {
        self.pool_side(side)?.acquire(&self.environment, self.side_stats(side)).await
    }

    async fn execute_on(&self, side: Side, sql: &str, params: &[Value]) -> Result<QueryOutcome> {
        let pool_side = self.pool_side(side)?;
        let stats = self.side_stats(side);
        let mut connection = pool_side.acquire(&self.environment, stats).await?;

        let started = Instant::now();
        let result = execute_statement(&self.environment, &mut connection, sql, params).await;
        stats.record_query(result.is_ok(), started.elapsed().as_millis() as u64);
        result
    }

    /// Run a statement on the read pool
    pub async fn execute_read(&self, sql: &str, params: &[Value]) -> Result<QueryOutcome> {
        self.execute_on(Side::Read, sql, params).await
    }

    /// Run a statement on the write pool
    pub async fn execute_write(&self, sql: &str, params: &[Value]) -> Result<QueryOutcome> {
        self.execute_on(Side::Write, sql, params).await
    }

    /// Run `callback` inside a transaction on a dedicated write connection.
    ///
    /// Commits when the callback succeeds and rolls back when it fails; the
    /// connection goes back to the pool either way.
    pub async fn execute_transaction<F, T>(&self, callback: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut MySqlConnection) -> BoxFuture<'c, Result<T>> + Send,
        T: Send,
    {
        let pool_side = self.pool_side(Side::Write)?;
        let stats = self.side_stats(Side::Write);

        let mut tx = {
            let _waiter = pool_side.enter_queue(&self.environment, stats)?;
            pool_side
                .pool
                .begin()
                .await
                .map_err(|e| pool_side.map_acquire_error(&self.environment, e, stats))?
        };

        let result = callback(&mut *tx).await;

        match result {
            Ok(value) => match tx.commit().await {
                Ok(()) => {
                    self.stats.record_transaction(true);
                    debug!("Transaction committed on environment '{}'", self.environment);
                    Ok(value)
                }
                Err(e) => {
                    self.stats.record_transaction(false);
                    Err(classify_sql_error(&self.environment, "COMMIT", e))
                }
            },
            Err(e) => {
                self.stats.record_transaction(false);
                warn!(
                    "Transaction on environment '{}' failed, rolling back: {}",
                    self.environment, e
                );
                if let Err(rollback_err) = tx.rollback().await {
                    error!(
                        "Rollback on environment '{}' failed: {}",
                        self.environment, rollback_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Ping every configured side
    pub async fn test_connections(&self, timeout: Duration) -> DatabaseProbe {
        let (read, write) = tokio::join!(
            async {
                match &self.read {
                    Some(side) => Some(side.ping(timeout).await),
                    None => None,
                }
            },
            async {
                match &self.write {
                    Some(side) => Some(side.ping(timeout).await),
                    None => None,
                }
            }
        );

        let probe = DatabaseProbe::from_sides(read, write);
        self.stats.record_health_check(probe.status.is_healthy());
        debug!(
            "Database probe for environment '{}': {}",
            self.environment, probe.status
        );
        probe
    }

    pub fn snapshot(&self) -> DatabasePoolSnapshot {
        DatabasePoolSnapshot {
            environment: self.environment.clone(),
            read: self.read.as_ref().map(PoolSide::snapshot),
            write: self.write.as_ref().map(PoolSide::snapshot),
            stats: self.stats.snapshot(),
        }
    }

    pub async fn close(&self) {
        info!("Closing database pools for environment '{}'", self.environment);
        if let Some(read) = &self.read {
            read.pool.close().await;
        }
        if let Some(write) = &self.write {
            write.pool.close().await;
        }
    }
}
