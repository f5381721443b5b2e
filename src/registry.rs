//! Per-environment pool registries
//!
//! A registry owns the pools of one kind for every environment, together
//! with the configuration they were built from and their running statistics.
//! The map lock only guards lookups and swaps; pools are created and closed
//! outside of it so environments never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{DatabasePoolConfig, DatabaseSides, RemoteConfig, RemotePoolConfig};
use crate::health::{DatabaseProbe, ProbeResult};
use crate::pool::{DatabaseConnectionPool, DatabasePoolSnapshot};
use crate::remote::RemoteConnector;
use crate::remote_pool::{RemoteExecutionPool, RemotePoolSnapshot};
use crate::stats::{DatabasePoolStats, DatabasePoolStatsSnapshot, RemotePoolStats, RemotePoolStatsSnapshot};
use crate::{PoolError, Result};

struct RemoteRegistration {
    config: RemoteConfig,
    pool_config: RemotePoolConfig,
    stats: Arc<RemotePoolStats>,
    /// `None` while the environment is unreachable
    pool: Option<Arc<RemoteExecutionPool>>,
}

/// Remote-execution pools keyed by environment
pub struct RemotePoolRegistry {
    connector: Arc<dyn RemoteConnector>,
    entries: RwLock<HashMap<String, RemoteRegistration>>,
}

impl RemotePoolRegistry {
    pub fn new(connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            connector,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register an environment and build its pool.
    ///
    /// Any pool already registered for the environment is closed first.
    /// Invalid configuration is rejected without registering anything;
    /// a valid configuration stays registered even when the pool cannot be
    /// created yet, so [`recreate`](Self::recreate) can retry later.
    pub async fn initialize(
        &self,
        environment: &str,
        config: RemoteConfig,
        pool_config: RemotePoolConfig,
    ) -> Result<Arc<RemoteExecutionPool>> {
        config.validate(environment)?;
        pool_config.validate(environment)?;

        self.close_pool(environment).await;

        let stats = Arc::new(RemotePoolStats::new());
        self.entries.write().await.insert(
            environment.to_string(),
            RemoteRegistration {
                config: config.clone(),
                pool_config: pool_config.clone(),
                stats: Arc::clone(&stats),
                pool: None,
            },
        );

        let pool = RemoteExecutionPool::initialize(
            environment,
            config,
            pool_config,
            Arc::clone(&self.connector),
            stats,
        )
        .await?;
        self.install(environment, pool).await
    }

    /// Store a freshly built pool unless the registration changed meanwhile
    async fn install(&self, environment: &str, pool: Arc<RemoteExecutionPool>) -> Result<Arc<RemoteExecutionPool>> {
        let rejected = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(environment) {
                Some(entry) if entry.pool.is_none() && Arc::ptr_eq(&entry.stats, pool.stats()) => {
                    entry.pool = Some(Arc::clone(&pool));
                    false
                }
                _ => true,
            }
        };

        if rejected {
            pool.close().await;
            return Err(PoolError::invalid_state(
                environment,
                "Remote pool was replaced or closed while it was being created",
            ));
        }
        Ok(pool)
    }

    pub async fn is_registered(&self, environment: &str) -> bool {
        self.entries.read().await.contains_key(environment)
    }

    /// The live pool of an environment
    pub async fn get(&self, environment: &str) -> Result<Arc<RemoteExecutionPool>> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(environment)
            .ok_or_else(|| PoolError::not_found(environment, "remote pool"))?;
        entry
            .pool
            .clone()
            .ok_or_else(|| PoolError::invalid_state(environment, "Remote pool is not connected"))
    }

    /// Tear down the environment's pool and rebuild it from the stored
    /// configuration. Statistics carry over.
    pub async fn recreate(&self, environment: &str) -> Result<Arc<RemoteExecutionPool>> {
        let (config, pool_config, stats, old) = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(environment)
                .ok_or_else(|| PoolError::not_found(environment, "remote pool"))?;
            (
                entry.config.clone(),
                entry.pool_config.clone(),
                Arc::clone(&entry.stats),
                entry.pool.take(),
            )
        };

        if let Some(old) = old {
            old.close().await;
        }

        info!("Recreating remote pool for environment '{}'", environment);
        let pool = RemoteExecutionPool::initialize(
            environment,
            config,
            pool_config,
            Arc::clone(&self.connector),
            stats,
        )
        .await?;
        self.install(environment, pool).await
    }

    /// Close and forget an environment's pool. Its statistics are dropped.
    pub async fn close_pool(&self, environment: &str) -> bool {
        let removed = self.entries.write().await.remove(environment);
        match removed {
            Some(entry) => {
                if let Some(pool) = entry.pool {
                    pool.close().await;
                }
                debug!("Removed remote pool registration for environment '{}'", environment);
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = self.entries.write().await.drain().collect();
        let count = drained.len();
        let closing = drained
            .into_iter()
            .filter_map(|(_, entry)| entry.pool)
            .map(|pool| async move { pool.close().await });
        futures::future::join_all(closing).await;
        if count > 0 {
            info!("Closed {} remote pool(s)", count);
        }
    }

    pub async fn environments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn stats(&self, environment: &str) -> Result<RemotePoolStatsSnapshot> {
        let entries = self.entries.read().await;
        entries
            .get(environment)
            .map(|entry| entry.stats.snapshot())
            .ok_or_else(|| PoolError::not_found(environment, "remote pool"))
    }

    pub async fn all_stats(&self) -> HashMap<String, RemotePoolStatsSnapshot> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.stats.snapshot()))
            .collect()
    }

    /// Occupancy of an environment's pool; an unreachable environment reports an empty pool
    pub async fn snapshot(&self, environment: &str) -> Result<RemotePoolSnapshot> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(environment)
            .ok_or_else(|| PoolError::not_found(environment, "remote pool"))?;

        Ok(match &entry.pool {
            Some(pool) => pool.snapshot(),
            None => RemotePoolSnapshot {
                environment: environment.to_string(),
                total: 0,
                available: 0,
                active: 0,
                pending: 0,
                min: entry.pool_config.min,
                max: entry.pool_config.max,
                stats: entry.stats.snapshot(),
            },
        })
    }

    /// Probe the environment's transport; `None` when it has no remote pool
    pub async fn probe(&self, environment: &str, timeout: Duration) -> Option<ProbeResult> {
        if !self.is_registered(environment).await {
            return None;
        }
        let pool = match self.get(environment).await {
            Ok(pool) => pool,
            Err(e) => return Some(ProbeResult::failed(0, e.user_message())),
        };

        let started = tokio::time::Instant::now();
        Some(match pool.probe(timeout).await {
            Ok(latency) => ProbeResult::healthy(latency.as_millis() as u64),
            Err(e) => ProbeResult::failed(started.elapsed().as_millis() as u64, e.user_message()),
        })
    }

    /// Return a connection to its environment's pool
    pub async fn release(&self, environment: &str, connection_id: u64) {
        match self.get(environment).await {
            Ok(pool) => pool.release(connection_id),
            Err(_) => warn!(
                "Release of connection {} ignored: environment '{}' has no live remote pool",
                connection_id, environment
            ),
        }
    }
}

struct DatabaseRegistration {
    sides: DatabaseSides,
    pool_config: DatabasePoolConfig,
    stats: Arc<DatabasePoolStats>,
    pool: Option<Arc<DatabaseConnectionPool>>,
}

/// Read/write database pools keyed by environment
#[derive(Default)]
pub struct DatabasePoolRegistry {
    entries: RwLock<HashMap<String, DatabaseRegistration>>,
}

impl DatabasePoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an environment and build its read/write pools.
    /// Same replacement and retention rules as [`RemotePoolRegistry::initialize`].
    pub async fn initialize(
        &self,
        environment: &str,
        sides: DatabaseSides,
        pool_config: DatabasePoolConfig,
    ) -> Result<Arc<DatabaseConnectionPool>> {
        if !sides.is_configured() {
            return Err(PoolError::configuration_error(
                format!("environments.{}.database", environment),
                "At least one of read or write must be configured",
            ));
        }
        if let Some(read) = &sides.read {
            read.validate(environment, "read")?;
            pool_config.read.validate(environment, "read")?;
        }
        if let Some(write) = &sides.write {
            write.validate(environment, "write")?;
            pool_config.write.validate(environment, "write")?;
        }

        self.close_pool(environment).await;

        let stats = Arc::new(DatabasePoolStats::new());
        self.entries.write().await.insert(
            environment.to_string(),
            DatabaseRegistration {
                sides: sides.clone(),
                pool_config: pool_config.clone(),
                stats: Arc::clone(&stats),
                pool: None,
            },
        );

        let pool = DatabaseConnectionPool::initialize_pools(environment, &sides, &pool_config, stats).await?;
        self.install(environment, Arc::new(pool)).await
    }

    async fn install(
        &self,
        environment: &str,
        pool: Arc<DatabaseConnectionPool>,
    ) -> Result<Arc<DatabaseConnectionPool>> {
        let rejected = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(environment) {
                Some(entry) if entry.pool.is_none() && Arc::ptr_eq(&entry.stats, pool.stats()) => {
                    entry.pool = Some(Arc::clone(&pool));
                    false
                }
                _ => true,
            }
        };

        if rejected {
            pool.close().await;
            return Err(PoolError::invalid_state(
                environment,
                "Database pools were replaced or closed while they were being created",
            ));
        }
        Ok(pool)
    }

    pub async fn is_registered(&self, environment: &str) -> bool {
        self.entries.read().await.contains_key(environment)
    }

    pub async fn get(&self, environment: &str) -> Result<Arc<DatabaseConnectionPool>> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(environment)
            .ok_or_else(|| PoolError::not_found(environment, "database pool"))?;
        entry
            .pool
            .clone()
            .ok_or_else(|| PoolError::invalid_state(environment, "Database pools are not connected"))
    }

    /// Rebuild both sides from the stored configuration, keeping statistics
    pub async fn recreate(&self, environment: &str) -> Result<Arc<DatabaseConnectionPool>> {
        let (sides, pool_config, stats, old) = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(environment)
                .ok_or_else(|| PoolError::not_found(environment, "database pool"))?;
            (
                entry.sides.clone(),
                entry.pool_config.clone(),
                Arc::clone(&entry.stats),
                entry.pool.take(),
            )
        };

        if let Some(old) = old {
            old.close().await;
        }

        info!("Recreating database pools for environment '{}'", environment);
        let pool = DatabaseConnectionPool::initialize_pools(environment, &sides, &pool_config, stats).await?;
        self.install(environment, Arc::new(pool)).await
    }

    pub async fn close_pool(&self, environment: &str) -> bool {
        let removed = self.entries.write().await.remove(environment);
        match removed {
            Some(entry) => {
                if let Some(pool) = entry.pool {
                    pool.close().await;
                }
                debug!("Removed database pool registration for environment '{}'", environment);
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = self.entries.write().await.drain().collect();
        let count = drained.len();
        let closing = drained
            .into_iter()
            .filter_map(|(_, entry)| entry.pool)
            .map(|pool| async move { pool.close().await });
        futures::future::join_all(closing).await;
        if count > 0 {
            info!("Closed database pools of {} environment(s)", count);
        }
    }

    pub async fn environments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn stats(&self, environment: &str) -> Result<DatabasePoolStatsSnapshot> {
        let entries = self.entries.read().await;
        entries
            .get(environment)
            .map(|entry| entry.stats.snapshot())
            .ok_or_else(|| PoolError::not_found(environment, "database pool"))
    }

    pub async fn all_stats(&self) -> HashMap<String, DatabasePoolStatsSnapshot> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.stats.snapshot()))
            .collect()
    }

    /// Probe every configured side; `None` when the environment has no database pools
    pub async fn probe(&self, environment: &str, timeout: Duration) -> Option<DatabaseProbe> {
        let (pool, read, write) = {
            let entries = self.entries.read().await;
            let entry = entries.get(environment)?;
            (entry.pool.clone(), entry.sides.read.is_some(), entry.sides.write.is_some())
        };

        match pool {
            Some(pool) => Some(pool.test_connections(timeout).await),
            None => {
                let down = || ProbeResult::failed(0, "Database pools are not connected");
                Some(DatabaseProbe::from_sides(read.then(down), write.then(down)))
            }
        }
    }

    pub async fn snapshot(&self, environment: &str) -> Result<DatabasePoolSnapshot> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(environment)
            .ok_or_else(|| PoolError::not_found(environment, "database pool"))?;

        Ok(match &entry.pool {
            Some(pool) => pool.snapshot(),
            None => DatabasePoolSnapshot {
                environment: environment.to_string(),
                read: None,
                write: None,
                stats: entry.stats.snapshot(),
            },
        })
    }
}
