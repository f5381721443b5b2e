//! Fleet manager
//!
//! Entry point for collaborators: registers environments, routes commands,
//! queries and transfers to the right pool, and exposes health and pool
//! statistics.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use sqlx::MySqlConnection;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

use crate::config::{EnvironmentConfig, MonitorConfig};
use crate::events::MonitorEvent;
use crate::health::{DatabaseProbe, HealthCheckRecord, HealthRecord, ProbeResult, SystemHealth};
use crate::monitor::{HealthMonitor, MonitoredPools, RecreateReport};
use crate::pool::DatabasePoolSnapshot;
use crate::query::QueryOutcome;
use crate::registry::{DatabasePoolRegistry, RemotePoolRegistry};
use crate::remote::{CommandOptions, CommandResult, RemoteConnector};
use crate::remote_pool::RemotePoolSnapshot;
use crate::ssh::SshConnector;
use crate::store::{HealthStore, InMemoryHealthStore};
use crate::{PoolError, Result};

/// Pool occupancy and statistics of one environment
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentPoolStats {
    pub environment: String,
    pub remote: Option<RemotePoolSnapshot>,
    pub database: Option<DatabasePoolSnapshot>,
}

/// Both registries, as seen by the health monitor
pub struct FleetPools {
    remote: RemotePoolRegistry,
    databases: DatabasePoolRegistry,
}

impl FleetPools {
    pub fn new(connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            remote: RemotePoolRegistry::new(connector),
            databases: DatabasePoolRegistry::new(),
        }
    }

    pub fn remote(&self) -> &RemotePoolRegistry {
        &self.remote
    }

    pub fn databases(&self) -> &DatabasePoolRegistry {
        &self.databases
    }
}

#[async_trait]
impl MonitoredPools for FleetPools {
    async fn test_transport(&self, environment: &str, timeout: Duration) -> Option<ProbeResult> {
        self.remote.probe(environment, timeout).await
    }

    async fn test_database(&self, environment: &str, timeout: Duration) -> Option<DatabaseProbe> {
        self.databases.probe(environment, timeout).await
    }

    async fn recreate(&self, environment: &str) -> RecreateReport {
        let mut report = RecreateReport::default();

        if self.remote.is_registered(environment).await {
            match self.remote.recreate(environment).await {
                Ok(pool) => report.actions.push(format!(
                    "recreated remote pool ({} connection(s))",
                    pool.snapshot().total
                )),
                Err(e) => report.errors.push(format!("remote pool: {}", e.user_message())),
            }
        }

        if self.databases.is_registered(environment).await {
            match self.databases.recreate(environment).await {
                Ok(_) => report.actions.push("recreated database pools".to_string()),
                Err(e) => report.errors.push(format!("database pools: {}", e.user_message())),
            }
        }

        report
    }
}

/// Pools, health monitoring and recovery for a fleet of environments
pub struct FleetManager {
    pools: Arc<FleetPools>,
    monitor: Arc<HealthMonitor>,
    environments: RwLock<HashMap<String, EnvironmentConfig>>,
}

impl FleetManager {
    pub fn new(settings: MonitorConfig, connector: Arc<dyn RemoteConnector>, store: Arc<dyn HealthStore>) -> Self {
        let pools = Arc::new(FleetPools::new(connector));
        let monitored: Arc<dyn MonitoredPools> = pools.clone();
        let monitor = HealthMonitor::new(settings, monitored, store);
        Self {
            pools,
            monitor,
            environments: RwLock::new(HashMap::new()),
        }
    }

    /// SSH transport with an in-memory health history
    pub fn with_ssh(settings: MonitorConfig) -> Self {
        let store = Arc::new(InMemoryHealthStore::new(settings.history_limit));
        Self::new(settings, Arc::new(SshConnector::new()), store)
    }

    pub fn pools(&self) -> &FleetPools {
        &self.pools
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.monitor.subscribe()
    }

    pub async fn environments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.environments.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn environment_config(&self, environment: &str) -> Option<EnvironmentConfig> {
        self.environments.read().await.get(environment).cloned()
    }

    /// Register an environment and start monitoring it.
    ///
    /// Configuration errors are returned before anything is touched. A
    /// registered environment is torn down first. An environment that is
    /// configured correctly but cannot be reached yet is still registered,
    /// so its pools can be rebuilt by recovery.
    pub async fn register_environment(&self, config: EnvironmentConfig) -> Result<()> {
        config.validate()?;
        let environment = config.name.clone();

        let previous = self
            .environments
            .write()
            .await
            .insert(environment.clone(), config.clone());
        if previous.is_some() {
            info!("Environment '{}' is already registered, replacing it", environment);
            self.monitor.unregister_environment(&environment).await;
            tokio::join!(
                self.pools.remote.close_pool(&environment),
                self.pools.databases.close_pool(&environment)
            );
        }

        let mut failures = Vec::new();

        if let Some(remote) = &config.remote {
            if let Err(e) = self
                .pools
                .remote
                .initialize(&environment, remote.clone(), config.remote_pool.clone())
                .await
            {
                failures.push(e);
            }
        }

        if config.database.is_configured() {
            if let Err(e) = self
                .pools
                .databases
                .initialize(&environment, config.database.clone(), config.database_pool.clone())
                .await
            {
                failures.push(e);
            }
        }

        for e in &failures {
            error!(
                "Environment '{}' registered but not reachable: {}",
                environment,
                e.detailed_message()
            );
        }

        self.monitor
            .register_environment(&environment, config.health)
            .await;

        if failures.is_empty() {
            info!("Environment '{}' registered", environment);
        } else {
            warn!(
                "Environment '{}' registered with {} unavailable pool(s); recovery will retry",
                environment,
                failures.len()
            );
        }
        Ok(())
    }

    pub async fn execute_command(
        &self,
        environment: &str,
        command: &str,
        options: CommandOptions,
    ) -> Result<CommandResult> {
        let pool = self.pools.remote.get(environment).await?;
        pool.execute(command, options).await
    }

    pub async fn upload_file(&self, environment: &str, local_path: &Path, remote_path: &str) -> Result<u64> {
        let pool = self.pools.remote.get(environment).await?;
        pool.upload_file(local_path, remote_path).await
    }

    pub async fn download_file(&self, environment: &str, remote_path: &str, local_path: &Path) -> Result<u64> {
        let pool = self.pools.remote.get(environment).await?;
        pool.download_file(remote_path, local_path).await
    }

    pub async fn execute_read(&self, environment: &str, sql: &str, params: &[Value]) -> Result<QueryOutcome> {
        let pool = self.pools.databases.get(environment).await?;
        pool.execute_read(sql, params).await
    }

    pub async fn execute_write(&self, environment: &str, sql: &str, params: &[Value]) -> Result<QueryOutcome> {
        let pool = self.pools.databases.get(environment).await?;
        pool.execute_write(sql, params).await
    }

    pub async fn execute_transaction<F, T>(&self, environment: &str, callback: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut MySqlConnection) -> BoxFuture<'c, Result<T>> + Send,
        T: Send,
    {
        let pool = self.pools.databases.get(environment).await?;
        pool.execute_transaction(callback).await
    }

    pub async fn get_pool_stats(&self, environment: &str) -> Result<EnvironmentPoolStats> {
        let remote = self.pools.remote.snapshot(environment).await.ok();
        let database = self.pools.databases.snapshot(environment).await.ok();

        if remote.is_none() && database.is_none() {
            return Err(PoolError::not_found(environment, "pools"));
        }
        Ok(EnvironmentPoolStats {
            environment: environment.to_string(),
            remote,
            database,
        })
    }

    pub async fn get_all_pool_stats(&self) -> Vec<EnvironmentPoolStats> {
        let mut all = Vec::new();
        for environment in self.environments().await {
            if let Ok(stats) = self.get_pool_stats(&environment).await {
                all.push(stats);
            }
        }
        all
    }

    pub async fn perform_health_check(&self, environment: &str) -> Result<HealthCheckRecord> {
        self.monitor.perform_health_check(environment).await
    }

    pub async fn get_environment_health(&self, environment: &str) -> Result<HealthRecord> {
        self.monitor.get_environment_health(environment).await
    }

    pub async fn get_system_health(&self) -> SystemHealth {
        self.monitor.get_system_health().await
    }

    pub async fn get_health_history(&self, environment: &str, hours: u32) -> Result<Vec<HealthCheckRecord>> {
        self.monitor.get_health_history(environment, hours).await
    }

    pub async fn trigger_recovery(&self, environment: &str) -> Result<()> {
        self.monitor.trigger_recovery(environment).await
    }

    /// Stop monitoring an environment, cancelling any recovery, then close its pools
    pub async fn close_pools(&self, environment: &str) -> bool {
        let monitored = self.monitor.unregister_environment(environment).await;
        let remote = self.pools.remote.close_pool(environment).await;
        let database = self.pools.databases.close_pool(environment).await;
        let known = self.environments.write().await.remove(environment).is_some();

        let closed = monitored || remote || database || known;
        if closed {
            info!("Closed pools for environment '{}'", environment);
        }
        closed
    }

    pub async fn close_all_pools(&self) {
        self.monitor.shutdown().await;
        tokio::join!(self.pools.remote.close_all(), self.pools.databases.close_all());
        self.environments.write().await.clear();
        info!("All pools closed");
    }
}
