//! Persistence boundary for health checks, recovery attempts and alerts

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

use crate::health::{Alert, HealthCheckRecord, RecoveryAttempt};
use crate::Result;

/// Anything the monitor persists
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredRecord {
    HealthCheck(HealthCheckRecord),
    RecoveryAttempt(RecoveryAttempt),
    Alert(Alert),
}

impl StoredRecord {
    pub fn environment(&self) -> &str {
        match self {
            StoredRecord::HealthCheck(r) => &r.environment,
            StoredRecord::RecoveryAttempt(r) => &r.environment,
            StoredRecord::Alert(r) => &r.environment,
        }
    }
}

/// Storage used by the health monitor. Failures never fail a health check.
#[async_trait]
pub trait HealthStore: Send + Sync {
    async fn store(&self, record: StoredRecord) -> Result<()>;

    /// Health checks for `environment` recorded at or after `since`, oldest first
    async fn health_history(&self, environment: &str, since: DateTime<Utc>) -> Result<Vec<HealthCheckRecord>>;
}

#[derive(Default)]
struct History {
    checks: VecDeque<HealthCheckRecord>,
    recoveries: VecDeque<RecoveryAttempt>,
    alerts: VecDeque<Alert>,
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, limit: usize) {
    if queue.len() == limit {
        queue.pop_front();
    }
    queue.push_back(item);
}

/// Keeps the most recent `limit` records of each kind per environment
pub struct InMemoryHealthStore {
    limit: usize,
    history: RwLock<HashMap<String, History>>,
}

impl InMemoryHealthStore {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            history: RwLock::new(HashMap::new()),
        }
    }

    pub async fn recovery_attempts(&self, environment: &str) -> Vec<RecoveryAttempt> {
        let history = self.history.read().await;
        history
            .get(environment)
            .map(|h| h.recoveries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn alerts(&self, environment: &str) -> Vec<Alert> {
        let history = self.history.read().await;
        history
            .get(environment)
            .map(|h| h.alerts.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget everything recorded for an environment
    pub async fn clear(&self, environment: &str) {
        self.history.write().await.remove(environment);
    }
}

impl Default for InMemoryHealthStore {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[async_trait]
impl HealthStore for InMemoryHealthStore {
    async fn store(&self, record: StoredRecord) -> Result<()> {
        let mut history = self.history.write().await;
        let entry = history.entry(record.environment().to_string()).or_default();
        match record {
            StoredRecord::HealthCheck(r) => push_bounded(&mut entry.checks, r, self.limit),
            StoredRecord::RecoveryAttempt(r) => push_bounded(&mut entry.recoveries, r, self.limit),
            StoredRecord::Alert(r) => push_bounded(&mut entry.alerts, r, self.limit),
        }
        Ok(())
    }

    async fn health_history(&self, environment: &str, since: DateTime<Utc>) -> Result<Vec<HealthCheckRecord>> {
        let history = self.history.read().await;
        Ok(history
            .get(environment)
            .map(|h| h.checks.iter().filter(|c| c.checked_at >= since).cloned().collect())
            .unwrap_or_default())
    }
}
