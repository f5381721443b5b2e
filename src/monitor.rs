//! Health monitor and recovery coordinator
//!
//! Every registered environment gets its own record, check lock, timer and
//! recovery task. Nothing is shared between environments apart from the
//! registry map, which is only held long enough to look up an entry.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::events::{EventBus, MonitorEvent};
use crate::health::{
    combine_status, Alert, DatabaseProbe, HealthCheckRecord, HealthRecord, HealthStatus, HealthThresholds,
    ProbeResult, RecoveryAttempt, SystemHealth,
};
use crate::store::{HealthStore, StoredRecord};
use crate::{PoolError, Result};

/// What a recovery attempt did to an environment's pools
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecreateReport {
    pub actions: Vec<String>,
    pub errors: Vec<String>,
}

/// The monitor's view of an environment's pools
#[async_trait]
pub trait MonitoredPools: Send + Sync {
    /// Probe the remote transport; `None` when the environment has none
    async fn test_transport(&self, environment: &str, timeout: Duration) -> Option<ProbeResult>;

    /// Probe the database sides; `None` when the environment has no database
    async fn test_database(&self, environment: &str, timeout: Duration) -> Option<DatabaseProbe>;

    /// Tear down and rebuild every pool of the environment
    async fn recreate(&self, environment: &str) -> RecreateReport;
}

struct SlotState {
    record: HealthRecord,
    last_alert_at: Option<Instant>,
}

struct MonitoredEnvironment {
    name: String,
    thresholds: HealthThresholds,
    state: Mutex<SlotState>,
    /// Serializes checks so only one writer updates the record at a time
    check_lock: Mutex<()>,
    timer: StdMutex<Option<JoinHandle<()>>>,
    recovery: StdMutex<Option<JoinHandle<()>>>,
}

impl MonitoredEnvironment {
    fn take_timer(&self) -> Option<JoinHandle<()>> {
        self.timer.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    fn take_recovery(&self) -> Option<JoinHandle<()>> {
        self.recovery.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    fn set_recovery(&self, handle: JoinHandle<()>) {
        *self.recovery.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }
}

/// Periodic health checks, alerting and recovery for every registered environment
pub struct HealthMonitor {
    settings: MonitorConfig,
    pools: Arc<dyn MonitoredPools>,
    store: Arc<dyn HealthStore>,
    events: EventBus,
    environments: RwLock<HashMap<String, Arc<MonitoredEnvironment>>>,
}

impl HealthMonitor {
    pub fn new(settings: MonitorConfig, pools: Arc<dyn MonitoredPools>, store: Arc<dyn HealthStore>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            pools,
            store,
            events: EventBus::new(),
            environments: RwLock::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &MonitorConfig {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    async fn slot(&self, environment: &str) -> Result<Arc<MonitoredEnvironment>> {
        self.environments
            .read()
            .await
            .get(environment)
            .cloned()
            .ok_or_else(|| PoolError::not_found(environment, "health record"))
    }

    pub async fn is_registered(&self, environment: &str) -> bool {
        self.environments.read().await.contains_key(environment)
    }

    pub async fn environments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.environments.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start monitoring an environment. Monitoring of an already registered
    /// environment is cancelled and restarted with a fresh record.
    pub async fn register_environment(self: &Arc<Self>, environment: &str, thresholds: HealthThresholds) {
        let slot = Arc::new(MonitoredEnvironment {
            name: environment.to_string(),
            thresholds,
            state: Mutex::new(SlotState {
                record: HealthRecord::new(environment),
                last_alert_at: None,
            }),
            check_lock: Mutex::new(()),
            timer: StdMutex::new(None),
            recovery: StdMutex::new(None),
        });

        // Replace and insert in one write-lock acquisition
        let previous = {
            let mut environments = self.environments.write().await;
            let timer = self.spawn_timer(environment.to_string());
            *slot.timer.lock().unwrap_or_else(|p| p.into_inner()) = Some(timer);
            environments.insert(environment.to_string(), slot)
        };

        if let Some(previous) = previous {
            info!("Re-registering environment '{}', replaced its monitoring", environment);
            Self::stop_tasks(&previous).await;
        }

        info!(
            "Monitoring environment '{}' every {}s (first check in {}s)",
            environment, self.settings.check_interval_secs, self.settings.initial_delay_secs
        );
        self.events.publish(MonitorEvent::EnvironmentRegistered {
            environment: environment.to_string(),
        });
    }

    fn spawn_timer(self: &Arc<Self>, environment: String) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let initial_delay = self.settings.initial_delay();
        let interval = self.settings.check_interval();

        tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut next = Instant::now();
            loop {
                let Some(monitor) = weak.upgrade() else { break };
                monitor.scheduled_check(&environment).await;
                drop(monitor);

                next += interval;
                tokio::time::sleep_until(next).await;
            }
        })
    }

    /// Timer-driven check; skipped while another check is in flight
    async fn scheduled_check(self: &Arc<Self>, environment: &str) {
        let Ok(slot) = self.slot(environment).await else { return };
        let Ok(_guard) = slot.check_lock.try_lock() else {
            debug!("Skipping scheduled check for '{}': a check is already running", environment);
            return;
        };
        self.run_check(&slot).await;
    }

    /// Check an environment now, waiting for any check already in flight
    pub async fn perform_health_check(self: &Arc<Self>, environment: &str) -> Result<HealthCheckRecord> {
        let slot = self.slot(environment).await?;
        let _guard = slot.check_lock.lock().await;
        Ok(self.run_check(&slot).await)
    }

    /// Check every registered environment concurrently
    pub async fn check_all(self: &Arc<Self>) -> Vec<HealthCheckRecord> {
        let names = self.environments().await;
        let checks = names.iter().map(|name| self.perform_health_check(name));
        futures::future::join_all(checks)
            .await
            .into_iter()
            .filter_map(|r| r.ok())
            .collect()
    }

    /// Probe, update the state machine, persist, alert and schedule recovery.
    /// Callers hold the slot's check lock.
    async fn run_check(self: &Arc<Self>, slot: &Arc<MonitoredEnvironment>) -> HealthCheckRecord {
        let environment = slot.name.as_str();
        let started = Instant::now();
        let timeout = self.settings.probe_timeout();

        let (transport, database) = tokio::join!(
            self.pools.test_transport(environment, timeout),
            self.pools.test_database(environment, timeout)
        );

        let overall = combine_status(
            transport
                .iter()
                .map(|t| t.healthy)
                .chain(database.iter().map(|d| d.status.is_healthy())),
        );
        let success = overall == HealthStatus::Healthy;

        let (transition, alert, start_recovery, consecutive_failures) = {
            let mut state = slot.state.lock().await;
            let now = Instant::now();

            state.record.last_check = Some(Utc::now());
            state.record.last_transport = transport.clone();
            state.record.last_database = database.clone();
            let transition = state.record.apply(success, &slot.thresholds);

            let alert_due = !success
                && matches!(transition.to, HealthStatus::Degraded | HealthStatus::Unhealthy)
                && state
                    .last_alert_at
                    .map_or(true, |at| now.duration_since(at) >= self.settings.alert_cooldown());
            let alert = if alert_due {
                state.last_alert_at = Some(now);
                let alert = Alert {
                    environment: environment.to_string(),
                    status: transition.to,
                    consecutive_failures: state.record.consecutive_failures,
                    timestamp: Utc::now(),
                };
                state.record.last_alert = Some(alert.timestamp);
                Some(alert)
            } else {
                None
            };

            let start_recovery = transition.schedule_recovery
                && !state.record.recovery_in_progress
                && state.record.recovery_attempts < self.settings.max_recovery_attempts;
            if start_recovery {
                state.record.recovery_in_progress = true;
            }

            (transition, alert, start_recovery, state.record.consecutive_failures)
        };

        let record = HealthCheckRecord {
            environment: environment.to_string(),
            overall,
            transport,
            database,
            status: transition.to,
            duration_ms: started.elapsed().as_millis() as u64,
            checked_at: Utc::now(),
        };
        self.persist(StoredRecord::HealthCheck(record.clone())).await;

        if transition.changed() {
            match transition.to {
                HealthStatus::Unhealthy => error!(
                    "Environment '{}' is unhealthy after {} consecutive failed checks",
                    environment, consecutive_failures
                ),
                HealthStatus::Degraded => warn!(
                    "Environment '{}' is degraded ({} -> {})",
                    environment, transition.from, transition.to
                ),
                _ => info!(
                    "Environment '{}' is {} ({} -> {})",
                    environment, transition.to, transition.from, transition.to
                ),
            }
            self.events.publish(MonitorEvent::EnvironmentStatusChanged {
                environment: environment.to_string(),
                from: transition.from,
                to: transition.to,
            });
        } else {
            debug!("Health check for '{}': {} (status {})", environment, overall, transition.to);
        }

        if let Some(alert) = alert {
            warn!(
                "Health alert for environment '{}': {} after {} consecutive failures",
                environment, alert.status, alert.consecutive_failures
            );
            self.persist(StoredRecord::Alert(alert.clone())).await;
            self.events.publish(MonitorEvent::HealthAlert(alert));
        }

        if start_recovery {
            self.spawn_recovery(slot);
        }

        record
    }

    async fn persist(&self, record: StoredRecord) {
        if let Err(e) = self.store.store(record).await {
            warn!("Failed to store health record: {}", e);
        }
    }

    fn spawn_recovery(self: &Arc<Self>, slot: &Arc<MonitoredEnvironment>) {
        info!("Scheduling recovery for environment '{}'", slot.name);
        let monitor = Arc::clone(self);
        let task_slot = Arc::clone(slot);
        let handle = tokio::spawn(async move {
            monitor.recover(&task_slot).await;
        });
        slot.set_recovery(handle);
    }

    /// Capped recovery loop for one incident
    async fn recover(self: &Arc<Self>, slot: &Arc<MonitoredEnvironment>) {
        let environment = slot.name.as_str();
        let max_attempts = self.settings.max_recovery_attempts;

        loop {
            let attempt_number = {
                let mut state = slot.state.lock().await;
                if state.record.recovery_attempts >= max_attempts {
                    break;
                }
                state.record.recovery_attempts += 1;
                state.record.last_recovery_attempt = Some(Utc::now());
                state.record.recovery_attempts
            };

            info!(
                "Recovery attempt {}/{} for environment '{}'",
                attempt_number, max_attempts, environment
            );
            let started_at = Utc::now();
            let started = Instant::now();

            let report = self.pools.recreate(environment).await;
            let check = {
                let _guard = slot.check_lock.lock().await;
                self.run_check(slot).await
            };
            let success = check.overall == HealthStatus::Healthy;

            let mut errors = report.errors;
            if !success {
                errors.push(format!("validation check reported {}", check.overall));
            }

            let attempt = RecoveryAttempt {
                environment: environment.to_string(),
                attempt_number,
                actions: report.actions,
                errors,
                started_at,
                duration_ms: started.elapsed().as_millis() as u64,
                success,
            };

            if success {
                info!(
                    "Environment '{}' recovered on attempt {}",
                    environment, attempt_number
                );
            } else {
                error!(
                    "Recovery attempt {} for environment '{}' failed: {}",
                    attempt_number,
                    environment,
                    attempt.errors.join("; ")
                );
            }

            self.persist(StoredRecord::RecoveryAttempt(attempt.clone())).await;
            self.events.publish(MonitorEvent::RecoveryAttempted(attempt));

            if success {
                self.events.publish(MonitorEvent::EnvironmentRecovered {
                    environment: environment.to_string(),
                    attempts: attempt_number,
                });
                break;
            }

            if attempt_number >= max_attempts {
                error!(
                    "Giving up on environment '{}' after {} recovery attempts",
                    environment, attempt_number
                );
                break;
            }

            tokio::time::sleep(self.settings.recovery_delay()).await;

            if slot.state.lock().await.record.status == HealthStatus::Healthy {
                info!("Environment '{}' became healthy, ending recovery", environment);
                break;
            }
        }

        slot.state.lock().await.record.recovery_in_progress = false;
    }

    /// Start a fresh recovery incident for an environment
    pub async fn trigger_recovery(self: &Arc<Self>, environment: &str) -> Result<()> {
        let slot = self.slot(environment).await?;
        {
            let mut state = slot.state.lock().await;
            if state.record.recovery_in_progress {
                return Err(PoolError::invalid_state(environment, "Recovery is already in progress"));
            }
            state.record.recovery_in_progress = true;
            state.record.recovery_attempts = 0;
        }

        info!("Manual recovery requested for environment '{}'", environment);
        self.spawn_recovery(&slot);
        Ok(())
    }

    /// Cancel any pending or running recovery for an environment and wait for it to stop
    pub async fn cancel_recovery(&self, environment: &str) {
        let Ok(slot) = self.slot(environment).await else { return };
        Self::stop_recovery(&slot).await;
    }

    /// Abort the timer and stop any recovery of a slot that left the map
    async fn stop_tasks(slot: &MonitoredEnvironment) {
        if let Some(timer) = slot.take_timer() {
            timer.abort();
        }
        Self::stop_recovery(slot).await;
    }

    async fn stop_recovery(slot: &MonitoredEnvironment) {
        if let Some(handle) = slot.take_recovery() {
            handle.abort();
            let _ = handle.await;
            debug!("Recovery task for environment '{}' stopped", slot.name);
        }
        slot.state.lock().await.record.recovery_in_progress = false;
    }

    /// Stop monitoring an environment. Returns whether it was registered.
    pub async fn unregister_environment(&self, environment: &str) -> bool {
        let Some(slot) = self.environments.write().await.remove(environment) else {
            return false;
        };
        Self::stop_tasks(&slot).await;

        info!("Stopped monitoring environment '{}'", environment);
        true
    }

    pub async fn get_environment_health(&self, environment: &str) -> Result<HealthRecord> {
        let slot = self.slot(environment).await?;
        let state = slot.state.lock().await;
        Ok(state.record.clone())
    }

    pub async fn get_system_health(&self) -> SystemHealth {
        let slots: Vec<_> = self.environments.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            records.push(slot.state.lock().await.record.clone());
        }
        SystemHealth::from_records(records.iter())
    }

    /// Health checks of the last `hours` hours, oldest first
    pub async fn get_health_history(&self, environment: &str, hours: u32) -> Result<Vec<HealthCheckRecord>> {
        let since = Utc::now() - chrono::Duration::hours(i64::from(hours));
        self.store.health_history(environment, since).await
    }

    /// Stop every timer and recovery task
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.environments.read().await.keys().cloned().collect();
        for name in names {
            self.unregister_environment(&name).await;
        }
        info!("Health monitor stopped");
    }
}
