//! Health monitor state machine, alerting and recovery against scripted pools

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ScriptedPools, DATABASE_DOWN, DOWN, HEALTHY};
use fleet_pool::config::MonitorConfig;
use fleet_pool::health::{HealthCheckRecord, HealthStatus, HealthThresholds};
use fleet_pool::monitor::HealthMonitor;
use fleet_pool::store::{HealthStore, InMemoryHealthStore, StoredRecord};
use fleet_pool::{MonitorEvent, PoolError, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const ENV: &str = "staging";

/// Timers far enough out that only explicit checks run
fn quiet_settings() -> MonitorConfig {
    MonitorConfig {
        check_interval_secs: 3_600,
        initial_delay_secs: 3_600,
        ..MonitorConfig::default()
    }
}

async fn create_test_monitor(
    settings: MonitorConfig,
    pools: &Arc<ScriptedPools>,
) -> (Arc<HealthMonitor>, Arc<InMemoryHealthStore>) {
    let store = Arc::new(InMemoryHealthStore::default());
    let monitor = HealthMonitor::new(settings, pools.clone(), store.clone());
    monitor.register_environment(ENV, HealthThresholds::default()).await;
    (monitor, store)
}

async fn check_times(monitor: &Arc<HealthMonitor>, times: usize) -> Vec<HealthCheckRecord> {
    let mut records = Vec::with_capacity(times);
    for _ in 0..times {
        records.push(monitor.perform_health_check(ENV).await.unwrap());
    }
    records
}

async fn wait_for<F>(events: &mut broadcast::Receiver<MonitorEvent>, mut matches: F) -> MonitorEvent
where
    F: FnMut(&MonitorEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("expected event was not published")
}

fn is_attempt(number: u32) -> impl FnMut(&MonitorEvent) -> bool {
    move |event| matches!(event, MonitorEvent::RecoveryAttempted(a) if a.attempt_number == number)
}

#[tokio::test(start_paused = true)]
async fn test_database_down_degrades_overall() {
    let pools = ScriptedPools::new(DATABASE_DOWN);
    let (monitor, _store) = create_test_monitor(quiet_settings(), &pools).await;

    let record = monitor.perform_health_check(ENV).await.unwrap();
    assert_eq!(record.overall, HealthStatus::Degraded);
    assert!(record.transport.as_ref().unwrap().healthy);
    assert_eq!(record.database.as_ref().unwrap().status, HealthStatus::Unhealthy);
}

#[tokio::test(start_paused = true)]
async fn test_failures_walk_through_degraded_to_unhealthy() {
    let pools = ScriptedPools::new(DOWN);
    let (monitor, store) = create_test_monitor(quiet_settings(), &pools).await;
    let mut events = monitor.subscribe();

    let statuses: Vec<_> = check_times(&monitor, 3).await.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![HealthStatus::Unknown, HealthStatus::Unknown, HealthStatus::Degraded]
    );
    let changed = wait_for(&mut events, |e| matches!(e, MonitorEvent::EnvironmentStatusChanged { .. })).await;
    assert!(matches!(
        changed,
        MonitorEvent::EnvironmentStatusChanged {
            from: HealthStatus::Unknown,
            to: HealthStatus::Degraded,
            ..
        }
    ));

    let fourth = monitor.perform_health_check(ENV).await.unwrap();
    assert_eq!(fourth.status, HealthStatus::Degraded);
    let fifth = monitor.perform_health_check(ENV).await.unwrap();
    assert_eq!(fifth.status, HealthStatus::Unhealthy);

    let attempt = wait_for(&mut events, is_attempt(1)).await;
    let MonitorEvent::RecoveryAttempted(attempt) = attempt else { unreachable!() };
    assert!(!attempt.success);
    assert_eq!(attempt.actions.len(), 2);
    assert_eq!(pools.recreations(), 1);
    assert_eq!(store.recovery_attempts(ENV).await.len(), 1);

    let record = monitor.get_environment_health(ENV).await.unwrap();
    assert!(record.consecutive_failures >= 5);
    assert_eq!(record.consecutive_successes, 0);
}

#[tokio::test(start_paused = true)]
async fn test_two_successes_restore_healthy_and_reset_attempts() {
    let pools = ScriptedPools::new(DOWN);
    let (monitor, _store) = create_test_monitor(quiet_settings(), &pools).await;
    let mut events = monitor.subscribe();

    check_times(&monitor, 5).await;
    wait_for(&mut events, is_attempt(1)).await;
    assert_eq!(monitor.get_environment_health(ENV).await.unwrap().recovery_attempts, 1);

    pools.set_fallback(HEALTHY);
    let first = monitor.perform_health_check(ENV).await.unwrap();
    assert_eq!(first.status, HealthStatus::Unhealthy);
    let second = monitor.perform_health_check(ENV).await.unwrap();
    assert_eq!(second.status, HealthStatus::Healthy);

    let record = monitor.get_environment_health(ENV).await.unwrap();
    assert_eq!(record.recovery_attempts, 0);
    assert_eq!(record.consecutive_failures, 0);
    assert_eq!(record.consecutive_successes, 2);

    // The pending retry sees a healthy environment and stands down
    tokio::time::sleep(Duration::from_secs(31)).await;
    let record = monitor.get_environment_health(ENV).await.unwrap();
    assert!(!record.recovery_in_progress);
    assert_eq!(pools.recreations(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_attempts_are_capped() {
    let pools = ScriptedPools::new(DOWN);
    let (monitor, store) = create_test_monitor(quiet_settings(), &pools).await;
    let mut events = monitor.subscribe();

    check_times(&monitor, 5).await;
    wait_for(&mut events, is_attempt(3)).await;

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(pools.recreations(), 3);

    let attempts = store.recovery_attempts(ENV).await;
    assert_eq!(
        attempts.iter().map(|a| a.attempt_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(attempts.iter().all(|a| !a.success));

    let record = monitor.get_environment_health(ENV).await.unwrap();
    assert!(!record.recovery_in_progress);
    assert_eq!(record.recovery_attempts, 3);

    // Further failures inside the same incident do not restart recovery
    check_times(&monitor, 3).await;
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(pools.recreations(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_success_after_cap_allows_recovery_again() {
    let pools = ScriptedPools::new(DOWN);
    let (monitor, _store) = create_test_monitor(quiet_settings(), &pools).await;
    let mut events = monitor.subscribe();

    check_times(&monitor, 5).await;
    wait_for(&mut events, is_attempt(3)).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pools.recreations(), 3);

    // One good check ends the incident without reaching the recovery threshold
    pools.push([HEALTHY]);
    let partial = monitor.perform_health_check(ENV).await.unwrap();
    assert_eq!(partial.status, HealthStatus::Unhealthy);
    let record = monitor.get_environment_health(ENV).await.unwrap();
    assert_eq!(record.recovery_attempts, 0);
    assert!(!record.recovery_in_progress);

    let mut events = monitor.subscribe();
    let failed = monitor.perform_health_check(ENV).await.unwrap();
    assert_eq!(failed.status, HealthStatus::Unhealthy);

    let attempt = wait_for(&mut events, is_attempt(1)).await;
    let MonitorEvent::RecoveryAttempted(attempt) = attempt else { unreachable!() };
    assert!(!attempt.success);
    assert_eq!(pools.recreations(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_manual_recovery_starts_a_new_incident() {
    let pools = ScriptedPools::new(DOWN);
    let (monitor, _store) = create_test_monitor(quiet_settings(), &pools).await;
    let mut events = monitor.subscribe();

    check_times(&monitor, 5).await;
    wait_for(&mut events, is_attempt(3)).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    pools.heal_on_recreate();
    let mut events = monitor.subscribe();
    monitor.trigger_recovery(ENV).await.unwrap();

    let attempt = wait_for(&mut events, is_attempt(1)).await;
    let MonitorEvent::RecoveryAttempted(attempt) = attempt else { unreachable!() };
    assert!(attempt.success);

    let recovered = wait_for(&mut events, |e| matches!(e, MonitorEvent::EnvironmentRecovered { .. })).await;
    assert!(matches!(recovered, MonitorEvent::EnvironmentRecovered { attempts: 1, .. }));
    assert_eq!(pools.recreations(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_succeeds_when_rebuild_heals() {
    let pools = ScriptedPools::new(DOWN);
    pools.heal_on_recreate();
    let (monitor, store) = create_test_monitor(quiet_settings(), &pools).await;
    let mut events = monitor.subscribe();

    check_times(&monitor, 5).await;
    let recovered = wait_for(&mut events, |e| matches!(e, MonitorEvent::EnvironmentRecovered { .. })).await;
    assert_eq!(recovered.environment(), ENV);

    let attempts = store.recovery_attempts(ENV).await;
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].success);
    assert!(attempts[0].errors.is_empty());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let record = monitor.get_environment_health(ENV).await.unwrap();
    assert_eq!(record.recovery_attempts, 0);
    assert!(!record.recovery_in_progress);

    // One more good check completes the recovery threshold
    let check = monitor.perform_health_check(ENV).await.unwrap();
    assert_eq!(check.status, HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_alerts_respect_cooldown() {
    let pools = ScriptedPools::new(DOWN);
    let settings = MonitorConfig {
        max_recovery_attempts: 0,
        ..quiet_settings()
    };
    let (monitor, store) = create_test_monitor(settings, &pools).await;

    check_times(&monitor, 10).await;
    let alerts = store.alerts(ENV).await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].status, HealthStatus::Degraded);
    assert_eq!(alerts[0].consecutive_failures, 3);

    tokio::time::sleep(Duration::from_secs(899)).await;
    check_times(&monitor, 1).await;
    assert_eq!(store.alerts(ENV).await.len(), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    check_times(&monitor, 1).await;
    let alerts = store.alerts(ENV).await;
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[1].status, HealthStatus::Unhealthy);
    assert_eq!(pools.recreations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timer_skips_while_a_check_is_running() {
    let pools = ScriptedPools::new(HEALTHY);
    pools.set_probe_delay(Duration::from_secs(12));
    let settings = MonitorConfig {
        check_interval_secs: 5,
        initial_delay_secs: 5,
        ..MonitorConfig::default()
    };
    let (monitor, _store) = create_test_monitor(settings, &pools).await;

    let explicit = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.perform_health_check(ENV).await })
    };

    tokio::time::sleep(Duration::from_secs(13)).await;
    assert!(explicit.is_finished());
    explicit.await.unwrap().unwrap();

    // Ticks at 5s and 10s found the explicit check in flight
    assert_eq!(pools.probes.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.get_environment_health(ENV).await.unwrap().total_checks, 1);

    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_checks_run_on_interval() {
    let pools = ScriptedPools::new(HEALTHY);
    let settings = MonitorConfig {
        check_interval_secs: 60,
        initial_delay_secs: 5,
        ..MonitorConfig::default()
    };
    let (monitor, _store) = create_test_monitor(settings, &pools).await;

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(monitor.get_environment_health(ENV).await.unwrap().total_checks, 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let record = monitor.get_environment_health(ENV).await.unwrap();
    assert_eq!(record.total_checks, 1);
    assert_eq!(record.status, HealthStatus::Healthy);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(monitor.get_environment_health(ENV).await.unwrap().total_checks, 3);
}

#[tokio::test(start_paused = true)]
async fn test_unregister_cancels_pending_recovery() {
    let pools = ScriptedPools::new(DOWN);
    let (monitor, _store) = create_test_monitor(quiet_settings(), &pools).await;
    let mut events = monitor.subscribe();

    check_times(&monitor, 5).await;
    wait_for(&mut events, is_attempt(1)).await;

    assert!(monitor.unregister_environment(ENV).await);
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(pools.recreations(), 1);
    assert!(matches!(
        monitor.get_environment_health(ENV).await,
        Err(PoolError::NotFound { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_reregistering_resets_the_record() {
    let pools = ScriptedPools::new(DOWN);
    let settings = MonitorConfig {
        max_recovery_attempts: 0,
        ..quiet_settings()
    };
    let (monitor, _store) = create_test_monitor(settings, &pools).await;

    check_times(&monitor, 3).await;
    assert_eq!(monitor.get_environment_health(ENV).await.unwrap().status, HealthStatus::Degraded);

    monitor.register_environment(ENV, HealthThresholds::default()).await;
    let record = monitor.get_environment_health(ENV).await.unwrap();
    assert_eq!(record.status, HealthStatus::Unknown);
    assert_eq!(record.total_checks, 0);
    assert_eq!(monitor.environments().await, vec![ENV.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_system_health_and_history() {
    let pools = ScriptedPools::new(DOWN);
    let settings = MonitorConfig {
        max_recovery_attempts: 0,
        ..quiet_settings()
    };
    let (monitor, _store) = create_test_monitor(settings, &pools).await;
    monitor.register_environment("production", HealthThresholds::default()).await;
    monitor.register_environment("qa", HealthThresholds::default()).await;

    check_times(&monitor, 5).await;
    pools.set_fallback(HEALTHY);
    monitor.perform_health_check("production").await.unwrap();

    let system = monitor.get_system_health().await;
    assert_eq!(system.status, HealthStatus::Unhealthy);
    assert_eq!(system.total, 3);
    assert_eq!(system.healthy, 1);
    assert_eq!(system.unhealthy, 1);
    assert_eq!(system.unknown, 1);

    let history = monitor.get_health_history(ENV, 24).await.unwrap();
    assert_eq!(history.len(), 5);
    assert!(history.iter().all(|r| r.overall == HealthStatus::Unhealthy));
    assert!(monitor.get_health_history("qa", 24).await.unwrap().is_empty());
}

struct BrokenStore;

#[async_trait]
impl HealthStore for BrokenStore {
    async fn store(&self, _record: StoredRecord) -> Result<()> {
        Err(PoolError::internal_error("storage offline", None))
    }

    async fn health_history(&self, _environment: &str, _since: DateTime<Utc>) -> Result<Vec<HealthCheckRecord>> {
        Err(PoolError::internal_error("storage offline", None))
    }
}

#[tokio::test(start_paused = true)]
async fn test_storage_failures_do_not_fail_checks() {
    let pools = ScriptedPools::new(DOWN);
    let monitor = HealthMonitor::new(quiet_settings(), pools.clone(), Arc::new(BrokenStore));
    monitor.register_environment(ENV, HealthThresholds::default()).await;

    let records = check_times(&monitor, 3).await;
    assert_eq!(records[2].status, HealthStatus::Degraded);
    assert!(monitor.get_health_history(ENV, 1).await.is_err());
}
