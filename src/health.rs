//! Health state, check results and the per-environment state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use crate::config::HealthThresholds;

/// Health classification of an environment or one of its components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    fn severity(self) -> u8 {
        match self {
            HealthStatus::Unknown | HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }

    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

/// Combine the outcome of every configured component.
/// All healthy is healthy, none healthy is unhealthy, anything between is degraded.
pub fn combine_status<I>(results: I) -> HealthStatus
where
    I: IntoIterator<Item = bool>,
{
    let (mut total, mut healthy) = (0usize, 0usize);
    for ok in results {
        total += 1;
        if ok {
            healthy += 1;
        }
    }

    match (total, healthy) {
        (0, _) => HealthStatus::Unknown,
        (t, h) if t == h => HealthStatus::Healthy,
        (_, 0) => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}

/// System-wide status: the worst of all environments, ignoring unknown ones
pub fn system_status<I>(statuses: I) -> HealthStatus
where
    I: IntoIterator<Item = HealthStatus>,
{
    statuses
        .into_iter()
        .filter(|s| *s != HealthStatus::Unknown)
        .max_by_key(|s| s.severity())
        .filter(|s| s.severity() > 0)
        .unwrap_or(HealthStatus::Healthy)
}

/// Result of one probe against one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProbeResult {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms,
            message: None,
        }
    }

    pub fn failed(latency_ms: u64, message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms,
            message: Some(message.into()),
        }
    }
}

/// Result of probing an environment's database sides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseProbe {
    pub status: HealthStatus,
    pub read: Option<ProbeResult>,
    pub write: Option<ProbeResult>,
}

impl DatabaseProbe {
    /// Build the verdict from whichever sides were configured
    pub fn from_sides(read: Option<ProbeResult>, write: Option<ProbeResult>) -> Self {
        let status = combine_status(read.iter().chain(write.iter()).map(|p| p.healthy));
        Self { status, read, write }
    }
}

/// Status change produced by applying one check outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthStatus,
    pub to: HealthStatus,
    /// Set for every failed check that leaves the environment `unhealthy`
    pub schedule_recovery: bool,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Per-environment health state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub environment: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_checks: u64,
    pub total_failures: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_transport: Option<ProbeResult>,
    pub last_database: Option<DatabaseProbe>,
    pub recovery_in_progress: bool,
    /// Recovery attempts made for the current incident
    pub recovery_attempts: u32,
    pub last_recovery_attempt: Option<DateTime<Utc>>,
    pub last_alert: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl HealthRecord {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_checks: 0,
            total_failures: 0,
            last_check: None,
            last_transport: None,
            last_database: None,
            recovery_in_progress: false,
            recovery_attempts: 0,
            last_recovery_attempt: None,
            last_alert: None,
            registered_at: Utc::now(),
        }
    }

    /// Apply one check outcome to the state machine
    pub fn apply(&mut self, success: bool, thresholds: &HealthThresholds) -> Transition {
        let from = self.status;
        self.total_checks += 1;

        let to = if success {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            self.recovery_attempts = 0;

            match from {
                HealthStatus::Unknown | HealthStatus::Healthy => HealthStatus::Healthy,
                HealthStatus::Degraded | HealthStatus::Unhealthy => {
                    if self.consecutive_successes >= thresholds.recovery_threshold {
                        HealthStatus::Healthy
                    } else {
                        from
                    }
                }
            }
        } else {
            self.total_failures += 1;
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;

            let by_threshold = if self.consecutive_failures >= thresholds.unhealthy_threshold {
                HealthStatus::Unhealthy
            } else if self.consecutive_failures >= thresholds.degraded_threshold {
                HealthStatus::Degraded
            } else {
                from
            };

            // A failure never improves the status
            if by_threshold.severity() >= from.severity() {
                by_threshold
            } else {
                from
            }
        };

        self.status = to;
        Transition {
            from,
            to,
            schedule_recovery: !success && to == HealthStatus::Unhealthy,
        }
    }
}

/// Alert raised for a failing environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub environment: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub timestamp: DateTime<Utc>,
}

/// One recovery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub environment: String,
    pub attempt_number: u32,
    pub actions: Vec<String>,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
}

/// Persisted outcome of one health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckRecord {
    pub environment: String,
    /// Combined result of this check
    pub overall: HealthStatus,
    pub transport: Option<ProbeResult>,
    pub database: Option<DatabaseProbe>,
    /// Environment status after the state machine ran
    pub status: HealthStatus,
    pub duration_ms: u64,
    pub checked_at: DateTime<Utc>,
}

/// Condensed per-environment entry of the system snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentSummary {
    pub environment: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub recovery_in_progress: bool,
    pub last_check: Option<DateTime<Utc>>,
}

/// Aggregate view over every monitored environment
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub environments: Vec<EnvironmentSummary>,
    pub generated_at: DateTime<Utc>,
}

impl SystemHealth {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a HealthRecord>,
    {
        let mut environments: Vec<EnvironmentSummary> = records
            .into_iter()
            .map(|r| EnvironmentSummary {
                environment: r.environment.clone(),
                status: r.status,
                consecutive_failures: r.consecutive_failures,
                recovery_in_progress: r.recovery_in_progress,
                last_check: r.last_check,
            })
            .collect();
        environments.sort_by(|a, b| a.environment.cmp(&b.environment));

        let count = |status: HealthStatus| environments.iter().filter(|e| e.status == status).count();

        Self {
            status: system_status(environments.iter().map(|e| e.status)),
            total: environments.len(),
            healthy: count(HealthStatus::Healthy),
            degraded: count(HealthStatus::Degraded),
            unhealthy: count(HealthStatus::Unhealthy),
            unknown: count(HealthStatus::Unknown),
            environments,
            generated_at: Utc::now(),
        }
    }
}
