//! Monitor events for collaborators such as audit loggers or alert dispatchers

use serde::Serialize;
use tokio::sync::broadcast;

use crate::health::{Alert, HealthStatus, RecoveryAttempt};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    EnvironmentRegistered {
        environment: String,
    },
    EnvironmentStatusChanged {
        environment: String,
        from: HealthStatus,
        to: HealthStatus,
    },
    EnvironmentRecovered {
        environment: String,
        attempts: u32,
    },
    HealthAlert(Alert),
    RecoveryAttempted(RecoveryAttempt),
}

impl MonitorEvent {
    pub fn environment(&self) -> &str {
        match self {
            MonitorEvent::EnvironmentRegistered { environment }
            | MonitorEvent::EnvironmentStatusChanged { environment, .. }
            | MonitorEvent::EnvironmentRecovered { environment, .. } => environment,
            MonitorEvent::HealthAlert(alert) => &alert.environment,
            MonitorEvent::RecoveryAttempted(attempt) => &attempt.environment,
        }
    }
}

/// Fan-out of monitor events; publishing never blocks and needs no subscriber
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: MonitorEvent) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
