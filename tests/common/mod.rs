//! In-process fakes shared by the integration suites

#![allow(dead_code)]

use async_trait::async_trait;
use fleet_pool::config::RemoteConfig;
use fleet_pool::health::{DatabaseProbe, ProbeResult};
use fleet_pool::monitor::{MonitoredPools, RecreateReport};
use fleet_pool::remote::{ExecOutput, RemoteConnector, RemoteSession};
use fleet_pool::{PoolError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Session that interprets a tiny command language:
/// `sleep <secs>` waits (until interrupted), `exit <code>` exits with that
/// status, `drop` fails like a lost connection; anything else is echoed.
pub struct ScriptedSession {
    pub id: usize,
    closed: AtomicBool,
    interrupted: AtomicBool,
    interrupt: Notify,
    pub commands: AtomicUsize,
}

impl ScriptedSession {
    fn new(id: usize) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            interrupt: Notify::new(),
            commands: AtomicUsize::new(0),
        }
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Simulate the remote side hanging up
    pub fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        let mut words = command.split_whitespace();
        match (words.next(), words.next()) {
            (Some("sleep"), Some(secs)) => {
                let secs: u64 = secs.parse().unwrap_or(1);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => Ok(ExecOutput {
                        exit_code: Some(0),
                        stdout: String::new(),
                        stderr: String::new(),
                    }),
                    _ = self.interrupt.notified() => Ok(ExecOutput {
                        exit_code: None,
                        stdout: String::new(),
                        stderr: "terminated".to_string(),
                    }),
                }
            }
            (Some("exit"), Some(code)) => Ok(ExecOutput {
                exit_code: Some(code.parse().unwrap_or(1)),
                stdout: String::new(),
                stderr: "failed".to_string(),
            }),
            (Some("drop"), _) => {
                self.closed.store(true, Ordering::SeqCst);
                Err(PoolError::Transport {
                    environment: "scripted".to_string(),
                    message: "connection reset by peer".to_string(),
                })
            }
            _ => Ok(ExecOutput {
                exit_code: Some(0),
                stdout: format!("{}\n", command.trim_start_matches("echo ")),
                stderr: String::new(),
            }),
        }
    }

    async fn upload(&self, data: &[u8], remote_path: &str) -> Result<u64> {
        if remote_path.starts_with("/readonly") {
            return Err(PoolError::Remote {
                command: format!("cat > {}", remote_path),
                exit_code: Some(1),
                stderr: "Permission denied".to_string(),
            });
        }
        Ok(data.len() as u64)
    }

    async fn download(&self, remote_path: &str) -> Result<Vec<u8>> {
        Ok(format!("contents of {}", remote_path).into_bytes())
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.interrupt.notify_one();
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connector handing out [`ScriptedSession`]s and remembering every one of them
#[derive(Default)]
pub struct ScriptedConnector {
    refuse: AtomicBool,
    connect_delay_ms: AtomicU32,
    sessions: Mutex<Vec<Arc<ScriptedSession>>>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.connect_delay_ms.store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    pub fn sessions(&self) -> Vec<Arc<ScriptedSession>> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteConnector for ScriptedConnector {
    async fn connect(&self, environment: &str, _config: &RemoteConfig) -> Result<Arc<dyn RemoteSession>> {
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(PoolError::Transport {
                environment: environment.to_string(),
                message: "connection refused".to_string(),
            });
        }

        let mut sessions = self.sessions.lock().unwrap();
        let session = Arc::new(ScriptedSession::new(sessions.len()));
        sessions.push(Arc::clone(&session));
        Ok(session)
    }
}

pub fn remote_config() -> RemoteConfig {
    RemoteConfig::with_password("10.0.0.5", "deploy", "secret")
}

/// Outcome of one scripted check
#[derive(Debug, Clone, Copy)]
pub struct Outcome {
    pub transport: bool,
    pub database: bool,
}

pub const HEALTHY: Outcome = Outcome {
    transport: true,
    database: true,
};
pub const DOWN: Outcome = Outcome {
    transport: false,
    database: false,
};
pub const DATABASE_DOWN: Outcome = Outcome {
    transport: true,
    database: false,
};

/// Monitored pools answering from a script; when the script runs out the
/// fallback outcome is repeated
pub struct ScriptedPools {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Mutex<Outcome>,
    current: Mutex<Option<Outcome>>,
    pub recreations: AtomicU32,
    pub probes: AtomicU32,
    probe_delay: Mutex<Duration>,
    recreate_heals: AtomicBool,
}

impl ScriptedPools {
    pub fn new(fallback: Outcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            current: Mutex::new(None),
            recreations: AtomicU32::new(0),
            probes: AtomicU32::new(0),
            probe_delay: Mutex::new(Duration::ZERO),
            recreate_heals: AtomicBool::new(false),
        })
    }

    pub fn push(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    pub fn set_fallback(&self, outcome: Outcome) {
        *self.fallback.lock().unwrap() = outcome;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock().unwrap() = delay;
    }

    /// Make every recreation switch the fallback to healthy
    pub fn heal_on_recreate(&self) {
        self.recreate_heals.store(true, Ordering::SeqCst);
    }

    pub fn recreations(&self) -> u32 {
        self.recreations.load(Ordering::SeqCst)
    }

    /// The transport probe runs first and pulls the next outcome; the
    /// database probe of the same check reuses it
    fn next_outcome(&self) -> Outcome {
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| *self.fallback.lock().unwrap());
        *self.current.lock().unwrap() = Some(next);
        next
    }
}

#[async_trait]
impl MonitoredPools for ScriptedPools {
    async fn test_transport(&self, _environment: &str, _timeout: Duration) -> Option<ProbeResult> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let outcome = self.next_outcome();
        let delay = *self.probe_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Some(if outcome.transport {
            ProbeResult::healthy(1)
        } else {
            ProbeResult::failed(1, "connection refused")
        })
    }

    async fn test_database(&self, _environment: &str, _timeout: Duration) -> Option<DatabaseProbe> {
        // Joined with the transport probe; wait until that one picked the outcome
        let outcome = loop {
            if let Some(outcome) = *self.current.lock().unwrap() {
                break outcome;
            }
            tokio::task::yield_now().await;
        };
        let write = if outcome.database {
            ProbeResult::healthy(1)
        } else {
            ProbeResult::failed(1, "Can't connect to MySQL server")
        };
        Some(DatabaseProbe::from_sides(None, Some(write)))
    }

    async fn recreate(&self, _environment: &str) -> RecreateReport {
        self.recreations.fetch_add(1, Ordering::SeqCst);
        if self.recreate_heals.load(Ordering::SeqCst) {
            self.set_fallback(HEALTHY);
        }
        RecreateReport {
            actions: vec!["recreated remote pool".to_string(), "recreated database pools".to_string()],
            errors: Vec::new(),
        }
    }
}
