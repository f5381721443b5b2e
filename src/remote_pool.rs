//! Pool of remote-execution connections for one environment
//!
//! The pool lends out ready sessions, keeps between `min` and `max` of them
//! alive, and evicts sessions that stay idle for longer than `idle_timeout`.
//! Pool bookkeeping lives behind a short-lived mutex that is never held
//! across a suspension point; connecting, running commands and transfers
//! all happen outside of it.

use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{RemoteConfig, RemotePoolConfig};
use crate::remote::{CommandOptions, CommandResult, RemoteConnector, RemoteSession};
use crate::stats::{RemotePoolStats, RemotePoolStatsSnapshot};
use crate::{PoolError, Result};

/// Re-check interval for acquirers waiting on a saturated pool
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Command used by health probes
const PROBE_COMMAND: &str = "echo ok";

/// One connection tracked by the pool
pub struct PoolEntry {
    pub id: u64,
    session: Arc<dyn RemoteSession>,
    pub created_at: Instant,
    pub last_used: Instant,
    pub last_released: Option<Instant>,
    pub in_use: bool,
}

impl PoolEntry {
    fn idle_since(&self) -> Instant {
        self.last_released.unwrap_or(self.created_at)
    }
}

/// A connection handed out by [`RemoteExecutionPool::acquire`]
#[derive(Clone)]
pub struct RemoteLease {
    pub id: u64,
    session: Arc<dyn RemoteSession>,
}

impl RemoteLease {
    pub fn session(&self) -> &Arc<dyn RemoteSession> {
        &self.session
    }
}

impl fmt::Debug for RemoteLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteLease")
            .field("id", &self.id)
            .field("closed", &self.session.is_closed())
            .finish()
    }
}

#[derive(Default)]
struct PoolState {
    entries: Vec<PoolEntry>,
    /// Creation slots reserved by acquirers that are still connecting
    pending: usize,
    closed: bool,
}

impl PoolState {
    fn active(&self) -> usize {
        self.entries.iter().filter(|e| e.in_use).count()
    }

    /// Drop idle entries whose session has died underneath the pool
    fn prune_dead(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.in_use || !e.session.is_closed());
        before - self.entries.len()
    }
}

/// Point-in-time view of a pool's occupancy
#[derive(Debug, Clone, Serialize)]
pub struct RemotePoolSnapshot {
    pub environment: String,
    pub total: usize,
    pub available: usize,
    pub active: usize,
    pub pending: usize,
    pub min: usize,
    pub max: usize,
    pub stats: RemotePoolStatsSnapshot,
}

enum Next {
    Leased(RemoteLease),
    Create,
    Wait,
}

/// Bounded pool of remote-execution sessions for one environment
pub struct RemoteExecutionPool {
    environment: String,
    config: RemoteConfig,
    pool_config: RemotePoolConfig,
    connector: Arc<dyn RemoteConnector>,
    state: Mutex<PoolState>,
    available: Notify,
    next_id: AtomicU64,
    stats: Arc<RemotePoolStats>,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
    this: Weak<Self>,
}

impl RemoteExecutionPool {
    /// Validate configuration, pre-create `min` sessions and start idle eviction
    pub async fn initialize(
        environment: impl Into<String>,
        config: RemoteConfig,
        pool_config: RemotePoolConfig,
        connector: Arc<dyn RemoteConnector>,
        stats: Arc<RemotePoolStats>,
    ) -> Result<Arc<Self>> {
        let environment = environment.into();
        config.validate(&environment)?;
        pool_config.validate(&environment)?;

        info!(
            "Initializing remote pool for environment '{}' ({}, min={}, max={})",
            environment,
            config.endpoint(),
            pool_config.min,
            pool_config.max
        );

        let pool = Arc::new_cyclic(|this| Self {
            environment,
            config,
            pool_config,
            connector,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            next_id: AtomicU64::new(1),
            stats,
            eviction_task: Mutex::new(None),
            this: this.clone(),
        });

        let min = pool.pool_config.min;
        if min > 0 {
            let created = pool.warm_up(min).await;
            if let Err(e) = created {
                pool.close().await;
                return Err(e);
            }
        }

        pool.start_eviction();
        info!("Remote pool for environment '{}' is ready", pool.environment);
        Ok(pool)
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn pool_config(&self) -> &RemotePoolConfig {
        &self.pool_config
    }

    pub fn stats(&self) -> &Arc<RemotePoolStats> {
        &self.stats
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_entry(&self, session: Arc<dyn RemoteSession>, in_use: bool) -> PoolEntry {
        let now = Instant::now();
        PoolEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            session,
            created_at: now,
            last_used: now,
            last_released: None,
            in_use,
        }
    }

    /// Create up to `count` idle sessions concurrently.
    /// Fails only when not a single one could be established.
    async fn warm_up(&self, count: usize) -> Result<usize> {
        let slots = self.reserve_slots(&mut self.state(), count);
        self.connect_reserved(slots).await
    }

    /// Reserve up to `count` creation slots without exceeding `max`
    fn reserve_slots(&self, state: &mut PoolState, count: usize) -> usize {
        let room = self.pool_config.max.saturating_sub(state.entries.len() + state.pending);
        let slots = count.min(room);
        state.pending += slots;
        slots
    }

    async fn connect_reserved(&self, slots: usize) -> Result<usize> {
        if slots == 0 {
            return Ok(0);
        }

        let attempts = (0..slots).map(|_| self.connector.connect(&self.environment, &self.config));
        let results = futures::future::join_all(attempts).await;

        let mut created = 0;
        let mut last_error = None;
        let mut orphaned = Vec::new();
        {
            let mut state = self.state();
            state.pending -= slots;
            for result in results {
                match result {
                    Ok(session) if !state.closed => {
                        self.stats.record_connection_attempt(true);
                        let entry = self.next_entry(session, false);
                        state.entries.push(entry);
                        created += 1;
                    }
                    Ok(session) => orphaned.push(session),
                    Err(e) => {
                        self.stats.record_connection_attempt(false);
                        last_error = Some(e);
                    }
                }
            }
        }
        self.available.notify_waiters();

        for session in orphaned {
            session.close().await;
        }

        match last_error {
            Some(e) if created == 0 => {
                error!(
                    "Could not establish any of {} connection(s) for environment '{}'",
                    slots, self.environment
                );
                Err(e)
            }
            Some(e) => {
                warn!(
                    "Created {}/{} connection(s) for environment '{}': {}",
                    created, slots, self.environment, e
                );
                Ok(created)
            }
            None => Ok(created),
        }
    }

    /// Lend out a session, creating one if the pool is below `max`,
    /// otherwise waiting up to `acquire_timeout` for a release.
    pub async fn acquire(&self) -> Result<RemoteLease> {
        let acquire_timeout = self.pool_config.acquire_timeout();
        let deadline = Instant::now() + acquire_timeout;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = self.state();
                if state.closed {
                    return Err(PoolError::invalid_state(&self.environment, "Remote pool is closed"));
                }

                let dead = state.prune_dead();
                for _ in 0..dead {
                    self.stats.record_evicted();
                }
                if dead > 0 {
                    self.schedule_replenish();
                }

                let now = Instant::now();
                if let Some(entry) = state.entries.iter_mut().find(|e| !e.in_use) {
                    entry.in_use = true;
                    entry.last_used = now;
                    Next::Leased(RemoteLease {
                        id: entry.id,
                        session: Arc::clone(&entry.session),
                    })
                } else if state.entries.len() + state.pending < self.pool_config.max {
                    state.pending += 1;
                    Next::Create
                } else {
                    Next::Wait
                }
            };

            match next {
                Next::Leased(lease) => {
                    self.stats.record_acquired();
                    debug!("Acquired connection {} for environment '{}'", lease.id, self.environment);
                    return Ok(lease);
                }
                Next::Create => return self.create_leased().await,
                Next::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.stats.record_acquire_timeout();
                        return Err(PoolError::acquire_timeout(
                            &self.environment,
                            acquire_timeout.as_millis() as u64,
                        ));
                    }
                    let wait = ACQUIRE_POLL_INTERVAL.min(deadline - now);
                    let _ = tokio::time::timeout(wait, notified).await;
                }
            }
        }
    }

    /// Connect using a slot reserved by `acquire`; the slot is returned on failure
    async fn create_leased(&self) -> Result<RemoteLease> {
        let slot = SlotReservation { pool: self, armed: true };
        let result = self.connector.connect(&self.environment, &self.config).await;
        slot.disarm();

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                self.state().pending -= 1;
                self.available.notify_waiters();
                self.stats.record_connection_attempt(false);
                return Err(e);
            }
        };

        let lease = {
            let mut state = self.state();
            state.pending -= 1;
            if state.closed {
                None
            } else {
                let entry = self.next_entry(session.clone(), true);
                let lease = RemoteLease {
                    id: entry.id,
                    session: Arc::clone(&entry.session),
                };
                state.entries.push(entry);
                Some(lease)
            }
        };

        match lease {
            Some(lease) => {
                self.stats.record_connection_attempt(true);
                self.stats.record_acquired();
                debug!(
                    "Created and acquired connection {} for environment '{}'",
                    lease.id, self.environment
                );
                Ok(lease)
            }
            None => {
                session.close().await;
                Err(PoolError::invalid_state(&self.environment, "Remote pool is closed"))
            }
        }
    }

    /// Return a leased session. Releasing an id that is not leased is a no-op.
    pub fn release(&self, id: u64) {
        let outcome = {
            let mut state = self.state();
            match state.entries.iter().position(|e| e.id == id) {
                Some(index) if state.entries[index].in_use => {
                    if state.entries[index].session.is_closed() {
                        state.entries.swap_remove(index);
                        Some(false)
                    } else {
                        let entry = &mut state.entries[index];
                        entry.in_use = false;
                        entry.last_released = Some(Instant::now());
                        Some(true)
                    }
                }
                _ => None,
            }
        };

        match outcome {
            Some(true) => {
                self.stats.record_released();
                debug!("Released connection {} for environment '{}'", id, self.environment);
            }
            Some(false) => {
                self.stats.record_discarded();
                debug!(
                    "Dropped closed connection {} on release for environment '{}'",
                    id, self.environment
                );
                self.schedule_replenish();
            }
            None => {
                warn!(
                    "Release of connection {} for environment '{}' ignored: not in use",
                    id, self.environment
                );
                return;
            }
        }
        self.available.notify_waiters();
    }

    fn remove_entry(&self, id: u64) -> Option<Arc<dyn RemoteSession>> {
        let removed = {
            let mut state = self.state();
            state
                .entries
                .iter()
                .position(|e| e.id == id)
                .map(|index| state.entries.swap_remove(index).session)
        };
        if removed.is_some() {
            self.stats.record_discarded();
            self.available.notify_waiters();
            self.schedule_replenish();
        }
        removed
    }

    /// Remove a session from the pool and close it
    pub async fn discard(&self, id: u64) {
        if let Some(session) = self.remove_entry(id) {
            debug!("Discarding connection {} for environment '{}'", id, self.environment);
            session.close().await;
        }
    }

    /// Run a command on a pooled session with a hard timeout.
    ///
    /// A non-zero exit is returned as an unsuccessful [`CommandResult`]. On
    /// timeout the command is interrupted, given the grace period, and its
    /// session is discarded.
    pub async fn execute(&self, command: &str, options: CommandOptions) -> Result<CommandResult> {
        let timeout = options.timeout.unwrap_or_else(|| self.pool_config.command_timeout());
        let grace = options.grace.unwrap_or_else(|| self.pool_config.kill_grace());

        let guard = LeaseGuard::new(self, self.acquire().await?);
        let session = Arc::clone(guard.session());
        let started = Instant::now();

        let exec = session.exec(command);
        tokio::pin!(exec);

        match tokio::time::timeout(timeout, &mut exec).await {
            Ok(Ok(output)) => {
                let result = CommandResult::from_output(output, started.elapsed());
                self.stats.record_command(result.success, result.duration_ms);
                guard.release();
                if !result.success {
                    debug!(
                        "Command on environment '{}' exited with {:?}",
                        self.environment, result.exit_code
                    );
                }
                Ok(result)
            }
            Ok(Err(e)) => {
                self.stats.record_error();
                guard.settle(&e).await;
                Err(e)
            }
            Err(_) => {
                warn!(
                    "Command on environment '{}' exceeded {}ms, interrupting",
                    self.environment,
                    timeout.as_millis()
                );
                session.interrupt();
                if tokio::time::timeout(grace, &mut exec).await.is_err() {
                    debug!(
                        "Command on environment '{}' still running after grace period, closing session",
                        self.environment
                    );
                }
                self.stats.record_command_timeout(started.elapsed().as_millis() as u64);
                guard.discard().await;
                Err(PoolError::timeout_error(
                    format!("command on environment '{}'", self.environment),
                    timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Copy a local file to the remote host
    pub async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<u64> {
        let contents = tokio::fs::read(local_path)
            .await
            .map_err(|e| PoolError::io_error(e, format!("reading {}", local_path.display())))?;

        let guard = LeaseGuard::new(self, self.acquire().await?);
        let session = Arc::clone(guard.session());
        match session.upload(&contents, remote_path).await {
            Ok(bytes) => {
                guard.release();
                self.stats.record_upload(bytes);
                info!(
                    "Uploaded {} bytes to {} on environment '{}'",
                    bytes, remote_path, self.environment
                );
                Ok(bytes)
            }
            Err(e) => {
                self.stats.record_error();
                guard.settle(&e).await;
                Err(e)
            }
        }
    }

    /// Copy a remote file to the local filesystem
    pub async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        let guard = LeaseGuard::new(self, self.acquire().await?);
        let session = Arc::clone(guard.session());
        let contents = match session.download(remote_path).await {
            Ok(contents) => {
                guard.release();
                contents
            }
            Err(e) => {
                self.stats.record_error();
                guard.settle(&e).await;
                return Err(e);
            }
        };

        tokio::fs::write(local_path, &contents)
            .await
            .map_err(|e| PoolError::io_error(e, format!("writing {}", local_path.display())))?;

        let bytes = contents.len() as u64;
        self.stats.record_download(bytes);
        info!(
            "Downloaded {} bytes from {} on environment '{}'",
            bytes, remote_path, self.environment
        );
        Ok(bytes)
    }

    /// Round-trip a trivial command through the pool.
    /// A session that fails the probe is discarded.
    pub async fn probe(&self, timeout: Duration) -> Result<Duration> {
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.probe_once()).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::timeout_error(
                format!("transport probe on environment '{}'", self.environment),
                timeout.as_millis() as u64,
            )),
        };

        self.stats.record_health_check(result.is_ok());
        result.map(|_| started.elapsed())
    }

    async fn probe_once(&self) -> Result<()> {
        let guard = LeaseGuard::new(self, self.acquire().await?);
        let session = Arc::clone(guard.session());

        match session.exec(PROBE_COMMAND).await {
            Ok(output) if output.success() && output.stdout.trim() == "ok" => {
                guard.release();
                Ok(())
            }
            Ok(output) => {
                guard.discard().await;
                Err(PoolError::remote_error(PROBE_COMMAND, output.exit_code, output.stderr))
            }
            Err(e) => {
                guard.discard().await;
                Err(e)
            }
        }
    }

    /// Occupancy and statistics
    pub fn snapshot(&self) -> RemotePoolSnapshot {
        let state = self.state();
        let active = state.active();
        RemotePoolSnapshot {
            environment: self.environment.clone(),
            total: state.entries.len(),
            available: state.entries.len() - active,
            active,
            pending: state.pending,
            min: self.pool_config.min,
            max: self.pool_config.max,
            stats: self.stats.snapshot(),
        }
    }

    /// Close sessions idle for longer than `idle_timeout`, never going below `min`
    pub async fn evict_idle(&self) -> usize {
        let idle_timeout = self.pool_config.idle_timeout();
        let now = Instant::now();

        let evicted: Vec<_> = {
            let mut state = self.state();
            if state.closed {
                return 0;
            }

            let mut excess = state.entries.len().saturating_sub(self.pool_config.min);
            let mut evicted = Vec::new();
            let mut index = 0;
            while index < state.entries.len() && excess > 0 {
                let entry = &state.entries[index];
                if !entry.in_use && now.duration_since(entry.idle_since()) >= idle_timeout {
                    evicted.push(state.entries.swap_remove(index).session);
                    excess -= 1;
                } else {
                    index += 1;
                }
            }
            evicted
        };

        let count = evicted.len();
        for session in evicted {
            self.stats.record_evicted();
            session.close().await;
        }
        if count > 0 {
            debug!("Evicted {} idle connection(s) for environment '{}'", count, self.environment);
        }
        count
    }

    /// Bring the pool back up to `min` after discards
    async fn replenish(&self) {
        let slots = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            let missing = self.pool_config.min.saturating_sub(state.entries.len() + state.pending);
            self.reserve_slots(&mut state, missing)
        };
        if slots == 0 {
            return;
        }

        if let Err(e) = self.connect_reserved(slots).await {
            warn!(
                "Could not restore minimum connections for environment '{}': {}",
                self.environment, e
            );
        }
    }

    /// Replenish in the background once a session has left the pool
    fn schedule_replenish(&self) {
        if self.pool_config.min == 0 {
            return;
        }
        let Some(pool) = self.this.upgrade() else { return };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { pool.replenish().await });
        }
    }

    fn start_eviction(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.pool_config.eviction_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                pool.evict_idle().await;
                pool.replenish().await;
            }
        });

        *self.eviction_task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Stop eviction and close every session, leased or not
    pub async fn close(&self) {
        let sessions: Vec<_> = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.entries.drain(..).map(|e| e.session).collect()
        };
        self.available.notify_waiters();

        if let Some(handle) = self.eviction_task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }

        let count = sessions.len();
        futures::future::join_all(sessions.iter().map(|session| session.close())).await;
        info!(
            "Closed remote pool for environment '{}' ({} connection(s))",
            self.environment, count
        );
    }
}

impl Drop for RemoteExecutionPool {
    fn drop(&mut self) {
        if let Some(handle) = self.eviction_task.get_mut().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }
}

/// Returns a reserved creation slot if connecting is cancelled
struct SlotReservation<'a> {
    pool: &'a RemoteExecutionPool,
    armed: bool,
}

impl SlotReservation<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state().pending -= 1;
            self.pool.available.notify_waiters();
        }
    }
}

/// Settles a lease exactly once: released, or discarded. A guard dropped
/// without being settled (cancelled caller) discards its session.
struct LeaseGuard<'a> {
    pool: &'a RemoteExecutionPool,
    lease: RemoteLease,
    settled: bool,
}

impl<'a> LeaseGuard<'a> {
    fn new(pool: &'a RemoteExecutionPool, lease: RemoteLease) -> Self {
        Self {
            pool,
            lease,
            settled: false,
        }
    }

    fn session(&self) -> &Arc<dyn RemoteSession> {
        &self.lease.session
    }

    fn release(mut self) {
        self.settled = true;
        self.pool.release(self.lease.id);
    }

    async fn discard(mut self) {
        self.settled = true;
        self.pool.discard(self.lease.id).await;
    }

    /// Keep the session after a remote-side failure, drop it after a transport failure
    async fn settle(self, err: &PoolError) {
        if matches!(err, PoolError::Remote { .. }) {
            self.release();
        } else {
            self.discard().await;
        }
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(session) = self.pool.remove_entry(self.lease.id) {
            debug!(
                "Discarding connection {} for environment '{}' after cancelled operation",
                self.lease.id, self.pool.environment
            );
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { session.close().await });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ExecOutput;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct EchoSession {
        closed: AtomicBool,
    }

    #[async_trait]
    impl RemoteSession for EchoSession {
        async fn exec(&self, command: &str) -> Result<ExecOutput> {
            Ok(ExecOutput {
                exit_code: Some(0),
                stdout: format!("{}\n", command.trim_start_matches("echo ")),
                stderr: String::new(),
            })
        }

        async fn upload(&self, contents: &[u8], _remote_path: &str) -> Result<u64> {
            Ok(contents.len() as u64)
        }

        async fn download(&self, _remote_path: &str) -> Result<Vec<u8>> {
            Ok(b"remote".to_vec())
        }

        fn interrupt(&self) {}

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    struct EchoConnector {
        connects: AtomicU64,
        fail: AtomicBool,
    }

    impl EchoConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicU64::new(0),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl RemoteConnector for EchoConnector {
        async fn connect(&self, environment: &str, _config: &RemoteConfig) -> Result<Arc<dyn RemoteSession>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PoolError::transport_error(environment, "connection refused"));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(EchoSession {
                closed: AtomicBool::new(false),
            }))
        }
    }

    fn pool_config(min: usize, max: usize) -> RemotePoolConfig {
        RemotePoolConfig {
            min,
            max,
            acquire_timeout_secs: 1,
            idle_timeout_secs: 60,
            eviction_interval_secs: 3_600,
            ..RemotePoolConfig::default()
        }
    }

    async fn pool(connector: Arc<EchoConnector>, min: usize, max: usize) -> Result<Arc<RemoteExecutionPool>> {
        RemoteExecutionPool::initialize(
            "staging",
            RemoteConfig::with_password("web-1", "deploy", "secret"),
            pool_config(min, max),
            connector,
            Arc::new(RemotePoolStats::new()),
        )
        .await
    }

    #[tokio::test]
    async fn test_initialize_creates_min_connections() {
        let connector = EchoConnector::new();
        let pool = pool(connector.clone(), 2, 4).await.unwrap();

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.available, 2);
        assert_eq!(snapshot.active, 0);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_initialize_fails_when_no_connection_succeeds() {
        let connector = EchoConnector::new();
        connector.fail.store(true, Ordering::SeqCst);

        let result = pool(connector, 2, 4).await;
        assert!(matches!(result, Err(PoolError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_config() {
        let mut config = RemoteConfig::with_key("web-1", "deploy", "/keys/id");
        config.private_key_path = None;

        let result = RemoteExecutionPool::initialize(
            "staging",
            config,
            pool_config(1, 2),
            EchoConnector::new(),
            Arc::new(RemotePoolStats::new()),
        )
        .await;
        assert!(matches!(result, Err(PoolError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let pool = pool(EchoConnector::new(), 1, 2).await.unwrap();
        let lease = pool.acquire().await.unwrap();

        pool.release(lease.id);
        pool.release(lease.id);
        pool.release(9_999);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.available, 1);
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.stats.released, 1);
    }

    #[tokio::test]
    async fn test_failed_creation_is_not_counted() {
        let connector = EchoConnector::new();
        let pool = pool(connector.clone(), 0, 2).await.unwrap();

        connector.fail.store(true, Ordering::SeqCst);
        assert!(pool.acquire().await.is_err());

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.pending, 0);
        assert_eq!(snapshot.stats.connection_failures, 1);

        connector.fail.store(false, Ordering::SeqCst);
        let lease = pool.acquire().await.unwrap();
        assert_eq!(pool.snapshot().active, 1);
        pool.release(lease.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_saturated() {
        let pool = pool(EchoConnector::new(), 1, 1).await.unwrap();
        let held = pool.acquire().await.unwrap();
        assert_eq!(format!("{:?}", held), format!("RemoteLease {{ id: {}, closed: false }}", held.id));

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::AcquireTimeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(pool.snapshot().total, 1);
    }

    #[tokio::test]
    async fn test_execute_releases_connection() {
        let pool = pool(EchoConnector::new(), 1, 1).await.unwrap();

        let result = pool.execute("echo hello", CommandOptions::default()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "hello");

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.stats.commands_executed, 1);
    }

    #[tokio::test]
    async fn test_probe_succeeds() {
        let pool = pool(EchoConnector::new(), 1, 1).await.unwrap();
        assert!(pool.probe(Duration::from_secs(1)).await.is_ok());
        assert_eq!(pool.snapshot().stats.health_checks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_keeps_min() {
        let pool = pool(EchoConnector::new(), 1, 3).await.unwrap();
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        pool.release(a.id);
        pool.release(b.id);
        pool.release(c.id);
        assert_eq!(pool.snapshot().total, 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(pool.evict_idle().await, 2);
        assert_eq!(pool.snapshot().total, 1);
        assert_eq!(pool.evict_idle().await, 0);
    }

    #[tokio::test]
    async fn test_close_rejects_acquire() {
        let pool = pool(EchoConnector::new(), 2, 2).await.unwrap();
        pool.close().await;

        assert!(pool.is_closed());
        assert_eq!(pool.snapshot().total, 0);
        assert!(matches!(pool.acquire().await, Err(PoolError::InvalidState { .. })));
    }
}
