//! Running statistics for remote-execution and database pools
//!
//! Counters only grow; they are reset when the owning pool is explicitly
//! closed. Rates and averages are derived when a snapshot is taken.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

fn rate(successes: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (successes as f64 / total as f64) * 100.0
    }
}

fn average(total_ms: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total_ms as f64 / count as f64
    }
}

/// Counters for one remote-execution pool
#[derive(Debug, Default)]
pub struct RemotePoolStats {
    connections_created: AtomicU64,
    connection_failures: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
    evicted: AtomicU64,
    acquire_timeouts: AtomicU64,
    commands_executed: AtomicU64,
    command_failures: AtomicU64,
    command_timeouts: AtomicU64,
    command_time_ms: AtomicU64,
    errors: AtomicU64,
    files_uploaded: AtomicU64,
    files_downloaded: AtomicU64,
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
    health_checks: AtomicU64,
    health_check_failures: AtomicU64,
}

impl RemotePoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_attempt(&self, success: bool) {
        if success {
            self.connections_created.fetch_add(1, Ordering::Relaxed);
        } else {
            self.connection_failures.fetch_add(1, Ordering::Relaxed);
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquire_timeout(&self) {
        self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a command that ran to completion (any exit status)
    pub fn record_command(&self, success: bool, duration_ms: u64) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        self.command_time_ms.fetch_add(duration_ms, Ordering::Relaxed);
        if !success {
            self.command_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_command_timeout(&self, duration_ms: u64) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        self.command_time_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.command_failures.fetch_add(1, Ordering::Relaxed);
        self.command_timeouts.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.files_uploaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_download(&self, bytes: u64) {
        self.files_downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_health_check(&self, success: bool) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.health_check_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RemotePoolStatsSnapshot {
        let commands_executed = self.commands_executed.load(Ordering::Relaxed);
        let command_failures = self.command_failures.load(Ordering::Relaxed);
        let command_time_ms = self.command_time_ms.load(Ordering::Relaxed);
        let connections_created = self.connections_created.load(Ordering::Relaxed);
        let connection_failures = self.connection_failures.load(Ordering::Relaxed);

        RemotePoolStatsSnapshot {
            connections_created,
            connection_failures,
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            commands_executed,
            command_failures,
            command_timeouts: self.command_timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            files_uploaded: self.files_uploaded.load(Ordering::Relaxed),
            files_downloaded: self.files_downloaded.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            health_checks: self.health_checks.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
            total_command_time_ms: command_time_ms,
            avg_command_time_ms: average(command_time_ms, commands_executed),
            command_success_rate: rate(commands_executed - command_failures, commands_executed),
            connection_success_rate: rate(connections_created, connections_created + connection_failures),
        }
    }
}

/// Point-in-time view of [`RemotePoolStats`] with derived rates
#[derive(Debug, Clone, Serialize)]
pub struct RemotePoolStatsSnapshot {
    pub connections_created: u64,
    pub connection_failures: u64,
    pub acquired: u64,
    pub released: u64,
    pub discarded: u64,
    pub evicted: u64,
    pub acquire_timeouts: u64,
    pub commands_executed: u64,
    pub command_failures: u64,
    pub command_timeouts: u64,
    pub errors: u64,
    pub files_uploaded: u64,
    pub files_downloaded: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub health_checks: u64,
    pub health_check_failures: u64,
    pub total_command_time_ms: u64,
    /// Average command duration in milliseconds
    pub avg_command_time_ms: f64,
    /// Percentage of commands that exited zero
    pub command_success_rate: f64,
    /// Percentage of connection attempts that succeeded
    pub connection_success_rate: f64,
}

/// Counters for one side (read or write) of a database pool
#[derive(Debug, Default)]
pub struct SideStats {
    queries: AtomicU64,
    query_errors: AtomicU64,
    query_time_ms: AtomicU64,
    acquire_timeouts: AtomicU64,
    rejected: AtomicU64,
}

impl SideStats {
    pub fn record_query(&self, success: bool, duration_ms: u64) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.query_time_ms.fetch_add(duration_ms, Ordering::Relaxed);
        if !success {
            self.query_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_acquire_timeout(&self) {
        self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Caller turned away because the wait queue was full
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SideStatsSnapshot {
        let queries = self.queries.load(Ordering::Relaxed);
        let query_errors = self.query_errors.load(Ordering::Relaxed);
        let query_time_ms = self.query_time_ms.load(Ordering::Relaxed);

        SideStatsSnapshot {
            queries,
            query_errors,
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            total_query_time_ms: query_time_ms,
            avg_query_time_ms: average(query_time_ms, queries),
            query_success_rate: rate(queries - query_errors, queries),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SideStatsSnapshot {
    pub queries: u64,
    pub query_errors: u64,
    pub acquire_timeouts: u64,
    pub rejected: u64,
    pub total_query_time_ms: u64,
    pub avg_query_time_ms: f64,
    pub query_success_rate: f64,
}

/// Counters for one environment's database pools
#[derive(Debug, Default)]
pub struct DatabasePoolStats {
    pub read: SideStats,
    pub write: SideStats,
    transactions: AtomicU64,
    transaction_errors: AtomicU64,
    health_checks: AtomicU64,
    health_check_failures: AtomicU64,
}

impl DatabasePoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_transaction(&self, success: bool) {
        self.transactions.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.transaction_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_health_check(&self, success: bool) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.health_check_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn transaction_errors(&self) -> u64 {
        self.transaction_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DatabasePoolStatsSnapshot {
        let transactions = self.transactions.load(Ordering::Relaxed);
        let transaction_errors = self.transaction_errors.load(Ordering::Relaxed);

        DatabasePoolStatsSnapshot {
            read: self.read.snapshot(),
            write: self.write.snapshot(),
            transactions,
            transaction_errors,
            transaction_success_rate: rate(transactions - transaction_errors, transactions),
            health_checks: self.health_checks.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabasePoolStatsSnapshot {
    pub read: SideStatsSnapshot,
    pub write: SideStatsSnapshot,
    pub transactions: u64,
    pub transaction_errors: u64,
    pub transaction_success_rate: f64,
    pub health_checks: u64,
    pub health_check_failures: u64,
}
