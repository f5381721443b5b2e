//! Fleet connection pooling and health monitoring
//!
//! Pooled remote-command and MySQL connections for a fleet of independently
//! configured environments, with a health monitor that classifies each
//! environment and rebuilds its pools when it becomes unhealthy.

pub mod config;
pub mod environment;
pub mod error;
pub mod events;
pub mod fleet;
pub mod health;
pub mod monitor;
pub mod pool;
pub mod query;
pub mod registry;
pub mod remote;
pub mod remote_pool;
pub mod ssh;
pub mod stats;
pub mod store;

pub use config::{Config, DatabaseConfig, EnvironmentConfig, MonitorConfig, RemoteConfig, RemotePoolConfig};
pub use error::{ErrorCategory, PoolError, Result};
pub use events::MonitorEvent;
pub use fleet::FleetManager;
pub use health::{HealthStatus, HealthThresholds};
pub use monitor::HealthMonitor;
