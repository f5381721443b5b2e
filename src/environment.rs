//! Environment manager
//!
//! Loads the configured environments, validates each of them and answers
//! which ones should be registered with the fleet. Status reports never
//! carry credentials.

use crate::config::{AuthMethod, Config, EnvironmentConfig};
use crate::{PoolError, Result};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Environment status information
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum EnvironmentStatus {
    /// Environment is enabled and ready to be registered
    Enabled,
    /// Environment is disabled in configuration
    Disabled,
    /// Environment configuration is invalid
    Invalid(String),
}

/// Environment configuration with its load-time status
#[derive(Debug, Clone)]
pub struct EnvironmentMetadata {
    pub config: EnvironmentConfig,
    pub status: EnvironmentStatus,
}

/// Manages the set of configured environments
#[derive(Debug, Default)]
pub struct EnvironmentManager {
    environments: HashMap<String, EnvironmentMetadata>,
}

impl EnvironmentManager {
    /// Build the manager from configuration, failing when any environment is
    /// invalid or none is enabled
    pub fn load_from_config(config: &Config) -> Result<Self> {
        info!("Loading environment configuration");

        let mut environments = HashMap::new();
        for (name, env_config) in &config.environments {
            let mut env_config = env_config.clone();
            if env_config.name.is_empty() {
                env_config.name = name.clone();
            }

            let status = if env_config.enabled {
                EnvironmentStatus::Enabled
            } else {
                EnvironmentStatus::Disabled
            };
            debug!(
                "Loaded environment '{}' (enabled: {}, remote: {}, database: {})",
                name,
                env_config.enabled,
                env_config.remote.is_some(),
                env_config.database.is_configured()
            );
            environments.insert(name.clone(), EnvironmentMetadata { config: env_config, status });
        }

        let mut manager = Self { environments };
        manager.validate_all_environments()?;

        info!(
            "Environment manager loaded {} environment(s), {} enabled",
            manager.environment_count(),
            manager.enabled_environment_count()
        );
        Ok(manager)
    }

    fn validate_all_environments(&mut self) -> Result<()> {
        let mut validation_errors = Vec::new();

        for (name, metadata) in &mut self.environments {
            if let Err(err) = metadata.config.validate() {
                let error_msg = err.user_message();
                warn!("Environment '{}' validation failed: {}", name, error_msg);
                metadata.status = EnvironmentStatus::Invalid(error_msg.clone());
                validation_errors.push(format!("Environment '{}': {}", name, error_msg));
            }
        }

        if !validation_errors.is_empty() {
            validation_errors.sort();
            return Err(PoolError::configuration_error(
                "environments",
                format!("Environment validation failed: {}", validation_errors.join("; ")),
            ));
        }

        if self.enabled_environment_count() == 0 {
            return Err(PoolError::configuration_error(
                "environments",
                "No environments are enabled",
            ));
        }

        Ok(())
    }

    pub fn get_environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.get(name).map(|metadata| &metadata.config)
    }

    pub fn get_environment_metadata(&self, name: &str) -> Option<&EnvironmentMetadata> {
        self.environments.get(name)
    }

    /// All environment names, sorted
    pub fn list_environments(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.environments.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Enabled environment names, sorted
    pub fn list_enabled_environments(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .environments
            .iter()
            .filter(|(_, metadata)| metadata.status == EnvironmentStatus::Enabled)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// Configurations of every enabled environment, ready for registration
    pub fn enabled_configs(&self) -> Vec<EnvironmentConfig> {
        self.list_enabled_environments()
            .into_iter()
            .filter_map(|name| self.get_environment(name).cloned())
            .collect()
    }

    pub fn validate_environment(&self, name: &str) -> Result<()> {
        let metadata = self
            .environments
            .get(name)
            .ok_or_else(|| PoolError::not_found(name, "environment configuration"))?;

        match &metadata.status {
            EnvironmentStatus::Enabled => Ok(()),
            EnvironmentStatus::Disabled => Err(PoolError::invalid_state(name, "Environment is disabled")),
            EnvironmentStatus::Invalid(error) => Err(PoolError::configuration_error(
                format!("environments.{}", name),
                format!("Environment is invalid: {}", error),
            )),
        }
    }

    pub fn environment_count(&self) -> usize {
        self.environments.len()
    }

    pub fn enabled_environment_count(&self) -> usize {
        self.environments
            .values()
            .filter(|metadata| metadata.status == EnvironmentStatus::Enabled)
            .count()
    }

    pub fn has_environment(&self, name: &str) -> bool {
        self.environments.contains_key(name)
    }

    /// Status of every environment for external consumption
    pub fn get_environment_status_report(&self) -> HashMap<String, EnvironmentStatusReport> {
        self.environments
            .iter()
            .map(|(name, metadata)| {
                let config = &metadata.config;
                let report = EnvironmentStatusReport {
                    name: name.clone(),
                    description: config.description.clone(),
                    status: metadata.status.clone(),
                    remote: config.remote.as_ref().map(|remote| RemoteInfo {
                        endpoint: remote.endpoint(),
                        username: remote.username.clone(),
                        auth_method: remote.auth_method,
                        min_connections: config.remote_pool.min,
                        max_connections: config.remote_pool.max,
                    }),
                    read_database: config.database.read.as_ref().map(|db| db.masked_connection_url()),
                    write_database: config.database.write.as_ref().map(|db| db.masked_connection_url()),
                };
                (name.clone(), report)
            })
            .collect()
    }
}

/// Environment status report, credentials masked
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentStatusReport {
    pub name: String,
    pub description: Option<String>,
    pub status: EnvironmentStatus,
    pub remote: Option<RemoteInfo>,
    pub read_database: Option<String>,
    pub write_database: Option<String>,
}

/// Remote transport summary for status reports
#[derive(Debug, Clone, Serialize)]
pub struct RemoteInfo {
    pub endpoint: String,
    pub username: String,
    pub auth_method: AuthMethod,
    pub min_connections: usize,
    pub max_connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, RemoteConfig};

    fn create_test_database_config(name: &str) -> DatabaseConfig {
        DatabaseConfig {
            host: format!("{}-db.example.com", name),
            port: 3306,
            username: format!("{}_user", name),
            password: format!("{}_password", name),
            database: format!("{}_db", name),
            connect_timeout_secs: 10,
        }
    }

    fn create_test_environment_config(name: &str) -> EnvironmentConfig {
        EnvironmentConfig::new(name)
            .with_remote(RemoteConfig::with_key(
                format!("{}.example.com", name),
                "deploy",
                "/home/deploy/.ssh/id_ed25519",
            ))
            .with_database(None, Some(create_test_database_config(name)))
    }

    fn create_test_config() -> Config {
        let mut config = Config::default();
        for name in ["dev", "uat"] {
            config
                .environments
                .insert(name.to_string(), create_test_environment_config(name));
        }
        config
    }

    #[test]
    fn test_load_environments() {
        let manager = EnvironmentManager::load_from_config(&create_test_config()).unwrap();

        assert_eq!(manager.environment_count(), 2);
        assert_eq!(manager.enabled_environment_count(), 2);
        assert_eq!(manager.list_environments(), vec!["dev", "uat"]);
        assert_eq!(manager.enabled_configs().len(), 2);
        assert!(manager.validate_environment("dev").is_ok());
        assert!(manager.has_environment("uat"));
        assert!(!manager.has_environment("prod"));
    }

    #[test]
    fn test_name_filled_from_key() {
        let mut config = Config::default();
        let mut env = create_test_environment_config("ignored");
        env.name = String::new();
        config.environments.insert("staging".to_string(), env);

        let manager = EnvironmentManager::load_from_config(&config).unwrap();
        assert_eq!(manager.get_environment("staging").unwrap().name, "staging");
    }

    #[test]
    fn test_disabled_environment() {
        let mut config = create_test_config();
        config.environments.get_mut("uat").unwrap().enabled = false;

        let manager = EnvironmentManager::load_from_config(&config).unwrap();
        assert_eq!(manager.list_enabled_environments(), vec!["dev"]);
        assert!(matches!(
            manager.validate_environment("uat"),
            Err(PoolError::InvalidState { .. })
        ));
        assert!(matches!(
            manager.validate_environment("prod"),
            Err(PoolError::NotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_environment_fails_load() {
        let mut config = create_test_config();
        config.environments.get_mut("uat").unwrap().database.write.as_mut().unwrap().host = String::new();

        let err = EnvironmentManager::load_from_config(&config).unwrap_err();
        assert!(err.to_string().contains("uat"));
    }

    #[test]
    fn test_no_enabled_environments() {
        let mut config = create_test_config();
        for env in config.environments.values_mut() {
            env.enabled = false;
        }
        assert!(EnvironmentManager::load_from_config(&config).is_err());
    }

    #[test]
    fn test_status_report_masks_credentials() {
        let manager = EnvironmentManager::load_from_config(&create_test_config()).unwrap();
        let reports = manager.get_environment_status_report();

        let dev = reports.get("dev").unwrap();
        assert_eq!(dev.status, EnvironmentStatus::Enabled);
        assert_eq!(dev.remote.as_ref().unwrap().endpoint, "deploy@dev.example.com:22");
        let write = dev.write_database.as_ref().unwrap();
        assert!(write.contains("****"));
        assert!(!write.contains("dev_password"));

        let json = serde_json::to_string(dev).unwrap();
        assert!(!json.contains("dev_password"));
    }
}
