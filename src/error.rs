//! Error types for the fleet connection pools and health monitor

use std::fmt;
use tracing::{error, warn};

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, PoolError>;

/// Coarse error category used by callers to decide whether to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Timeout,
    Authentication,
    Transport,
    Remote,
    Query,
    Resource,
    State,
    Internal,
}

/// Main error type for pool, transport and monitoring operations
#[derive(Debug)]
pub enum PoolError {
    /// Missing or invalid configuration
    Configuration {
        /// Configuration parameter that is invalid
        parameter: String,
        /// Error message
        message: String,
    },
    /// No pool or record exists for the environment
    NotFound {
        /// Environment identifier
        environment: String,
        /// What was looked up (remote pool, read pool, health record, ...)
        resource: String,
    },
    /// No connection became available within the acquire timeout
    AcquireTimeout {
        /// Environment identifier
        environment: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },
    /// A command or statement exceeded its time limit
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },
    /// Credentials or host key rejected
    Authentication {
        /// Environment identifier
        environment: String,
        /// Error message
        message: String,
    },
    /// Connection could not be established or was dropped
    Transport {
        /// Environment identifier
        environment: String,
        /// Error message
        message: String,
    },
    /// Remote command failed where a failure cannot be reported as a result
    Remote {
        /// Command that failed
        command: String,
        /// Exit status if the command ran to completion
        exit_code: Option<u32>,
        /// Captured standard error (truncated)
        stderr: String,
    },
    /// Query execution errors
    Query {
        /// The SQL statement that failed
        sql: String,
        /// The underlying database error
        source: sqlx::Error,
        /// MySQL error code if available
        error_code: Option<String>,
    },
    /// Database connection errors outside of a statement
    Database {
        /// The underlying database error
        source: sqlx::Error,
        /// User-friendly error message
        message: String,
        /// Whether this is a recoverable error
        recoverable: bool,
    },
    /// Resource exhaustion errors
    ResourceExhaustion {
        /// Type of resource that was exhausted
        resource_type: String,
        /// Current usage information
        usage_info: Option<String>,
    },
    /// Operation rejected because of the current lifecycle state
    InvalidState {
        /// Environment identifier
        environment: String,
        /// Error message
        message: String,
    },
    /// Serialization/deserialization errors
    Serialization {
        /// The underlying serialization error
        source: serde_json::Error,
        /// Context about what was being serialized
        context: String,
    },
    /// General I/O errors
    Io {
        /// The underlying I/O error
        source: std::io::Error,
        /// Context about the I/O operation
        context: String,
    },
    /// Internal errors
    Internal {
        /// Error message (safe for callers)
        message: String,
        /// Internal error details (for logging only)
        details: Option<String>,
    },
}

impl PoolError {
    /// Create a new configuration error
    pub fn configuration_error(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        let parameter = parameter.into();
        let message = message.into();
        error!("Configuration error for '{}': {}", parameter, message);

        Self::Configuration { parameter, message }
    }

    /// Create a new not-found error
    pub fn not_found(environment: impl Into<String>, resource: impl Into<String>) -> Self {
        let environment = environment.into();
        let resource = resource.into();
        warn!("No {} registered for environment '{}'", resource, environment);

        Self::NotFound {
            environment,
            resource,
        }
    }

    /// Create a new acquisition timeout error
    pub fn acquire_timeout(environment: impl Into<String>, timeout_ms: u64) -> Self {
        let environment = environment.into();
        warn!(
            "Timed out acquiring a connection for environment '{}' after {}ms",
            environment, timeout_ms
        );

        Self::AcquireTimeout {
            environment,
            timeout_ms,
        }
    }

    /// Create a new timeout error
    pub fn timeout_error(operation: impl Into<String>, timeout_ms: u64) -> Self {
        let operation = operation.into();
        warn!("Operation timed out: {} after {}ms", operation, timeout_ms);

        Self::Timeout {
            operation,
            timeout_ms,
        }
    }

    /// Create a new authentication error
    pub fn authentication_error(environment: impl Into<String>, message: impl Into<String>) -> Self {
        let environment = environment.into();
        let message = message.into();
        error!("Authentication failed for environment '{}': {}", environment, message);

        Self::Authentication {
            environment,
            message,
        }
    }

    /// Create a new transport error
    pub fn transport_error(environment: impl Into<String>, message: impl Into<String>) -> Self {
        let environment = environment.into();
        let message = message.into();
        error!("Transport error for environment '{}': {}", environment, message);

        Self::Transport {
            environment,
            message,
        }
    }

    /// Create a new remote command error
    pub fn remote_error(command: impl Into<String>, exit_code: Option<u32>, stderr: impl Into<String>) -> Self {
        let command = command.into();
        let stderr = truncate(stderr.into(), 500);
        warn!(
            "Remote command failed: {} | exit code: {:?} | stderr: {}",
            command, exit_code, stderr
        );

        Self::Remote {
            command,
            exit_code,
            stderr,
        }
    }

    /// Create a new query error
    pub fn query_error(sql: impl Into<String>, source: sqlx::Error) -> Self {
        let sql = sql.into();
        let error_code = Self::extract_mysql_error_code(&source);
        error!("Query execution failed: {} | SQL: {}", source, sql);

        Self::Query {
            sql,
            source,
            error_code,
        }
    }

    /// Create a new database connection error
    pub fn database_error(source: sqlx::Error, recoverable: bool) -> Self {
        let message = Self::format_database_error(&source, recoverable);
        error!("Database error: {} (recoverable: {})", source, recoverable);

        Self::Database {
            source,
            message,
            recoverable,
        }
    }

    /// Create a new resource exhaustion error
    pub fn resource_exhaustion(resource_type: impl Into<String>, usage_info: Option<String>) -> Self {
        let resource_type = resource_type.into();
        error!("Resource exhaustion: {} | Usage: {:?}", resource_type, usage_info);

        Self::ResourceExhaustion {
            resource_type,
            usage_info,
        }
    }

    /// Create a new lifecycle state error
    pub fn invalid_state(environment: impl Into<String>, message: impl Into<String>) -> Self {
        let environment = environment.into();
        let message = message.into();
        warn!("Rejected operation for environment '{}': {}", environment, message);

        Self::InvalidState {
            environment,
            message,
        }
    }

    /// Create a new serialization error
    pub fn serialization_error(source: serde_json::Error, context: impl Into<String>) -> Self {
        let context = context.into();
        error!("Serialization error in {}: {}", context, source);

        Self::Serialization { source, context }
    }

    /// Create a new I/O error
    pub fn io_error(source: std::io::Error, context: impl Into<String>) -> Self {
        let context = context.into();
        error!("I/O error in {}: {}", context, source);

        Self::Io { source, context }
    }

    /// Create a new internal error
    pub fn internal_error(message: impl Into<String>, details: Option<String>) -> Self {
        let message = message.into();
        error!("Internal error: {} | Details: {:?}", message, details);

        Self::Internal { message, details }
    }

    /// Classify the error for upstream retry decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            PoolError::Configuration { .. } => ErrorCategory::Configuration,
            PoolError::NotFound { .. } => ErrorCategory::State,
            PoolError::AcquireTimeout { .. } => ErrorCategory::Timeout,
            PoolError::Timeout { .. } => ErrorCategory::Timeout,
            PoolError::Authentication { .. } => ErrorCategory::Authentication,
            PoolError::Transport { .. } => ErrorCategory::Transport,
            PoolError::Remote { .. } => ErrorCategory::Remote,
            PoolError::Query { .. } => ErrorCategory::Query,
            PoolError::Database { source, .. } => match source {
                sqlx::Error::PoolTimedOut => ErrorCategory::Timeout,
                _ => ErrorCategory::Transport,
            },
            PoolError::ResourceExhaustion { .. } => ErrorCategory::Resource,
            PoolError::InvalidState { .. } => ErrorCategory::State,
            PoolError::Serialization { .. } => ErrorCategory::Internal,
            PoolError::Io { .. } => ErrorCategory::Transport,
            PoolError::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::Configuration { .. } => false,
            PoolError::NotFound { .. } => false,
            PoolError::AcquireTimeout { .. } => true,
            PoolError::Timeout { .. } => true,
            PoolError::Authentication { .. } => false,
            PoolError::Transport { .. } => true,
            PoolError::Remote { .. } => false,
            PoolError::Query { .. } => false,
            PoolError::Database { recoverable, .. } => *recoverable,
            PoolError::ResourceExhaustion { .. } => true,
            PoolError::InvalidState { .. } => true,
            PoolError::Serialization { .. } => false,
            PoolError::Io { .. } => true,
            PoolError::Internal { .. } => false,
        }
    }

    /// Get a user-friendly error message (safe to hand to callers)
    pub fn user_message(&self) -> String {
        match self {
            PoolError::Configuration { parameter, message } => {
                format!("Configuration error for '{}': {}", parameter, message)
            }
            PoolError::NotFound { environment, resource } => {
                format!("No {} found for environment '{}'", resource, environment)
            }
            PoolError::AcquireTimeout { environment, timeout_ms } => {
                format!(
                    "Timed out after {}ms waiting for a connection in environment '{}'",
                    timeout_ms, environment
                )
            }
            PoolError::Timeout { operation, timeout_ms } => {
                format!("Operation '{}' timed out after {}ms", operation, timeout_ms)
            }
            PoolError::Authentication { environment, message } => {
                format!("Authentication failed for environment '{}': {}", environment, message)
            }
            PoolError::Transport { environment, message } => {
                format!("Connection to environment '{}' failed: {}", environment, message)
            }
            PoolError::Remote { command, exit_code, .. } => match exit_code {
                Some(code) => format!("Remote command '{}' exited with status {}", command, code),
                None => format!("Remote command '{}' did not complete", command),
            },
            PoolError::Query { source, .. } => {
                format!("Query execution failed: {}", Self::sanitize_database_error(source))
            }
            PoolError::Database { message, .. } => message.clone(),
            PoolError::ResourceExhaustion { resource_type, .. } => {
                format!("Resource exhaustion: {}", resource_type)
            }
            PoolError::InvalidState { environment, message } => {
                format!("Environment '{}': {}", environment, message)
            }
            PoolError::Serialization { context, .. } => {
                format!("Data serialization error in {}", context)
            }
            PoolError::Io { context, .. } => format!("I/O error during {}", context),
            PoolError::Internal { message, .. } => message.clone(),
        }
    }

    /// Get detailed error information for logging
    pub fn detailed_message(&self) -> String {
        match self {
            PoolError::Query { sql, source, error_code } => {
                format!("Query error: {} | SQL: {} | Error code: {:?}", source, sql, error_code)
            }
            PoolError::Database { source, message, recoverable } => {
                format!(
                    "Database error: {} | Recoverable: {} | Source: {}",
                    message, recoverable, source
                )
            }
            PoolError::Remote { command, exit_code, stderr } => {
                format!(
                    "Remote command failed: {} | Exit code: {:?} | Stderr: {}",
                    command, exit_code, stderr
                )
            }
            PoolError::ResourceExhaustion { resource_type, usage_info } => {
                format!("Resource exhaustion: {} | Usage: {:?}", resource_type, usage_info)
            }
            PoolError::Serialization { source, context } => {
                format!("Serialization error in {}: {}", context, source)
            }
            PoolError::Io { source, context } => format!("I/O error in {}: {}", context, source),
            PoolError::Internal { message, details } => {
                format!("Internal error: {} | Details: {:?}", message, details)
            }
            other => other.user_message(),
        }
    }

    /// Format database error message based on the underlying error
    fn format_database_error(source: &sqlx::Error, recoverable: bool) -> String {
        match source {
            sqlx::Error::Io(_) => {
                if recoverable {
                    "Unable to connect to database. Please check network connectivity and try again.".to_string()
                } else {
                    "Database connection failed due to network error.".to_string()
                }
            }
            sqlx::Error::Tls(_) => {
                "Database connection failed due to TLS/SSL error. Please check certificate configuration.".to_string()
            }
            sqlx::Error::PoolTimedOut => {
                "Timed out waiting for a database connection from the pool.".to_string()
            }
            sqlx::Error::PoolClosed => "Database pool has been closed.".to_string(),
            sqlx::Error::Configuration(_) => {
                "Database connection failed due to configuration error. Please check connection parameters.".to_string()
            }
            _ => format!("Database connection failed: {}", Self::sanitize_database_error(source)),
        }
    }

    /// Extract MySQL error code from sqlx error if available
    pub(crate) fn extract_mysql_error_code(source: &sqlx::Error) -> Option<String> {
        if let sqlx::Error::Database(db_err) = source {
            if let Some(mysql_err) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
                return Some(mysql_err.number().to_string());
            }
            if let Some(code) = db_err.code() {
                return Some(code.into_owned());
            }
        }

        // Fallback for errors that only carry the code in their text: "ERROR 1045 (28000): ..."
        let error_str = source.to_string();
        if let Some(start) = error_str.find("ERROR ") {
            if let Some(end) = error_str[start + 6..].find(' ') {
                return Some(error_str[start + 6..start + 6 + end].to_string());
            }
        }

        None
    }

    /// Sanitize database error messages to remove sensitive information
    fn sanitize_database_error(source: &sqlx::Error) -> String {
        let sanitized = source
            .to_string()
            .replace("password=", "password=[REDACTED]")
            .replace("pwd=", "pwd=[REDACTED]");

        truncate(sanitized, 500)
    }
}

fn truncate(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max.saturating_sub(3);
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Query { source, .. } => Some(source),
            PoolError::Database { source, .. } => Some(source),
            PoolError::Serialization { source, .. } => Some(source),
            PoolError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for PoolError {
    fn from(err: sqlx::Error) -> Self {
        let recoverable = matches!(
            err,
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
        );

        PoolError::database_error(err, recoverable)
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        PoolError::serialization_error(err, "unknown context")
    }
}

impl From<std::io::Error> for PoolError {
    fn from(err: std::io::Error) -> Self {
        PoolError::io_error(err, "unknown context")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_timeout_is_distinct_and_retryable() {
        let err = PoolError::acquire_timeout("staging", 500);
        assert!(matches!(err, PoolError::AcquireTimeout { .. }));
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert!(err.is_retryable());
        assert!(err.user_message().contains("staging"));
    }

    #[test]
    fn test_authentication_is_not_retryable() {
        let err = PoolError::authentication_error("prod", "password rejected");
        assert_eq!(err.category(), ErrorCategory::Authentication);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_pool_timed_out_maps_to_timeout_category() {
        let err: PoolError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_remote_error_truncates_stderr() {
        let err = PoolError::remote_error("cat /nope", Some(1), "x".repeat(2_000));
        match err {
            PoolError::Remote { stderr, exit_code, .. } => {
                assert_eq!(stderr.len(), 500);
                assert!(stderr.ends_with("..."));
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: PoolError = io.into();
        assert_eq!(err.category(), ErrorCategory::Transport);
        assert!(std::error::Error::source(&err).is_some());
    }
}
