//! Error types for the mail agent.

use std::time::Duration;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mail transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },
}

/// Chat provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a command payload could not be turned into a dispatchable command.
///
/// The `Display` text is sent back to the sender verbatim, followed by the
/// help text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandParseError {
    #[error("Invalid command syntax: {0}")]
    Syntax(String),

    #[error("Command input not in key: value format")]
    NotKeyValue,

    #[error("Password required")]
    MissingPassword,

    #[error("Command required")]
    MissingCommand,

    #[error("Invalid command \"{0}\"")]
    UnknownCommand(String),
}

/// A single rejected field in `set-config` or `set-user-config`.
///
/// Field errors never abort the command; each one becomes a line of the
/// reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("Invalid config key \"{0}\"")]
    UnknownConfigKey(String),

    #[error("Invalid user config key \"{0}\"")]
    UnknownUserKey(String),

    #[error("Cannot set {key} to \"{value}\"\n{reason}")]
    Rejected {
        key: String,
        value: String,
        reason: String,
    },
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_field_renders_key_value_and_reason() {
        let err = FieldError::Rejected {
            key: "mode".into(),
            value: "sleepy".into(),
            reason: "Options are enabled, disabled".into(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot set mode to \"sleepy\"\nOptions are enabled, disabled"
        );
    }

    #[test]
    fn database_error_converts_into_top_level() {
        let err: Error = DatabaseError::Query("boom".into()).into();
        assert_eq!(err.to_string(), "Database error: Query failed: boom");
    }
}
