//! Bootstrap configuration read from the environment.
//!
//! Operational settings that admins change at runtime (mode, model, access
//! lists, quotas) live in the database instead; see `agent::settings`.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Persona preamble sent on the first turn of every conversation.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant in the guise of a wise frog. Put your responses in html tags.";

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Secret every command payload must carry in its `password` field.
    pub admin_password: SecretString,
    /// API key for the chat provider.
    pub api_key: SecretString,
    /// Base URL of the chat provider API.
    pub api_base_url: String,
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// System preamble for new conversations.
    pub system_prompt: String,
    /// Maximum number of open conversations kept in memory.
    pub session_capacity: usize,
    /// Conversations idle for longer than this are forgotten.
    pub session_idle_timeout: Duration,
}

impl AgentConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let admin_password = required_env("MAIL_AGENT_ADMIN_PASSWORD")?;
        let api_key = required_env("OPENAI_API_KEY")?;

        let api_base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let db_path = std::env::var("MAIL_AGENT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/mail-agent.db"));

        let system_prompt = std::env::var("MAIL_AGENT_SYSTEM_PROMPT")
            .unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string());

        let session_capacity = parse_env("MAIL_AGENT_SESSION_CAPACITY", 1000)?;
        if session_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAIL_AGENT_SESSION_CAPACITY".into(),
                message: "must be at least 1".into(),
            });
        }
        let ttl_secs: u64 = parse_env("MAIL_AGENT_SESSION_TTL_SECS", 86_400)?;

        Ok(Self {
            admin_password: SecretString::from(admin_password),
            api_key: SecretString::from(api_key),
            api_base_url,
            db_path,
            system_prompt,
            session_capacity,
            session_idle_timeout: Duration::from_secs(ttl_secs),
        })
    }
}

fn required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_uses_default_when_unset() {
        let value: u64 = parse_env("MAIL_AGENT_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn parse_env_rejects_garbage() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("MAIL_AGENT_TEST_GARBAGE", "lots") };
        let result: Result<u64, _> = parse_env("MAIL_AGENT_TEST_GARBAGE", 1);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn required_env_treats_empty_as_missing() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("MAIL_AGENT_TEST_EMPTY", "") };
        let result = required_env("MAIL_AGENT_TEST_EMPTY");
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(_))));
    }
}
