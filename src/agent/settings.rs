//! Operational settings (the Config Store).
//!
//! `Config` is the runtime configuration admins change through
//! `set-config`. Every settable field is listed in a lookup table that maps
//! its wire name to a typed validator; validated values are applied through
//! `Config::apply`. The live copy sits behind a [`ConfigHandle`], which
//! persists a YAML snapshot on every mutation.

use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tokio::sync::RwLock;
use tracing::info;

use crate::agent::request::render_value;
use crate::error::{ConfigError, Error, FieldError};
use crate::store::{Database, UserRecord};

/// List entry that expands to the list's current contents.
pub const LIST_CONTINUATION: &str = "...";

/// Default token budget for users seen for the first time.
pub const DEFAULT_TOKENS_LIMIT: u64 = 250_000;

static ADDRESS_OR_DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([^\s@]+)?@[^\s@]+\.[^\s@]+$").expect("address pattern is valid")
});

// ── Enumerated values ───────────────────────────────────────────────

/// Whether chat requests are served at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    Enabled,
    Disabled,
}

impl ServiceMode {
    pub const ALL: [Self; 2] = [Self::Enabled, Self::Disabled];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

/// Chat models the agent may be switched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatModel {
    #[serde(rename = "gpt-4.1")]
    Gpt41,
    #[serde(rename = "gpt-3.5-turbo")]
    Gpt35Turbo,
}

impl ChatModel {
    pub const ALL: [Self; 2] = [Self::Gpt41, Self::Gpt35Turbo];

    /// Identifier sent to the chat provider.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gpt41 => "gpt-4.1",
            Self::Gpt35Turbo => "gpt-3.5-turbo",
        }
    }
}

/// Join the allowed values of an enumerated field for help and error text.
fn options<T: Copy>(all: &[T], as_str: fn(T) -> &'static str) -> String {
    all.iter().map(|v| as_str(*v)).collect::<Vec<_>>().join(", ")
}

fn pick<T: Copy>(all: &[T], as_str: fn(T) -> &'static str, raw: &Value) -> Result<T, String> {
    let wanted = render_value(raw);
    all.iter()
        .copied()
        .find(|v| as_str(*v) == wanted)
        .ok_or_else(|| format!("Options are {}", options(all, as_str)))
}

// ── Config ──────────────────────────────────────────────────────────

/// Runtime operational settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: ServiceMode,
    pub model: ChatModel,
    /// Addresses or `@domain` suffixes that are always refused.
    pub deny_list: Vec<String>,
    /// Addresses or `@domain` suffixes that may chat.
    pub allow_list: Vec<String>,
    /// Token limit given to users on their first chat request.
    pub default_tokens_limit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ServiceMode::Enabled,
            model: ChatModel::Gpt41,
            deny_list: Vec::new(),
            allow_list: Vec::new(),
            default_tokens_limit: DEFAULT_TOKENS_LIMIT,
        }
    }
}

impl Config {
    /// Serialize to the YAML snapshot stored in the database.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse a stored YAML snapshot. Missing fields take their defaults.
    pub fn from_yaml(snapshot: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(snapshot).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate a raw payload value for `field` against the current state.
    ///
    /// Nothing is changed; pass the result to [`Config::apply`].
    pub fn validate(&self, field: ConfigField, raw: &Value) -> Result<ConfigValue, FieldError> {
        (field.def().validate)(self, raw).map_err(|reason| FieldError::Rejected {
            key: field.name().to_string(),
            value: render_value(raw),
            reason,
        })
    }

    /// Store a validated value.
    pub fn apply(&mut self, value: ConfigValue) {
        match value {
            ConfigValue::Mode(mode) => self.mode = mode,
            ConfigValue::Model(model) => self.model = model,
            ConfigValue::DenyList(list) => self.deny_list = list,
            ConfigValue::AllowList(list) => self.allow_list = list,
            ConfigValue::DefaultTokensLimit(limit) => self.default_tokens_limit = limit,
        }
    }

    /// Human-readable current value of a field.
    pub fn display_field(&self, field: ConfigField) -> String {
        match field {
            ConfigField::Mode => self.mode.as_str().to_string(),
            ConfigField::Model => self.model.as_str().to_string(),
            ConfigField::DenyList => self.deny_list.join(","),
            ConfigField::AllowList => self.allow_list.join(","),
            ConfigField::DefaultTokensLimit => self.default_tokens_limit.to_string(),
        }
    }
}

// ── Settable fields ─────────────────────────────────────────────────

/// A settable `Config` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    Mode,
    Model,
    DenyList,
    AllowList,
    DefaultTokensLimit,
}

/// A validated value for one `Config` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Mode(ServiceMode),
    Model(ChatModel),
    DenyList(Vec<String>),
    AllowList(Vec<String>),
    DefaultTokensLimit(u64),
}

struct FieldDef {
    field: ConfigField,
    name: &'static str,
    validate: fn(&Config, &Value) -> Result<ConfigValue, String>,
}

static CONFIG_FIELDS: &[FieldDef] = &[
    FieldDef {
        field: ConfigField::Mode,
        name: "mode",
        validate: validate_mode,
    },
    FieldDef {
        field: ConfigField::Model,
        name: "model",
        validate: validate_model,
    },
    FieldDef {
        field: ConfigField::DenyList,
        name: "deny_list",
        validate: validate_deny_list,
    },
    FieldDef {
        field: ConfigField::AllowList,
        name: "allow_list",
        validate: validate_allow_list,
    },
    FieldDef {
        field: ConfigField::DefaultTokensLimit,
        name: "default_tokens_limit",
        validate: validate_default_tokens_limit,
    },
];

fn validate_mode(_: &Config, raw: &Value) -> Result<ConfigValue, String> {
    pick(&ServiceMode::ALL, ServiceMode::as_str, raw).map(ConfigValue::Mode)
}

fn validate_model(_: &Config, raw: &Value) -> Result<ConfigValue, String> {
    pick(&ChatModel::ALL, ChatModel::as_str, raw).map(ConfigValue::Model)
}

fn validate_deny_list(config: &Config, raw: &Value) -> Result<ConfigValue, String> {
    address_list(&config.deny_list, raw).map(ConfigValue::DenyList)
}

fn validate_allow_list(config: &Config, raw: &Value) -> Result<ConfigValue, String> {
    address_list(&config.allow_list, raw).map(ConfigValue::AllowList)
}

fn validate_default_tokens_limit(_: &Config, raw: &Value) -> Result<ConfigValue, String> {
    non_negative_integer(raw).map(ConfigValue::DefaultTokensLimit)
}

impl ConfigField {
    /// Find a field by its payload name.
    pub fn lookup(name: &str) -> Option<Self> {
        CONFIG_FIELDS.iter().find(|s| s.name == name).map(|s| s.field)
    }

    /// Payload name of the field.
    pub fn name(self) -> &'static str {
        self.def().name
    }

    pub fn all() -> impl Iterator<Item = Self> {
        CONFIG_FIELDS.iter().map(|s| s.field)
    }

    fn def(self) -> &'static FieldDef {
        // Table rows are in declaration order.
        &CONFIG_FIELDS[self as usize]
    }
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl ConfigField {
    /// Accepted values, for the help text.
    pub fn describe(self) -> String {
        match self {
            Self::Mode => options(&ServiceMode::ALL, ServiceMode::as_str),
            Self::Model => options(&ChatModel::ALL, ChatModel::as_str),
            Self::DenyList | Self::AllowList => {
                format!("list of emails or @domains, \"{LIST_CONTINUATION}\" keeps current entries")
            }
            Self::DefaultTokensLimit => "non-negative integer".to_string(),
        }
    }
}

/// Validate an address list. Any bad element rejects the whole list.
fn address_list(current: &[String], raw: &Value) -> Result<Vec<String>, String> {
    let Value::Sequence(items) = raw else {
        return Err("Must be array value".to_string());
    };

    let mut list: Vec<String> = Vec::new();
    let mut push = |entry: &str| {
        if !list.iter().any(|e| e.eq_ignore_ascii_case(entry)) {
            list.push(entry.to_string());
        }
    };

    for item in items {
        let Value::String(entry) = item else {
            return Err(format!("Array item \"{}\" must be string", render_value(item)));
        };
        let entry = entry.trim();
        if entry == LIST_CONTINUATION {
            current.iter().for_each(|e| push(e));
        } else if ADDRESS_OR_DOMAIN.is_match(entry) {
            push(entry);
        } else {
            return Err(format!(
                "Array item \"{entry}\" must be an email or email domain"
            ));
        }
    }
    Ok(list)
}

/// Accept integers and numeric strings that fit in a `u64`.
pub(crate) fn non_negative_integer(raw: &Value) -> Result<u64, String> {
    let parsed = match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| "Must be a non-negative integer".to_string())
}

// ── User config fields ──────────────────────────────────────────────

/// A settable per-user field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserField {
    TokensLimit,
}

/// A validated value for one user field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserValue {
    TokensLimit(u64),
}

struct UserFieldDef {
    field: UserField,
    name: &'static str,
    validate: fn(&Value) -> Result<UserValue, String>,
}

static USER_FIELDS: &[UserFieldDef] = &[UserFieldDef {
    field: UserField::TokensLimit,
    name: "tokens_limit",
    validate: validate_tokens_limit,
}];

fn validate_tokens_limit(raw: &Value) -> Result<UserValue, String> {
    non_negative_integer(raw).map(UserValue::TokensLimit)
}

impl UserField {
    pub fn lookup(name: &str) -> Option<Self> {
        USER_FIELDS.iter().find(|s| s.name == name).map(|s| s.field)
    }

    pub fn name(self) -> &'static str {
        self.def().name
    }

    pub fn all() -> impl Iterator<Item = Self> {
        USER_FIELDS.iter().map(|s| s.field)
    }

    pub fn describe(self) -> String {
        match self {
            Self::TokensLimit => "non-negative integer".to_string(),
        }
    }

    pub fn validate(self, raw: &Value) -> Result<UserValue, FieldError> {
        (self.def().validate)(raw).map_err(|reason| FieldError::Rejected {
            key: self.name().to_string(),
            value: render_value(raw),
            reason,
        })
    }

    /// Current value of the field on a stored user.
    pub fn display(self, user: &UserRecord) -> String {
        match self {
            Self::TokensLimit => user.tokens_limit.to_string(),
        }
    }

    fn def(self) -> &'static UserFieldDef {
        &USER_FIELDS[self as usize]
    }
}

impl fmt::Display for UserField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validated user-field changes, written to the store in one go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserConfigUpdate {
    pub tokens_limit: Option<u64>,
}

impl UserConfigUpdate {
    pub fn apply(&mut self, value: UserValue) {
        match value {
            UserValue::TokensLimit(limit) => self.tokens_limit = Some(limit),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens_limit.is_none()
    }

    /// Display form of the pending value for `field`, if set.
    pub fn display(&self, field: UserField) -> Option<String> {
        match field {
            UserField::TokensLimit => self.tokens_limit.map(|l| l.to_string()),
        }
    }
}

// ── Handle ──────────────────────────────────────────────────────────

/// Shared handle to the live `Config`.
///
/// Reads clone a snapshot under the read lock. Updates run under the write
/// lock on a copy, persist it, and only then replace the live value, so
/// readers see either the old or the new config and a failed write leaves
/// the live value untouched.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Config>>,
    store: Arc<dyn Database>,
}

impl ConfigHandle {
    /// Load the stored snapshot, or seed the store with defaults.
    pub async fn load(store: Arc<dyn Database>) -> Result<Self, Error> {
        let config = match store.load_config_snapshot().await? {
            Some(snapshot) => {
                let config = Config::from_yaml(&snapshot)?;
                info!(mode = config.mode.as_str(), model = config.model.as_str(), "Loaded config from database");
                config
            }
            None => {
                let config = Config::default();
                store.save_config_snapshot(&config.to_yaml()?).await?;
                info!("No stored config, saved defaults");
                config
            }
        };

        Ok(Self {
            inner: Arc::new(RwLock::new(config)),
            store,
        })
    }

    /// A copy of the current config.
    pub async fn snapshot(&self) -> Config {
        self.inner.read().await.clone()
    }

    /// Mutate the config and persist it once.
    ///
    /// `mutate` works on a copy; the copy becomes live only after the
    /// snapshot has been saved.
    pub async fn update<T>(&self, mutate: impl FnOnce(&mut Config) -> T) -> Result<T, Error> {
        let mut live = self.inner.write().await;
        let mut next = live.clone();
        let out = mutate(&mut next);
        self.store.save_config_snapshot(&next.to_yaml()?).await?;
        *live = next;
        Ok(out)
    }
}
