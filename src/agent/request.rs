//! Request classification — turns an inbound message into a typed request.
//!
//! A message whose subject (after reply prefixes) starts with `command` is
//! an admin command whose body is a flat YAML mapping:
//!
//! ```yaml
//! password: <admin password>
//! command: set-config
//! mode: disabled
//! ```
//!
//! Everything else is a chat query. Classification never fails: a bad
//! command payload becomes `CommandRequest::Malformed` and is answered later.

use std::fmt;

use secrecy::SecretString;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_yaml::Value;

use crate::error::CommandParseError;

/// Subject marker that turns a message into a command.
pub const COMMAND_MARKER: &str = "command";

/// A classified inbound message.
#[derive(Debug)]
pub enum AgentRequest {
    Command(CommandRequest),
    Chat(ChatRequest),
}

/// Free-text query for the chat provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub query: String,
}

/// Admin command names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandName {
    Help,
    Info,
    SetConfig,
    SetUserConfig,
}

impl CommandName {
    pub const ALL: [Self; 4] = [Self::Help, Self::Info, Self::SetConfig, Self::SetUserConfig];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::Info => "info",
            Self::SetConfig => "set-config",
            Self::SetUserConfig => "set-user-config",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == raw)
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command payload, either dispatchable or rejected at parse time.
#[derive(Debug)]
pub enum CommandRequest {
    Malformed(CommandParseError),
    Parsed {
        password: SecretString,
        command: CommandName,
        fields: CommandFields,
    },
}

/// Command-specific fields in payload order, keys unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandFields(Vec<(String, Value)>);

impl CommandFields {
    /// Insert a field; a repeated key replaces the earlier value in place.
    pub fn insert(&mut self, key: String, value: Value) {
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Classify a message by subject and visible body.
pub fn classify(subject: &str, body: &str) -> AgentRequest {
    let subject = strip_reply_prefixes(subject);
    let is_command = subject
        .get(..COMMAND_MARKER.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(COMMAND_MARKER));

    if is_command {
        AgentRequest::Command(parse_command(body))
    } else {
        AgentRequest::Chat(ChatRequest {
            query: body.to_string(),
        })
    }
}

/// Remove leading `Re:` markers (any case, repeated) from a subject.
pub fn strip_reply_prefixes(subject: &str) -> &str {
    let mut rest = subject.trim_start();
    while let Some(head) = rest.get(..3)
        && head.eq_ignore_ascii_case("re:")
    {
        rest = rest[3..].trim_start();
    }
    rest
}

/// Parse a command body into a `CommandRequest`.
pub fn parse_command(body: &str) -> CommandRequest {
    match try_parse_command(body) {
        Ok(request) => request,
        Err(e) => CommandRequest::Malformed(e),
    }
}

fn try_parse_command(body: &str) -> Result<CommandRequest, CommandParseError> {
    let document: FlatDocument =
        serde_yaml::from_str(body).map_err(|e| CommandParseError::Syntax(e.to_string()))?;
    let FlatDocument::Mapping(mut fields) = document else {
        return Err(CommandParseError::NotKeyValue);
    };

    let password = fields
        .remove("password")
        .as_ref()
        .and_then(scalar)
        .filter(|p| !p.is_empty())
        .ok_or(CommandParseError::MissingPassword)?;

    let command = fields
        .remove("command")
        .as_ref()
        .and_then(scalar)
        .filter(|c| !c.is_empty())
        .ok_or(CommandParseError::MissingCommand)?;
    let command =
        CommandName::parse(&command).ok_or(CommandParseError::UnknownCommand(command))?;

    Ok(CommandRequest::Parsed {
        password: SecretString::from(password),
        command,
        fields,
    })
}

/// Text of a scalar value; sequences and mappings have none.
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Tagged(tagged) => scalar(&tagged.value),
        Value::Null | Value::Sequence(_) | Value::Mapping(_) => None,
    }
}

/// Render a payload value the way it is echoed back in replies.
///
/// Scalars print bare, sequences are comma-joined.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Sequence(items) => items.iter().map(render_value).collect::<Vec<_>>().join(","),
        Value::Mapping(_) => serde_yaml::to_string(value)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
        Value::Tagged(tagged) => render_value(&tagged.value),
    }
}

// ── Flat YAML document ──────────────────────────────────────────────

/// Top level of a command payload.
///
/// Deserialized by hand so duplicate keys overwrite instead of failing,
/// and so a non-mapping document is distinguishable from bad syntax.
enum FlatDocument {
    Mapping(CommandFields),
    Other,
}

impl<'de> Deserialize<'de> for FlatDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(FlatDocumentVisitor)
    }
}

struct FlatDocumentVisitor;

impl<'de> Visitor<'de> for FlatDocumentVisitor {
    type Value = FlatDocument;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a key: value mapping")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut fields = CommandFields::default();
        while let Some((key, value)) = map.next_entry::<Value, Value>()? {
            let key = match key {
                Value::String(s) => s,
                other => render_value(&other),
            };
            fields.insert(key, value);
        }
        Ok(FlatDocument::Mapping(fields))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        while seq.next_element::<de::IgnoredAny>()?.is_some() {}
        Ok(FlatDocument::Other)
    }

    fn visit_str<E: de::Error>(self, _: &str) -> Result<Self::Value, E> {
        Ok(FlatDocument::Other)
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<Self::Value, E> {
        Ok(FlatDocument::Other)
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<Self::Value, E> {
        Ok(FlatDocument::Other)
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> Result<Self::Value, E> {
        Ok(FlatDocument::Other)
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> Result<Self::Value, E> {
        Ok(FlatDocument::Other)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(FlatDocument::Other)
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(FlatDocument::Other)
    }
}
