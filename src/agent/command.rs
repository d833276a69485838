//! Admin command execution.
//!
//! ```text
//! Received ─┬─ Malformed ─────────────▶ error + help
//!           ├─ bad password ──────────▶ "Failed to authenticate"
//!           └─ Dispatched ─┬─ help
//!                          ├─ info
//!                          ├─ set-config
//!                          └─ set-user-config
//! ```
//!
//! Field updates report one line per field. A bad field never stops the
//! others; the changed state is persisted once at the end.

use std::fmt::Write as _;
use std::sync::LazyLock;

use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::agent::ledger::TokenLedger;
use crate::agent::request::{
    COMMAND_MARKER, CommandFields, CommandName, CommandRequest, render_value,
};
use crate::agent::settings::{ConfigField, ConfigHandle, UserConfigUpdate, UserField};
use crate::error::{Error, FieldError};
use crate::store::{UserRecord, UserTarget};

pub const AUTH_FAILED: &str = "Failed to authenticate";

/// Payload key naming the target of `set-user-config`.
const USER_KEY: &str = "user";

static HELP_TEXT: LazyLock<String> = LazyLock::new(build_help);

/// Static usage text, generated from the field tables.
pub fn help_text() -> &'static str {
    &HELP_TEXT
}

fn build_help() -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Send a message with subject \"{COMMAND_MARKER}\" and a YAML body:\n"
    );
    out.push_str("password: <admin password>\ncommand: <command>\n<field>: <value>\n\n");

    out.push_str("Commands:\n");
    for command in CommandName::ALL {
        let about = match command {
            CommandName::Help => "show this message",
            CommandName::Info => "show the config and per-user usage",
            CommandName::SetConfig => "set one or more config fields",
            CommandName::SetUserConfig => {
                "set fields for the user in \"user\" (\"*\" for all existing users)"
            }
        };
        let _ = writeln!(out, "  {:<16} {about}", command.as_str());
    }

    out.push_str("\nConfig fields:\n");
    for field in ConfigField::all() {
        let _ = writeln!(out, "  {:<21} {}", field.name(), field.describe());
    }

    out.push_str("\nUser config fields:\n");
    for field in UserField::all() {
        let _ = writeln!(out, "  {:<21} {}", field.name(), field.describe());
    }
    out
}

/// Runs admin commands against the config and the ledger.
pub struct CommandExecutor {
    admin_password: SecretString,
    config: ConfigHandle,
    ledger: TokenLedger,
}

impl CommandExecutor {
    pub fn new(admin_password: SecretString, config: ConfigHandle, ledger: TokenLedger) -> Self {
        Self {
            admin_password,
            config,
            ledger,
        }
    }

    /// Run a command and produce the reply text.
    ///
    /// Parse, auth and field problems are part of the reply. Only store
    /// failures come back as errors.
    pub async fn execute(&self, request: &CommandRequest) -> Result<String, Error> {
        let (password, command, fields) = match request {
            CommandRequest::Malformed(e) => {
                info!(error = %e, "Rejected malformed command");
                return Ok(format!("{e}\n\n{}", help_text()));
            }
            CommandRequest::Parsed {
                password,
                command,
                fields,
            } => (password, *command, fields),
        };

        if password.expose_secret() != self.admin_password.expose_secret() {
            warn!(%command, "Command failed authentication");
            return Ok(AUTH_FAILED.to_string());
        }

        info!(%command, fields = fields.len(), "Running command");
        match command {
            CommandName::Help => Ok(help_text().to_string()),
            CommandName::Info => self.info().await,
            CommandName::SetConfig => self.set_config(fields).await,
            CommandName::SetUserConfig => self.set_user_config(fields).await,
        }
    }

    async fn info(&self) -> Result<String, Error> {
        let yaml = self.config.snapshot().await.to_yaml()?;
        let users = self.ledger.users().await?;
        Ok(format!("{yaml}\n{}", render_user_table(&users)))
    }

    /// Validate and apply each field under the config write lock, then
    /// persist once.
    async fn set_config(&self, fields: &CommandFields) -> Result<String, Error> {
        let lines = self
            .config
            .update(|config| {
                let mut lines = Vec::with_capacity(fields.len());
                for (key, raw) in fields.iter() {
                    let Some(field) = ConfigField::lookup(key) else {
                        lines.push(FieldError::UnknownConfigKey(key.to_string()).to_string());
                        continue;
                    };
                    match config.validate(field, raw) {
                        Ok(value) => {
                            let before = config.display_field(field);
                            config.apply(value);
                            let after = config.display_field(field);
                            lines.push(format!("Changed {field} from \"{before}\" to \"{after}\""));
                        }
                        Err(e) => lines.push(e.to_string()),
                    }
                }
                lines
            })
            .await?;

        if lines.is_empty() {
            return Ok("No config fields given".to_string());
        }
        Ok(lines.join("\n"))
    }

    async fn set_user_config(&self, fields: &CommandFields) -> Result<String, Error> {
        let Some(raw_user) = fields.get(USER_KEY) else {
            return Ok(format!("set-user-config must have {USER_KEY} field"));
        };
        let target = UserTarget::parse(&render_value(raw_user));

        let current: Option<UserRecord> = match &target {
            UserTarget::One(email) => match self.ledger.user(email).await? {
                Some(user) => Some(user),
                None => return Ok(format!("No user \"{email}\"")),
            },
            UserTarget::All => None,
        };

        let mut update = UserConfigUpdate::default();
        let mut lines = Vec::new();
        for (key, raw) in fields.iter().filter(|(k, _)| *k != USER_KEY) {
            let Some(field) = UserField::lookup(key) else {
                lines.push(FieldError::UnknownUserKey(key.to_string()).to_string());
                continue;
            };
            match field.validate(raw) {
                Ok(value) => {
                    update.apply(value);
                    let after = update.display(field).unwrap_or_default();
                    match &current {
                        Some(user) => lines.push(format!(
                            "Changed {field} from \"{}\" to \"{after}\"",
                            field.display(user)
                        )),
                        None => lines.push(format!("Changed {field} to \"{after}\"")),
                    }
                }
                Err(e) => lines.push(e.to_string()),
            }
        }

        if let Some(limit) = update.tokens_limit {
            let changed = self.ledger.set_limit(&target, limit).await?;
            info!(user = %target, limit, changed, "Updated user token limit");
            if target == UserTarget::All {
                lines.push(format!("Updated {changed} users"));
            }
        }

        if lines.is_empty() {
            return Ok("No user config fields given".to_string());
        }
        Ok(lines.join("\n"))
    }
}

// ── User table ──────────────────────────────────────────────────────

const USER_TABLE_TITLE: &str = "User Data";
const USER_TABLE_HEADERS: [&str; 5] = ["Email", "Name", "Chat Requests", "Tokens Used", "Tokens Limit"];

/// ASCII table of user records, header row always present.
pub fn render_user_table(users: &[UserRecord]) -> String {
    let rows: Vec<[String; 5]> = users
        .iter()
        .map(|u| {
            [
                u.email.clone(),
                u.name.clone(),
                u.chat_requests.to_string(),
                u.tokens_used.to_string(),
                u.tokens_limit.to_string(),
            ]
        })
        .collect();

    let mut widths = USER_TABLE_HEADERS.map(|h| h.chars().count());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let rule = {
        let mut line = String::from("+");
        for w in &widths {
            line.push_str(&"-".repeat(w + 2));
            line.push('+');
        }
        line
    };
    let render_row = |cells: &[&str]| {
        let mut line = String::from("|");
        for (cell, w) in cells.iter().zip(&widths) {
            let pad = w - cell.chars().count();
            let _ = write!(line, " {cell}{} |", " ".repeat(pad));
        }
        line
    };

    let mut out = String::new();
    let _ = writeln!(out, "{USER_TABLE_TITLE}");
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "{}", render_row(&USER_TABLE_HEADERS[..]));
    let _ = writeln!(out, "{rule}");
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        let _ = writeln!(out, "{}", render_row(&cells));
    }
    if !rows.is_empty() {
        let _ = writeln!(out, "{rule}");
    }
    out
}
