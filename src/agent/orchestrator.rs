//! Per-message decision sequence and the run loop.
//!
//! Every inbound message gets exactly one reply:
//!
//! 1. commands are executed regardless of mode or access lists
//! 2. chat is refused when the service is disabled
//! 3. then when the sender is not permitted
//! 4. then when the sender's token budget is spent
//! 5. otherwise the conversation continues and usage is recorded

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::agent::access::permitted;
use crate::agent::command::CommandExecutor;
use crate::agent::ledger::TokenLedger;
use crate::agent::request::{AgentRequest, classify};
use crate::agent::sessions::SessionRegistry;
use crate::agent::settings::{ConfigHandle, ServiceMode};
use crate::channels::{InboundMessage, MailTransport, OutgoingReply};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::llm::ChatProvider;
use crate::store::Database;

pub const DISABLED_NOTICE: &str = "This service has been disabled";
pub const ACCESS_DENIED_NOTICE: &str = "You do not have access to this service";
pub const OVER_LIMIT_NOTICE: &str =
    "You have reached your limit for token usage. Please contact the admin to reactivate.";

/// Which branch handled a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Command,
    Disabled,
    Denied,
    OverLimit,
    Answered { tokens: u64 },
}

pub struct Orchestrator {
    config: ConfigHandle,
    ledger: TokenLedger,
    sessions: SessionRegistry,
    commands: CommandExecutor,
}

impl Orchestrator {
    pub fn new(
        settings: &AgentConfig,
        store: Arc<dyn Database>,
        config: ConfigHandle,
        provider: Arc<dyn ChatProvider>,
    ) -> Self {
        let ledger = TokenLedger::new(store, config.clone());
        let sessions = SessionRegistry::new(
            provider,
            config.clone(),
            settings.system_prompt.clone(),
            settings.session_capacity,
            settings.session_idle_timeout,
        );
        let commands = CommandExecutor::new(
            settings.admin_password.clone(),
            config.clone(),
            ledger.clone(),
        );
        Self {
            config,
            ledger,
            sessions,
            commands,
        }
    }

    /// Handle one message and send its reply.
    pub async fn handle(&self, transport: &dyn MailTransport, msg: &InboundMessage) -> Result<Outcome> {
        let chat = match classify(&msg.subject, &msg.body) {
            AgentRequest::Command(request) => {
                let reply = self.commands.execute(&request).await?;
                send(transport, msg, OutgoingReply::plain(reply)).await?;
                info!(sender = %msg.sender, "Handled command");
                return Ok(Outcome::Command);
            }
            AgentRequest::Chat(chat) => chat,
        };

        let config = self.config.snapshot().await;
        if config.mode == ServiceMode::Disabled {
            send(transport, msg, OutgoingReply::plain(DISABLED_NOTICE)).await?;
            info!(sender = %msg.sender, "Denied request while disabled");
            return Ok(Outcome::Disabled);
        }

        if !permitted(&msg.sender, &config) {
            send(transport, msg, OutgoingReply::plain(ACCESS_DENIED_NOTICE)).await?;
            info!(sender = %msg.sender, "Denied request from sender without access");
            return Ok(Outcome::Denied);
        }

        if !self.ledger.within_limit(&msg.sender).await? {
            send(transport, msg, OutgoingReply::plain(OVER_LIMIT_NOTICE)).await?;
            info!(sender = %msg.sender, "Denied chat request over token limit");
            return Ok(Outcome::OverLimit);
        }

        let turn = self
            .sessions
            .continue_conversation(&msg.thread_id, &chat.query)
            .await?;
        let answer = strip_markup_fence(&turn.text);
        self.ledger
            .record(&msg.sender, &msg.sender_name, turn.tokens)
            .await?;
        send(transport, msg, OutgoingReply::html(answer)).await?;
        info!(sender = %msg.sender, tokens = turn.tokens, "Handled chat request");
        Ok(Outcome::Answered { tokens: turn.tokens })
    }

    /// Connect the transport and handle messages until its stream ends.
    ///
    /// Each message runs on its own task; a failure only affects that
    /// message. Returns once every handler has finished.
    pub async fn run(self: Arc<Self>, transport: Arc<dyn MailTransport>) -> Result<()> {
        let mut inbound = transport.connect().await?;
        info!(transport = transport.name(), "Agent running");

        let mut handlers = JoinSet::new();
        while let Some(msg) = inbound.next().await {
            let agent = Arc::clone(&self);
            let transport = Arc::clone(&transport);
            handlers.spawn(async move {
                if let Err(e) = agent.handle(transport.as_ref(), &msg).await {
                    error!(sender = %msg.sender, id = %msg.id, "Failed to handle message: {e}");
                }
            });
            // Reap finished handlers so the set stays small on long runs.
            while let Some(joined) = handlers.try_join_next() {
                log_join(joined);
            }
        }

        info!(pending = handlers.len(), "Inbound stream closed");
        while let Some(joined) = handlers.join_next().await {
            log_join(joined);
        }
        Ok(())
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        error!("Message handler failed: {e}");
    }
}

async fn send(transport: &dyn MailTransport, msg: &InboundMessage, reply: OutgoingReply) -> Result<()> {
    if !transport.send_reply(msg, reply).await? {
        warn!(sender = %msg.sender, "Reply was not accepted by the mail server");
    }
    Ok(())
}

/// Remove a ```` ```html ```` fence around a model answer, if present.
///
/// Text without the opening fence is returned unchanged.
pub fn strip_markup_fence(text: &str) -> String {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```html") else {
        return text.to_string();
    };
    inner.strip_suffix("```").unwrap_or(inner).trim().to_string()
}
