//! Mail transport abstraction.

pub mod cli;
pub mod email;
pub mod email_types;

pub use cli::StdinTransport;
pub use email::{EmailConfig, EmailTransport};

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use uuid::Uuid;

use crate::error::ChannelError;

/// Stream of inbound messages produced by a transport.
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

/// A normalized inbound mail message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Local id for logs.
    pub id: Uuid,
    /// Transport that produced the message.
    pub channel: String,
    /// Sender address.
    pub sender: String,
    /// Sender display name, empty when absent.
    pub sender_name: String,
    /// `Message-ID` without angle brackets.
    pub message_id: String,
    /// Conversation identity: first `References` entry, else `message_id`.
    pub thread_id: String,
    pub subject: String,
    /// Visible body with quoted replies removed.
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// A message that starts its own thread.
    pub fn new(
        channel: &str,
        sender: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let id = Uuid::new_v4();
        let message_id = format!("{id}@{channel}");
        Self {
            id,
            channel: channel.to_string(),
            sender: sender.into(),
            sender_name: String::new(),
            thread_id: message_id.clone(),
            message_id,
            subject: subject.into(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = name.into();
        self
    }

    /// Place the message in an existing thread.
    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }
}

/// Reply body and its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingReply {
    pub body: String,
    pub is_html: bool,
}

impl OutgoingReply {
    pub fn plain(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            is_html: false,
        }
    }

    pub fn html(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            is_html: true,
        }
    }
}

/// A mailbox the agent reads from and replies through.
#[async_trait]
pub trait MailTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Verify connectivity and start delivering inbound messages.
    async fn connect(&self) -> Result<InboundStream, ChannelError>;

    /// Reply to `original` in its thread. Returns whether the server
    /// accepted the message.
    async fn send_reply(
        &self,
        original: &InboundMessage,
        reply: OutgoingReply,
    ) -> Result<bool, ChannelError>;
}
