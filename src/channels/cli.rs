//! Stdin transport for exercising admin commands locally.
//!
//! Lines accumulate until an empty line; the block is then delivered as a
//! `command` message from the local admin. Replies go to stdout.

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::agent::request::COMMAND_MARKER;
use crate::channels::{InboundMessage, InboundStream, MailTransport, OutgoingReply};
use crate::error::ChannelError;

const CHANNEL: &str = "stdin";

/// Sender address used for stdin messages.
pub const LOCAL_ADMIN: &str = "admin@localhost";

pub struct StdinTransport;

impl StdinTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StdinTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects lines into blank-line separated blocks.
#[derive(Debug, Default)]
struct BlockBuffer {
    pending: String,
}

impl BlockBuffer {
    /// Feed one line; returns a finished block on an empty line.
    fn push(&mut self, line: &str) -> Option<String> {
        if line.trim().is_empty() {
            if self.pending.is_empty() {
                return None;
            }
            return Some(std::mem::take(&mut self.pending));
        }
        self.pending.push_str(line);
        self.pending.push('\n');
        None
    }

    /// Whatever is left at end of input.
    fn finish(self) -> Option<String> {
        (!self.pending.is_empty()).then_some(self.pending)
    }
}

fn command_message(body: String) -> InboundMessage {
    InboundMessage::new(CHANNEL, LOCAL_ADMIN, COMMAND_MARKER, body).with_sender_name("admin")
}

#[async_trait]
impl MailTransport for StdinTransport {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn connect(&self) -> Result<InboundStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut buffer = BlockBuffer::default();
            eprintln!("Running in command test mode. End each command with an empty line.");
            eprint!("> ");

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(block) = buffer.push(&line) {
                            if tx.send(command_message(block)).is_err() {
                                break;
                            }
                            eprint!("> ");
                        }
                    }
                    Ok(None) => {
                        if let Some(block) = buffer.finish() {
                            let _ = tx.send(command_message(block));
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send_reply(
        &self,
        _original: &InboundMessage,
        reply: OutgoingReply,
    ) -> Result<bool, ChannelError> {
        println!("\n{}\n", reply.body);
        eprint!("> ");
        Ok(true)
    }
}
