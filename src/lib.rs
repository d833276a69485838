//! Mail agent — answers mailbox messages with a chat model and takes admin
//! commands over the same mailbox.

pub mod agent;
pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod store;
