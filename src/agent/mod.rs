//! Agent core: classification, policy, sessions, commands and the
//! orchestrator that ties them together.

pub mod access;
pub mod command;
pub mod ledger;
pub mod orchestrator;
pub mod request;
pub mod sessions;
pub mod settings;

pub use command::CommandExecutor;
pub use ledger::TokenLedger;
pub use orchestrator::{Orchestrator, Outcome};
pub use request::{AgentRequest, CommandRequest, classify};
pub use sessions::SessionRegistry;
pub use settings::{Config, ConfigHandle};
