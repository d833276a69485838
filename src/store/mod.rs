//! Persistence layer — libSQL-backed storage for the config snapshot and
//! per-user usage records.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, UserRecord, UserTarget};
