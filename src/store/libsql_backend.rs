//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, UserRecord, UserTarget};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// SQLite integers are signed; clamp counters into range.
fn to_sql_int(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn from_sql_int(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

const USER_COLUMNS: &str =
    "email, name, chat_requests, tokens_used, tokens_limit, created_at, updated_at";

/// Map a libsql Row to a UserRecord. Column order matches USER_COLUMNS.
fn row_to_user(row: &libsql::Row) -> Result<UserRecord, libsql::Error> {
    let created_str: String = row.get(5)?;
    let updated_str: String = row.get(6)?;
    Ok(UserRecord {
        email: row.get(0)?,
        name: row.get::<String>(1).unwrap_or_default(),
        chat_requests: from_sql_int(row.get(2)?),
        tokens_used: from_sql_int(row.get(3)?),
        tokens_limit: from_sql_int(row.get(4)?),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Config snapshot ─────────────────────────────────────────────

    async fn load_config_snapshot(&self) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT config FROM globals WHERE id = 1", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("load_config_snapshot: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let snapshot: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("load_config_snapshot: {e}")))?;
                Ok(Some(snapshot))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("load_config_snapshot: {e}"))),
        }
    }

    async fn save_config_snapshot(&self, snapshot: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO globals (id, config, updated_at) VALUES (1, ?1, ?2)
                 ON CONFLICT (id) DO UPDATE SET config = excluded.config, updated_at = excluded.updated_at",
                params![snapshot, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_config_snapshot: {e}")))?;
        debug!("Config snapshot saved");
        Ok(())
    }

    // ── Users ───────────────────────────────────────────────────────

    async fn get_user(&self, email: &str) -> Result<Option<UserRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_user: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_user(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_user row: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_user: {e}"))),
        }
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users ORDER BY email ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_users: {e}")))?;

        let mut users = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => users.push(
                    row_to_user(&row)
                        .map_err(|e| DatabaseError::Query(format!("list_users row: {e}")))?,
                ),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_users: {e}"))),
            }
        }
        Ok(users)
    }

    async fn record_chat_usage(
        &self,
        email: &str,
        name: &str,
        tokens_used: u64,
        default_limit: u64,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO users (email, name, chat_requests, tokens_used, tokens_limit, created_at, updated_at)
                 VALUES (?1, ?2, 1, ?3, ?4, ?5, ?5)
                 ON CONFLICT (email) DO UPDATE SET
                    chat_requests = users.chat_requests + 1,
                    tokens_used = users.tokens_used + excluded.tokens_used,
                    name = CASE WHEN excluded.name <> '' THEN excluded.name ELSE users.name END,
                    updated_at = excluded.updated_at",
                params![
                    email,
                    name,
                    to_sql_int(tokens_used),
                    to_sql_int(default_limit),
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_chat_usage: {e}")))?;
        Ok(())
    }

    async fn set_tokens_limit(
        &self,
        target: &UserTarget,
        limit: u64,
    ) -> Result<u64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = match target {
            UserTarget::One(email) => {
                self.conn()
                    .execute(
                        "UPDATE users SET tokens_limit = ?1, updated_at = ?2 WHERE email = ?3",
                        params![to_sql_int(limit), now, email.as_str()],
                    )
                    .await
            }
            UserTarget::All => {
                self.conn()
                    .execute(
                        "UPDATE users SET tokens_limit = ?1, updated_at = ?2",
                        params![to_sql_int(limit), now],
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("set_tokens_limit: {e}")))?;

        debug!(target = %target, limit, changed, "Token limit updated");
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    // ── Config snapshot tests ───────────────────────────────────────

    #[tokio::test]
    async fn config_snapshot_absent_on_fresh_db() {
        let db = test_db().await;
        assert!(db.load_config_snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn config_snapshot_overwrites_single_row() {
        let db = test_db().await;
        db.save_config_snapshot("mode: enabled\n").await.unwrap();
        db.save_config_snapshot("mode: disabled\n").await.unwrap();
        assert_eq!(
            db.load_config_snapshot().await.unwrap().as_deref(),
            Some("mode: disabled\n")
        );
    }

    // ── User tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn first_usage_creates_row_with_default_limit() {
        let db = test_db().await;
        db.record_chat_usage("alice@example.com", "Alice", 120, 5000)
            .await
            .unwrap();

        let user = db.get_user("alice@example.com").await.unwrap().unwrap();
        assert_eq!(user.name, "Alice");
        assert_eq!(user.chat_requests, 1);
        assert_eq!(user.tokens_used, 120);
        assert_eq!(user.tokens_limit, 5000);
    }

    #[tokio::test]
    async fn later_usage_accumulates_and_keeps_limit() {
        let db = test_db().await;
        db.record_chat_usage("alice@example.com", "Alice", 100, 5000)
            .await
            .unwrap();
        db.record_chat_usage("alice@example.com", "", 50, 9999)
            .await
            .unwrap();

        let user = db.get_user("alice@example.com").await.unwrap().unwrap();
        assert_eq!(user.chat_requests, 2);
        assert_eq!(user.tokens_used, 150);
        assert_eq!(user.tokens_limit, 5000);
        assert_eq!(user.name, "Alice");
    }

    #[tokio::test]
    async fn get_user_not_found() {
        let db = test_db().await;
        assert!(db.get_user("nobody@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_users_sorted_by_email() {
        let db = test_db().await;
        db.record_chat_usage("zed@example.com", "Zed", 1, 10).await.unwrap();
        db.record_chat_usage("amy@example.com", "Amy", 1, 10).await.unwrap();

        let emails: Vec<String> = db
            .list_users()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.email)
            .collect();
        assert_eq!(emails, vec!["amy@example.com", "zed@example.com"]);
    }

    #[tokio::test]
    async fn set_limit_single_user() {
        let db = test_db().await;
        db.record_chat_usage("a@example.com", "A", 1, 10).await.unwrap();
        db.record_chat_usage("b@example.com", "B", 1, 10).await.unwrap();

        let changed = db
            .set_tokens_limit(&UserTarget::One("a@example.com".into()), 77)
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(db.get_user("a@example.com").await.unwrap().unwrap().tokens_limit, 77);
        assert_eq!(db.get_user("b@example.com").await.unwrap().unwrap().tokens_limit, 10);
    }

    #[tokio::test]
    async fn set_limit_all_users_updates_existing_rows() {
        let db = test_db().await;
        db.record_chat_usage("a@example.com", "A", 1, 10).await.unwrap();
        db.record_chat_usage("b@example.com", "B", 1, 20).await.unwrap();

        let changed = db.set_tokens_limit(&UserTarget::All, 300).await.unwrap();
        assert_eq!(changed, 2);
        for user in db.list_users().await.unwrap() {
            assert_eq!(user.tokens_limit, 300);
        }
    }

    #[tokio::test]
    async fn set_limit_unknown_user_changes_nothing() {
        let db = test_db().await;
        let changed = db
            .set_tokens_limit(&UserTarget::One("ghost@example.com".into()), 5)
            .await
            .unwrap();
        assert_eq!(changed, 0);
    }

    #[tokio::test]
    async fn new_local_creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("agent.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        db.save_config_snapshot("mode: enabled\n").await.unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn parse_datetime_accepts_sqlite_format() {
        let dt = parse_datetime("2026-01-02 03:04:05");
        assert_eq!(dt.to_rfc3339(), "2026-01-02T03:04:05+00:00");
    }
}
