//! Database pool construction and lifecycle.
//!
//! The pool is an explicitly constructed handle passed down to every store
//! function; there is no ambient global. Callers own the pool and close it
//! at shutdown.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;

/// Open the SQLite database described by the config.
///
/// WAL journaling for concurrent readers, foreign keys enforced (cascade
/// deletes depend on it), and a bounded pool: callers queue on acquisition
/// up to the configured timeout rather than failing immediately.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .min_connections(config.db.min_connections)
        .max_connections(config.db.max_connections)
        .acquire_timeout(Duration::from_secs(config.db.acquire_timeout_secs))
        .connect_with(options)
        .await?;

    Ok(pool)
}
