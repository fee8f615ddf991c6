//! SQLite-backed document store.
//!
//! The specification describes persistence as abstract collection
//! operations (`insertOne`, `findOne`, `find().sort().skip().limit()`,
//! `updateOne`, `replaceOne(upsert)`, `countDocuments`, `aggregate`,
//! `createIndex`). Rust's type system makes a literal Mongo-shaped
//! interface awkward to keep safe, so each collection gets its own set of
//! concrete typed methods realizing those operations — the same move the
//! teacher's `UserStore` makes for its `users`/`api_keys` tables. A fresh
//! `rusqlite::Connection` is opened per call, matching that module's
//! style; SQLite's file lock serializes writers.

mod admin_audit;
mod analysis;
mod users;

pub use admin_audit::AdminAuditEntry;
pub use analysis::{AnalysisLog, DailySummary, KindBreakdown};
pub use users::{Tier, UserRecord, UserStatus};

use anyhow::{Context, Result};
use rusqlite::Connection;

pub struct Store {
    db_path: String,
}

impl Store {
    pub fn new(db_path: impl Into<String>) -> Result<Self> {
        let store = Self {
            db_path: db_path.into(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.db_path).context("opening store database")
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id            INTEGER PRIMARY KEY,
                email              TEXT NOT NULL,
                password_hash      TEXT NOT NULL,
                display_name       TEXT,
                tier               TEXT NOT NULL,
                status             TEXT NOT NULL,
                total_analyses     INTEGER NOT NULL DEFAULT 0,
                daily_date         TEXT NOT NULL,
                daily_count        INTEGER NOT NULL DEFAULT 0,
                subscription_start TEXT NOT NULL,
                subscription_end   TEXT,
                last_seen          TEXT,
                created_at         TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS users_user_id_idx ON users(user_id);
            CREATE UNIQUE INDEX IF NOT EXISTS users_email_idx ON users(email);
            CREATE INDEX IF NOT EXISTS users_status_tier_idx ON users(status, tier);

            CREATE TABLE IF NOT EXISTS analysis_logs (
                id              TEXT PRIMARY KEY,
                user_id         INTEGER NOT NULL,
                kind            TEXT NOT NULL,
                success         INTEGER NOT NULL,
                processing_ms   INTEGER NOT NULL,
                error           TEXT,
                user_tier       TEXT NOT NULL,
                price_at_request REAL,
                created_at      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS analysis_logs_user_created_idx
                ON analysis_logs(user_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS daily_summaries (
                user_id     INTEGER NOT NULL,
                date        TEXT NOT NULL,
                total       INTEGER NOT NULL DEFAULT 0,
                successful  INTEGER NOT NULL DEFAULT 0,
                failed      INTEGER NOT NULL DEFAULT 0,
                kind_quick    INTEGER NOT NULL DEFAULT 0,
                kind_detailed INTEGER NOT NULL DEFAULT 0,
                kind_chart    INTEGER NOT NULL DEFAULT 0,
                kind_news     INTEGER NOT NULL DEFAULT 0,
                kind_forecast INTEGER NOT NULL DEFAULT 0,
                mean_ms     REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, date)
            );

            CREATE TABLE IF NOT EXISTS admin_audit (
                id              TEXT PRIMARY KEY,
                admin_id        TEXT NOT NULL,
                action          TEXT NOT NULL,
                target_user_id  INTEGER,
                detail          TEXT,
                created_at      TEXT NOT NULL
            );
            "#,
        )
        .context("creating store schema")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn temp_store() -> (Store, tempfile::NamedTempFile) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = Store::new(file.path().to_str().unwrap()).unwrap();
        (store, file)
    }

    #[test]
    fn init_schema_is_idempotent() {
        let (store, _file) = temp_store();
        store.init_schema().unwrap();
        store.init_schema().unwrap();
    }
}
