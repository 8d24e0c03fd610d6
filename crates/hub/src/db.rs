use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

use crate::actuator::Actuator;
use crate::rules::Rule;
use crate::sensors::Snapshot;

/// Durable key-record store. Records are JSON documents keyed by id;
/// writes are whole-document and last-write-wins per key.
#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("failed to encode record")
}

fn decode<T: serde::de::DeserializeOwned>(doc: &str) -> Result<T> {
    serde_json::from_str(doc).context("failed to decode record")
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/hydro/hydro.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // A shared-cache memory db locks whole tables across connections.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Actuators
    // ----------------------------

    pub async fn upsert_actuator(&self, a: &Actuator) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO actuators (id, doc) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET doc = excluded.doc
            "#,
        )
        .bind(&a.id)
        .bind(encode(a)?)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert_actuator failed id={}", a.id))?;
        Ok(())
    }

    /// Create the record unless the id already exists. Returns true when a
    /// row was written.
    pub async fn insert_actuator_if_absent(&self, a: &Actuator) -> Result<bool> {
        let res = sqlx::query("INSERT OR IGNORE INTO actuators (id, doc) VALUES (?, ?)")
            .bind(&a.id)
            .bind(encode(a)?)
            .execute(&self.pool)
            .await
            .with_context(|| format!("insert_actuator failed id={}", a.id))?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn get_actuator(&self, id: &str) -> Result<Option<Actuator>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT doc FROM actuators WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get_actuator failed")?;
        row.map(|(doc,)| decode(&doc)).transpose()
    }

    pub async fn load_actuators(&self) -> Result<Vec<Actuator>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT doc FROM actuators ORDER BY rowid")
            .fetch_all(&self.pool)
            .await
            .context("load_actuators failed")?;
        rows.iter().map(|(doc,)| decode(doc)).collect()
    }

    pub async fn delete_all_actuators(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM actuators")
            .execute(&self.pool)
            .await
            .context("delete_all_actuators failed")?;
        Ok(res.rows_affected())
    }

    // ----------------------------
    // Rules
    // ----------------------------

    /// Insert a new rule and return its assigned id.
    pub async fn insert_rule(&self, r: &Rule) -> Result<i64> {
        let res = sqlx::query("INSERT INTO rules (priority, doc) VALUES (?, ?)")
            .bind(r.priority as i64)
            .bind(encode(r)?)
            .execute(&self.pool)
            .await
            .context("insert_rule failed")?;
        Ok(res.last_insert_rowid())
    }

    /// Overwrite an existing rule. Returns false when the id is unknown.
    pub async fn update_rule(&self, r: &Rule) -> Result<bool> {
        let res = sqlx::query("UPDATE rules SET priority = ?, doc = ? WHERE id = ?")
            .bind(r.priority as i64)
            .bind(encode(r)?)
            .bind(r.id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("update_rule failed id={}", r.id))?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn get_rule(&self, id: i64) -> Result<Option<Rule>> {
        let row: Option<(i64, String)> = sqlx::query_as("SELECT id, doc FROM rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get_rule failed")?;
        row.map(|(id, doc)| decode_rule(id, &doc)).transpose()
    }

    /// All rules, highest priority first, newest first within a priority.
    pub async fn load_rules(&self) -> Result<Vec<Rule>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, doc FROM rules ORDER BY priority DESC, id DESC")
                .fetch_all(&self.pool)
                .await
                .context("load_rules failed")?;
        rows.iter().map(|(id, doc)| decode_rule(*id, doc)).collect()
    }

    pub async fn delete_rule(&self, id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_rule failed")?;
        Ok(res.rows_affected() == 1)
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(&self, s: &Snapshot) -> Result<()> {
        sqlx::query("INSERT INTO readings (ts, node_id, doc) VALUES (?, ?, ?)")
            .bind(s.ts.unix_timestamp())
            .bind(&s.node_id)
            .bind(encode(s)?)
            .execute(&self.pool)
            .await
            .context("insert_reading failed")?;
        Ok(())
    }

    pub async fn latest_reading(&self) -> Result<Option<Snapshot>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT doc FROM readings ORDER BY ts DESC, id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .context("latest_reading failed")?;
        row.map(|(doc,)| decode(&doc)).transpose()
    }

    #[cfg(test)]
    pub async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }
}

fn decode_rule(id: i64, doc: &str) -> Result<Rule> {
    let mut rule: Rule = decode(doc)?;
    rule.id = id;
    Ok(rule)
}

// ===========================================================================
// Tests
// ===========================================================================
