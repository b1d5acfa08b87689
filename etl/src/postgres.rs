use crate::audit::IngestionLog;
use crate::extract::ChangeSource;
use crate::load::RelationalSink;
use crate::models::{IngestionLogEntry, LoadStatus, SourceRow, Value, Watermark, parse_timestamp};
use crate::rules::{ColumnType, INGESTED_AT_COLUMN, SOURCE_FILE_COLUMN, SourceRules};
use crate::validate::ReferenceLookup;
use crate::watermark::WatermarkStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::config::DatabaseConfig;
use common::{Error, Result};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Postgres caps a statement at 65535 bind parameters.
const BIND_LIMIT: usize = 65_535;

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(kind: ColumnType) -> &'static str {
    match kind {
        ColumnType::Text => "TEXT",
        ColumnType::Float => "DOUBLE PRECISION",
        ColumnType::Timestamp => "TIMESTAMPTZ",
    }
}

fn rows_per_statement(columns: usize) -> usize {
    (BIND_LIMIT / columns.max(1)).max(1)
}

/// `ON CONFLICT` clause updating every non-key column.
fn conflict_clause(key_column: &str, columns: &[String]) -> String {
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| c.as_str() != key_column)
        .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(c)))
        .collect();
    if updates.is_empty() {
        format!(" ON CONFLICT ({}) DO NOTHING", quote_ident(key_column))
    } else {
        format!(
            " ON CONFLICT ({}) DO UPDATE SET {}",
            quote_ident(key_column),
            updates.join(", ")
        )
    }
}

/// Relational backend: change source, upsert destination, reference lookups,
/// ingestion log and watermark table, all over one bounded pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;
        info!(
            max_connections = config.max_connections,
            "Connected to relational store"
        );
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the bookkeeping tables, and any missing source table with its
    /// declared column types.
    pub async fn ensure_schema<'a>(
        &self,
        sources: impl IntoIterator<Item = &'a SourceRules>,
    ) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ingestion_log (
                id BIGSERIAL PRIMARY KEY,
                source TEXT NOT NULL,
                batch_id TEXT NOT NULL,
                row_count BIGINT NOT NULL,
                logged_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                error_msg TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS ingestion_log_source_time ON ingestion_log (source, logged_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS etl_watermarks (
                source_name TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await?;

        for rules in sources {
            let ddl = Self::table_ddl(rules);
            debug!(table = rules.table(), sql = %ddl, "Ensuring source table");
            sqlx::query(&ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn table_ddl(rules: &SourceRules) -> String {
        let mut columns: Vec<(String, &'static str)> = rules
            .columns
            .iter()
            .map(|c| (c.name.clone(), sql_type(c.kind)))
            .collect();
        for (name, kind) in [
            (INGESTED_AT_COLUMN, ColumnType::Timestamp),
            (SOURCE_FILE_COLUMN, ColumnType::Text),
        ] {
            if !columns.iter().any(|(c, _)| c == name) {
                columns.push((name.to_string(), sql_type(kind)));
            }
        }

        let mut defs: Vec<String> = columns
            .iter()
            .map(|(name, ty)| format!("{} {}", quote_ident(name), ty))
            .collect();
        if let Some(key) = rules.primary_key() {
            defs.push(format!("PRIMARY KEY ({})", quote_ident(&key)));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(rules.table()),
            defs.join(", ")
        )
    }

    async fn insert_log(conn: &mut PgConnection, entry: &IngestionLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingestion_log (source, batch_id, row_count, logged_at, status, error_msg)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&entry.source)
        .bind(&entry.batch_id)
        .bind(entry.row_count as i64)
        .bind(entry.timestamp)
        .bind(entry.status.as_str())
        .bind(entry.error_msg.as_deref())
        .execute(conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeSource for PgStore {
    async fn fetch_changes(
        &self,
        table: &str,
        change_column: &str,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SourceRow>> {
        let sql = format!(
            "SELECT to_jsonb(t) AS record FROM (
                SELECT * FROM {table} WHERE {col} > $1 ORDER BY {col} ASC LIMIT $2
             ) t ORDER BY t.{col} ASC",
            table = quote_ident(table),
            col = quote_ident(change_column),
        );
        let records: Vec<serde_json::Value> = sqlx::query_scalar(&sql)
            .bind(after)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        records
            .into_iter()
            .map(|record| match record {
                serde_json::Value::Object(fields) => Ok(fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect()),
                other => Err(Error::Extraction {
                    source_name: table.to_string(),
                    message: format!("Unexpected record shape: {}", other),
                }),
            })
            .collect()
    }

    async fn count_changed_since(
        &self,
        table: &str,
        change_column: &str,
        after: DateTime<Utc>,
    ) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} > $1",
            quote_ident(table),
            quote_ident(change_column)
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(after)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl ReferenceLookup for PgStore {
    async fn existing_keys(
        &self,
        table: &str,
        column: &str,
        keys: &[String],
    ) -> Result<HashSet<String>> {
        let sql = format!(
            "SELECT DISTINCT {col}::text FROM {table} WHERE {col}::text = ANY($1)",
            col = quote_ident(column),
            table = quote_ident(table),
        );
        let found: Vec<String> = sqlx::query_scalar(&sql)
            .bind(keys)
            .fetch_all(&self.pool)
            .await?;
        Ok(found.into_iter().collect())
    }
}

#[async_trait]
impl IngestionLog for PgStore {
    async fn record(&self, entry: &IngestionLogEntry) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_log(&mut conn, entry).await
    }

    async fn entries_since(
        &self,
        source: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<IngestionLogEntry>> {
        let rows: Vec<(String, String, i64, DateTime<Utc>, String, Option<String>)> =
            sqlx::query_as(
                "SELECT source, batch_id, row_count, logged_at, status, error_msg
                 FROM ingestion_log
                 WHERE source = $1 AND logged_at > $2
                 ORDER BY logged_at ASC",
            )
            .bind(source)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(source, batch_id, row_count, timestamp, status, error_msg)| {
                let Some(status) = LoadStatus::parse(&status) else {
                    warn!(source = %source, batch_id = %batch_id, status = %status, "Unknown log status");
                    return None;
                };
                Some(IngestionLogEntry {
                    source,
                    batch_id,
                    row_count: row_count.max(0) as usize,
                    timestamp,
                    status,
                    error_msg,
                })
            })
            .collect())
    }
}

#[async_trait]
impl RelationalSink for PgStore {
    async fn upsert_with_log(
        &self,
        table: &str,
        key_column: &str,
        columns: &[String],
        rows: &[SourceRow],
        entry: &IngestionLogEntry,
    ) -> Result<usize> {
        let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let conflict = conflict_clause(key_column, columns);

        // dropped without commit on any error, which rolls back
        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(rows_per_statement(columns.len())) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} ({}) ",
                quote_ident(table),
                column_list.join(", ")
            ));
            builder.push_values(chunk, |mut values, row| {
                for column in columns {
                    match row.get(column).unwrap_or(&Value::Null) {
                        Value::Null => {
                            values.push("NULL");
                        }
                        Value::Text(s) => {
                            values.push_bind(s.clone());
                        }
                        Value::Number(n) => {
                            values.push_bind(*n);
                        }
                        Value::Timestamp(ts) => {
                            values.push_bind(*ts);
                        }
                    }
                }
            });
            builder.push(&conflict);
            builder.build().execute(&mut *tx).await?;
        }
        Self::insert_log(&mut tx, entry).await?;
        tx.commit().await?;

        debug!(table, rows = rows.len(), "Committed upsert");
        Ok(rows.len())
    }
}

#[async_trait]
impl WatermarkStore for PgStore {
    async fn get(&self, source_name: &str) -> Result<Watermark> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM etl_watermarks WHERE source_name = $1")
                .bind(source_name)
                .fetch_optional(&self.pool)
                .await?;

        match stored {
            None => {
                info!(source = source_name, "No watermark stored, starting from epoch");
                Ok(Watermark::epoch(source_name))
            }
            Some(raw) => match parse_timestamp(&raw) {
                Some(value) => Ok(Watermark::new(source_name, value)),
                None => {
                    warn!(
                        source = source_name,
                        value = %raw,
                        "Unparsable watermark, treating source as never synced"
                    );
                    Ok(Watermark::epoch(source_name))
                }
            },
        }
    }

    async fn set(&self, watermark: &Watermark) -> Result<()> {
        sqlx::query(
            "INSERT INTO etl_watermarks (source_name, value, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (source_name) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(&watermark.source_name)
        .bind(watermark.value.to_rfc3339())
        .execute(&self.pool)
        .await?;
        info!(
            source = %watermark.source_name,
            watermark = %watermark.value.to_rfc3339(),
            "Watermark updated"
        );
        Ok(())
    }
}
