//! In-process relational store for running pipelines and ingestion without Postgres.

use crate::audit::IngestionLog;
use crate::extract::{ChangeSource, change_instant};
use crate::load::RelationalSink;
use crate::models::{IngestionLogEntry, SourceRow};
use crate::validate::ReferenceLookup;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<SourceRow>>,
    log: Vec<IngestionLogEntry>,
    read_failure: Option<String>,
    write_failure: Option<String>,
}

#[derive(Default)]
pub struct MemoryDatabase {
    state: Mutex<State>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_rows(&self, table: &str, rows: Vec<SourceRow>) {
        self.state()
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<SourceRow> {
        self.state().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state().tables.get(table).map_or(0, Vec::len)
    }

    pub fn find(&self, table: &str, column: &str, key: &str) -> Option<SourceRow> {
        self.state()
            .tables
            .get(table)?
            .iter()
            .find(|row| row.get(column).and_then(|v| v.to_key()).as_deref() == Some(key))
            .cloned()
    }

    /// Makes every read fail with `message` until cleared.
    pub fn fail_reads(&self, message: &str) {
        self.state().read_failure = Some(message.to_string());
    }

    /// Makes every upsert fail with `message` until cleared.
    pub fn fail_writes(&self, message: &str) {
        self.state().write_failure = Some(message.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.read_failure = None;
        state.write_failure = None;
    }

    fn check_reads(state: &State) -> Result<()> {
        match &state.read_failure {
            Some(message) => Err(Error::Other(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChangeSource for MemoryDatabase {
    async fn fetch_changes(
        &self,
        table: &str,
        change_column: &str,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SourceRow>> {
        let state = self.state();
        Self::check_reads(&state)?;

        let mut changed: Vec<(DateTime<Utc>, SourceRow)> = state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| change_instant(row, change_column).map(|ts| (ts, row.clone())))
                    .filter(|(ts, _)| *ts > after)
                    .collect()
            })
            .unwrap_or_default();
        changed.sort_by_key(|(ts, _)| *ts);
        Ok(changed.into_iter().take(limit).map(|(_, row)| row).collect())
    }

    async fn count_changed_since(
        &self,
        table: &str,
        change_column: &str,
        after: DateTime<Utc>,
    ) -> Result<u64> {
        let state = self.state();
        Self::check_reads(&state)?;
        Ok(state.tables.get(table).map_or(0, |rows| {
            rows.iter()
                .filter(|row| change_instant(row, change_column).is_some_and(|ts| ts > after))
                .count() as u64
        }))
    }
}

#[async_trait]
impl ReferenceLookup for MemoryDatabase {
    async fn existing_keys(
        &self,
        table: &str,
        column: &str,
        keys: &[String],
    ) -> Result<HashSet<String>> {
        let state = self.state();
        Self::check_reads(&state)?;
        let wanted: HashSet<&String> = keys.iter().collect();
        Ok(state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get(column).and_then(|v| v.to_key()))
                    .filter(|key| wanted.contains(key))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl IngestionLog for MemoryDatabase {
    async fn record(&self, entry: &IngestionLogEntry) -> Result<()> {
        self.state().log.push(entry.clone());
        Ok(())
    }

    async fn entries_since(
        &self,
        source: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<IngestionLogEntry>> {
        let state = self.state();
        Self::check_reads(&state)?;
        let mut entries: Vec<IngestionLogEntry> = state
            .log
            .iter()
            .filter(|e| e.source == source && e.timestamp > since)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }
}

#[async_trait]
impl RelationalSink for MemoryDatabase {
    async fn upsert_with_log(
        &self,
        table: &str,
        key_column: &str,
        columns: &[String],
        rows: &[SourceRow],
        entry: &IngestionLogEntry,
    ) -> Result<usize> {
        // rows and log entry change under one lock, or not at all
        let mut state = self.state();
        if let Some(message) = &state.write_failure {
            return Err(Error::Load {
                table: table.to_string(),
                message: message.clone(),
            });
        }

        let stored = state.tables.entry(table.to_string()).or_default();
        for row in rows {
            let key = row.get(key_column).and_then(|v| v.to_key());
            let position = key.as_ref().and_then(|key| {
                stored
                    .iter()
                    .position(|r| r.get(key_column).and_then(|v| v.to_key()).as_ref() == Some(key))
            });
            match position {
                Some(idx) => {
                    let target = &mut stored[idx];
                    for column in columns {
                        if let Some(value) = row.get(column) {
                            target.insert(column.clone(), value.clone());
                        }
                    }
                }
                None => stored.push(
                    columns
                        .iter()
                        .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                        .collect(),
                ),
            }
        }
        state.log.push(entry.clone());
        Ok(rows.len())
    }
}
