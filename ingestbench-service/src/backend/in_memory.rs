//! In-memory backend.
//!
//! This provides a [`Backend`] backed by ordered maps keyed on the natural key. Inserts overwrite
//! existing rows, which makes them idempotent. The backend is [`Clone`] and all clones share
//! their tables, so tests can hold a handle for direct inspection while the loader owns another.
//!
//! When created with rollups enabled, tables of one-second-interval cases get a derived
//! `<table>_1min` rollup that keeps the earliest sample of every tag per minute, mimicking the
//! materialized views some columnar stores maintain next to the primary table.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use ingestbench_types::{NaturalKey, TimeSeriesRecord, Value};

use super::common::{Backend, BackendError, BackendResult};

/// Suffix of the derived per-minute rollup table.
const ROLLUP_SUFFIX: &str = "_1min";

/// Fixed per-row overhead of the size estimate: timestamp, tag id and a validity byte.
const ROW_OVERHEAD: u64 = 8 + 4 + 1;

type Table = BTreeMap<NaturalKey, Value>;
type Rollup = BTreeMap<NaturalKey, (DateTime<Utc>, Value)>;

#[derive(Debug, Default)]
struct Store {
    tables: HashMap<String, Table>,
    rollups: HashMap<String, Rollup>,
}

/// An in-process [`Backend`] storing rows in ordered maps.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    rollups: bool,
    store: Arc<Mutex<Store>>,
}

impl InMemoryBackend {
    /// Creates an empty backend without derived rollups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty backend that maintains per-minute rollups for one-second cases.
    pub fn with_rollups() -> Self {
        Self {
            rollups: true,
            ..Self::default()
        }
    }

    /// Returns all rows of the table in natural key order.
    pub fn rows(&self, table: &str) -> Option<Vec<TimeSeriesRecord>> {
        let store = self.lock();
        let rows = store.tables.get(table)?;
        Some(
            rows.iter()
                .map(|(&(time, tag_id), value)| TimeSeriesRecord {
                    time,
                    tag_id,
                    value: value.clone(),
                })
                .collect(),
        )
    }

    /// Returns the number of rows in the derived rollup of the table, if it exists.
    pub fn rollup_rows(&self, table: &str) -> Option<usize> {
        let store = self.lock();
        store.rollups.get(&rollup_name(table)).map(BTreeMap::len)
    }

    /// Returns `true` if the backend has no tables at all.
    pub fn is_empty(&self) -> bool {
        let store = self.lock();
        store.tables.is_empty() && store.rollups.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn rollup_name(table: &str) -> String {
    format!("{table}{ROLLUP_SUFFIX}")
}

fn wants_rollup(table: &str) -> bool {
    table.ends_with("_at_1_second_intervals")
}

fn value_size(value: &Value) -> u64 {
    match value {
        Value::Int(_) | Value::Float(_) => 4,
        Value::Str(s) => s.len() as u64,
        Value::Bool(_) => 1,
    }
}

#[async_trait::async_trait]
impl Backend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn prepare_schema(&self, table: &str) -> BackendResult<()> {
        let mut store = self.lock();
        store.tables.entry(table.to_owned()).or_default();
        if self.rollups && wants_rollup(table) {
            store.rollups.entry(rollup_name(table)).or_default();
        }
        Ok(())
    }

    async fn reset(&self, table: &str) -> BackendResult<()> {
        let mut store = self.lock();
        store.tables.remove(table);
        store.rollups.remove(&rollup_name(table));
        Ok(())
    }

    async fn insert_chunk(&self, table: &str, records: &[TimeSeriesRecord]) -> BackendResult<()> {
        let mut store = self.lock();
        let Store { tables, rollups } = &mut *store;

        let rows = tables
            .get_mut(table)
            .ok_or_else(|| BackendError::MissingTable(table.to_owned()))?;
        for record in records {
            rows.insert(record.key(), record.value.clone());
        }

        if let Some(rollup) = rollups.get_mut(&rollup_name(table)) {
            for record in records {
                let minute = record
                    .time
                    .duration_trunc(TimeDelta::minutes(1))
                    .map_err(|e| BackendError::generic("truncating rollup timestamp", e))?;

                let entry = rollup
                    .entry((minute, record.tag_id))
                    .or_insert_with(|| (record.time, record.value.clone()));
                if record.time < entry.0 {
                    *entry = (record.time, record.value.clone());
                }
            }
        }

        Ok(())
    }

    async fn measure_size(&self, table: &str) -> BackendResult<u64> {
        let store = self.lock();
        let rows = store
            .tables
            .get(table)
            .ok_or_else(|| BackendError::MissingTable(table.to_owned()))?;

        let mut size: u64 = rows.values().map(|v| ROW_OVERHEAD + value_size(v)).sum();
        if let Some(rollup) = store.rollups.get(&rollup_name(table)) {
            size += rollup
                .values()
                .map(|(_, v)| ROW_OVERHEAD + value_size(v))
                .sum::<u64>();
        }

        Ok(size)
    }

    async fn count_rows(&self, table: &str) -> BackendResult<Option<u64>> {
        let store = self.lock();
        let rows = store
            .tables
            .get(table)
            .ok_or_else(|| BackendError::MissingTable(table.to_owned()))?;
        Ok(Some(rows.len() as u64))
    }
}
