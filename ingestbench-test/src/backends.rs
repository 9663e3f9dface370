//! Scripted backends for loader and runner tests.
//!
//! All backends are [`Clone`] and clones share their state, so a test can keep one handle for
//! assertions while the loader or a [`CloningFactory`] owns another.
//!
//! [`CloningFactory`]: ingestbench_service::backend::CloningFactory

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ingestbench_service::backend::in_memory::InMemoryBackend;
use ingestbench_service::backend::{Backend, BackendError, BackendResult};
use ingestbench_types::{NaturalKey, TimeSeriesRecord};

/// A backend that sleeps for a fixed delay on every insert and stores nothing.
///
/// It tracks how many chunks and records it received and the highest number of inserts that
/// were in flight at the same time.
#[derive(Clone, Debug)]
pub struct SleepingBackend {
    delay: Duration,
    stats: Arc<SleepStats>,
}

#[derive(Debug, Default)]
struct SleepStats {
    chunks: AtomicUsize,
    records: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SleepingBackend {
    /// Creates a backend sleeping `delay` per chunk.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            stats: Arc::default(),
        }
    }

    /// Number of completed chunk inserts.
    pub fn chunks(&self) -> usize {
        self.stats.chunks.load(Ordering::SeqCst)
    }

    /// Number of records across all completed chunk inserts.
    pub fn records(&self) -> usize {
        self.stats.records.load(Ordering::SeqCst)
    }

    /// Highest number of concurrently running inserts.
    pub fn max_in_flight(&self) -> usize {
        self.stats.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Backend for SleepingBackend {
    fn name(&self) -> &'static str {
        "sleeping"
    }

    async fn prepare_schema(&self, _table: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn reset(&self, _table: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn insert_chunk(&self, _table: &str, records: &[TimeSeriesRecord]) -> BackendResult<()> {
        let in_flight = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats
            .max_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.stats.chunks.fetch_add(1, Ordering::SeqCst);
        self.stats
            .records
            .fetch_add(records.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn measure_size(&self, _table: &str) -> BackendResult<u64> {
        Ok(0)
    }
}

/// The backend operation a [`FailingBackend`] fails.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    /// [`Backend::prepare_schema`]
    PrepareSchema,
    /// [`Backend::reset`]
    Reset,
    /// [`Backend::insert_chunk`]
    InsertChunk,
    /// [`Backend::measure_size`]
    MeasureSize,
}

/// An in-memory backend that fails one operation.
///
/// By default the operation fails for every table. Use [`only_table`](Self::only_table) to fail
/// it for a single table and pass all others through.
#[derive(Clone, Debug)]
pub struct FailingBackend {
    inner: InMemoryBackend,
    operation: Operation,
    table: Option<String>,
}

impl FailingBackend {
    /// Creates a backend failing `operation`.
    pub fn new(operation: Operation) -> Self {
        Self {
            inner: InMemoryBackend::new(),
            operation,
            table: None,
        }
    }

    /// Restricts failures to the given table.
    pub fn only_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// The in-memory storage behind this backend.
    pub fn inner(&self) -> &InMemoryBackend {
        &self.inner
    }

    fn check(&self, operation: Operation, table: &str) -> BackendResult<()> {
        let table_matches = self.table.as_deref().is_none_or(|t| t == table);
        if operation == self.operation && table_matches {
            return Err(BackendError::generic(
                format!("{operation:?} on {table}"),
                "injected failure",
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Backend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn prepare_schema(&self, table: &str) -> BackendResult<()> {
        self.check(Operation::PrepareSchema, table)?;
        self.inner.prepare_schema(table).await
    }

    async fn reset(&self, table: &str) -> BackendResult<()> {
        self.check(Operation::Reset, table)?;
        self.inner.reset(table).await
    }

    async fn insert_chunk(&self, table: &str, records: &[TimeSeriesRecord]) -> BackendResult<()> {
        self.check(Operation::InsertChunk, table)?;
        self.inner.insert_chunk(table, records).await
    }

    async fn measure_size(&self, table: &str) -> BackendResult<u64> {
        self.check(Operation::MeasureSize, table)?;
        self.inner.measure_size(table).await
    }

    async fn count_rows(&self, table: &str) -> BackendResult<Option<u64>> {
        self.inner.count_rows(table).await
    }
}

/// An in-memory backend that fails the first attempts of every chunk.
///
/// Chunks are identified by the natural key of their first record, so a retried chunk is
/// recognized across attempts.
#[derive(Clone, Debug)]
pub struct FlakyBackend {
    inner: InMemoryBackend,
    failures_per_chunk: usize,
    attempts: Arc<Mutex<HashMap<NaturalKey, usize>>>,
}

impl FlakyBackend {
    /// Creates a backend failing every chunk `failures_per_chunk` times before storing it.
    pub fn new(failures_per_chunk: usize) -> Self {
        Self {
            inner: InMemoryBackend::new(),
            failures_per_chunk,
            attempts: Arc::default(),
        }
    }

    /// The in-memory storage behind this backend.
    pub fn inner(&self) -> &InMemoryBackend {
        &self.inner
    }

    /// Total number of insert attempts across all chunks.
    pub fn attempts(&self) -> usize {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }
}

#[async_trait::async_trait]
impl Backend for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn prepare_schema(&self, table: &str) -> BackendResult<()> {
        self.inner.prepare_schema(table).await
    }

    async fn reset(&self, table: &str) -> BackendResult<()> {
        self.inner.reset(table).await
    }

    async fn insert_chunk(&self, table: &str, records: &[TimeSeriesRecord]) -> BackendResult<()> {
        if let Some(first) = records.first() {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
                let attempt = attempts.entry(first.key()).or_default();
                *attempt += 1;
                *attempt
            };

            if attempt <= self.failures_per_chunk {
                return Err(BackendError::generic(
                    format!("attempt {attempt} of chunk at {:?}", first.key()),
                    "flaky failure",
                ));
            }
        }

        self.inner.insert_chunk(table, records).await
    }

    async fn measure_size(&self, table: &str) -> BackendResult<u64> {
        self.inner.measure_size(table).await
    }

    async fn count_rows(&self, table: &str) -> BackendResult<Option<u64>> {
        self.inner.count_rows(table).await
    }
}
