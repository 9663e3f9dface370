//! Timed, concurrent bulk loading of datasets.
//!
//! The [`ChunkedParallelLoader`] splits a [`Dataset`] into contiguous [`Chunk`]s and assigns
//! them round-robin to a fixed number of workers. Chunk `i` goes to worker `i % workers`, so the
//! assignment is static and every worker processes at most `ceil(chunks / workers)` chunks in
//! dataset order. The measured time spans from the first dispatched chunk until the last worker
//! finished.

use std::collections::HashMap;
use std::ops::{Deref, Range};
use std::sync::Arc;
use std::time::Duration;

use ingestbench_types::{Dataset, TimeSeriesRecord};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::backend::common::{Backend, SharedBackend};
use crate::error::{AggregateInsertError, ChunkFailure, Error, Result, WorkerPanicError};

/// A contiguous slice of a [`Dataset`], dispatched as one insert.
///
/// Chunks keep a cheap handle to the dataset, so they can be moved into worker tasks without
/// copying records.
#[derive(Clone, Debug)]
pub struct Chunk {
    index: usize,
    dataset: Dataset,
    range: Range<usize>,
}

impl Chunk {
    /// Position of this chunk within the chunk sequence.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Positions of the chunk's records within the dataset.
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    /// The records of this chunk.
    pub fn records(&self) -> &[TimeSeriesRecord] {
        &self.dataset[self.range.clone()]
    }
}

impl Deref for Chunk {
    type Target = [TimeSeriesRecord];

    fn deref(&self) -> &Self::Target {
        self.records()
    }
}

/// Splits the dataset into contiguous chunks of at most `chunk_size` records.
///
/// Only the last chunk may be shorter. Concatenating all chunks in order reproduces the dataset.
pub fn partition(dataset: &Dataset, chunk_size: usize) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(Error::InvalidArgument("chunk size must be positive".into()));
    }

    let chunks = (0..dataset.len())
        .step_by(chunk_size)
        .enumerate()
        .map(|(index, start)| Chunk {
            index,
            dataset: dataset.clone(),
            range: start..dataset.len().min(start + chunk_size),
        })
        .collect();

    Ok(chunks)
}

/// Retry and deadline settings of a load.
#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    /// How often a failed chunk insert is retried before it counts as failed.
    pub retries: usize,
    /// Pause between two attempts of the same chunk.
    pub retry_backoff: Duration,
    /// Deadline for the entire load.
    ///
    /// On expiry all workers are aborted and in-flight chunks are abandoned without cleanup.
    pub timeout: Option<Duration>,
}

/// Drives chunked inserts of a dataset through a fixed pool of concurrent workers.
#[derive(Clone, Debug)]
pub struct ChunkedParallelLoader {
    chunk_size: usize,
    worker_count: usize,
    options: LoadOptions,
}

impl ChunkedParallelLoader {
    /// Creates a loader with default [`LoadOptions`].
    ///
    /// Both `chunk_size` and `worker_count` must be positive.
    pub fn new(chunk_size: usize, worker_count: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk size must be positive".into()));
        }
        if worker_count == 0 {
            return Err(Error::InvalidArgument("worker count must be positive".into()));
        }

        Ok(Self {
            chunk_size,
            worker_count,
            options: LoadOptions::default(),
        })
    }

    /// Replaces the retry and deadline settings.
    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    /// Maximum number of records per chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of concurrent workers.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Inserts the whole dataset into `table` and returns the elapsed wall-clock time.
    ///
    /// The elapsed time is rounded to milliseconds. If any chunk fails after exhausting its
    /// retries, the load fails with an [`AggregateInsertError`] listing every failed chunk, even
    /// though all other chunks have been inserted.
    pub async fn load(
        &self,
        backend: &SharedBackend,
        table: &str,
        dataset: &Dataset,
    ) -> Result<Duration> {
        let chunks = partition(dataset, self.chunk_size)?;
        let total_chunks = chunks.len();
        tracing::debug!(
            backend = backend.name(),
            table,
            records = dataset.len(),
            chunks = total_chunks,
            workers = self.worker_count,
            "starting load"
        );

        let start = Instant::now();
        let dispatch = self.dispatch(backend, table, chunks);
        let failures = match self.options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, dispatch)
                .await
                .map_err(|_| Error::TimedOut(timeout))??,
            None => dispatch.await?,
        };
        let elapsed = round_to_millis(start.elapsed());

        if !failures.is_empty() {
            return Err(AggregateInsertError {
                backend: backend.name(),
                total_chunks,
                failures,
            }
            .into());
        }

        tracing::debug!(table, ?elapsed, "finished load");
        Ok(elapsed)
    }

    async fn dispatch(
        &self,
        backend: &SharedBackend,
        table: &str,
        chunks: Vec<Chunk>,
    ) -> Result<Vec<ChunkFailure>> {
        let mut assignments: Vec<Vec<Chunk>> = vec![Vec::new(); self.worker_count];
        for chunk in chunks {
            assignments[chunk.index % self.worker_count].push(chunk);
        }

        let table: Arc<str> = table.into();
        let mut workers = JoinSet::new();
        let mut worker_ids = HashMap::new();

        for (worker, assigned) in assignments.into_iter().enumerate() {
            if assigned.is_empty() {
                continue;
            }

            let backend = Arc::clone(backend);
            let table = Arc::clone(&table);
            let options = self.options.clone();
            let handle = workers.spawn(async move {
                run_worker(backend.as_ref(), &table, assigned, &options).await
            });
            worker_ids.insert(handle.id(), worker);
        }

        let mut failures = Vec::new();
        let mut panicked = Vec::new();
        while let Some(joined) = workers.join_next_with_id().await {
            match joined {
                Ok((_, worker_failures)) => failures.extend(worker_failures),
                Err(err) => {
                    let worker = worker_ids.get(&err.id()).copied().unwrap_or_default();
                    tracing::error!(
                        worker,
                        error = &err as &dyn std::error::Error,
                        "loader worker died"
                    );
                    panicked.push(worker);
                }
            }
        }

        failures.sort_by_key(|failure| failure.index);
        if !panicked.is_empty() {
            panicked.sort_unstable();
            return Err(WorkerPanicError {
                backend: backend.name(),
                workers: panicked,
                failures,
            }
            .into());
        }

        Ok(failures)
    }
}

async fn run_worker(
    backend: &dyn Backend,
    table: &str,
    chunks: Vec<Chunk>,
    options: &LoadOptions,
) -> Vec<ChunkFailure> {
    let mut failures = Vec::new();
    for chunk in chunks {
        if let Err(failure) = insert_with_retries(backend, table, &chunk, options).await {
            failures.push(failure);
        }
    }
    failures
}

async fn insert_with_retries(
    backend: &dyn Backend,
    table: &str,
    chunk: &Chunk,
    options: &LoadOptions,
) -> Result<(), ChunkFailure> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let cause = match backend.insert_chunk(table, chunk).await {
            Ok(()) => return Ok(()),
            Err(cause) => cause,
        };

        if attempts > options.retries {
            return Err(ChunkFailure {
                index: chunk.index(),
                records: chunk.range(),
                attempts,
                cause,
            });
        }

        tracing::warn!(
            chunk = chunk.index(),
            attempt = attempts,
            error = &cause as &dyn std::error::Error,
            "chunk insert failed, retrying"
        );
        tokio::time::sleep(options.retry_backoff).await;
    }
}

fn round_to_millis(elapsed: Duration) -> Duration {
    let millis = (elapsed.as_nanos() + 500_000) / 1_000_000;
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeDelta};
    use ingestbench_types::{CaseKey, Value};

    use super::*;
    use crate::backend::common::{BackendError, BackendResult};
    use crate::backend::in_memory::InMemoryBackend;

    fn dataset(len: u32) -> Dataset {
        let records = (0..len)
            .map(|i| TimeSeriesRecord {
                time: DateTime::UNIX_EPOCH + TimeDelta::seconds(i64::from(i)),
                tag_id: 0,
                value: Value::Int(i as i32),
            })
            .collect();
        Dataset::new(CaseKey::new(1, 1, 1), records)
    }

    #[test]
    fn chunks_reproduce_dataset() {
        let dataset = dataset(50);
        let chunks = partition(&dataset, 20).unwrap();

        let sizes: Vec<_> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, [20, 20, 10]);

        let indexes: Vec<_> = chunks.iter().map(Chunk::index).collect();
        assert_eq!(indexes, [0, 1, 2]);

        let concatenated: Vec<_> = chunks.iter().flat_map(|c| c.iter().cloned()).collect();
        assert_eq!(concatenated, dataset.records());
    }

    #[test]
    fn exact_multiple_has_no_empty_chunk() {
        let chunks = partition(&dataset(40), 20).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(partition(&dataset(0), 20).unwrap().is_empty());
    }

    #[test]
    fn rejects_zero_parameters() {
        assert!(matches!(
            ChunkedParallelLoader::new(0, 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ChunkedParallelLoader::new(1, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            partition(&dataset(1), 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn rounds_to_milliseconds() {
        assert_eq!(
            round_to_millis(Duration::from_micros(1_499)),
            Duration::from_millis(1)
        );
        assert_eq!(
            round_to_millis(Duration::from_micros(1_500)),
            Duration::from_millis(2)
        );
    }

    #[tokio::test]
    async fn loads_every_record() {
        let memory = InMemoryBackend::new();
        let backend: SharedBackend = Arc::new(memory.clone());
        backend.prepare_schema("_t").await.unwrap();

        let dataset = dataset(50);
        let loader = ChunkedParallelLoader::new(7, 3).unwrap();
        loader.load(&backend, "_t", &dataset).await.unwrap();

        assert_eq!(memory.rows("_t").unwrap(), dataset.records());
    }

    #[tokio::test]
    async fn empty_dataset_loads_nothing() {
        let backend: SharedBackend = Arc::new(InMemoryBackend::new());
        let loader = ChunkedParallelLoader::new(10, 2).unwrap();

        // no chunk is dispatched, so the missing table is never touched
        let elapsed = loader
            .load(&backend, "_missing", &dataset(0))
            .await
            .unwrap();
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn reports_all_failed_chunks() {
        let backend: SharedBackend = Arc::new(InMemoryBackend::new());
        let loader = ChunkedParallelLoader::new(20, 2).unwrap();

        let err = loader
            .load(&backend, "_missing", &dataset(50))
            .await
            .unwrap_err();
        let Error::AggregateInsert(aggregate) = err else {
            panic!("expected aggregate insert error, got {err:?}");
        };

        assert_eq!(aggregate.backend, "memory");
        assert_eq!(aggregate.total_chunks, 3);
        let failed: Vec<_> = aggregate.failures.iter().map(|f| f.index).collect();
        assert_eq!(failed, [0, 1, 2]);
        assert_eq!(aggregate.failures[2].records, 40..50);
    }

    /// Panics on the chunk starting with value 20 and rejects every other chunk.
    #[derive(Debug)]
    struct PanickingBackend;

    #[async_trait::async_trait]
    impl Backend for PanickingBackend {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn prepare_schema(&self, _table: &str) -> BackendResult<()> {
            Ok(())
        }

        async fn reset(&self, _table: &str) -> BackendResult<()> {
            Ok(())
        }

        async fn insert_chunk(
            &self,
            table: &str,
            records: &[TimeSeriesRecord],
        ) -> BackendResult<()> {
            if records[0].value == Value::Int(20) {
                panic!("worker exploded");
            }
            Err(BackendError::MissingTable(table.into()))
        }

        async fn measure_size(&self, _table: &str) -> BackendResult<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn worker_panic_keeps_other_failures() {
        let backend: SharedBackend = Arc::new(PanickingBackend);
        let loader = ChunkedParallelLoader::new(20, 3).unwrap();

        let err = loader.load(&backend, "_t", &dataset(50)).await.unwrap_err();
        let Error::WorkerPanic(error) = err else {
            panic!("expected worker panic, got {err:?}");
        };

        assert_eq!(error.backend, "panicking");
        assert_eq!(error.workers, [1]);
        let failed: Vec<_> = error.failures.iter().map(|f| f.index).collect();
        assert_eq!(failed, [0, 2]);
    }
}
