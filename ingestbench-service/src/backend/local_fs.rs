//! Append-only columnar backend on the local filesystem.
//!
//! Every table is a directory below the backend root. [`prepare_schema`] creates a generation
//! directory inside it, which holds immutable Parquet segment files. Each inserted chunk becomes
//! one segment:
//!
//!  1. The chunk's natural keys that are not yet stored are reserved in an in-process key index.
//!     Keys that are already present are skipped, like `ON CONFLICT DO NOTHING`.
//!  2. The remaining rows are written to a staging file with a unique name, so concurrent chunks
//!     never share staging state.
//!  3. The staging file is synced and atomically renamed into a segment.
//!
//! If writing fails, the reservation is released again so that a retry stores the rows exactly
//! once. The key index of a table is rebuilt from its segments on [`prepare_schema`] or on
//! first use by a fresh handle.
//!
//! A reset removes the table directory including its generation. Writes still in flight from
//! before the reset, such as those of a timed out load, fail instead of landing in the table
//! created by the next [`prepare_schema`].
//!
//! [`prepare_schema`]: Backend::prepare_schema

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arrow::record_batch::RecordBatch;
use ingestbench_types::columnar::{self, ColumnarError};
use ingestbench_types::{NaturalKey, TimeSeriesRecord};
use parquet::arrow::ArrowWriter;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use uuid::Uuid;

use super::common::{Backend, BackendError, BackendFactory, BackendResult, BoxedBackend};

const GENERATION_PREFIX: &str = "generation-";
const SEGMENT_PREFIX: &str = "segment-";
const STAGING_PREFIX: &str = ".staging-";
const PARQUET_EXTENSION: &str = "parquet";

type KeyIndex = Arc<Mutex<HashSet<NaturalKey>>>;

/// The current generation of a table and the keys stored in it.
#[derive(Clone, Debug)]
struct TableState {
    generation: PathBuf,
    keys: KeyIndex,
}

/// A [`Backend`] writing Parquet segments into a local directory.
#[derive(Debug, Clone)]
pub struct LocalFsBackend {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    tables: Mutex<HashMap<String, TableState>>,
}

impl LocalFsBackend {
    /// Creates a backend storing tables below `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                tables: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn table_dir(&self, table: &str) -> BackendResult<PathBuf> {
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(BackendError::generic(
                "resolving table directory",
                format!("invalid table name `{table}`"),
            ));
        }
        Ok(self.inner.root.join(table))
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<String, TableState>> {
        self.inner
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the state of the table, loading it from disk on first use.
    async fn table_state(&self, table: &str) -> BackendResult<TableState> {
        if let Some(state) = self.tables().get(table) {
            return Ok(state.clone());
        }

        let table_dir = self.table_dir(table)?;
        let name = table.to_owned();
        let (generation, keys) = blocking(move || {
            let generation = find_generation(&table_dir, &name)?
                .ok_or_else(|| BackendError::MissingTable(name.clone()))?;
            let keys = load_keys(&generation, &name)?;
            Ok((generation, keys))
        })
        .await?;

        let mut tables = self.tables();
        let state = tables
            .entry(table.to_owned())
            .or_insert_with(|| TableState {
                generation,
                keys: Arc::new(Mutex::new(keys)),
            });
        Ok(state.clone())
    }
}

async fn blocking<F, T>(f: F) -> BackendResult<T>
where
    F: FnOnce() -> BackendResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackendError::generic("joining blocking filesystem task", e))?
}

fn lock_keys(index: &KeyIndex) -> MutexGuard<'_, HashSet<NaturalKey>> {
    index.lock().unwrap_or_else(PoisonError::into_inner)
}

fn missing_as_table(table: &str) -> impl FnOnce(std::io::Error) -> BackendError + '_ {
    move |err| {
        if err.kind() == ErrorKind::NotFound {
            BackendError::MissingTable(table.to_owned())
        } else {
            err.into()
        }
    }
}

fn find_generation(table_dir: &Path, table: &str) -> BackendResult<Option<PathBuf>> {
    for entry in std::fs::read_dir(table_dir).map_err(missing_as_table(table))? {
        let entry = entry?;
        let is_generation = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(GENERATION_PREFIX));
        if is_generation && entry.file_type()?.is_dir() {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

fn segments(generation: &Path, table: &str) -> BackendResult<Vec<PathBuf>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(generation).map_err(missing_as_table(table))? {
        let path = entry?.path();
        let is_segment = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(SEGMENT_PREFIX));
        if is_segment && path.extension().is_some_and(|ext| ext == PARQUET_EXTENSION) {
            segments.push(path);
        }
    }
    segments.sort();
    Ok(segments)
}

fn load_keys(generation: &Path, table: &str) -> BackendResult<HashSet<NaturalKey>> {
    let mut keys = HashSet::new();

    for path in segments(generation, table)? {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(&path)?)?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), [0, 1]);
        for batch in builder.with_projection(mask).build()? {
            let batch = batch.map_err(ColumnarError::from)?;
            keys.extend(columnar::keys_from_record_batch(&batch)?);
        }
    }

    tracing::debug!(dir = %generation.display(), keys = keys.len(), "loaded key index");
    Ok(keys)
}

/// Sums the sizes of all files below `dir`.
fn disk_usage(dir: &Path) -> std::io::Result<u64> {
    let mut size = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            size += disk_usage(&entry.path())?;
        } else if metadata.is_file() {
            size += metadata.len();
        }
    }
    Ok(size)
}

fn write_segment(generation: &Path, batch: &RecordBatch) -> BackendResult<PathBuf> {
    let staging = generation.join(format!(
        "{STAGING_PREFIX}{}.{PARQUET_EXTENSION}",
        Uuid::new_v4()
    ));

    let result = (|| -> BackendResult<PathBuf> {
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer =
            ArrowWriter::try_new(File::create(&staging)?, batch.schema(), Some(props))?;
        writer.write(batch)?;
        writer.into_inner()?.sync_all()?;

        let segment = generation.join(format!(
            "{SEGMENT_PREFIX}{}.{PARQUET_EXTENSION}",
            Uuid::now_v7()
        ));
        std::fs::rename(&staging, &segment)?;
        Ok(segment)
    })();

    if result.is_err() {
        std::fs::remove_file(&staging).ok();
    }
    result
}

#[async_trait::async_trait]
impl Backend for LocalFsBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn prepare_schema(&self, table: &str) -> BackendResult<()> {
        let table_dir = self.table_dir(table)?;
        let name = table.to_owned();
        let (generation, keys) = blocking(move || {
            std::fs::create_dir_all(&table_dir)?;
            let generation = match find_generation(&table_dir, &name)? {
                Some(generation) => generation,
                None => {
                    let generation =
                        table_dir.join(format!("{GENERATION_PREFIX}{}", Uuid::now_v7()));
                    std::fs::create_dir(&generation)?;
                    generation
                }
            };
            let keys = load_keys(&generation, &name)?;
            Ok((generation, keys))
        })
        .await?;

        let state = TableState {
            generation,
            keys: Arc::new(Mutex::new(keys)),
        };
        self.tables().insert(table.to_owned(), state);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn reset(&self, table: &str) -> BackendResult<()> {
        let dir = self.table_dir(table)?;
        self.tables().remove(table);

        match tokio::fs::remove_dir_all(&dir).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    #[tracing::instrument(
        level = "trace",
        skip_all,
        fields(table = table, records = records.len())
    )]
    async fn insert_chunk(&self, table: &str, records: &[TimeSeriesRecord]) -> BackendResult<()> {
        let TableState { generation, keys } = self.table_state(table).await?;

        let fresh: Vec<&TimeSeriesRecord> = {
            let mut keys = lock_keys(&keys);
            records.iter().filter(|r| keys.insert(r.key())).collect()
        };

        if fresh.is_empty() {
            tracing::trace!("all keys already stored, skipping chunk");
            return Ok(());
        }

        let release = |fresh: &[&TimeSeriesRecord]| {
            let mut keys = lock_keys(&keys);
            for record in fresh {
                keys.remove(&record.key());
            }
        };

        let batch = if fresh.len() == records.len() {
            columnar::to_record_batch(records)
        } else {
            let rows: Vec<TimeSeriesRecord> = fresh.iter().map(|&r| r.clone()).collect();
            columnar::to_record_batch(&rows)
        };
        let batch = match batch {
            Ok(batch) => batch,
            Err(err) => {
                release(&fresh);
                return Err(err.into());
            }
        };

        match blocking(move || write_segment(&generation, &batch)).await {
            Ok(segment) => {
                tracing::trace!(segment = %segment.display(), rows = fresh.len(), "wrote segment");
                Ok(())
            }
            Err(err) => {
                release(&fresh);
                Err(err)
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn measure_size(&self, table: &str) -> BackendResult<u64> {
        let dir = self.table_dir(table)?;
        let name = table.to_owned();
        blocking(move || disk_usage(&dir).map_err(missing_as_table(&name))).await
    }

    async fn count_rows(&self, table: &str) -> BackendResult<Option<u64>> {
        let table_dir = self.table_dir(table)?;
        let name = table.to_owned();
        blocking(move || {
            let Some(generation) = find_generation(&table_dir, &name)? else {
                return Err(BackendError::MissingTable(name));
            };

            let mut rows = 0;
            for path in segments(&generation, &name)? {
                let reader = SerializedFileReader::new(File::open(&path)?)?;
                rows += reader.metadata().file_metadata().num_rows() as u64;
            }
            Ok(Some(rows))
        })
        .await
    }
}

/// Creates a fresh [`LocalFsBackend`] below a root directory on every connect.
#[derive(Debug)]
pub struct LocalFsFactory {
    root: PathBuf,
}

impl LocalFsFactory {
    /// Creates a factory for backends storing tables below `root`.
    pub fn new(root: &Path) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl BackendFactory for LocalFsFactory {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn connect(&self) -> BackendResult<BoxedBackend> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(Box::new(LocalFsBackend::new(&self.root)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeDelta};
    use ingestbench_types::Value;

    use super::*;

    const TABLE: &str = "_1_minutes_of_4_tags_at_60_second_intervals";

    fn records(range: std::ops::Range<u32>) -> Vec<TimeSeriesRecord> {
        range
            .map(|tag_id| TimeSeriesRecord {
                time: DateTime::UNIX_EPOCH + TimeDelta::seconds(60),
                tag_id,
                value: Value::Str(format!("value{tag_id:05}")),
            })
            .collect()
    }

    #[tokio::test]
    async fn stores_segments() {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tempdir.path());

        backend.prepare_schema(TABLE).await.unwrap();
        backend.insert_chunk(TABLE, &records(0..2)).await.unwrap();
        backend.insert_chunk(TABLE, &records(2..4)).await.unwrap();

        assert_eq!(backend.count_rows(TABLE).await.unwrap(), Some(4));
        let generation = backend.table_state(TABLE).await.unwrap().generation;
        assert_eq!(segments(&generation, TABLE).unwrap().len(), 2);
        assert!(backend.measure_size(TABLE).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn skips_existing_keys() {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tempdir.path());

        backend.prepare_schema(TABLE).await.unwrap();
        backend.insert_chunk(TABLE, &records(0..3)).await.unwrap();
        backend.insert_chunk(TABLE, &records(0..3)).await.unwrap();
        backend.insert_chunk(TABLE, &records(2..4)).await.unwrap();

        assert_eq!(backend.count_rows(TABLE).await.unwrap(), Some(4));
        // the fully duplicated chunk does not produce a segment
        let generation = backend.table_state(TABLE).await.unwrap().generation;
        assert_eq!(segments(&generation, TABLE).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fresh_handle_rebuilds_index() {
        let tempdir = tempfile::tempdir().unwrap();

        let first = LocalFsBackend::new(tempdir.path());
        first.prepare_schema(TABLE).await.unwrap();
        first.insert_chunk(TABLE, &records(0..4)).await.unwrap();

        // no `prepare_schema` on the second handle: the index is loaded on first insert
        let second = LocalFsBackend::new(tempdir.path());
        second.insert_chunk(TABLE, &records(0..4)).await.unwrap();

        assert_eq!(second.count_rows(TABLE).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn reset_removes_everything() {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tempdir.path());

        backend.reset(TABLE).await.unwrap();
        backend.prepare_schema(TABLE).await.unwrap();
        backend.insert_chunk(TABLE, &records(0..4)).await.unwrap();
        backend.reset(TABLE).await.unwrap();

        assert!(!tempdir.path().join(TABLE).exists());
        let err = backend.measure_size(TABLE).await.unwrap_err();
        assert!(matches!(err, BackendError::MissingTable(ref t) if t == TABLE));

        // a reset table starts from scratch
        backend.prepare_schema(TABLE).await.unwrap();
        backend.insert_chunk(TABLE, &records(0..4)).await.unwrap();
        assert_eq!(backend.count_rows(TABLE).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn rejects_unsafe_table_names() {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tempdir.path());

        let err = backend.prepare_schema("../outside").await.unwrap_err();
        assert!(matches!(err, BackendError::Generic { .. }));
    }

    #[tokio::test]
    async fn concurrent_inserts_store_each_key_once() {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tempdir.path());
        backend.prepare_schema(TABLE).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let backend = backend.clone();
                tokio::spawn(async move { backend.insert_chunk(TABLE, &records(0..100)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(backend.count_rows(TABLE).await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn writes_from_before_reset_are_dropped() {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tempdir.path());

        backend.prepare_schema(TABLE).await.unwrap();
        let stale = backend.table_state(TABLE).await.unwrap().generation;
        backend.reset(TABLE).await.unwrap();
        backend.prepare_schema(TABLE).await.unwrap();

        let current = backend.table_state(TABLE).await.unwrap().generation;
        assert_ne!(current, stale);

        // a write that was still running when the table was reset
        let batch = columnar::to_record_batch(&records(0..4)).unwrap();
        assert!(write_segment(&stale, &batch).is_err());

        assert_eq!(backend.count_rows(TABLE).await.unwrap(), Some(0));
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn prepare_keeps_current_generation() {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tempdir.path());

        backend.prepare_schema(TABLE).await.unwrap();
        backend.insert_chunk(TABLE, &records(0..4)).await.unwrap();
        let generation = backend.table_state(TABLE).await.unwrap().generation;

        backend.prepare_schema(TABLE).await.unwrap();
        let current = backend.table_state(TABLE).await.unwrap().generation;
        assert_eq!(current, generation);
        assert_eq!(backend.count_rows(TABLE).await.unwrap(), Some(4));
    }
}
