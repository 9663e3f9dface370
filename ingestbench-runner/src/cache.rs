//! Cross-run cache of generated datasets.
//!
//! Every case is stored as one Parquet file named after the case below the cache directory,
//! using the shared six-column schema of [`ingestbench_types::columnar`]. The seed of the
//! generator that produced the file is kept in the file's key-value metadata, so a run with a
//! different explicit seed regenerates the dataset instead of reusing stale data.

use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ingestbench_types::columnar::{self, ColumnarError};
use ingestbench_types::{CaseKey, Dataset};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use thiserror::Error;

use crate::generator::DataGenerator;

/// Key-value metadata entry holding the generator seed.
pub const SEED_METADATA_KEY: &str = "ingestbench.seed";

/// Number of records per written record batch.
const BATCH_ROWS: usize = 64 * 1024;

/// Errors reading or writing cached datasets.
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO errors related to cache files.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors reading or writing Parquet files.
    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),

    /// The file content does not match the dataset schema.
    #[error("columnar error: {0}")]
    Columnar(#[from] ColumnarError),

    /// The file does not hold a valid dataset for its case.
    #[error("corrupt cache file {path}: {reason}")]
    Corrupt {
        /// The offending file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// The dataset could not be generated.
    #[error(transparent)]
    Generate(#[from] ingestbench_service::Error),
}

impl CacheError {
    /// Returns `true` if a cache file exists but does not hold a readable dataset.
    pub fn is_invalid_content(&self) -> bool {
        matches!(
            self,
            Self::Parquet(_) | Self::Columnar(_) | Self::Corrupt { .. }
        )
    }
}

/// A directory of cached datasets.
#[derive(Clone, Debug)]
pub struct DatasetCache {
    dir: PathBuf,
}

impl DatasetCache {
    /// Creates a cache below `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the cache file for a case.
    pub fn path(&self, key: CaseKey) -> PathBuf {
        self.dir.join(format!("{key}.parquet"))
    }

    /// Reads a cached dataset together with the seed it was generated from.
    ///
    /// Returns `None` if there is no cache file for the case.
    pub fn read(&self, key: CaseKey) -> Result<Option<(Dataset, Option<u64>)>, CacheError> {
        let path = self.path(key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let seed = builder
            .metadata()
            .file_metadata()
            .key_value_metadata()
            .and_then(|entries| entries.iter().find(|kv| kv.key == SEED_METADATA_KEY))
            .and_then(|kv| kv.value.as_deref())
            .and_then(|value| value.parse().ok());

        let mut records = Vec::new();
        for batch in builder.build()? {
            let batch = batch.map_err(ColumnarError::from)?;
            records.extend(columnar::from_record_batch(&batch)?);
        }

        let dataset = Dataset::new(key, records);
        if Some(dataset.len() as u64) != key.record_count() {
            return Err(CacheError::Corrupt {
                path,
                reason: format!("holds {} records", dataset.len()),
            });
        }
        if !dataset.is_sorted_unique() {
            return Err(CacheError::Corrupt {
                path,
                reason: "records are not ordered by time and tag".into(),
            });
        }

        Ok(Some((dataset, seed)))
    }

    /// Writes a dataset to its cache file, replacing any previous file atomically.
    pub fn write(&self, dataset: &Dataset, seed: u64) -> Result<PathBuf, CacheError> {
        std::fs::create_dir_all(&self.dir)?;

        let path = self.path(dataset.key());
        let temp = self
            .dir
            .join(format!(".{}.{}.tmp", dataset.key(), uuid::Uuid::new_v4()));

        let result = (|| -> Result<(), CacheError> {
            let props = WriterProperties::builder()
                .set_compression(Compression::SNAPPY)
                .set_key_value_metadata(Some(vec![KeyValue::new(
                    SEED_METADATA_KEY.to_owned(),
                    seed.to_string(),
                )]))
                .build();

            let mut writer =
                ArrowWriter::try_new(File::create(&temp)?, columnar::schema(), Some(props))?;
            for chunk in dataset.chunks(BATCH_ROWS) {
                writer.write(&columnar::to_record_batch(chunk)?)?;
            }
            writer.into_inner()?.sync_all()?;
            std::fs::rename(&temp, &path)?;
            Ok(())
        })();

        if let Err(err) = result {
            std::fs::remove_file(&temp).ok();
            return Err(err);
        }

        tracing::debug!(
            path = %path.display(),
            records = dataset.len(),
            "wrote cached dataset"
        );
        Ok(path)
    }

    /// Returns the cached dataset of a case, generating and caching it if needed.
    ///
    /// A cached file is reused unless the generator has an explicit seed that differs from the
    /// one stored in the file. Unreadable or corrupt files are replaced.
    pub fn load_or_generate(
        &self,
        key: CaseKey,
        generator: &DataGenerator,
    ) -> Result<Dataset, CacheError> {
        match self.read(key) {
            Ok(Some((dataset, stored))) => {
                if !generator.is_seeded() || stored == Some(generator.seed()) {
                    tracing::debug!(case = %key, "using cached dataset");
                    return Ok(dataset);
                }
                tracing::info!(
                    case = %key,
                    ?stored,
                    seed = generator.seed(),
                    "seed changed, regenerating dataset"
                );
            }
            Ok(None) => (),
            Err(err) if err.is_invalid_content() => {
                tracing::warn!(
                    case = %key,
                    error = &err as &dyn std::error::Error,
                    "discarding unreadable cached dataset"
                );
            }
            Err(err) => return Err(err),
        }

        let dataset = generator.generate(key)?;
        self.write(&dataset, generator.seed())?;
        Ok(dataset)
    }
}
