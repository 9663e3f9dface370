//! Orchestration of a benchmark sweep.
//!
//! For every case the [`Runner`] produces the dataset once, then measures it against every
//! [`Target`] and worker count in turn. Each measurement opens a fresh backend handle and runs
//! reset, schema preparation, the parallel load and size measurement strictly in sequence. A
//! failing measurement is recorded as a failed [`CaseResult`] and the sweep moves on.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use ingestbench_service::backend::{BackendFactory, SharedBackend};
use ingestbench_service::{ChunkedParallelLoader, Error, LoadOptions, Result};
use ingestbench_types::{CaseKey, CaseResult, CaseStatus, Dataset};

use crate::cache::{CacheError, DatasetCache};
use crate::generator::DataGenerator;
use crate::matrix::CaseSpec;
use crate::report::{ResultsSink, print_result};

/// A backend measured by the runner.
#[derive(Debug)]
pub struct Target {
    /// Opens a fresh handle for every measurement.
    pub factory: Box<dyn BackendFactory>,
    /// Maximum number of records per insert call.
    pub chunk_size: usize,
    /// Whether the backend runs on a remote host.
    pub remote: bool,
}

impl Target {
    /// Creates a target.
    pub fn new(factory: Box<dyn BackendFactory>, chunk_size: usize, remote: bool) -> Self {
        Self {
            factory,
            chunk_size,
            remote,
        }
    }

    /// The name of the measured backend.
    pub fn name(&self) -> &'static str {
        self.factory.name()
    }
}

/// Why a measurement did not produce a result.
#[derive(Debug)]
struct Failure {
    status: CaseStatus,
    message: String,
}

impl Failure {
    fn new(status: CaseStatus, error: &(dyn std::error::Error + 'static)) -> Self {
        Self {
            status,
            message: error_chain(error),
        }
    }
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Self::new(status_of(&error), &error)
    }
}

impl From<CacheError> for Failure {
    fn from(error: CacheError) -> Self {
        let status = match &error {
            CacheError::Generate(inner) => status_of(inner),
            _ => CaseStatus::Failed,
        };
        Self::new(status, &error)
    }
}

fn status_of(error: &Error) -> CaseStatus {
    match error {
        Error::InvalidArgument(_) => CaseStatus::Invalid,
        Error::TimedOut(_) => CaseStatus::TimedOut,
        _ => CaseStatus::Failed,
    }
}

/// Renders an error with all of its sources, skipping sources already contained in the message.
fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Runs benchmark cases against a set of targets.
#[derive(Debug)]
pub struct Runner {
    generator: DataGenerator,
    cache: Option<DatasetCache>,
    options: LoadOptions,
    progress: bool,
}

impl Runner {
    /// Creates a runner generating datasets with `generator`, without a cache.
    pub fn new(generator: DataGenerator) -> Self {
        Self {
            generator,
            cache: None,
            options: LoadOptions::default(),
            progress: false,
        }
    }

    /// Reads and writes datasets through `cache`.
    pub fn with_cache(mut self, cache: DatasetCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets retries and deadline of every load.
    pub fn with_load_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    /// Shows a spinner while a measurement is running.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Measures every case against every target and worker count.
    ///
    /// Results are recorded into `sink` as soon as they are produced and also returned in
    /// order. Failing measurements do not abort the sweep; only a failing sink does.
    pub async fn run<S>(
        &self,
        cases: &[CaseSpec],
        targets: &[Target],
        sink: &mut S,
    ) -> anyhow::Result<Vec<CaseResult>>
    where
        S: ResultsSink + ?Sized,
    {
        let mut results = Vec::new();

        for case in cases {
            let dataset = self.dataset(case.key).await;
            if let Err(failure) = &dataset {
                tracing::error!(
                    case = %case.key,
                    error = %failure.message,
                    "failed to produce dataset"
                );
            }

            for target in targets {
                for &workers in &case.worker_counts {
                    let result = match &dataset {
                        Ok(dataset) => self.measure(target, dataset, workers).await,
                        Err(failure) => {
                            let records = case.key.record_count().unwrap_or_default();
                            failed(row(case.key, target, workers, records), failure)
                        }
                    };

                    report(&result);
                    sink.record(&result)?;
                    results.push(result);
                }
            }
        }

        Ok(results)
    }

    /// Produces the dataset of a case, from the cache if one is configured.
    async fn dataset(&self, key: CaseKey) -> Result<Dataset, Failure> {
        let generator = self.generator.clone();
        let cache = self.cache.clone();

        let task = tokio::task::spawn_blocking(move || match cache {
            Some(cache) => cache.load_or_generate(key, &generator),
            None => Ok(generator.generate(key)?),
        });

        match task.await {
            Ok(Ok(dataset)) => Ok(dataset),
            Ok(Err(error)) => Err(error.into()),
            Err(error) => Err(Failure::new(CaseStatus::Failed, &error)),
        }
    }

    async fn measure(&self, target: &Target, dataset: &Dataset, workers: usize) -> CaseResult {
        let key = dataset.key();
        let result = row(key, target, workers, dataset.len() as u64);

        let spinner = self.spinner(format!("{} {key} (workers: {workers}):", target.name()));
        let outcome = self.try_measure(target, dataset, workers).await;
        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }

        match outcome {
            Ok((elapsed, size)) => CaseResult {
                table_size_bytes: Some(size),
                insert_duration_seconds: Some(elapsed.as_secs_f64()),
                ..result
            },
            Err(error) => failed(result, &error.into()),
        }
    }

    async fn try_measure(
        &self,
        target: &Target,
        dataset: &Dataset,
        workers: usize,
    ) -> Result<(Duration, u64)> {
        let name = target.name();
        let loader = ChunkedParallelLoader::new(target.chunk_size, workers)?
            .with_options(self.options.clone());

        let backend: SharedBackend = Arc::from(
            target
                .factory
                .connect()
                .await
                .map_err(|e| Error::backend(name, e))?,
        );
        let table = dataset.key().table_name();

        backend
            .reset(&table)
            .await
            .map_err(|e| Error::backend(name, e))?;
        backend
            .prepare_schema(&table)
            .await
            .map_err(|e| Error::backend(name, e))?;

        let elapsed = loader.load(&backend, &table, dataset).await?;

        let size = backend
            .measure_size(&table)
            .await
            .map_err(|e| Error::backend(name, e))?;

        match backend.count_rows(&table).await {
            Ok(Some(rows)) if rows != dataset.len() as u64 => {
                tracing::warn!(
                    backend = name,
                    table,
                    rows,
                    expected = dataset.len(),
                    "stored row count differs from dataset"
                );
            }
            Ok(_) => {}
            Err(error) => {
                tracing::debug!(
                    backend = name,
                    table,
                    error = %error,
                    "failed to count rows"
                );
            }
        }

        Ok((elapsed, size))
    }

    fn spinner(&self, message: String) -> Option<ProgressBar> {
        if !self.progress {
            return None;
        }

        let style = ProgressStyle::with_template("{spinner} {msg} {elapsed}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        let bar = ProgressBar::new_spinner()
            .with_style(style)
            .with_message(message);
        bar.enable_steady_tick(Duration::from_millis(100));
        Some(bar)
    }
}

/// A successful result row without measurements.
fn row(key: CaseKey, target: &Target, workers: usize, record_count: u64) -> CaseResult {
    CaseResult {
        backend: target.name().to_owned(),
        duration_minutes: key.duration_minutes,
        tag_count: key.tag_count,
        sampling_interval_seconds: key.sampling_interval_seconds,
        record_count,
        table_size_bytes: None,
        insert_duration_seconds: None,
        worker_count: workers,
        is_remote: target.remote,
        status: CaseStatus::Ok,
        error: None,
    }
}

fn failed(result: CaseResult, failure: &Failure) -> CaseResult {
    CaseResult {
        table_size_bytes: None,
        insert_duration_seconds: None,
        status: failure.status,
        error: Some(failure.message.clone()),
        ..result
    }
}

fn report(result: &CaseResult) {
    if result.is_ok() {
        tracing::info!(
            backend = %result.backend,
            case = %result.key(),
            workers = result.worker_count,
            records = result.record_count,
            seconds = result.insert_duration_seconds,
            bytes = result.table_size_bytes,
            "measured case"
        );
    } else {
        tracing::warn!(
            backend = %result.backend,
            case = %result.key(),
            workers = result.worker_count,
            status = ?result.status,
            error = result.error.as_deref(),
            "case failed"
        );
    }

    print_result(result);
}
