use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ingestbench_types::TimeSeriesRecord;
use ingestbench_types::columnar::ColumnarError;
use thiserror::Error;
use tokio::time::Instant;

/// User agent string used for outgoing requests.
pub const USER_AGENT: &str = concat!("ingestbench/", env!("CARGO_PKG_VERSION"));

/// A type-erased [`Backend`] instance.
pub type BoxedBackend = Box<dyn Backend>;

/// A [`Backend`] handle shared by concurrent loader workers.
pub type SharedBackend = Arc<dyn Backend>;

/// A storage system under benchmark.
///
/// All operations address a named table (or stream, bucket, measurement) that holds records
/// with the fixed six-column schema. Implementations have to be `Sync`, which means a single
/// handle can always be shared by concurrent loader workers. Backends whose driver sessions are
/// not safe for concurrent use must pool them internally.
#[async_trait::async_trait]
pub trait Backend: Debug + Send + Sync + 'static {
    /// The backend name, used for diagnostics and report file names.
    fn name(&self) -> &'static str;

    /// Ensures the table exists.
    ///
    /// This is idempotent and succeeds if the table is already present.
    async fn prepare_schema(&self, table: &str) -> BackendResult<()>;

    /// Removes all data and schema of the table, including derived objects.
    ///
    /// This is idempotent and succeeds if the table does not exist.
    async fn reset(&self, table: &str) -> BackendResult<()>;

    /// Appends the records to the table.
    ///
    /// This may be called concurrently for the same table. Records whose `(time, tag_id)` key is
    /// already present must not produce duplicate rows, so a retried chunk leaves the same row
    /// count as a single successful insert.
    async fn insert_chunk(&self, table: &str, records: &[TimeSeriesRecord]) -> BackendResult<()>;

    /// Returns the on-disk footprint of the table and its derived objects in bytes.
    ///
    /// The reading reflects the steady state after all inserts have completed. Backends that
    /// compact asynchronously block until the reading is stable.
    async fn measure_size(&self, table: &str) -> BackendResult<u64>;

    /// Returns the number of rows stored in the table, if the backend can report it cheaply.
    async fn count_rows(&self, _table: &str) -> BackendResult<Option<u64>> {
        Ok(None)
    }
}

/// Creates fresh [`Backend`] handles.
///
/// The runner connects once per measurement and drops the handle afterwards.
#[async_trait::async_trait]
pub trait BackendFactory: Debug + Send + Sync + 'static {
    /// The name of the backends created by this factory.
    fn name(&self) -> &'static str;

    /// Opens a new backend handle.
    async fn connect(&self) -> BackendResult<BoxedBackend>;
}

/// A [`BackendFactory`] that hands out clones of a prototype backend.
///
/// Clones of the in-process backends share their storage, so every handle sees the same tables,
/// just like separate sessions against one database server would.
#[derive(Clone, Debug)]
pub struct CloningFactory<B>(B);

impl<B> CloningFactory<B> {
    /// Creates a factory handing out clones of `backend`.
    pub fn new(backend: B) -> Self {
        Self(backend)
    }
}

#[async_trait::async_trait]
impl<B> BackendFactory for CloningFactory<B>
where
    B: Backend + Clone,
{
    fn name(&self) -> &'static str {
        self.0.name()
    }

    async fn connect(&self) -> BackendResult<BoxedBackend> {
        Ok(Box::new(self.0.clone()))
    }
}

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// IO errors related to file operations.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors reading or writing Parquet files.
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Errors converting records to or from Arrow batches.
    #[error("columnar error: {0}")]
    Columnar(#[from] ColumnarError),

    /// All errors stemming from the reqwest client.
    ///
    /// These are network errors encountered when sending requests or decoding responses.
    #[error("reqwest error: {context}")]
    Reqwest {
        /// What the backend was doing when the error occurred.
        context: String,
        /// The underlying client error.
        #[source]
        cause: reqwest::Error,
    },

    /// A remote API answered with an unexpected status code.
    #[error("{context}: unexpected status {status}: {body}")]
    Status {
        /// What the backend was doing when the error occurred.
        context: String,
        /// The response status.
        status: reqwest::StatusCode,
        /// The response body, for diagnostics.
        body: String,
    },

    /// An operation addressed a table that has not been prepared.
    #[error("table `{0}` does not exist")]
    MissingTable(String),

    /// Any other error stemming from one of the storage backends.
    #[error("storage backend error: {context}")]
    Generic {
        /// What the backend was doing when the error occurred.
        context: String,
        /// The underlying error.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl BackendError {
    /// Creates a [`BackendError::Reqwest`] with the given context.
    pub fn reqwest(context: impl Into<String>, cause: reqwest::Error) -> Self {
        Self::Reqwest {
            context: context.into(),
            cause,
        }
    }

    /// Creates a [`BackendError::Generic`] with the given context.
    pub fn generic<E>(context: impl Into<String>, cause: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Generic {
            context: context.into(),
            cause: cause.into(),
        }
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Creates a reqwest client with required defaults.
pub fn reqwest_client() -> BackendResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|cause| BackendError::reqwest("building http client", cause))
}

/// Polls `measure` until two consecutive readings agree.
///
/// Backends that compact or flush asynchronously report a growing or shrinking size for a while
/// after the last insert. This waits for the figure to settle, but gives up after `max_wait` and
/// returns the last reading.
pub async fn wait_for_stable_size<F, Fut>(
    mut measure: F,
    poll_interval: Duration,
    max_wait: Duration,
) -> BackendResult<u64>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<u64>>,
{
    let deadline = Instant::now() + max_wait;
    let mut previous = measure().await?;

    loop {
        if Instant::now() >= deadline {
            tracing::warn!(
                size = previous,
                "size did not settle, reporting last reading"
            );
            return Ok(previous);
        }

        tokio::time::sleep(poll_interval).await;
        let current = measure().await?;
        if current == previous {
            return Ok(current);
        }
        tracing::trace!(previous, current, "size still changing");
        previous = current;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn stable_size_waits_for_settling() {
        let readings = Mutex::new(vec![300, 300, 200, 100]);
        let size = wait_for_stable_size(
            || {
                let next = readings.lock().unwrap().pop().unwrap();
                async move { Ok(next) }
            },
            Duration::from_millis(100),
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(size, 300);
        assert!(readings.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stable_size_gives_up() {
        let mut next = 0;
        let size = wait_for_stable_size(
            || {
                next += 1;
                let reading = next;
                async move { Ok(reading) }
            },
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        // one initial reading plus five polls before the deadline
        assert_eq!(size, 6);
    }

    #[tokio::test]
    async fn stable_size_propagates_errors() {
        let result = wait_for_stable_size(
            || async { Err(BackendError::MissingTable("_t".into())) },
            Duration::from_millis(1),
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(result, Err(BackendError::MissingTable(_))));
    }
}
