use std::fmt;
use std::ops::Range;
use std::time::Duration;

use thiserror::Error;

use crate::backend::common::BackendError;

/// Errors raised while preparing or loading a benchmark case.
#[derive(Debug, Error)]
pub enum Error {
    /// Case or loader parameters are invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A backend operation outside the parallel load failed.
    #[error("{backend} backend error")]
    Backend {
        /// Name of the failing backend.
        backend: &'static str,
        /// The underlying backend error.
        #[source]
        cause: BackendError,
    },

    /// One or more chunk inserts failed.
    #[error(transparent)]
    AggregateInsert(#[from] AggregateInsertError),

    /// The load did not finish within its deadline.
    #[error("load timed out after {0:?}")]
    TimedOut(Duration),

    /// One or more loader workers panicked.
    #[error(transparent)]
    WorkerPanic(#[from] WorkerPanicError),
}

impl Error {
    /// Wraps a [`BackendError`] raised by the named backend.
    pub fn backend(backend: &'static str, cause: BackendError) -> Self {
        Self::Backend { backend, cause }
    }
}

/// Result type for loader and runner operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A single chunk insert that failed, after all retries.
#[derive(Debug)]
pub struct ChunkFailure {
    /// Position of the chunk within the dataset's chunk sequence.
    pub index: usize,
    /// The records covered by the chunk.
    pub records: Range<usize>,
    /// Number of insert attempts made.
    pub attempts: usize,
    /// The error of the final attempt.
    pub cause: BackendError,
}

impl fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk {} (records {}..{}, {} attempt{}): {}",
            self.index,
            self.records.start,
            self.records.end,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" },
            self.cause,
        )
    }
}

/// All chunk failures of one parallel load.
///
/// The failures are sorted by chunk index. Successful chunks of the same load are not listed.
#[derive(Debug)]
pub struct AggregateInsertError {
    /// Name of the backend the load ran against.
    pub backend: &'static str,
    /// Number of chunks dispatched by the load.
    pub total_chunks: usize,
    /// Every failed chunk.
    pub failures: Vec<ChunkFailure>,
}

impl fmt::Display for AggregateInsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} chunks failed to insert into {}",
            self.failures.len(),
            self.total_chunks,
            self.backend
        )?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateInsertError {}

/// Loader workers that panicked, along with the chunk failures of the workers that finished.
///
/// The chunks assigned to a panicked worker are in an unknown state.
#[derive(Debug)]
pub struct WorkerPanicError {
    /// Name of the backend the load ran against.
    pub backend: &'static str,
    /// Indexes of the panicked workers, ascending.
    pub workers: Vec<usize>,
    /// Failed chunks of the remaining workers, sorted by chunk index.
    pub failures: Vec<ChunkFailure>,
}

impl fmt::Display for WorkerPanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plural = if self.workers.len() == 1 { "" } else { "s" };
        write!(f, "loader worker{plural} ")?;
        for (i, worker) in self.workers.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{worker}")?;
        }
        write!(f, " panicked while inserting into {}", self.backend)?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for WorkerPanicError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_lists_every_failure() {
        let error = AggregateInsertError {
            backend: "memory",
            total_chunks: 5,
            failures: vec![
                ChunkFailure {
                    index: 1,
                    records: 20..40,
                    attempts: 1,
                    cause: BackendError::MissingTable("_a".into()),
                },
                ChunkFailure {
                    index: 4,
                    records: 80..90,
                    attempts: 3,
                    cause: BackendError::MissingTable("_b".into()),
                },
            ],
        };

        assert_eq!(
            error.to_string(),
            "2 of 5 chunks failed to insert into memory; \
             chunk 1 (records 20..40, 1 attempt): table `_a` does not exist; \
             chunk 4 (records 80..90, 3 attempts): table `_b` does not exist"
        );
    }

    #[test]
    fn worker_panic_lists_remaining_failures() {
        let error = WorkerPanicError {
            backend: "memory",
            workers: vec![1, 3],
            failures: vec![ChunkFailure {
                index: 2,
                records: 40..60,
                attempts: 1,
                cause: BackendError::MissingTable("_a".into()),
            }],
        };

        assert_eq!(
            error.to_string(),
            "loader workers 1, 3 panicked while inserting into memory; \
             chunk 2 (records 40..60, 1 attempt): table `_a` does not exist"
        );
    }

    #[test]
    fn backend_error_names_backend() {
        let error = Error::backend("filesystem", BackendError::MissingTable("_t".into()));
        assert_eq!(error.to_string(), "filesystem backend error");

        let source = std::error::Error::source(&error).unwrap();
        assert_eq!(source.to_string(), "table `_t` does not exist");
    }
}
