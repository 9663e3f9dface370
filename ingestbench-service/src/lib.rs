//! The service layer of the ingestion benchmark.
//!
//! It defines the [`Backend`](backend::Backend) contract every storage system under benchmark
//! has to satisfy, ships reference backends, and provides the [`ChunkedParallelLoader`] which
//! drives timed, concurrent bulk inserts through any backend.
//!
//! # Backend contract
//!
//! Backends expose schema preparation, reset, chunked inserts and size measurement for a named
//! table. Inserts must be safe to run concurrently for the same table and must be idempotent
//! on the `(time, tag_id)` natural key, which is what makes chunk retries and repeated sweeps
//! comparable across systems with very different write models.
//!
//! Schema operations and inserts never overlap for the same table: callers run
//! [`reset`](backend::Backend::reset), [`prepare_schema`](backend::Backend::prepare_schema), the
//! load and [`measure_size`](backend::Backend::measure_size) strictly in sequence.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod backend;
pub mod error;
pub mod loader;

pub use error::{AggregateInsertError, ChunkFailure, Error, Result, WorkerPanicError};
pub use loader::{Chunk, ChunkedParallelLoader, LoadOptions};
