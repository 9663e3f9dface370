//! Shared data model of the ingestion benchmark.
//!
//! This crate defines the types that flow between the data generator, the storage backends and
//! the benchmark runner:
//!
//!  - [`TimeSeriesRecord`] and its single-valued [`Value`] payload
//!  - [`Dataset`], an immutable, sorted collection of records identified by a [`CaseKey`]
//!  - [`CaseResult`], one measured row of the benchmark report
//!
//! The [`columnar`] module converts records to and from Arrow record batches, which is the
//! representation used by the dataset cache and by columnar backends.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod case;
pub mod columnar;
pub mod dataset;
pub mod record;

pub use case::{CaseKey, CaseResult, CaseStatus};
pub use dataset::Dataset;
pub use record::{NaturalKey, TimeSeriesRecord, Value, ValueKind};
