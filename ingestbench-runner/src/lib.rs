//! The benchmark runner.
//!
//! This builds on top of [`ingestbench_service`] and drives complete benchmark sweeps: it
//! generates (or loads cached) synthetic datasets for every case of the configured matrix, loads
//! them into each configured backend with the [`ChunkedParallelLoader`], measures the resulting
//! footprint, and appends one row per measurement to the results report.
//!
//! [`ChunkedParallelLoader`]: ingestbench_service::ChunkedParallelLoader
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod generator;
pub mod matrix;
pub mod observability;
pub mod report;
pub mod runner;
