//! Test utilities for the ingestion benchmark.
//!
//! This crate provides utilities to facilitate testing of backends, the loader and the runner.
//! See the modules for all available utilities.

pub mod backends;
pub mod tracing;
