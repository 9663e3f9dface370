//! Storage backends under benchmark.
//!
//! Every backend implements [`Backend`](common::Backend). The runner never talks to a backend
//! type directly: it receives a [`BackendFactory`](common::BackendFactory) created from a
//! [`StorageConfig`] and opens a fresh handle for every measurement.

use std::path::Path;
use std::time::Duration;

pub mod common;
pub mod in_memory;
pub mod line_protocol;
pub mod local_fs;

pub use common::{
    Backend, BackendError, BackendFactory, BackendResult, BoxedBackend, CloningFactory,
    SharedBackend,
};

/// Configuration to create a [`BackendFactory`].
#[derive(Debug, Clone)]
pub enum StorageConfig<'a> {
    /// Keep tables in process memory.
    Memory {
        /// Maintain per-minute rollups for one-second cases.
        rollups: bool,
    },
    /// Write Parquet segments to the local filesystem.
    FileSystem {
        /// The directory below which tables are stored.
        path: &'a Path,
    },
    /// Write line protocol to an InfluxDB v2 compatible server.
    LineProtocol {
        /// Base URL of the server.
        endpoint: &'a str,
        /// Name of the organization owning the buckets.
        org: &'a str,
        /// API token of the organization.
        token: &'a str,
        /// Interval between size readings while waiting for compaction.
        size_poll_interval: Duration,
        /// Upper bound for waiting on a stable size reading.
        size_max_wait: Duration,
    },
}

/// Creates the factory for the configured backend.
pub fn create_factory(config: StorageConfig<'_>) -> Box<dyn BackendFactory> {
    match config {
        StorageConfig::Memory { rollups: false } => {
            Box::new(CloningFactory::new(in_memory::InMemoryBackend::new()))
        }
        StorageConfig::Memory { rollups: true } => {
            Box::new(CloningFactory::new(in_memory::InMemoryBackend::with_rollups()))
        }
        StorageConfig::FileSystem { path } => Box::new(local_fs::LocalFsFactory::new(path)),
        StorageConfig::LineProtocol {
            endpoint,
            org,
            token,
            size_poll_interval,
            size_max_wait,
        } => Box::new(line_protocol::LineProtocolFactory::new(
            line_protocol::LineProtocolConfig {
                endpoint: endpoint.into(),
                org: org.into(),
                token: token.into(),
                size_poll_interval,
                size_max_wait,
            },
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_factory_shares_tables() {
        let factory = create_factory(StorageConfig::Memory { rollups: false });
        assert_eq!(factory.name(), "memory");

        let first = factory.connect().await.unwrap();
        first.prepare_schema("_t").await.unwrap();

        let second = factory.connect().await.unwrap();
        assert_eq!(second.measure_size("_t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn filesystem_factory_creates_root() {
        let tempdir = tempfile::tempdir().unwrap();
        let root = tempdir.path().join("nested").join("root");

        let factory = create_factory(StorageConfig::FileSystem { path: &root });
        assert_eq!(factory.name(), "filesystem");

        let backend = factory.connect().await.unwrap();
        assert!(root.is_dir());
        backend.prepare_schema("_t").await.unwrap();
        assert!(root.join("_t").is_dir());
    }
}
