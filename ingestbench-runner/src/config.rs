//! Configuration of a benchmark sweep.
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `IB__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! # Environment Variables
//!
//! Environment variables use `IB__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `IB__GENERATOR__SEED=42` fixes the generator seed
//! - `IB__LOAD__TIMEOUT=10m` aborts loads running longer than ten minutes
//! - `IB__MATRIX__TAG_COUNT=[10,100,1000]` replaces the tag counts of the matrix
//!
//! # YAML Configuration File
//!
//! ```yaml
//! matrix:
//!   duration_minutes: [5, 60]
//!   tag_count: [10, 100]
//!   sampling_interval_seconds: [1, 60]
//!   worker_count: [1, 4]
//!
//! backends:
//!   - type: filesystem
//!     path: data/tables
//!     chunk_size: 50000
//!   - type: line_protocol
//!     endpoint: http://influx.internal:8086
//!     org: bench
//!     token: secret
//!     remote: true
//! ```

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use ingestbench_service::LoadOptions;
use ingestbench_service::backend::{BackendFactory, StorageConfig, create_factory};
use secrecy::{CloneableSecret, ExposeSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::matrix::CaseMatrix;
use crate::runner::Target;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "IB__";

/// Default number of records per insert chunk.
const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Newtype around `String` that protects against accidental logging of secrets. Use with
/// [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    /// Returns the secret value.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl std::ops::Deref for ConfigSecret {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

fn default_size_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_size_max_wait() -> Duration {
    Duration::from_secs(60)
}

/// Storage backend configuration.
///
/// The `type` field in YAML determines which variant is used.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Storage {
    /// In-process tables (type `"memory"`).
    ///
    /// Useful as a baseline and for smoke-testing a configuration.
    Memory {
        /// Maintain per-minute rollups for cases sampled every second.
        #[serde(default)]
        rollups: bool,
    },

    /// Parquet segments on the local filesystem (type `"filesystem"`).
    ///
    /// # Example
    ///
    /// ```yaml
    /// backends:
    ///   - type: filesystem
    ///     path: data/tables
    /// ```
    Filesystem {
        /// Directory below which every table gets its own subdirectory.
        ///
        /// The directory will be created if it doesn't exist.
        path: PathBuf,
    },

    /// An InfluxDB v2 compatible server written to via line protocol (type `"line_protocol"`).
    ///
    /// Every case is stored in its own bucket, which is dropped and recreated on reset.
    LineProtocol {
        /// Base URL of the server, for example `http://localhost:8086`.
        endpoint: String,
        /// Name of the organization owning the buckets.
        org: String,
        /// API token with read and write access to the organization.
        token: SecretBox<ConfigSecret>,
        /// Interval between size readings while waiting for compaction to settle.
        ///
        /// Defaults to `1s`.
        #[serde(default = "default_size_poll_interval", with = "humantime_serde")]
        size_poll_interval: Duration,
        /// Upper bound for waiting on a stable size reading.
        ///
        /// Defaults to `60s`.
        #[serde(default = "default_size_max_wait", with = "humantime_serde")]
        size_max_wait: Duration,
    },
}

impl Storage {
    fn as_storage_config(&self) -> StorageConfig<'_> {
        match self {
            Storage::Memory { rollups } => StorageConfig::Memory { rollups: *rollups },
            Storage::Filesystem { path } => StorageConfig::FileSystem { path },
            Storage::LineProtocol {
                endpoint,
                org,
                token,
                size_poll_interval,
                size_max_wait,
            } => StorageConfig::LineProtocol {
                endpoint,
                org,
                token: token.expose_secret().as_str(),
                size_poll_interval: *size_poll_interval,
                size_max_wait: *size_max_wait,
            },
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

/// One backend measured by the sweep.
#[derive(Debug, Deserialize, Serialize)]
pub struct BackendTarget {
    /// Maximum number of records per insert call.
    ///
    /// Defaults to `10000`.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Whether the backend runs on a remote host. Only used to label results.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    pub remote: bool,

    /// The storage system to connect to.
    #[serde(flatten)]
    pub storage: Storage,
}

impl BackendTarget {
    /// Creates the backend factory of this target.
    pub fn factory(&self) -> Box<dyn BackendFactory> {
        create_factory(self.storage.as_storage_config())
    }

    /// Creates the runner target for this backend.
    pub fn target(&self) -> Target {
        Target::new(self.factory(), self.chunk_size, self.remote)
    }
}

impl Default for BackendTarget {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            remote: false,
            storage: Storage::Memory { rollups: false },
        }
    }
}

/// Dataset generator configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Generator {
    /// Base seed of all generated datasets.
    ///
    /// When unset, a random seed is drawn and logged for every run, and cached datasets are
    /// reused regardless of the seed they were generated with.
    ///
    /// # Environment Variable
    ///
    /// `IB__GENERATOR__SEED`
    pub seed: Option<u64>,
}

/// Dataset cache configuration.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Cache {
    /// Whether generated datasets are cached across runs.
    ///
    /// Defaults to `true`.
    pub enabled: bool,

    /// Directory holding one Parquet file per case.
    ///
    /// Defaults to `data/cache`.
    pub dir: PathBuf,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("data/cache"),
        }
    }
}

/// Results report configuration.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Results {
    /// Directory receiving the CSV reports.
    ///
    /// Defaults to `results`.
    pub dir: PathBuf,
}

impl Default for Results {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("results"),
        }
    }
}

/// Loader configuration shared by all backends.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Load {
    /// Deadline of a single load, for example `10m`.
    ///
    /// Loads exceeding it are aborted and recorded as timed out. Defaults to no deadline.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// How often a failed chunk insert is retried.
    ///
    /// Defaults to `0`.
    pub retries: usize,

    /// Pause between two attempts of the same chunk.
    ///
    /// Defaults to `1s`.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Load {
    /// Returns the loader options described by this section.
    pub fn options(&self) -> LoadOptions {
        LoadOptions {
            retries: self.retries,
            retry_backoff: self.retry_backoff,
            timeout: self.timeout,
        }
    }
}

impl Default for Load {
    fn default() -> Self {
        Self {
            timeout: None,
            retries: 0,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Runtime configuration for the Tokio async runtime.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Runtime {
    /// Number of worker threads of the runtime driving the loader workers.
    ///
    /// Defaults to the number of CPU cores on the host machine.
    ///
    /// # Environment Variable
    ///
    /// `IB__RUNTIME__WORKER_THREADS`
    pub worker_threads: usize,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
        }
    }
}

/// [Sentry](https://sentry.io/) error reporting configuration.
///
/// Sentry is disabled by default and only enabled when a DSN is provided.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Sentry {
    /// Sentry DSN.
    ///
    /// # Environment Variable
    ///
    /// `IB__SENTRY__DSN`
    pub dsn: Option<SecretBox<ConfigSecret>>,

    /// Environment name attached to all events.
    pub environment: Option<Cow<'static, str>>,

    /// Error event sampling rate.
    ///
    /// Defaults to `1.0`.
    pub sample_rate: f32,

    /// Performance trace sampling rate.
    ///
    /// Defaults to `0.01`.
    pub traces_sample_rate: f32,
}

impl Sentry {
    /// Returns whether Sentry integration is enabled.
    pub fn is_enabled(&self) -> bool {
        self.dsn.is_some()
    }
}

impl Default for Sentry {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: None,
            sample_rate: 1.0,
            traces_sample_rate: 0.01,
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Simplified plain text output.
    Simplified,

    /// Dump out JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

impl std::error::Error for FormatParseError {}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr, so they never interleave with the result summaries on
/// stdout.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// The `RUST_LOG` environment variable provides more granular control per module if needed.
    ///
    /// Defaults to `INFO`.
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    ///
    /// Defaults to `auto`.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration struct of the benchmark.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The cases to measure.
    pub matrix: CaseMatrix,
    /// Dataset generation.
    pub generator: Generator,
    /// Cross-run dataset cache.
    pub cache: Cache,
    /// Results reports.
    pub results: Results,
    /// Loader retries and deadlines.
    pub load: Load,
    /// The backends to measure, in order.
    ///
    /// Defaults to a single in-memory backend.
    pub backends: Vec<BackendTarget>,
    /// Async runtime.
    pub runtime: Runtime,
    /// Log output.
    pub logging: Logging,
    /// Error reporting.
    pub sentry: Sentry,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            matrix: CaseMatrix::default(),
            generator: Generator::default(),
            cache: Cache::default(),
            results: Results::default(),
            load: Load::default(),
            backends: vec![BackendTarget::default()],
            runtime: Runtime::default(),
            logging: Logging::default(),
            sentry: Sentry::default(),
        }
    }
}

impl Config {
    /// Loads configuration from an optional YAML file and the environment.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if provided)
    /// 3. Environment variables (prefixed with `IB__`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("failed to load configuration")?;

        if let Some(target) = config.backends.iter().find(|t| t.chunk_size == 0) {
            anyhow::bail!(
                "chunk_size of {:?} backend must be positive",
                target.storage
            );
        }

        Ok(config)
    }

    /// Creates the runner targets of all configured backends.
    pub fn targets(&self) -> Vec<Target> {
        self.backends.iter().map(BackendTarget::target).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None).unwrap();

            assert_eq!(config.matrix.tag_count, [10, 100].into());
            assert_eq!(config.generator.seed, None);
            assert!(config.cache.enabled);
            assert_eq!(config.load.retries, 0);
            assert_eq!(config.load.timeout, None);
            assert_eq!(config.backends.len(), 1);
            assert!(matches!(
                config.backends[0].storage,
                Storage::Memory { rollups: false }
            ));
            assert!(!config.sentry.is_enabled());

            Ok(())
        });
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("IB__GENERATOR__SEED", "42");
            jail.set_env("IB__MATRIX__TAG_COUNT", "[5, 50]");
            jail.set_env("IB__LOAD__TIMEOUT", "10m");
            jail.set_env("IB__LOAD__RETRIES", "2");
            jail.set_env("IB__LOGGING__LEVEL", "debug");
            jail.set_env("IB__LOGGING__FORMAT", "json");
            jail.set_env("IB__SENTRY__DSN", "abcde");
            jail.set_env("IB__SENTRY__SAMPLE_RATE", "0.5");

            let config = Config::load(None).unwrap();

            assert_eq!(config.generator.seed, Some(42));
            assert_eq!(config.matrix.tag_count, [5, 50].into());
            assert_eq!(config.load.timeout, Some(Duration::from_secs(600)));
            assert_eq!(config.load.retries, 2);
            assert_eq!(config.logging.level, LevelFilter::DEBUG);
            assert_eq!(config.logging.format, LogFormat::Json);
            assert_eq!(config.sentry.dsn.unwrap().expose_secret().as_str(), "abcde");
            assert_eq!(config.sentry.sample_rate, 0.5);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            matrix:
                duration_minutes: [5]
                tag_count: [10]
                sampling_interval_seconds: [60]
                worker_count: [1, 2]
            backends:
                - type: filesystem
                  path: /data/tables
                  chunk_size: 500
                - type: line_protocol
                  endpoint: http://localhost:8086
                  org: bench
                  token: secret-token
                  remote: true
                  size_max_wait: 5s
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path())).unwrap();

            assert_eq!(config.matrix.worker_count, [1, 2].into());
            assert_eq!(config.backends.len(), 2);

            let fs = &config.backends[0];
            assert_eq!(fs.chunk_size, 500);
            assert!(!fs.remote);
            let Storage::Filesystem { path } = &fs.storage else {
                panic!("expected filesystem storage");
            };
            assert_eq!(path, Path::new("/data/tables"));

            let lp = &config.backends[1];
            assert_eq!(lp.chunk_size, DEFAULT_CHUNK_SIZE);
            assert!(lp.remote);
            let Storage::LineProtocol {
                endpoint,
                token,
                size_poll_interval,
                size_max_wait,
                ..
            } = &lp.storage
            else {
                panic!("expected line protocol storage");
            };
            assert_eq!(endpoint, "http://localhost:8086");
            assert_eq!(token.expose_secret().as_str(), "secret-token");
            assert_eq!(*size_poll_interval, Duration::from_secs(1));
            assert_eq!(*size_max_wait, Duration::from_secs(5));

            // secrets never show up in debug output
            assert!(!format!("{config:?}").contains("secret-token"));

            Ok(())
        });
    }

    #[test]
    fn configured_with_env_and_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            generator:
                seed: 1
            results:
                dir: /tmp/results
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("IB__GENERATOR__SEED", "2");

            let config = Config::load(Some(tempfile.path())).unwrap();

            // Env should overwrite the yaml config
            assert_eq!(config.generator.seed, Some(2));
            assert_eq!(config.results.dir, Path::new("/tmp/results"));

            Ok(())
        });
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            backends:
                - type: memory
                  chunk_size: 0
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            assert!(Config::load(Some(tempfile.path())).is_err());
            Ok(())
        });
    }
}
