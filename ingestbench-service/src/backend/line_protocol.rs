//! Backend for time-series databases speaking the InfluxDB v2 HTTP API.
//!
//! Tables map to buckets. Each record becomes one point of the measurement named after the
//! table, tagged with its `tag_id` and carrying a single typed field named after the value
//! column. Points with the same measurement, tag set and timestamp overwrite each other, which
//! gives idempotent inserts on the natural key.

use std::collections::HashMap;
use std::fmt::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ingestbench_types::{TimeSeriesRecord, Value};
use reqwest::header::AUTHORIZATION;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tokio::sync::OnceCell;

use super::common::{
    Backend, BackendError, BackendFactory, BackendResult, BoxedBackend, reqwest_client,
    wait_for_stable_size,
};

/// Prometheus metric reporting the on-disk size of a storage shard.
const SHARD_SIZE_METRIC: &str = "storage_shard_disk_size";

/// Connection settings for a [`LineProtocolBackend`].
#[derive(Clone)]
pub struct LineProtocolConfig {
    /// Base URL of the server, for example `http://localhost:8086`.
    pub endpoint: String,
    /// Name of the organization owning the buckets.
    pub org: String,
    /// API token with read and write access to the organization.
    pub token: String,
    /// Interval between size readings while waiting for compaction to settle.
    pub size_poll_interval: Duration,
    /// Upper bound for waiting on a stable size reading.
    pub size_max_wait: Duration,
}

impl fmt::Debug for LineProtocolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineProtocolConfig")
            .field("endpoint", &self.endpoint)
            .field("org", &self.org)
            .field("token", &"[redacted]")
            .field("size_poll_interval", &self.size_poll_interval)
            .field("size_max_wait", &self.size_max_wait)
            .finish()
    }
}

#[derive(Deserialize)]
struct Orgs {
    orgs: Vec<Resource>,
}

#[derive(Deserialize)]
struct Buckets {
    buckets: Vec<Resource>,
}

#[derive(Deserialize)]
struct Resource {
    id: String,
}

/// A [`Backend`] writing line protocol over HTTP.
pub struct LineProtocolBackend {
    client: reqwest::Client,
    config: Arc<LineProtocolConfig>,
    org_id: OnceCell<String>,
    bucket_ids: Mutex<HashMap<String, String>>,
}

impl LineProtocolBackend {
    /// Creates a new backend without contacting the server.
    pub fn new(config: LineProtocolConfig) -> BackendResult<Self> {
        Ok(Self {
            client: reqwest_client()?,
            config: Arc::new(config),
            org_id: OnceCell::new(),
            bucket_ids: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.endpoint.trim_end_matches('/'))
    }

    fn token(&self) -> String {
        format!("Token {}", self.config.token)
    }

    async fn org_id(&self) -> BackendResult<&str> {
        let id = self
            .org_id
            .get_or_try_init(|| async {
                let response = self
                    .client
                    .get(self.url("/api/v2/orgs"))
                    .header(AUTHORIZATION, self.token())
                    .query(&[("org", &self.config.org)])
                    .send()
                    .await
                    .map_err(|e| BackendError::reqwest("looking up organization", e))?;

                let orgs: Orgs = check(response, "looking up organization")
                    .await?
                    .json()
                    .await
                    .map_err(|e| BackendError::reqwest("decoding organizations", e))?;

                orgs.orgs.into_iter().next().map(|org| org.id).ok_or_else(|| {
                    BackendError::generic(
                        "looking up organization",
                        format!("organization `{}` not found", self.config.org),
                    )
                })
            })
            .await?;
        Ok(id.as_str())
    }

    async fn bucket_id(&self, bucket: &str) -> BackendResult<Option<String>> {
        let cached = self
            .bucket_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(bucket)
            .cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let org_id = self.org_id().await?;
        let response = self
            .client
            .get(self.url("/api/v2/buckets"))
            .header(AUTHORIZATION, self.token())
            .query(&[("name", bucket), ("orgID", org_id)])
            .send()
            .await
            .map_err(|e| BackendError::reqwest("looking up bucket", e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let buckets: Buckets = check(response, "looking up bucket")
            .await?
            .json()
            .await
            .map_err(|e| BackendError::reqwest("decoding buckets", e))?;

        let id = buckets.buckets.into_iter().next().map(|b| b.id);
        if let Some(ref id) = id {
            self.remember(bucket, id);
        }
        Ok(id)
    }

    fn remember(&self, bucket: &str, id: &str) {
        self.bucket_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bucket.to_owned(), id.to_owned());
    }

    fn forget(&self, bucket: &str) {
        self.bucket_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(bucket);
    }

    async fn shard_size(&self, bucket_id: &str) -> BackendResult<u64> {
        let response = self
            .client
            .get(self.url("/metrics"))
            .header(AUTHORIZATION, self.token())
            .send()
            .await
            .map_err(|e| BackendError::reqwest("scraping metrics", e))?;

        let text = check(response, "scraping metrics")
            .await?
            .text()
            .await
            .map_err(|e| BackendError::reqwest("reading metrics", e))?;

        Ok(parse_shard_size(&text, bucket_id))
    }
}

impl fmt::Debug for LineProtocolBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineProtocolBackend")
            .field("endpoint", &self.config.endpoint)
            .field("org", &self.config.org)
            .finish_non_exhaustive()
    }
}

/// Turns non-success responses into [`BackendError::Status`].
async fn check(response: Response, context: &str) -> BackendResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        context: context.to_owned(),
        status,
        body,
    })
}

fn escape_measurement(out: &mut BytesMut, name: &str) -> fmt::Result {
    for c in name.chars() {
        if matches!(c, ',' | ' ') {
            out.write_char('\\')?;
        }
        out.write_char(c)?;
    }
    Ok(())
}

fn escape_string(out: &mut BytesMut, value: &str) -> fmt::Result {
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            out.write_char('\\')?;
        }
        out.write_char(c)?;
    }
    Ok(())
}

/// Encodes records as line protocol with second precision.
pub fn encode_lines(measurement: &str, records: &[TimeSeriesRecord]) -> Result<Bytes, fmt::Error> {
    let mut out = BytesMut::with_capacity(records.len() * (measurement.len() + 48));

    for record in records {
        escape_measurement(&mut out, measurement)?;
        write!(out, ",tag_id={} {}=", record.tag_id, record.value.kind())?;
        match &record.value {
            Value::Int(v) => write!(out, "{v}i")?,
            Value::Float(v) => write!(out, "{v}")?,
            Value::Str(v) => {
                out.write_char('"')?;
                escape_string(&mut out, v)?;
                out.write_char('"')?;
            }
            Value::Bool(v) => write!(out, "{v}")?,
        }
        writeln!(out, " {}", record.time.timestamp())?;
    }

    Ok(out.freeze())
}

/// Sums all shard size samples of the given bucket from a Prometheus text exposition.
pub fn parse_shard_size(metrics: &str, bucket_id: &str) -> u64 {
    let label = format!("bucket=\"{bucket_id}\"");

    metrics
        .lines()
        .filter(|line| {
            line.strip_prefix(SHARD_SIZE_METRIC)
                .is_some_and(|rest| rest.starts_with('{'))
        })
        .filter(|line| line.contains(&label))
        .filter_map(|line| line.rsplit_once(' '))
        .filter_map(|(_, value)| value.parse::<f64>().ok())
        .map(|value| value as u64)
        .sum()
}

#[async_trait::async_trait]
impl Backend for LineProtocolBackend {
    fn name(&self) -> &'static str {
        "line_protocol"
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn prepare_schema(&self, table: &str) -> BackendResult<()> {
        if self.bucket_id(table).await?.is_some() {
            return Ok(());
        }

        let org_id = self.org_id().await?;
        let body = serde_json::json!({
            "orgID": org_id,
            "name": table,
            "retentionRules": [],
        });

        let response = self
            .client
            .post(self.url("/api/v2/buckets"))
            .header(AUTHORIZATION, self.token())
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::reqwest("creating bucket", e))?;

        // a concurrent creation is as good as our own
        if matches!(
            response.status(),
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY
        ) {
            tracing::debug!(table, "bucket already exists");
            return Ok(());
        }

        let created: Resource = check(response, "creating bucket")
            .await?
            .json()
            .await
            .map_err(|e| BackendError::reqwest("decoding created bucket", e))?;
        self.remember(table, &created.id);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn reset(&self, table: &str) -> BackendResult<()> {
        let Some(id) = self.bucket_id(table).await? else {
            return Ok(());
        };
        self.forget(table);

        let response = self
            .client
            .delete(self.url(&format!("/api/v2/buckets/{id}")))
            .header(AUTHORIZATION, self.token())
            .send()
            .await
            .map_err(|e| BackendError::reqwest("deleting bucket", e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response, "deleting bucket").await?;
        Ok(())
    }

    #[tracing::instrument(
        level = "trace",
        skip_all,
        fields(table = table, records = records.len())
    )]
    async fn insert_chunk(&self, table: &str, records: &[TimeSeriesRecord]) -> BackendResult<()> {
        let body = encode_lines(table, records)
            .map_err(|e| BackendError::generic("encoding line protocol", e))?;

        let response = self
            .client
            .post(self.url("/api/v2/write"))
            .header(AUTHORIZATION, self.token())
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", table),
                ("precision", "s"),
            ])
            .body(body)
            .send()
            .await
            .map_err(|e| BackendError::reqwest("writing points", e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::MissingTable(table.to_owned()));
        }
        check(response, "writing points").await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn measure_size(&self, table: &str) -> BackendResult<u64> {
        let id = self
            .bucket_id(table)
            .await?
            .ok_or_else(|| BackendError::MissingTable(table.to_owned()))?;

        wait_for_stable_size(
            || self.shard_size(&id),
            self.config.size_poll_interval,
            self.config.size_max_wait,
        )
        .await
    }
}

/// Creates [`LineProtocolBackend`] handles and checks that the organization exists.
#[derive(Debug)]
pub struct LineProtocolFactory {
    config: LineProtocolConfig,
}

impl LineProtocolFactory {
    /// Creates a factory connecting with the given settings.
    pub fn new(config: LineProtocolConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl BackendFactory for LineProtocolFactory {
    fn name(&self) -> &'static str {
        "line_protocol"
    }

    async fn connect(&self) -> BackendResult<BoxedBackend> {
        let backend = LineProtocolBackend::new(self.config.clone())?;
        backend.org_id().await?;
        Ok(Box::new(backend))
    }
}
