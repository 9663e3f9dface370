//! Benchmark cases and their measured results.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies the shape of a synthetic dataset.
///
/// A case is one combination of duration, tag count and sampling interval. Its [`Display`]
/// representation is the case name, which is used to name cache files and backend tables.
///
/// # Examples
///
/// ```
/// use ingestbench_types::CaseKey;
///
/// let key = CaseKey::new(5, 10, 60);
/// assert_eq!(key.to_string(), "5_minutes_of_10_tags_at_60_second_intervals");
/// assert_eq!(key.records_per_tag(), Some(5));
/// ```
///
/// [`Display`]: fmt::Display
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct CaseKey {
    /// Total time span covered by the dataset.
    pub duration_minutes: u32,
    /// Number of distinct tags.
    pub tag_count: u32,
    /// Spacing between two samples of the same tag.
    pub sampling_interval_seconds: u32,
}

impl CaseKey {
    /// Creates a new case key.
    pub fn new(duration_minutes: u32, tag_count: u32, sampling_interval_seconds: u32) -> Self {
        Self {
            duration_minutes,
            tag_count,
            sampling_interval_seconds,
        }
    }

    /// Number of samples per tag, or `None` if the sampling interval is zero.
    ///
    /// A trailing partial interval is truncated.
    pub fn records_per_tag(&self) -> Option<u64> {
        let total_seconds = u64::from(self.duration_minutes) * 60;
        total_seconds.checked_div(u64::from(self.sampling_interval_seconds))
    }

    /// Total number of records of this case, or `None` if the sampling interval is zero.
    pub fn record_count(&self) -> Option<u64> {
        self.records_per_tag()
            .map(|per_tag| per_tag * u64::from(self.tag_count))
    }

    /// The default table or stream name for this case in a backend.
    pub fn table_name(&self) -> String {
        format!("_{self}")
    }
}

impl fmt::Display for CaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_minutes_of_{}_tags_at_{}_second_intervals",
            self.duration_minutes, self.tag_count, self.sampling_interval_seconds
        )
    }
}

/// Outcome of a single measurement.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    /// The dataset was fully ingested and measured.
    Ok,
    /// A backend operation or chunk insert failed.
    Failed,
    /// The load exceeded the configured deadline.
    TimedOut,
    /// The case parameters were rejected.
    Invalid,
}

/// One row of the benchmark report.
///
/// There is one result per `(case, backend, worker_count)` combination, including failed ones.
/// Results are never mutated after creation. For failed cases, `table_size_bytes` and
/// `insert_duration_seconds` are absent and `error` carries the cause.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CaseResult {
    /// The backend this row was measured against.
    ///
    /// Not part of the serialized row, since reports are split into one file per backend.
    #[serde(skip_serializing)]
    pub backend: String,
    /// See [`CaseKey::duration_minutes`].
    pub duration_minutes: u32,
    /// See [`CaseKey::tag_count`].
    pub tag_count: u32,
    /// See [`CaseKey::sampling_interval_seconds`].
    pub sampling_interval_seconds: u32,
    /// Number of records in the dataset.
    pub record_count: u64,
    /// On-disk footprint reported by the backend after the load.
    pub table_size_bytes: Option<u64>,
    /// Wall-clock time of the whole parallel load, with millisecond precision.
    pub insert_duration_seconds: Option<f64>,
    /// Number of concurrent loader workers.
    pub worker_count: usize,
    /// Whether the backend runs on a remote host.
    pub is_remote: bool,
    /// Whether the measurement succeeded.
    pub status: CaseStatus,
    /// The error cause for unsuccessful measurements.
    pub error: Option<String>,
}

impl CaseResult {
    /// Returns the case key this result was measured for.
    pub fn key(&self) -> CaseKey {
        CaseKey::new(
            self.duration_minutes,
            self.tag_count,
            self.sampling_interval_seconds,
        )
    }

    /// Returns `true` if the measurement succeeded.
    pub fn is_ok(&self) -> bool {
        self.status == CaseStatus::Ok
    }

    /// Ingestion throughput in records per second, if the measurement succeeded.
    pub fn records_per_second(&self) -> Option<f64> {
        let seconds = self.insert_duration_seconds?;
        (seconds > 0.0).then(|| self.record_count as f64 / seconds)
    }
}
