//! Deterministic synthetic time-series datasets.
//!
//! A dataset covers `tag_count` tags sampled every `sampling_interval_seconds` for
//! `duration_minutes`, starting at [`epoch`]. Tags are split into four contiguous bands by
//! value type:
//!
//! | tag ids             | value                               |
//! |---------------------|-------------------------------------|
//! | first 35%           | integer, uniform in `[0, 100]`      |
//! | next 35%            | float, uniform in `[0, 1)`          |
//! | next 15%            | alphanumeric string of length 10    |
//! | remaining 15%       | boolean                             |
//!
//! A tag belongs to the first band whose boundary `tag_count * cumulative_fraction` lies strictly
//! above its id, so a tag straddling a boundary stays in the lower band. For 100 tags the bands are
//! `[0, 35)`, `[35, 70)`, `[70, 85)` and `[85, 100)`; a single tag has integer values.

use chrono::{DateTime, TimeDelta, Utc};
use ingestbench_service::{Error, Result};
use ingestbench_types::{CaseKey, Dataset, TimeSeriesRecord, Value, ValueKind};
use rand::distr::{Alphanumeric, SampleString};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Seconds since the Unix epoch of the first sample, `2025-01-01T00:00:00Z`.
const EPOCH_SECONDS: i64 = 1_735_689_600;

/// Length of generated string values.
pub const STRING_LENGTH: usize = 10;

/// Cumulative band boundaries in percent of the tag count.
const INT_BAND: u64 = 35;
const FLOAT_BAND: u64 = 70;
const STR_BAND: u64 = 85;

/// Timestamp of the first sample of every dataset.
pub fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH + TimeDelta::seconds(EPOCH_SECONDS)
}

/// Returns the value type of a tag.
pub fn value_kind(tag_id: u32, tag_count: u32) -> ValueKind {
    let below = |percent: u64| u64::from(tag_id) * 100 < u64::from(tag_count) * percent;

    if below(INT_BAND) {
        ValueKind::Int
    } else if below(FLOAT_BAND) {
        ValueKind::Float
    } else if below(STR_BAND) {
        ValueKind::Str
    } else {
        ValueKind::Bool
    }
}

/// SplitMix64 finalizer, used to derive independent per-case seeds.
fn mix(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Produces reproducible datasets from a base seed.
#[derive(Clone, Debug)]
pub struct DataGenerator {
    seed: u64,
    seeded: bool,
}

impl DataGenerator {
    /// Creates a generator.
    ///
    /// Without an explicit seed, a random seed is drawn and logged, so the run can be
    /// reproduced later.
    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self { seed, seeded: true },
            None => {
                let seed = rand::random();
                tracing::info!(seed, "no generator seed configured, drew a random one");
                Self {
                    seed,
                    seeded: false,
                }
            }
        }
    }

    /// The base seed of this generator.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Returns `true` if the seed was configured explicitly.
    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Derives the seed of a single case from the base seed.
    ///
    /// Each case gets its own random stream, so the payload of a case does not depend on which
    /// other cases are generated.
    pub fn case_seed(&self, key: CaseKey) -> u64 {
        [
            key.duration_minutes,
            key.tag_count,
            key.sampling_interval_seconds,
        ]
        .into_iter()
        .fold(mix(self.seed), |acc, part| mix(acc ^ u64::from(part)))
    }

    /// Generates the dataset of a case.
    ///
    /// Records are emitted time-major with ascending tag ids per timestamp, which is exactly the
    /// `(time, tag_id)` order.
    pub fn generate(&self, key: CaseKey) -> Result<Dataset> {
        if key.sampling_interval_seconds == 0 {
            return Err(Error::InvalidArgument(format!(
                "sampling interval of case {key} must be positive"
            )));
        }

        let per_tag = key.records_per_tag().unwrap_or_default();
        let capacity = key
            .record_count()
            .and_then(|count| usize::try_from(count).ok())
            .ok_or_else(|| Error::InvalidArgument(format!("case {key} is too large")))?;

        let interval = TimeDelta::seconds(i64::from(key.sampling_interval_seconds));

        let mut rng = SmallRng::seed_from_u64(self.case_seed(key));
        let mut records = Vec::with_capacity(capacity);
        let mut time = epoch();

        for _ in 0..per_tag {
            for tag_id in 0..key.tag_count {
                records.push(TimeSeriesRecord {
                    time,
                    tag_id,
                    value: random_value(&mut rng, value_kind(tag_id, key.tag_count)),
                });
            }
            time += interval;
        }

        tracing::debug!(case = %key, records = records.len(), "generated dataset");
        Ok(Dataset::new(key, records))
    }
}

fn random_value(rng: &mut SmallRng, kind: ValueKind) -> Value {
    match kind {
        ValueKind::Int => Value::Int(rng.random_range(0..=100)),
        ValueKind::Float => Value::Float(rng.random()),
        ValueKind::Str => Value::Str(Alphanumeric.sample_string(rng, STRING_LENGTH)),
        ValueKind::Bool => Value::Bool(rng.random_bool(0.5)),
    }
}
