//! Immutable synthetic datasets.

use std::ops::Deref;
use std::sync::Arc;

use crate::case::CaseKey;
use crate::record::TimeSeriesRecord;

/// An ordered, immutable sequence of [`TimeSeriesRecord`]s generated for a [`CaseKey`].
///
/// Records are sorted by `(time, tag_id)` and contain no duplicate natural keys. Cloning a
/// dataset is cheap: all clones share the same record storage, so one generated dataset can be
/// handed to many loader workers and backends without copying.
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    key: CaseKey,
    records: Arc<[TimeSeriesRecord]>,
}

impl Dataset {
    /// Wraps the given records into a dataset.
    ///
    /// The caller is responsible for the ordering guarantee, see [`is_sorted_unique`].
    ///
    /// [`is_sorted_unique`]: Self::is_sorted_unique
    pub fn new(key: CaseKey, records: Vec<TimeSeriesRecord>) -> Self {
        Self {
            key,
            records: records.into(),
        }
    }

    /// The case this dataset was generated for.
    pub fn key(&self) -> CaseKey {
        self.key
    }

    /// All records in `(time, tag_id)` order.
    pub fn records(&self) -> &[TimeSeriesRecord] {
        &self.records
    }

    /// Returns `true` if records are strictly ascending by natural key.
    ///
    /// Strict ordering implies there are no duplicate `(time, tag_id)` pairs.
    pub fn is_sorted_unique(&self) -> bool {
        self.records.windows(2).all(|w| w[0].key() < w[1].key())
    }
}

impl Deref for Dataset {
    type Target = [TimeSeriesRecord];

    fn deref(&self) -> &Self::Target {
        &self.records
    }
}
