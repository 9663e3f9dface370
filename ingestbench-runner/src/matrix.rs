//! The case matrix of a benchmark sweep.

use std::collections::BTreeSet;

use ingestbench_types::CaseKey;
use serde::{Deserialize, Serialize};

/// One dataset shape and the worker counts to measure it with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CaseSpec {
    /// The dataset shape.
    pub key: CaseKey,
    /// Loader worker counts, each measured separately.
    pub worker_counts: Vec<usize>,
}

/// Sets of parameters whose cartesian product forms the cases of a sweep.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CaseMatrix {
    /// Dataset durations in minutes.
    pub duration_minutes: BTreeSet<u32>,
    /// Numbers of distinct tags.
    pub tag_count: BTreeSet<u32>,
    /// Sampling intervals in seconds.
    pub sampling_interval_seconds: BTreeSet<u32>,
    /// Loader worker counts.
    pub worker_count: BTreeSet<usize>,
}

impl Default for CaseMatrix {
    fn default() -> Self {
        Self {
            duration_minutes: [5].into(),
            tag_count: [10, 100].into(),
            sampling_interval_seconds: [1, 60].into(),
            worker_count: [1].into(),
        }
    }
}

impl CaseMatrix {
    /// Expands the matrix into cases.
    ///
    /// Cases are ordered by duration, then tag count, then interval, all ascending. Every case
    /// carries all worker counts.
    pub fn cases(&self) -> Vec<CaseSpec> {
        let worker_counts: Vec<usize> = self.worker_count.iter().copied().collect();

        let mut cases = Vec::new();
        for &duration in &self.duration_minutes {
            for &tags in &self.tag_count {
                for &interval in &self.sampling_interval_seconds {
                    cases.push(CaseSpec {
                        key: CaseKey::new(duration, tags, interval),
                        worker_counts: worker_counts.clone(),
                    });
                }
            }
        }
        cases
    }

    /// Distinct dataset shapes of the matrix, ignoring worker counts.
    pub fn keys(&self) -> impl Iterator<Item = CaseKey> + '_ {
        self.duration_minutes.iter().flat_map(move |&duration| {
            self.tag_count.iter().flat_map(move |&tags| {
                self.sampling_interval_seconds
                    .iter()
                    .map(move |&interval| CaseKey::new(duration, tags, interval))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_cartesian_product() {
        let matrix = CaseMatrix {
            duration_minutes: [60, 5].into(),
            tag_count: [10].into(),
            sampling_interval_seconds: [60, 1].into(),
            worker_count: [4, 1].into(),
        };

        let cases = matrix.cases();
        let keys: Vec<_> = cases.iter().map(|c| c.key.to_string()).collect();
        assert_eq!(
            keys,
            [
                "5_minutes_of_10_tags_at_1_second_intervals",
                "5_minutes_of_10_tags_at_60_second_intervals",
                "60_minutes_of_10_tags_at_1_second_intervals",
                "60_minutes_of_10_tags_at_60_second_intervals",
            ]
        );
        assert!(cases.iter().all(|c| c.worker_counts == [1, 4]));

        let keys: Vec<_> = matrix.keys().collect();
        assert_eq!(keys, cases.iter().map(|c| c.key).collect::<Vec<_>>());
    }

    #[test]
    fn empty_set_yields_no_cases() {
        let matrix = CaseMatrix {
            tag_count: BTreeSet::new(),
            ..Default::default()
        };
        assert!(matrix.cases().is_empty());
    }
}
