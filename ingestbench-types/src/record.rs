//! Definitions of a single time-series data point.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The natural key of a data point.
///
/// A `(time, tag_id)` pair uniquely identifies a logical data point across repeated insert
/// attempts. Backends must never store two rows with the same natural key.
pub type NaturalKey = (DateTime<Utc>, u32);

/// The payload of a [`TimeSeriesRecord`].
///
/// Every record carries exactly one value. The four nullable value columns of the storage
/// schema (`value_int`, `value_float`, `value_str`, `value_bool`) are projections of this enum,
/// so "exactly one of them is non-null" holds by construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// An integer sample, stored in `value_int`.
    Int(i32),
    /// A floating point sample, stored in `value_float`.
    Float(f32),
    /// A string sample, stored in `value_str`.
    Str(String),
    /// A boolean sample, stored in `value_bool`.
    Bool(bool),
}

impl Value {
    /// Returns the kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Bool(_) => ValueKind::Bool,
        }
    }
}

/// The type of a [`Value`], independent of its payload.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ValueKind {
    /// See [`Value::Int`].
    Int,
    /// See [`Value::Float`].
    Float,
    /// See [`Value::Str`].
    Str,
    /// See [`Value::Bool`].
    Bool,
}

impl ValueKind {
    /// The name of the storage column holding values of this kind.
    pub fn column(self) -> &'static str {
        match self {
            ValueKind::Int => "value_int",
            ValueKind::Float => "value_float",
            ValueKind::Str => "value_str",
            ValueKind::Bool => "value_bool",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// A single sample of one tag at one point in time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesRecord {
    /// The sampling timestamp.
    pub time: DateTime<Utc>,
    /// The identifier of the sampled tag.
    pub tag_id: u32,
    /// The sampled value.
    pub value: Value,
}

impl TimeSeriesRecord {
    /// Returns the `(time, tag_id)` natural key of this record.
    pub fn key(&self) -> NaturalKey {
        (self.time, self.tag_id)
    }

    /// The `value_int` column.
    pub fn value_int(&self) -> Option<i32> {
        match self.value {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    /// The `value_float` column.
    pub fn value_float(&self) -> Option<f32> {
        match self.value {
            Value::Float(v) => Some(v),
            _ => None,
        }
    }

    /// The `value_str` column.
    pub fn value_str(&self) -> Option<&str> {
        match &self.value {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    /// The `value_bool` column.
    pub fn value_bool(&self) -> Option<bool> {
        match self.value {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }
}
