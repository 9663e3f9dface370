//! Conversion between records and Arrow record batches.
//!
//! All columnar representations of a dataset share the fixed six-column [`schema`]:
//!
//! | column        | type                 | nullable |
//! |---------------|----------------------|----------|
//! | `time`        | timestamp (µs, UTC)  | no       |
//! | `tag_id`      | int32                | no       |
//! | `value_int`   | int32                | yes      |
//! | `value_float` | float32              | yes      |
//! | `value_str`   | utf8                 | yes      |
//! | `value_bool`  | boolean              | yes      |

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float32Array, Int32Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::DateTime;
use thiserror::Error;

use crate::record::{NaturalKey, TimeSeriesRecord, Value};

/// Timezone annotation of the `time` column.
pub const TIMEZONE: &str = "UTC";

/// Errors converting between records and record batches.
#[derive(Debug, Error)]
pub enum ColumnarError {
    /// Errors raised by Arrow while assembling a batch.
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    /// A required column is missing from the batch.
    #[error("missing column `{0}`")]
    MissingColumn(&'static str),

    /// A column does not have the expected Arrow type.
    #[error("column `{0}` has an unexpected type")]
    ColumnType(&'static str),

    /// A tag identifier does not fit into the `int32` storage type.
    #[error("tag id {0} does not fit into int32")]
    TagOutOfRange(i64),

    /// A timestamp is null or outside the representable range.
    #[error("invalid timestamp in row {0}")]
    InvalidTime(usize),

    /// A row does not have exactly one non-null value column.
    #[error("row {row} has {count} non-null value columns, expected exactly one")]
    ValueCount {
        /// Index of the offending row within its batch.
        row: usize,
        /// Number of non-null value columns found.
        count: usize,
    },
}

/// Returns the Arrow schema shared by all columnar dataset representations.
pub fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(
            "time",
            DataType::Timestamp(TimeUnit::Microsecond, Some(TIMEZONE.into())),
            false,
        ),
        Field::new("tag_id", DataType::Int32, false),
        Field::new("value_int", DataType::Int32, true),
        Field::new("value_float", DataType::Float32, true),
        Field::new("value_str", DataType::Utf8, true),
        Field::new("value_bool", DataType::Boolean, true),
    ]))
}

/// Converts records into a record batch with the shared [`schema`].
pub fn to_record_batch(records: &[TimeSeriesRecord]) -> Result<RecordBatch, ColumnarError> {
    let micros = records.iter().map(|r| r.time.timestamp_micros());
    let time = TimestampMicrosecondArray::from_iter_values(micros);
    let tag_ids: Vec<i32> = records.iter().map(tag_id).collect::<Result<_, _>>()?;

    let ints: Int32Array = records.iter().map(TimeSeriesRecord::value_int).collect();
    let floats: Float32Array = records.iter().map(TimeSeriesRecord::value_float).collect();
    let strs: StringArray = records.iter().map(TimeSeriesRecord::value_str).collect();
    let bools: BooleanArray = records.iter().map(TimeSeriesRecord::value_bool).collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(time.with_timezone(TIMEZONE)),
        Arc::new(Int32Array::from(tag_ids)),
        Arc::new(ints),
        Arc::new(floats),
        Arc::new(strs),
        Arc::new(bools),
    ];

    Ok(RecordBatch::try_new(schema(), columns)?)
}

fn tag_id(record: &TimeSeriesRecord) -> Result<i32, ColumnarError> {
    i32::try_from(record.tag_id)
        .map_err(|_| ColumnarError::TagOutOfRange(record.tag_id.into()))
}

/// Converts a record batch with the shared [`schema`] back into records.
///
/// Every row must have exactly one non-null value column.
pub fn from_record_batch(batch: &RecordBatch) -> Result<Vec<TimeSeriesRecord>, ColumnarError> {
    let keys = keys_from_record_batch(batch)?;
    let ints = column::<Int32Array>(batch, "value_int")?;
    let floats = column::<Float32Array>(batch, "value_float")?;
    let strs = column::<StringArray>(batch, "value_str")?;
    let bools = column::<BooleanArray>(batch, "value_bool")?;

    keys.into_iter()
        .enumerate()
        .map(|(row, (time, tag_id))| {
            let valid = |column: &dyn Array| column.is_valid(row);
            let mut values = [
                valid(ints).then(|| Value::Int(ints.value(row))),
                valid(floats).then(|| Value::Float(floats.value(row))),
                valid(strs).then(|| Value::Str(strs.value(row).to_owned())),
                valid(bools).then(|| Value::Bool(bools.value(row))),
            ]
            .into_iter()
            .flatten();

            match (values.next(), values.count()) {
                (Some(value), 0) => Ok(TimeSeriesRecord {
                    time,
                    tag_id,
                    value,
                }),
                (first, rest) => Err(ColumnarError::ValueCount {
                    row,
                    count: usize::from(first.is_some()) + rest,
                }),
            }
        })
        .collect()
}

/// Extracts the natural keys from a batch.
///
/// Only the `time` and `tag_id` columns are required, so this also works on batches read with a
/// projection onto those two columns.
pub fn keys_from_record_batch(batch: &RecordBatch) -> Result<Vec<NaturalKey>, ColumnarError> {
    let time = column::<TimestampMicrosecondArray>(batch, "time")?;
    let tag_id = column::<Int32Array>(batch, "tag_id")?;

    (0..batch.num_rows())
        .map(|row| {
            let time = time
                .is_valid(row)
                .then(|| DateTime::from_timestamp_micros(time.value(row)))
                .flatten()
                .ok_or(ColumnarError::InvalidTime(row))?;
            let tag_id = u32::try_from(tag_id.value(row))
                .map_err(|_| ColumnarError::TagOutOfRange(tag_id.value(row).into()))?;
            Ok((time, tag_id))
        })
        .collect()
}

fn column<'a, A>(batch: &'a RecordBatch, name: &'static str) -> Result<&'a A, ColumnarError>
where
    A: Array + 'static,
{
    batch
        .column_by_name(name)
        .ok_or(ColumnarError::MissingColumn(name))?
        .as_any()
        .downcast_ref::<A>()
        .ok_or(ColumnarError::ColumnType(name))
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn records() -> Vec<TimeSeriesRecord> {
        let time = DateTime::UNIX_EPOCH + TimeDelta::seconds(1_735_689_600);
        vec![
            TimeSeriesRecord {
                time,
                tag_id: 0,
                value: Value::Int(100),
            },
            TimeSeriesRecord {
                time,
                tag_id: 1,
                value: Value::Float(0.25),
            },
            TimeSeriesRecord {
                time,
                tag_id: 2,
                value: Value::Str("aB3dE5gH9j".into()),
            },
            TimeSeriesRecord {
                time: time + TimeDelta::seconds(1),
                tag_id: 3,
                value: Value::Bool(false),
            },
        ]
    }

    #[test]
    fn batch_has_fixed_schema() {
        let batch = to_record_batch(&records()).unwrap();
        assert_eq!(batch.schema(), schema());
        assert_eq!(batch.num_rows(), 4);

        // one value per row means three nulls per row across the value columns
        let nulls: usize = (2..6).map(|i| batch.column(i).null_count()).sum();
        assert_eq!(nulls, 3 * 4);
    }

    #[test]
    fn converts_back_to_records() {
        let batch = to_record_batch(&records()).unwrap();
        assert_eq!(from_record_batch(&batch).unwrap(), records());
    }

    #[test]
    fn rejects_rows_without_value() {
        let time = TimestampMicrosecondArray::from(vec![0]);
        let columns: Vec<ArrayRef> = vec![
            Arc::new(time.with_timezone(TIMEZONE)),
            Arc::new(Int32Array::from(vec![0])),
            Arc::new(Int32Array::from(vec![None])),
            Arc::new(Float32Array::from(vec![None])),
            Arc::new(StringArray::from(vec![None::<&str>])),
            Arc::new(BooleanArray::from(vec![None])),
        ];
        let batch = RecordBatch::try_new(schema(), columns).unwrap();

        let err = from_record_batch(&batch).unwrap_err();
        assert!(matches!(err, ColumnarError::ValueCount { row: 0, count: 0 }));
    }
}
