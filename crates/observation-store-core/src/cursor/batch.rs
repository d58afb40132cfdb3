//! Cursor over Arrow record batches.
//!
//! Narrow measure rows often arrive as Arrow batches (CSV exports, Flight
//! results, Parquet scans). This cursor walks them row by row and exposes each
//! cell as a [`CellValue`], converting Arrow timestamps of any unit to UTC
//! instants. Empty batches are skipped transparently.
use arrow::{
    array::{Array, ArrayRef, AsArray, RecordBatch},
    datatypes::{
        DataType, Float32Type, Float64Type, Int32Type, Int64Type, SchemaRef, TimeUnit,
        TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
        TimestampSecondType, UInt32Type,
    },
};
use chrono::{DateTime, Utc};
use snafu::prelude::*;

use super::{
    CellValue, CursorError, MissingColumnSnafu, NoCurrentRowSnafu, ResultCursor,
    TimestampOutOfRangeSnafu, UnsupportedArrowTypeSnafu,
};

/// Row cursor over a sequence of record batches sharing one schema.
#[derive(Debug, Clone)]
pub struct RecordBatchCursor {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    batch: usize,
    row: usize,
    started: bool,
}

impl RecordBatchCursor {
    /// Create a cursor over `batches`, all of which must use `schema`.
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        RecordBatchCursor {
            schema,
            batches,
            batch: 0,
            row: 0,
            started: false,
        }
    }

    /// Schema of the underlying batches.
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn positioned(&self) -> bool {
        self.started
            && self
                .batches
                .get(self.batch)
                .is_some_and(|b| self.row < b.num_rows())
    }

    fn skip_exhausted_batches(&mut self) {
        while let Some(b) = self.batches.get(self.batch) {
            if self.row < b.num_rows() {
                break;
            }
            self.batch += 1;
            self.row = 0;
        }
    }
}

fn timestamp_cell(column: &str, unit: &TimeUnit, raw: i64) -> Result<CellValue, CursorError> {
    let converted = match unit {
        TimeUnit::Second => DateTime::<Utc>::from_timestamp(raw, 0),
        TimeUnit::Millisecond => DateTime::<Utc>::from_timestamp_millis(raw),
        TimeUnit::Microsecond => DateTime::<Utc>::from_timestamp_micros(raw),
        TimeUnit::Nanosecond => Some(DateTime::<Utc>::from_timestamp_nanos(raw)),
    };
    converted
        .map(CellValue::Timestamp)
        .context(TimestampOutOfRangeSnafu { column, value: raw })
}

fn cell_at(column: &str, array: &ArrayRef, row: usize) -> Result<CellValue, CursorError> {
    if array.is_null(row) {
        return Ok(CellValue::Null);
    }

    let cell = match array.data_type() {
        DataType::Int64 => CellValue::Integer(array.as_primitive::<Int64Type>().value(row)),
        DataType::Int32 => CellValue::Integer(array.as_primitive::<Int32Type>().value(row) as i64),
        DataType::UInt32 => {
            CellValue::Integer(array.as_primitive::<UInt32Type>().value(row) as i64)
        }
        DataType::Float64 => CellValue::Double(array.as_primitive::<Float64Type>().value(row)),
        DataType::Float32 => {
            CellValue::Double(array.as_primitive::<Float32Type>().value(row) as f64)
        }
        DataType::Utf8 => CellValue::Text(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => CellValue::Text(array.as_string::<i64>().value(row).to_string()),
        DataType::Boolean => CellValue::Boolean(array.as_boolean().value(row)),
        DataType::Timestamp(unit, _) => {
            let raw = match unit {
                TimeUnit::Second => array.as_primitive::<TimestampSecondType>().value(row),
                TimeUnit::Millisecond => {
                    array.as_primitive::<TimestampMillisecondType>().value(row)
                }
                TimeUnit::Microsecond => {
                    array.as_primitive::<TimestampMicrosecondType>().value(row)
                }
                TimeUnit::Nanosecond => array.as_primitive::<TimestampNanosecondType>().value(row),
            };
            timestamp_cell(column, unit, raw)?
        }
        other => {
            return UnsupportedArrowTypeSnafu {
                column,
                datatype: other.clone(),
            }
            .fail();
        }
    };
    Ok(cell)
}

impl ResultCursor for RecordBatchCursor {
    fn next_on_field(&mut self, _field: &str) -> Result<bool, CursorError> {
        if self.started {
            self.row += 1;
        } else {
            self.started = true;
        }
        self.skip_exhausted_batches();
        Ok(self.positioned())
    }

    fn has_column(&self, column: &str) -> bool {
        self.schema.index_of(column).is_ok()
    }

    fn value(&self, column: &str) -> Result<CellValue, CursorError> {
        let idx = self
            .schema
            .index_of(column)
            .ok()
            .context(MissingColumnSnafu { column })?;
        ensure!(self.positioned(), NoCurrentRowSnafu);
        let batch = &self.batches[self.batch];
        cell_at(column, batch.column(idx), self.row)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::{
        array::{BooleanArray, Float64Array, Int64Array, StringArray, TimestampMillisecondArray},
        datatypes::{Field, Schema},
        error::ArrowError,
    };

    use super::*;
    use crate::test_util::*;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new(
                "time",
                DataType::Timestamp(TimeUnit::Millisecond, None),
                false,
            ),
            Field::new("id", DataType::Int64, true),
            Field::new("result", DataType::Float64, true),
            Field::new("obsprop_id", DataType::Utf8, false),
            Field::new("flag", DataType::Boolean, true),
        ]))
    }

    fn batch(times: &[i64], values: &[Option<f64>]) -> Result<RecordBatch, ArrowError> {
        let n = times.len();
        RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(TimestampMillisecondArray::from(times.to_vec())),
                Arc::new(Int64Array::from(vec![None::<i64>; n])),
                Arc::new(Float64Array::from(values.to_vec())),
                Arc::new(StringArray::from(vec!["A"; n])),
                Arc::new(BooleanArray::from(vec![Some(true); n])),
            ],
        )
    }

    #[test]
    fn walks_batches_and_skips_empty_ones() -> TestResult {
        let batches = vec![
            batch(&[1_000], &[Some(1.0)])?,
            batch(&[], &[])?,
            batch(&[2_000, 3_000], &[None, Some(3.0)])?,
        ];
        let mut cursor = RecordBatchCursor::new(schema(), batches);

        let mut seen = Vec::new();
        while cursor.next_on_field("time")? {
            seen.push((cursor.get_timestamp("time")?, cursor.value("result")?));
        }

        assert_eq!(
            seen,
            vec![
                (Some(utc_millis(1_000)), CellValue::Double(1.0)),
                (Some(utc_millis(2_000)), CellValue::Null),
                (Some(utc_millis(3_000)), CellValue::Double(3.0)),
            ]
        );
        assert!(!cursor.next_on_field("time")?);
        Ok(())
    }

    #[test]
    fn exposes_text_boolean_and_null_integer() -> TestResult {
        let mut cursor = RecordBatchCursor::new(schema(), vec![batch(&[1], &[Some(0.5)])?]);
        assert!(cursor.next_on_field("time")?);
        assert_eq!(cursor.get_text("obsprop_id")?, Some("A".to_string()));
        assert_eq!(cursor.value("flag")?, CellValue::Boolean(true));
        assert_eq!(cursor.get_i64("id")?, None);
        Ok(())
    }

    #[test]
    fn missing_column_and_unpositioned_reads_fail() -> TestResult {
        let mut cursor = RecordBatchCursor::new(schema(), vec![batch(&[1], &[Some(0.5)])?]);
        assert!(matches!(
            cursor.value("result"),
            Err(CursorError::NoCurrentRow)
        ));
        cursor.next_on_field("time")?;
        assert!(!cursor.has_column("depth"));
        assert!(matches!(
            cursor.value("depth"),
            Err(CursorError::MissingColumn { .. })
        ));
        Ok(())
    }

    #[test]
    fn converts_every_timestamp_unit() -> TestResult {
        let expected = CellValue::Timestamp(utc_millis(1_500));
        assert_eq!(timestamp_cell("t", &TimeUnit::Millisecond, 1_500)?, expected);
        assert_eq!(timestamp_cell("t", &TimeUnit::Microsecond, 1_500_000)?, expected);
        assert_eq!(
            timestamp_cell("t", &TimeUnit::Nanosecond, 1_500_000_000)?,
            expected
        );
        assert_eq!(
            timestamp_cell("t", &TimeUnit::Second, 2)?,
            CellValue::Timestamp(utc_millis(2_000))
        );
        assert!(matches!(
            timestamp_cell("t", &TimeUnit::Second, i64::MAX),
            Err(CursorError::TimestampOutOfRange { .. })
        ));
        Ok(())
    }
}
