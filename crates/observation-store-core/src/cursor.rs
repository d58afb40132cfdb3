//! Forward-only cursor contract over pre-ordered measure rows.
//!
//! The engine never issues queries itself. It consumes an already-open cursor
//! whose rows are ordered by grouping key (then by observed property) and
//! advances it with [`ResultCursor::next_on_field`]. Values are read by column
//! name through typed accessors; multi-table cursors can also be addressed by
//! table number.
//!
//! Narrow measure rows use the column names in [`columns`]; the main field is
//! read from the column named after it.
//!
//! Cursors release whatever they hold when dropped, so every exit path of a
//! read (including `?` propagation) closes them.
use std::cmp::Ordering;

use arrow::datatypes::DataType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use snafu::prelude::*;

mod batch;
mod merge;

pub use batch::RecordBatchCursor;
pub use merge::MergedCursor;

/// Column names of narrow measure rows.
pub mod columns {
    /// Synthetic or stored measurement identifier.
    pub const ID: &str = "id";
    /// Cast timestamp for profiles.
    pub const TIME: &str = "time";
    /// Observed-property identifier (the field name).
    pub const OBSERVED_PROPERTY: &str = "obsprop_id";
    /// Measured value.
    pub const RESULT: &str = "result";
    /// Series key column of a bounds (MIN/MAX) cursor for profiles.
    pub const SERIES_TIME: &str = "series_time";
    /// Lower bound column of a bounds cursor.
    pub const MIN_VALUE: &str = "min_value";
    /// Upper bound column of a bounds cursor.
    pub const MAX_VALUE: &str = "max_value";
}

/// Errors raised while reading from a cursor.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CursorError {
    /// The requested column is not part of the result set.
    #[snafu(display("Column {column} not found in result set"))]
    MissingColumn {
        /// Requested column.
        column: String,
    },

    /// The column holds a value of another type than requested.
    #[snafu(display("Column {column} holds {found}, expected {expected}"))]
    ColumnType {
        /// Column being read.
        column: String,
        /// Requested type.
        expected: &'static str,
        /// Type encountered.
        found: &'static str,
    },

    /// A value was read before the first successful advance or after the end.
    #[snafu(display("Cursor is not positioned on a row"))]
    NoCurrentRow,

    /// No child cursor is bound to the requested table number.
    #[snafu(display("No cursor for measure table {table_number}"))]
    UnknownTable {
        /// Requested table number.
        table_number: usize,
    },

    /// Arrow column type the cursor cannot expose.
    #[snafu(display("Unsupported arrow type for column {column}: {datatype}"))]
    UnsupportedArrowType {
        /// Column being read.
        column: String,
        /// Arrow type of the column.
        datatype: DataType,
    },

    /// Timestamp outside the representable range.
    #[snafu(display("Timestamp value {value} in column {column} is out of range"))]
    TimestampOutOfRange {
        /// Column being read.
        column: String,
        /// Raw integer value.
        value: i64,
    },
}

/// One dynamically typed cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    /// SQL NULL.
    Null,
    /// Integer value.
    Integer(i64),
    /// Floating point value (NaN is the missing-quantity sentinel).
    Double(f64),
    /// Text value.
    Text(String),
    /// Boolean value.
    Boolean(bool),
    /// Instant.
    Timestamp(DateTime<Utc>),
}

impl CellValue {
    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            CellValue::Null => "null",
            CellValue::Integer(_) => "integer",
            CellValue::Double(_) => "double",
            CellValue::Text(_) => "text",
            CellValue::Boolean(_) => "boolean",
            CellValue::Timestamp(_) => "timestamp",
        }
    }

    /// True for SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Total order used to merge cursors by key.
    ///
    /// Nulls sort first; numbers compare numerically across integer/double;
    /// values of unrelated types compare by type name so the order is total.
    pub fn cmp_key(&self, other: &CellValue) -> Ordering {
        use CellValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Double(b)) => (*a as f64).total_cmp(b),
            (Double(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (Double(a), Double(b)) => a.total_cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (a, b) => a.type_name().cmp(b.type_name()),
        }
    }
}

/// Forward-only cursor over rows ordered by grouping key.
pub trait ResultCursor {
    /// Advance to the next row in `field` order. Returns `false` at the end.
    ///
    /// Single-table cursors are already ordered and simply advance; merging
    /// cursors use `field` as the merge key.
    fn next_on_field(&mut self, field: &str) -> Result<bool, CursorError>;

    /// True when the result set exposes `column`.
    fn has_column(&self, column: &str) -> bool;

    /// Value of `column` in the current row.
    fn value(&self, column: &str) -> Result<CellValue, CursorError>;

    /// Value of `column` in the current row of measure table `table_number`.
    fn value_in_table(&self, column: &str, table_number: usize) -> Result<CellValue, CursorError> {
        if table_number != crate::catalog::FIRST_TABLE {
            return UnknownTableSnafu { table_number }.fail();
        }
        self.value(column)
    }

    /// Measure table the current row comes from.
    fn current_table(&self) -> usize {
        crate::catalog::FIRST_TABLE
    }

    /// Read `column` as an instant; `None` for NULL.
    fn get_timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, CursorError> {
        match self.value(column)? {
            CellValue::Null => Ok(None),
            CellValue::Timestamp(t) => Ok(Some(t)),
            other => ColumnTypeSnafu {
                column,
                expected: "timestamp",
                found: other.type_name(),
            }
            .fail(),
        }
    }

    /// Read `column` as a double; integers widen. `None` for NULL.
    fn get_f64(&self, column: &str) -> Result<Option<f64>, CursorError> {
        match self.value(column)? {
            CellValue::Null => Ok(None),
            CellValue::Double(v) => Ok(Some(v)),
            CellValue::Integer(v) => Ok(Some(v as f64)),
            other => ColumnTypeSnafu {
                column,
                expected: "double",
                found: other.type_name(),
            }
            .fail(),
        }
    }

    /// Read `column` as an integer; `None` for NULL.
    fn get_i64(&self, column: &str) -> Result<Option<i64>, CursorError> {
        match self.value(column)? {
            CellValue::Null => Ok(None),
            CellValue::Integer(v) => Ok(Some(v)),
            other => ColumnTypeSnafu {
                column,
                expected: "integer",
                found: other.type_name(),
            }
            .fail(),
        }
    }

    /// Read `column` as text; `None` for NULL.
    fn get_text(&self, column: &str) -> Result<Option<String>, CursorError> {
        match self.value(column)? {
            CellValue::Null => Ok(None),
            CellValue::Text(v) => Ok(Some(v)),
            other => ColumnTypeSnafu {
                column,
                expected: "text",
                found: other.type_name(),
            }
            .fail(),
        }
    }
}

impl<C: ResultCursor + ?Sized> ResultCursor for Box<C> {
    fn next_on_field(&mut self, field: &str) -> Result<bool, CursorError> {
        (**self).next_on_field(field)
    }

    fn has_column(&self, column: &str) -> bool {
        (**self).has_column(column)
    }

    fn value(&self, column: &str) -> Result<CellValue, CursorError> {
        (**self).value(column)
    }

    fn value_in_table(&self, column: &str, table_number: usize) -> Result<CellValue, CursorError> {
        (**self).value_in_table(column, table_number)
    }

    fn current_table(&self) -> usize {
        (**self).current_table()
    }
}

/// In-memory cursor over owned rows.
#[derive(Debug, Clone, Default)]
pub struct RowCursor {
    columns: Vec<String>,
    rows: Vec<Vec<CellValue>>,
    position: Option<usize>,
}

impl RowCursor {
    /// Create a cursor; every row must have one cell per column.
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>, rows: Vec<Vec<CellValue>>) -> Self {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        debug_assert!(
            rows.iter().all(|r| r.len() == columns.len()),
            "every row must match the column count"
        );
        RowCursor {
            columns,
            rows,
            position: None,
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the cursor holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column_index(&self, column: &str) -> Result<usize, CursorError> {
        self.columns
            .iter()
            .position(|c| c == column)
            .context(MissingColumnSnafu { column })
    }
}

impl ResultCursor for RowCursor {
    fn next_on_field(&mut self, _field: &str) -> Result<bool, CursorError> {
        let next = self.position.map_or(0, |p| p + 1);
        self.position = Some(next.min(self.rows.len()));
        Ok(next < self.rows.len())
    }

    fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    fn value(&self, column: &str) -> Result<CellValue, CursorError> {
        let idx = self.column_index(column)?;
        let row = self
            .position
            .and_then(|p| self.rows.get(p))
            .context(NoCurrentRowSnafu)?;
        Ok(row[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;

    #[test]
    fn row_cursor_walks_rows_then_stops() -> TestResult {
        let mut cursor = RowCursor::new(
            ["time", "result"],
            vec![
                vec![ts(1_000), CellValue::Double(1.0)],
                vec![ts(2_000), CellValue::Double(2.0)],
            ],
        );

        assert!(matches!(
            cursor.value("result"),
            Err(CursorError::NoCurrentRow)
        ));
        assert!(cursor.next_on_field("time")?);
        assert_eq!(cursor.get_f64("result")?, Some(1.0));
        assert!(cursor.next_on_field("time")?);
        assert_eq!(cursor.get_timestamp("time")?, Some(utc_millis(2_000)));
        assert!(!cursor.next_on_field("time")?);
        assert!(!cursor.next_on_field("time")?);
        assert!(matches!(
            cursor.value("result"),
            Err(CursorError::NoCurrentRow)
        ));
        Ok(())
    }

    #[test]
    fn typed_accessors_reject_other_types() -> TestResult {
        let mut cursor = RowCursor::new(["a"], vec![vec![CellValue::Text("x".into())]]);
        cursor.next_on_field("a")?;
        assert_eq!(cursor.get_text("a")?, Some("x".to_string()));
        let err = cursor.get_f64("a").expect_err("text is not a double");
        assert!(matches!(err, CursorError::ColumnType { .. }));
        assert!(matches!(
            cursor.value("b"),
            Err(CursorError::MissingColumn { .. })
        ));
        Ok(())
    }

    #[test]
    fn single_table_cursor_rejects_other_tables() -> TestResult {
        let mut cursor = RowCursor::new(["a"], vec![vec![CellValue::Integer(3)]]);
        cursor.next_on_field("a")?;
        assert_eq!(cursor.value_in_table("a", 1)?, CellValue::Integer(3));
        assert!(matches!(
            cursor.value_in_table("a", 2),
            Err(CursorError::UnknownTable { table_number: 2 })
        ));
        Ok(())
    }

    #[test]
    fn cmp_key_orders_mixed_numbers_and_nulls() {
        assert_eq!(
            CellValue::Integer(2).cmp_key(&CellValue::Double(2.5)),
            Ordering::Less
        );
        assert_eq!(
            CellValue::Null.cmp_key(&CellValue::Double(-1.0)),
            Ordering::Less
        );
        assert_eq!(ts(5).cmp_key(&ts(5)), Ordering::Equal);
    }
}
