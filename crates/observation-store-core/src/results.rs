//! Result buffer filled from flushed blocks.
//!
//! Every flushed [`Block`] is handed to a [`BlockSink`]. The default sink is
//! [`ResultBuilder`], which renders blocks in one of three shapes:
//!
//! - [`ResultMode::Csv`]: delimited text, tokens separated by
//!   `token_separator`, blocks terminated by `block_separator`;
//! - [`ResultMode::DataArray`]: rows of typed cells, convertible to an Arrow
//!   [`RecordBatch`];
//! - [`ResultMode::Count`]: only the number of blocks.
//!
//! Column order is always: identity (when requested), cast time (profiles,
//! when requested), main field, then the working fields in catalog order.
use std::sync::Arc;

use arrow::{
    array::{
        ArrayRef, BooleanBuilder, Float64Builder, RecordBatch, StringBuilder,
        TimestampMillisecondBuilder,
    },
    datatypes::{DataType, Field as ArrowField, Schema, TimeUnit},
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    block::Block,
    catalog::{FieldType, WorkingSet},
    cursor::{CellValue, columns},
    error::{ArrowSnafu, IllegalStateSnafu, ObservationError, UnsupportedFieldTypeSnafu},
};

/// Timezone of timestamp columns; offset form so writers need no tz database.
const UTC_OFFSET: &str = "+00:00";

/// Receiver of flushed blocks.
pub trait BlockSink {
    /// Consume one closed block. The block is reset by the caller afterwards.
    fn write_block(&mut self, block: &Block) -> Result<(), ObservationError>;
}

/// Output shape of a result buffer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultMode {
    /// Delimited text.
    #[default]
    Csv,
    /// Typed rows.
    DataArray,
    /// Block count only.
    Count,
}

/// Separators used by [`ResultMode::Csv`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TextEncoding {
    /// Between values of one block.
    pub token_separator: String,
    /// After each block.
    pub block_separator: String,
    /// Decimal point of rendered numbers.
    pub decimal_separator: String,
}

impl Default for TextEncoding {
    fn default() -> Self {
        TextEncoding {
            token_separator: ",".to_string(),
            block_separator: "@@".to_string(),
            decimal_separator: ".".to_string(),
        }
    }
}

/// Name and type of one output column.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResultColumn {
    /// Column name.
    pub name: String,
    /// Value type.
    pub data_type: FieldType,
    /// Unit of measure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uom: Option<String>,
}

/// Column layout of every row a builder produces.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultLayout {
    include_id: bool,
    include_time: bool,
    columns: Vec<ResultColumn>,
}

impl ResultLayout {
    /// Layout for blocks pivoted over `working`.
    ///
    /// `include_time` only applies to profiles; time series carry their
    /// instant in the main column already.
    pub fn for_working_set(working: &WorkingSet, include_id: bool, include_time: bool) -> Self {
        let include_time = include_time && working.procedure_type().is_profile();
        let mut cols = Vec::with_capacity(working.len() + 3);
        if include_id {
            cols.push(ResultColumn {
                name: columns::ID.to_string(),
                data_type: FieldType::Text,
                uom: None,
            });
        }
        if include_time {
            cols.push(ResultColumn {
                name: columns::TIME.to_string(),
                data_type: FieldType::Time,
                uom: None,
            });
        }
        for field in std::iter::once(working.main()).chain(working.fields()) {
            cols.push(ResultColumn {
                name: field.name.clone(),
                data_type: field.data_type,
                uom: field.uom.clone(),
            });
        }
        ResultLayout {
            include_id,
            include_time,
            columns: cols,
        }
    }

    /// Output columns in order.
    pub fn columns(&self) -> &[ResultColumn] {
        &self.columns
    }

    fn cells(&self, block: &Block) -> Vec<CellValue> {
        let mut cells = Vec::with_capacity(self.columns.len());
        if self.include_id {
            cells.push(
                block
                    .id()
                    .map_or(CellValue::Null, |id| CellValue::Text(id.to_string())),
            );
        }
        if self.include_time {
            cells.push(
                block
                    .time_column()
                    .map_or(CellValue::Null, CellValue::Timestamp),
            );
        }
        cells.push(block.main().unwrap_or(CellValue::Null));
        cells.extend(block.values().iter().cloned());
        cells
    }
}

/// Rendered result values, see [`ResultBuilder::into_values`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultValues {
    /// Delimited text.
    Text(String),
    /// Typed rows.
    DataArray(Vec<Vec<CellValue>>),
    /// Block count.
    Count(usize),
}

/// Accumulates flushed blocks in the configured [`ResultMode`].
#[derive(Debug, Clone)]
pub struct ResultBuilder {
    mode: ResultMode,
    encoding: TextEncoding,
    layout: ResultLayout,
    text: String,
    rows: Vec<Vec<CellValue>>,
    count: usize,
}

impl ResultBuilder {
    /// Create an empty builder.
    pub fn new(mode: ResultMode, encoding: TextEncoding, layout: ResultLayout) -> Self {
        ResultBuilder {
            mode,
            encoding,
            layout,
            text: String::new(),
            rows: Vec::new(),
            count: 0,
        }
    }

    /// Empty builder with the same mode, encoding and layout.
    pub fn empty_like(&self) -> Self {
        ResultBuilder::new(self.mode, self.encoding.clone(), self.layout.clone())
    }

    /// Move the content of `other` to the end of this builder.
    pub fn append(&mut self, other: ResultBuilder) {
        self.text.push_str(&other.text);
        self.rows.extend(other.rows);
        self.count += other.count;
    }

    /// Output shape.
    pub fn mode(&self) -> ResultMode {
        self.mode
    }

    /// Text separators.
    pub fn encoding(&self) -> &TextEncoding {
        &self.encoding
    }

    /// Column layout.
    pub fn layout(&self) -> &ResultLayout {
        &self.layout
    }

    /// Number of blocks written.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Rendered text ([`ResultMode::Csv`] only, empty otherwise).
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Typed rows ([`ResultMode::DataArray`] only, empty otherwise).
    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    /// Consume the builder into its rendered values.
    pub fn into_values(self) -> ResultValues {
        match self.mode {
            ResultMode::Csv => ResultValues::Text(self.text),
            ResultMode::DataArray => ResultValues::DataArray(self.rows),
            ResultMode::Count => ResultValues::Count(self.count),
        }
    }

    /// Convert typed rows to an Arrow batch, one column per layout column.
    ///
    /// Instants become UTC millisecond timestamps; sentinels become nulls.
    pub fn to_record_batch(&self) -> Result<RecordBatch, ObservationError> {
        ensure!(
            self.mode == ResultMode::DataArray,
            IllegalStateSnafu {
                message: format!("record batch requested from a {:?} result", self.mode),
            }
        );

        let mut fields = Vec::with_capacity(self.layout.columns.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.layout.columns.len());
        for (idx, column) in self.layout.columns.iter().enumerate() {
            let cells = self.rows.iter().map(|row| &row[idx]);
            let (data_type, array) = column_array(column, cells)?;
            fields.push(ArrowField::new(&column.name, data_type, true));
            arrays.push(array);
        }

        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).context(ArrowSnafu)
    }

    fn render_cell(&self, cell: &CellValue) -> String {
        match cell {
            CellValue::Null => String::new(),
            CellValue::Integer(v) => v.to_string(),
            CellValue::Double(v) => {
                let rendered = format_double(*v);
                if self.encoding.decimal_separator == "." {
                    rendered
                } else {
                    rendered.replace('.', &self.encoding.decimal_separator)
                }
            }
            CellValue::Text(v) => v.clone(),
            CellValue::Boolean(v) => v.to_string(),
            CellValue::Timestamp(t) => format_instant(t),
        }
    }
}

impl BlockSink for ResultBuilder {
    fn write_block(&mut self, block: &Block) -> Result<(), ObservationError> {
        match self.mode {
            ResultMode::Csv => {
                let cells = self.layout.cells(block);
                let line = cells
                    .iter()
                    .map(|c| self.render_cell(c))
                    .collect::<Vec<_>>()
                    .join(&self.encoding.token_separator);
                self.text.push_str(&line);
                self.text.push_str(&self.encoding.block_separator);
            }
            ResultMode::DataArray => {
                let cells = self.layout.cells(block);
                self.rows.push(cells);
            }
            ResultMode::Count => {}
        }
        self.count += 1;
        Ok(())
    }
}

/// Render an instant the way every text output does.
pub fn format_instant(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn format_double(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        v.to_string()
    }
}

fn mismatch(column: &ResultColumn, cell: &CellValue) -> ObservationError {
    UnsupportedFieldTypeSnafu {
        field: column.name.clone(),
        expected: column.data_type.to_string(),
        found: cell.type_name(),
    }
    .build()
}

fn column_array<'a>(
    column: &ResultColumn,
    cells: impl Iterator<Item = &'a CellValue>,
) -> Result<(DataType, ArrayRef), ObservationError> {
    match column.data_type {
        FieldType::Quantity => {
            let mut builder = Float64Builder::new();
            for cell in cells {
                match cell {
                    CellValue::Null => builder.append_null(),
                    CellValue::Double(v) if v.is_nan() => builder.append_null(),
                    CellValue::Double(v) => builder.append_value(*v),
                    CellValue::Integer(v) => builder.append_value(*v as f64),
                    other => return Err(mismatch(column, other)),
                }
            }
            Ok((DataType::Float64, Arc::new(builder.finish())))
        }
        FieldType::Time => {
            let mut builder = TimestampMillisecondBuilder::new().with_timezone(UTC_OFFSET);
            for cell in cells {
                match cell {
                    CellValue::Null => builder.append_null(),
                    CellValue::Timestamp(t) => builder.append_value(t.timestamp_millis()),
                    other => return Err(mismatch(column, other)),
                }
            }
            Ok((
                DataType::Timestamp(TimeUnit::Millisecond, Some(UTC_OFFSET.into())),
                Arc::new(builder.finish()),
            ))
        }
        FieldType::Boolean => {
            let mut builder = BooleanBuilder::new();
            for cell in cells {
                match cell {
                    CellValue::Null => builder.append_null(),
                    CellValue::Boolean(v) => builder.append_value(*v),
                    other => return Err(mismatch(column, other)),
                }
            }
            Ok((DataType::Boolean, Arc::new(builder.finish())))
        }
        FieldType::Text => {
            let mut builder = StringBuilder::new();
            for cell in cells {
                match cell {
                    CellValue::Null => builder.append_null(),
                    CellValue::Text(v) => builder.append_value(v),
                    CellValue::Timestamp(t) => builder.append_value(format_instant(t)),
                    CellValue::Integer(v) => builder.append_value(v.to_string()),
                    CellValue::Double(v) => builder.append_value(v.to_string()),
                    CellValue::Boolean(v) => builder.append_value(v.to_string()),
                }
            }
            Ok((DataType::Utf8, Arc::new(builder.finish())))
        }
    }
}
