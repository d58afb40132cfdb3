//! Row-grouping pivot.
//!
//! Measure rows arrive narrow, one row per `(key, observed property)`, and
//! ordered by grouping key then observed property. The pivot turns each run of
//! rows sharing a key into one fixed-width [`Block`]:
//!
//! - the key is the main value for time series and trajectories, and
//!   `(time, main value)` for profiles;
//! - on a key change the open block is flushed to a [`BlockSink`] and a new one
//!   is opened, writing the identity column, the cast time (profiles) and the
//!   main value once;
//! - each row stores its `result` under the working field named by its
//!   observed property (last write wins); rows for other properties are
//!   ignored;
//! - the last open block is flushed at the end of the stream.
//!
//! When the working set holds no measure field (only-main mode) the
//! observed-property and result columns are neither required nor read.
//!
//! Any value that cannot be read as its field's declared type aborts the whole
//! read; [`RowProcessor::process_results`] stages its output so that a failed
//! read leaves the processor's buffer untouched.
use chrono::{DateTime, Utc};
use log::debug;
use snafu::prelude::*;

use crate::{
    block::{Block, GroupKey, MainValue, sentinel},
    catalog::{Field, FieldType, ProcedureInfo, WorkingSet},
    cursor::{CellValue, ResultCursor, columns},
    error::{
        FieldParseSnafu, IllegalStateSnafu, MalformedCursorSnafu, ObservationError,
        UnsupportedFieldTypeSnafu,
    },
    request::SqlRequest,
    results::{BlockSink, ResultBuilder, ResultLayout, ResultMode, TextEncoding},
};

/// Caller-controlled knobs of a pivot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessorOptions {
    /// Output shape of the result buffer.
    pub mode: ResultMode,
    /// Separators for [`ResultMode::Csv`].
    pub encoding: TextEncoding,
    /// Emit an identity column in front of every block.
    pub include_id: bool,
    /// Emit the cast time column for profiles.
    pub include_time: bool,
    /// Prefix of identity column values; the measurement id is appended.
    pub block_id_prefix: String,
}

/// Deterministic measurement id for rows that carry no `id` column.
///
/// Time series use the instant in epoch milliseconds. Profiles mix the cast
/// instant with the depth so that every `(time, depth)` pair gets its own id.
pub fn synthetic_measurement_id(time: Option<DateTime<Utc>>, depth: Option<f64>) -> i64 {
    let millis = time.map_or(0, |t| t.timestamp_millis());
    let Some(depth) = depth else {
        return millis;
    };
    // splitmix64 finalizer
    let mut z = (millis as u64) ^ depth.to_bits().rotate_left(32);
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    ((z ^ (z >> 31)) & (i64::MAX as u64)) as i64
}

/// Coerce a raw `result` cell to the declared type of `field`.
pub(crate) fn coerce_result(field: &Field, raw: CellValue) -> Result<CellValue, ObservationError> {
    let unsupported = |found: &CellValue| {
        UnsupportedFieldTypeSnafu {
            field: field.name.clone(),
            expected: field.data_type.to_string(),
            found: found.type_name(),
        }
        .build()
    };

    match (field.data_type, raw) {
        (ty, CellValue::Null) => Ok(sentinel(ty)),

        (FieldType::Quantity, CellValue::Double(v)) => Ok(CellValue::Double(v)),
        (FieldType::Quantity, CellValue::Integer(v)) => Ok(CellValue::Double(v as f64)),
        (FieldType::Quantity, CellValue::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(CellValue::Double)
            .ok()
            .context(FieldParseSnafu {
                field: field.name.clone(),
                value: s,
            }),

        (FieldType::Boolean, CellValue::Boolean(v)) => Ok(CellValue::Boolean(v)),
        (FieldType::Boolean, CellValue::Integer(v @ (0 | 1))) => Ok(CellValue::Boolean(v == 1)),
        (FieldType::Boolean, CellValue::Text(s)) => match s.trim().to_ascii_lowercase().as_str()
        {
            "true" | "1" => Ok(CellValue::Boolean(true)),
            "false" | "0" => Ok(CellValue::Boolean(false)),
            _ => FieldParseSnafu {
                field: field.name.clone(),
                value: s,
            }
            .fail(),
        },

        (FieldType::Time, CellValue::Timestamp(t)) => Ok(CellValue::Timestamp(t)),
        (FieldType::Time, CellValue::Integer(ms)) => DateTime::<Utc>::from_timestamp_millis(ms)
            .map(CellValue::Timestamp)
            .context(FieldParseSnafu {
                field: field.name.clone(),
                value: ms.to_string(),
            }),
        (FieldType::Time, CellValue::Text(s)) => DateTime::parse_from_rfc3339(s.trim())
            .map(|t| CellValue::Timestamp(t.with_timezone(&Utc)))
            .ok()
            .context(FieldParseSnafu {
                field: field.name.clone(),
                value: s,
            }),

        (FieldType::Text, CellValue::Text(s)) => Ok(CellValue::Text(s)),
        (FieldType::Text, CellValue::Integer(v)) => Ok(CellValue::Text(v.to_string())),
        (FieldType::Text, CellValue::Double(v)) => Ok(CellValue::Text(v.to_string())),
        (FieldType::Text, CellValue::Boolean(v)) => Ok(CellValue::Text(v.to_string())),
        (FieldType::Text, CellValue::Timestamp(t)) => Ok(CellValue::Text(
            crate::results::format_instant(&t),
        )),

        (_, other) => Err(unsupported(&other)),
    }
}

/// Walks a cursor group by group, filling one block per grouping key.
pub(crate) struct GroupReader<'a> {
    cursor: &'a mut dyn ResultCursor,
    working: &'a WorkingSet,
    options: &'a ProcessorOptions,
    read_time: bool,
    read_id: bool,
    pending: bool,
    exhausted: bool,
}

impl<'a> GroupReader<'a> {
    /// Check the cursor metadata against the working set.
    pub(crate) fn new(
        cursor: &'a mut dyn ResultCursor,
        working: &'a WorkingSet,
        options: &'a ProcessorOptions,
    ) -> Result<Self, ObservationError> {
        let main = &working.main().name;
        ensure!(
            cursor.has_column(main),
            MalformedCursorSnafu {
                column: main.clone()
            }
        );
        if !working.is_empty() {
            for column in [columns::OBSERVED_PROPERTY, columns::RESULT] {
                ensure!(cursor.has_column(column), MalformedCursorSnafu { column });
            }
        }

        // profile keys are (cast time, depth); depth alone would merge casts
        let profile = working.procedure_type().is_profile();
        if profile {
            ensure!(
                cursor.has_column(columns::TIME),
                MalformedCursorSnafu {
                    column: columns::TIME
                }
            );
        }

        Ok(GroupReader {
            read_time: profile,
            read_id: cursor.has_column(columns::ID),
            cursor,
            working,
            options,
            pending: false,
            exhausted: false,
        })
    }

    fn advance(&mut self) -> Result<bool, ObservationError> {
        let working = self.working;
        Ok(self.cursor.next_on_field(&working.main().name)?)
    }

    fn read_key(&self) -> Result<GroupKey, ObservationError> {
        let main = self.working.main();
        let raw = self.cursor.value(&main.name)?;
        let value = match (main.data_type, raw) {
            (FieldType::Time, CellValue::Timestamp(t)) => MainValue::Time(t),
            (FieldType::Quantity, CellValue::Double(v)) => MainValue::Number(v),
            (FieldType::Quantity, CellValue::Integer(v)) => MainValue::Number(v as f64),
            (expected, other) => {
                return UnsupportedFieldTypeSnafu {
                    field: main.name.clone(),
                    expected: expected.to_string(),
                    found: other.type_name(),
                }
                .fail();
            }
        };

        let time = if self.read_time {
            self.cursor.get_timestamp(columns::TIME)?
        } else {
            None
        };
        Ok(GroupKey { time, main: value })
    }

    fn measurement_id(&self, key: &GroupKey) -> Result<i64, ObservationError> {
        let stored = if self.read_id {
            self.cursor.get_i64(columns::ID)?
        } else {
            None
        };
        Ok(stored.unwrap_or_else(|| {
            let depth = match key.main {
                MainValue::Number(v) => Some(v),
                MainValue::Time(_) => None,
            };
            synthetic_measurement_id(key.instant(), depth)
        }))
    }

    fn open(&self, block: &mut Block, key: GroupKey) -> Result<(), ObservationError> {
        let measurement_id = self.measurement_id(&key)?;
        let id = self
            .options
            .include_id
            .then(|| format!("{}{}", self.options.block_id_prefix, measurement_id));
        let time = if self.options.include_time && self.working.procedure_type().is_profile() {
            key.time
        } else {
            None
        };
        block.open(key, measurement_id, id, time);
        Ok(())
    }

    fn apply_row(&self, block: &mut Block) -> Result<(), ObservationError> {
        if self.working.is_empty() {
            return Ok(());
        }
        let property = match self.cursor.value(columns::OBSERVED_PROPERTY)? {
            CellValue::Text(s) => s,
            CellValue::Integer(v) => v.to_string(),
            _ => return Ok(()),
        };
        let Some(position) = self.working.position(&property) else {
            return Ok(());
        };
        let field = &self.working.fields()[position];
        let value = coerce_result(field, self.cursor.value(columns::RESULT)?)?;
        block.set(position, value);
        Ok(())
    }

    /// Fill `block` (which must be fresh) with the next group.
    ///
    /// Returns `false` once the cursor is exhausted.
    pub(crate) fn next_group(&mut self, block: &mut Block) -> Result<bool, ObservationError> {
        if self.exhausted {
            return Ok(false);
        }
        if !self.pending && !self.advance()? {
            self.exhausted = true;
            return Ok(false);
        }
        self.pending = false;

        let key = self.read_key()?;
        self.open(block, key)?;
        self.apply_row(block)?;

        loop {
            if !self.advance()? {
                self.exhausted = true;
                break;
            }
            if self.read_key()? != key {
                self.pending = true;
                break;
            }
            self.apply_row(block)?;
        }

        block.close();
        Ok(true)
    }
}

/// Shared settings of every row processor: what to read and how to render it.
#[derive(Debug, Clone)]
pub struct Pivot {
    procedure: ProcedureInfo,
    phenomena: Vec<String>,
    options: ProcessorOptions,
}

impl Pivot {
    /// Pivot over every field of `procedure`.
    pub fn new(procedure: ProcedureInfo, options: ProcessorOptions) -> Self {
        Pivot {
            procedure,
            phenomena: Vec::new(),
            options,
        }
    }

    /// Restrict the working set to the named fields.
    pub fn with_phenomena(mut self, phenomena: Vec<String>) -> Self {
        self.phenomena = phenomena;
        self
    }

    /// Procedure being read.
    pub fn procedure(&self) -> &ProcedureInfo {
        &self.procedure
    }

    /// Requested phenomena (empty for all).
    pub fn phenomena(&self) -> &[String] {
        &self.phenomena
    }

    /// Rendering options.
    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Working set for `field_offset`.
    pub fn working_set(&self, field_offset: usize) -> Result<WorkingSet, ObservationError> {
        self.procedure
            .working_set_for(field_offset, &self.phenomena)
    }

    /// Output layout of the blocks produced for `field_offset`.
    pub fn layout(&self, field_offset: usize) -> Result<ResultLayout, ObservationError> {
        Ok(ResultLayout::for_working_set(
            &self.working_set(field_offset)?,
            self.options.include_id,
            self.options.include_time,
        ))
    }

    /// Empty result buffer for `field_offset`.
    pub fn new_builder(&self, field_offset: usize) -> Result<ResultBuilder, ObservationError> {
        Ok(ResultBuilder::new(
            self.options.mode,
            self.options.encoding.clone(),
            self.layout(field_offset)?,
        ))
    }

    /// Rewrite the projection and ordering of `request` for this pivot.
    ///
    /// Rows come back ordered by `(main, obsprop)`, or `(time, main, obsprop)`
    /// for profiles, which is what grouping relies on.
    pub fn compute_request(
        &self,
        request: &mut SqlRequest,
        field_offset: usize,
    ) -> Result<(), ObservationError> {
        let working = self.working_set(field_offset)?;
        let profile = working.procedure_type().is_profile();
        let main = request.column(&working.main().name);

        let mut select = Vec::new();
        if self.options.include_id {
            select.push(request.column(columns::ID));
        }
        if profile {
            select.push(request.column(columns::TIME));
        }
        select.push(main.clone());

        let mut order_by = Vec::new();
        if profile {
            order_by.push(request.column(columns::TIME));
        }
        order_by.push(main);

        if !working.is_empty() {
            let property = request.column(columns::OBSERVED_PROPERTY);
            select.push(property.clone());
            select.push(request.column(columns::RESULT));
            order_by.push(property);
        }

        request.select = select;
        request.order_by = order_by;
        Ok(())
    }

    /// Plain pivot: one block per distinct key, written to `sink`.
    pub(crate) fn pivot_into(
        &self,
        cursor: &mut dyn ResultCursor,
        field_offset: usize,
        sink: &mut dyn BlockSink,
    ) -> Result<usize, ObservationError> {
        let working = self.working_set(field_offset)?;
        let mut reader = GroupReader::new(cursor, &working, &self.options)?;
        let mut block = Block::for_fields(working.fields());
        let mut count = 0;
        while reader.next_group(&mut block)? {
            sink.write_block(&block)?;
            block.reset();
            count += 1;
        }
        debug!(
            "pivoted {count} blocks for procedure {} ({} fields)",
            self.procedure.procedure_id,
            working.len()
        );
        Ok(count)
    }
}

/// A strategy turning measure rows into blocks.
///
/// Implemented by [`ResultProcessor`] (one block per key) and
/// [`ResultDecimator`](crate::decimate::ResultDecimator) (bounded block count).
pub trait RowProcessor {
    /// Shared pivot settings.
    fn pivot(&self) -> &Pivot;

    /// Stream `cursor` into `sink`, returning the number of blocks written.
    fn process_into(
        &self,
        cursor: &mut dyn ResultCursor,
        field_offset: usize,
        sink: &mut dyn BlockSink,
    ) -> Result<usize, ObservationError>;

    /// Accumulated result buffer, if anything was processed yet.
    fn builder(&self) -> Option<&ResultBuilder>;

    /// Slot holding the accumulated result buffer.
    fn builder_slot(&mut self) -> &mut Option<ResultBuilder>;

    /// Procedure being read.
    fn procedure(&self) -> &ProcedureInfo {
        self.pivot().procedure()
    }

    /// Working set for `field_offset`.
    fn working_set(&self, field_offset: usize) -> Result<WorkingSet, ObservationError> {
        self.pivot().working_set(field_offset)
    }

    /// Rewrite the projection and ordering of `request`.
    fn compute_request(
        &self,
        request: &mut SqlRequest,
        field_offset: usize,
    ) -> Result<(), ObservationError> {
        self.pivot().compute_request(request, field_offset)
    }

    /// Stream `cursor` into the processor's own result buffer.
    ///
    /// Output is staged and only appended once the whole cursor was read, so a
    /// failure leaves the buffer as it was.
    fn process_results(
        &mut self,
        cursor: &mut dyn ResultCursor,
        field_offset: usize,
    ) -> Result<usize, ObservationError> {
        let mut staged = self.pivot().new_builder(field_offset)?;
        let count = self.process_into(cursor, field_offset, &mut staged)?;

        let slot = self.builder_slot();
        match slot {
            Some(existing) => {
                ensure!(
                    existing.layout() == staged.layout(),
                    IllegalStateSnafu {
                        message: "field offset changed between two reads into one buffer",
                    }
                );
                existing.append(staged);
            }
            None => *slot = Some(staged),
        }
        Ok(count)
    }

    /// Take the accumulated result buffer, leaving the processor empty.
    fn take_builder(&mut self) -> Option<ResultBuilder> {
        self.builder_slot().take()
    }
}

/// One block per distinct grouping key.
#[derive(Debug, Clone)]
pub struct ResultProcessor {
    pivot: Pivot,
    builder: Option<ResultBuilder>,
}

impl ResultProcessor {
    /// Create a processor for `procedure`.
    pub fn new(procedure: ProcedureInfo, options: ProcessorOptions) -> Self {
        ResultProcessor::from_pivot(Pivot::new(procedure, options))
    }

    /// Create a processor from prepared settings.
    pub fn from_pivot(pivot: Pivot) -> Self {
        ResultProcessor {
            pivot,
            builder: None,
        }
    }
}

impl RowProcessor for ResultProcessor {
    fn pivot(&self) -> &Pivot {
        &self.pivot
    }

    fn process_into(
        &self,
        cursor: &mut dyn ResultCursor,
        field_offset: usize,
        sink: &mut dyn BlockSink,
    ) -> Result<usize, ObservationError> {
        self.pivot.pivot_into(cursor, field_offset, sink)
    }

    fn builder(&self) -> Option<&ResultBuilder> {
        self.builder.as_ref()
    }

    fn builder_slot(&mut self) -> &mut Option<ResultBuilder> {
        &mut self.builder
    }
}
