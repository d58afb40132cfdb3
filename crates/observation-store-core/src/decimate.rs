//! Two-phase decimation.
//!
//! Very long series are reduced to at most `width + 2` blocks per series:
//!
//! 1. **Bounds.** The MIN/MAX of the main field is computed per series (one
//!    series for time series and trajectories, one per cast time for
//!    profiles), either by running [`ResultDecimator::bounds_request`] and
//!    feeding the aggregate cursor to [`ResultDecimator::compute_bounds`], or
//!    with a pass over raw rows ([`ResultDecimator::compute_bounds_from_rows`]).
//!    Each series is cut into `width` buckets of `step = (max - min) / width`.
//! 2. **Streaming.** Rows are grouped exactly like a plain pivot. The first
//!    and last group of every series are emitted as they are; every group in
//!    between is folded into the bucket containing its main value, and one
//!    block per non-empty bucket is emitted when the stream leaves it.
//!
//! A bucket keeps the last observed value of each field, and its main value is
//! the last main value it absorbed. A series with `min == max` has a zero step
//! and collapses into one bucket.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::debug;
use snafu::prelude::*;

use crate::{
    block::{Block, GroupKey},
    catalog::ProcedureInfo,
    cursor::{CellValue, ResultCursor, columns},
    error::{
        IllegalStateSnafu, InvalidDecimationWidthSnafu, MalformedCursorSnafu, ObservationError,
        UnsupportedFieldTypeSnafu,
    },
    pivot::{GroupReader, Pivot, ProcessorOptions, RowProcessor},
    request::SqlRequest,
    results::{BlockSink, ResultBuilder},
};

/// Series identifier: the cast time (epoch ms) for profiles, `None` otherwise.
pub type SeriesKey = Option<i64>;

/// MIN/MAX of the main field over one series, on the main field's numeric axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesBounds {
    /// Smallest main value.
    pub min: f64,
    /// Largest main value.
    pub max: f64,
}

impl SeriesBounds {
    fn merge(&mut self, other: SeriesBounds) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Bucket width for `width` buckets.
    pub fn step(&self, width: usize) -> f64 {
        (self.max - self.min) / width as f64
    }

    /// Index of the bucket containing `value`, in `0..width`.
    pub fn bucket_of(&self, value: f64, width: usize) -> usize {
        let step = self.step(width);
        if !(step.is_finite() && step > 0.0) {
            return 0;
        }
        let idx = ((value - self.min) / step).floor();
        if idx <= 0.0 {
            0
        } else {
            (idx as usize).min(width - 1)
        }
    }
}

fn flush_bucket(
    bucket: &mut Block,
    bucket_index: &mut Option<usize>,
    sink: &mut dyn BlockSink,
) -> Result<usize, ObservationError> {
    if bucket_index.take().is_none() {
        return Ok(0);
    }
    bucket.close();
    sink.write_block(bucket)?;
    bucket.reset();
    Ok(1)
}

fn series_of(key: &GroupKey) -> SeriesKey {
    key.time.map(|t| t.timestamp_millis())
}

fn axis_value(column: &str, cell: CellValue) -> Result<Option<f64>, ObservationError> {
    match cell {
        CellValue::Null => Ok(None),
        CellValue::Double(v) => Ok(Some(v)),
        CellValue::Integer(v) => Ok(Some(v as f64)),
        CellValue::Timestamp(t) => Ok(Some(t.timestamp_millis() as f64)),
        other => UnsupportedFieldTypeSnafu {
            field: column,
            expected: "number or timestamp",
            found: other.type_name(),
        }
        .fail(),
    }
}

/// Row processor emitting at most `width + 2` blocks per series.
#[derive(Debug, Clone)]
pub struct ResultDecimator {
    pivot: Pivot,
    width: usize,
    bounds: Option<BTreeMap<SeriesKey, SeriesBounds>>,
    builder: Option<ResultBuilder>,
}

impl ResultDecimator {
    /// Decimator producing `width` buckets per series.
    pub fn new(
        procedure: ProcedureInfo,
        options: ProcessorOptions,
        width: usize,
    ) -> Result<Self, ObservationError> {
        ResultDecimator::from_pivot(Pivot::new(procedure, options), width)
    }

    /// Decimator over prepared pivot settings.
    pub fn from_pivot(pivot: Pivot, width: usize) -> Result<Self, ObservationError> {
        ensure!(width > 0, InvalidDecimationWidthSnafu { width });
        Ok(ResultDecimator {
            pivot,
            width,
            bounds: None,
            builder: None,
        })
    }

    /// Number of buckets per series.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Bounds gathered so far.
    pub fn bounds(&self) -> Option<&BTreeMap<SeriesKey, SeriesBounds>> {
        self.bounds.as_ref()
    }

    /// Aggregate request computing the bounds over the rows `request` selects.
    ///
    /// The result exposes `min_value` and `max_value`, plus `series_time` for
    /// profiles (one row per cast).
    pub fn bounds_request(
        &self,
        request: &SqlRequest,
        field_offset: usize,
    ) -> Result<SqlRequest, ObservationError> {
        let working = self.pivot.working_set(field_offset)?;
        let main = request.column(&working.main().name);

        let mut bounds = request.clone();
        bounds.select.clear();
        bounds.group_by.clear();
        bounds.order_by.clear();
        if working.procedure_type().is_profile() {
            let time = request.column(columns::TIME);
            bounds
                .select
                .push(format!("{time} AS {}", columns::SERIES_TIME));
            bounds.group_by.push(time);
            bounds.order_by.push(columns::SERIES_TIME.to_string());
        }
        bounds
            .select
            .push(format!("MIN({main}) AS {}", columns::MIN_VALUE));
        bounds
            .select
            .push(format!("MAX({main}) AS {}", columns::MAX_VALUE));
        Ok(bounds)
    }

    /// Read an aggregate cursor produced by [`Self::bounds_request`].
    ///
    /// May be called once per measure table; bounds of the same series are
    /// merged. Returns the number of rows read.
    pub fn compute_bounds(&mut self, cursor: &mut dyn ResultCursor) -> Result<usize, ObservationError> {
        for column in [columns::MIN_VALUE, columns::MAX_VALUE] {
            ensure!(cursor.has_column(column), MalformedCursorSnafu { column });
        }
        let keyed = cursor.has_column(columns::SERIES_TIME);

        let mut rows = 0;
        while cursor.next_on_field(columns::MIN_VALUE)? {
            rows += 1;
            let series = if keyed {
                cursor
                    .get_timestamp(columns::SERIES_TIME)?
                    .map(|t| t.timestamp_millis())
            } else {
                None
            };
            let min = axis_value(columns::MIN_VALUE, cursor.value(columns::MIN_VALUE)?)?;
            let max = axis_value(columns::MAX_VALUE, cursor.value(columns::MAX_VALUE)?)?;
            // empty series aggregate to NULL
            if let (Some(min), Some(max)) = (min, max) {
                self.merge_bounds(series, SeriesBounds { min, max });
            }
        }
        // an aggregate over zero rows still counts as computed bounds
        self.bounds.get_or_insert_with(BTreeMap::new);
        debug!("read {rows} bounds row(s) for decimation width {}", self.width);
        Ok(rows)
    }

    /// Compute bounds with a pass over the raw measure rows.
    ///
    /// Used when no aggregate query can be issued; `cursor` must have the
    /// shape expected by [`RowProcessor::process_into`] and is consumed.
    pub fn compute_bounds_from_rows(
        &mut self,
        cursor: &mut dyn ResultCursor,
        field_offset: usize,
    ) -> Result<usize, ObservationError> {
        let working = self.pivot.working_set(field_offset)?;
        let mut collected: BTreeMap<SeriesKey, SeriesBounds> = BTreeMap::new();
        {
            let mut reader = GroupReader::new(cursor, &working, self.pivot.options())?;
            let mut block = Block::for_fields(working.fields());
            while reader.next_group(&mut block)? {
                if let Some(key) = block.key() {
                    let v = key.main.as_f64();
                    collected
                        .entry(series_of(key))
                        .and_modify(|b| b.merge(SeriesBounds { min: v, max: v }))
                        .or_insert(SeriesBounds { min: v, max: v });
                }
                block.reset();
            }
        }

        let series = collected.len();
        for (key, bounds) in collected {
            self.merge_bounds(key, bounds);
        }
        self.bounds.get_or_insert_with(BTreeMap::new);
        Ok(series)
    }

    /// Set the bounds of one series directly.
    pub fn set_bounds(&mut self, series_time: Option<DateTime<Utc>>, min: f64, max: f64) {
        self.merge_bounds(
            series_time.map(|t| t.timestamp_millis()),
            SeriesBounds { min, max },
        );
    }

    fn merge_bounds(&mut self, series: SeriesKey, bounds: SeriesBounds) {
        self.bounds
            .get_or_insert_with(BTreeMap::new)
            .entry(series)
            .and_modify(|b| b.merge(bounds))
            .or_insert(bounds);
    }

    fn decimate_into(
        &self,
        cursor: &mut dyn ResultCursor,
        field_offset: usize,
        sink: &mut dyn BlockSink,
    ) -> Result<usize, ObservationError> {
        let bounds = self.bounds.as_ref().context(IllegalStateSnafu {
            message: "decimation started before bounds were computed",
        })?;

        let working = self.pivot.working_set(field_offset)?;
        let mut reader = GroupReader::new(cursor, &working, self.pivot.options())?;
        let fields = working.fields();

        let mut current = Block::for_fields(fields);
        let mut held = Block::for_fields(fields);
        let mut has_held = false;
        let mut bucket = Block::for_fields(fields);
        let mut bucket_index: Option<usize> = None;
        let mut series: Option<(SeriesKey, SeriesBounds)> = None;
        let mut emitted = 0;

        while reader.next_group(&mut current)? {
            let key = current.key().copied().context(IllegalStateSnafu {
                message: "closed block without a key",
            })?;
            let key_series = series_of(&key);

            let same_series = series.is_some_and(|(s, _)| s == key_series);
            if !same_series {
                // close the previous series: its middle bucket, then its last group
                emitted += flush_bucket(&mut bucket, &mut bucket_index, sink)?;
                if has_held {
                    sink.write_block(&held)?;
                    held.reset();
                    has_held = false;
                    emitted += 1;
                }

                let series_bounds = bounds.get(&key_series).copied().context(IllegalStateSnafu {
                    message: format!("no decimation bounds for series {key_series:?}"),
                })?;
                series = Some((key_series, series_bounds));
                sink.write_block(&current)?;
                current.reset();
                emitted += 1;
                continue;
            }

            if has_held {
                let Some((_, series_bounds)) = series else {
                    return IllegalStateSnafu {
                        message: "held group outside of a series",
                    }
                    .fail();
                };
                let held_key = held.key().copied().context(IllegalStateSnafu {
                    message: "held block without a key",
                })?;
                let idx = series_bounds.bucket_of(held_key.main.as_f64(), self.width);
                if bucket_index != Some(idx) {
                    emitted += flush_bucket(&mut bucket, &mut bucket_index, sink)?;
                    bucket.open(
                        held_key,
                        held.measurement_id(),
                        held.id().map(str::to_string),
                        held.time_column(),
                    );
                    bucket_index = Some(idx);
                }
                bucket.absorb(&held);
                held.reset();
            }

            std::mem::swap(&mut held, &mut current);
            has_held = true;
        }

        emitted += flush_bucket(&mut bucket, &mut bucket_index, sink)?;
        if has_held {
            sink.write_block(&held)?;
            emitted += 1;
        }

        debug!(
            "decimated procedure {} into {emitted} blocks ({} series, width {})",
            self.pivot.procedure().procedure_id,
            bounds.len(),
            self.width
        );
        Ok(emitted)
    }
}

impl RowProcessor for ResultDecimator {
    fn pivot(&self) -> &Pivot {
        &self.pivot
    }

    fn process_into(
        &self,
        cursor: &mut dyn ResultCursor,
        field_offset: usize,
        sink: &mut dyn BlockSink,
    ) -> Result<usize, ObservationError> {
        self.decimate_into(cursor, field_offset, sink)
    }

    fn builder(&self) -> Option<&ResultBuilder> {
        self.builder.as_ref()
    }

    fn builder_slot(&mut self) -> &mut Option<ResultBuilder> {
        &mut self.builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FieldType;
    use crate::cursor::RowCursor;
    use crate::results::ResultMode;
    use crate::test_util::*;

    fn data_array() -> ProcessorOptions {
        ProcessorOptions {
            mode: ResultMode::DataArray,
            ..ProcessorOptions::default()
        }
    }

    fn evenly_spaced(n: i64) -> RowCursor {
        let rows: Vec<(i64, &str, f64)> = (0..n).map(|i| (i * 1_000, "A", i as f64)).collect();
        narrow_timeseries_rows(&rows)
    }

    fn decimator(width: usize) -> Result<ResultDecimator, ObservationError> {
        ResultDecimator::new(
            timeseries_procedure(&[("A", FieldType::Quantity)]),
            data_array(),
            width,
        )
    }

    #[test]
    fn zero_width_is_rejected() {
        assert!(matches!(
            decimator(0),
            Err(ObservationError::InvalidDecimationWidth { width: 0 })
        ));
    }

    #[test]
    fn streaming_before_bounds_is_illegal() -> TestResult {
        let mut dec = decimator(10)?;
        let err = dec
            .process_results(&mut evenly_spaced(5), 0)
            .expect_err("bounds are required");
        assert!(matches!(err, ObservationError::IllegalState { .. }));
        Ok(())
    }

    #[test]
    fn thousand_points_reduce_to_width_plus_endpoints() -> TestResult {
        let mut dec = decimator(10)?;
        dec.compute_bounds_from_rows(&mut evenly_spaced(1_000), 0)?;
        let count = dec.process_results(&mut evenly_spaced(1_000), 0)?;

        assert!((10..=12).contains(&count), "got {count} blocks");
        let rows = dec.builder().map(|b| b.rows().to_vec()).unwrap_or_default();
        assert_eq!(rows.len(), count);
        assert_eq!(rows[0][0], ts(0));
        assert_eq!(rows[count - 1][0], ts(999_000));
        Ok(())
    }

    #[test]
    fn bucket_keeps_last_values_and_last_main() -> TestResult {
        let mut dec = decimator(1)?;
        dec.set_bounds(None, 0.0, 3_000.0);
        dec.process_results(&mut evenly_spaced(4), 0)?;

        let rows = dec.builder().map(|b| b.rows().to_vec()).unwrap_or_default();
        assert_eq!(
            rows,
            vec![
                vec![ts(0), CellValue::Double(0.0)],
                vec![ts(2_000), CellValue::Double(2.0)],
                vec![ts(3_000), CellValue::Double(3.0)],
            ]
        );
        Ok(())
    }

    #[test]
    fn single_point_series_is_one_block() -> TestResult {
        let mut dec = decimator(10)?;
        dec.compute_bounds_from_rows(&mut evenly_spaced(1), 0)?;
        assert_eq!(dec.process_results(&mut evenly_spaced(1), 0)?, 1);

        // one key written by several rows still has min == max
        let proc = profile_procedure(&[("Y", FieldType::Quantity), ("Z", FieldType::Quantity)]);
        let rows = [(1_000, 4.0, "Y", 1.0), (1_000, 4.0, "Z", 2.0)];
        let mut dec = ResultDecimator::new(proc, data_array(), 500)?;
        dec.compute_bounds_from_rows(&mut narrow_profile_rows(&rows), 0)?;
        assert_eq!(
            dec.bounds().and_then(|b| b.get(&Some(1_000))).copied(),
            Some(SeriesBounds { min: 4.0, max: 4.0 })
        );
        assert_eq!(dec.process_results(&mut narrow_profile_rows(&rows), 0)?, 1);
        Ok(())
    }

    #[test]
    fn zero_step_collapses_middle_groups_into_one_bucket() -> TestResult {
        let mut dec = decimator(1_000)?;
        dec.set_bounds(None, 2_000.0, 2_000.0);
        assert_eq!(dec.process_results(&mut evenly_spaced(5), 0)?, 3);

        let rows = dec.builder().map(|b| b.rows().to_vec()).unwrap_or_default();
        assert_eq!(rows[0], vec![ts(0), CellValue::Double(0.0)]);
        assert_eq!(rows[1], vec![ts(3_000), CellValue::Double(3.0)]);
        assert_eq!(rows[2], vec![ts(4_000), CellValue::Double(4.0)]);
        Ok(())
    }

    #[test]
    fn profile_series_decimate_independently() -> TestResult {
        let proc = profile_procedure(&[("Z", FieldType::Quantity)]);
        let options = ProcessorOptions {
            include_time: true,
            ..data_array()
        };
        let mut dec = ResultDecimator::new(proc, options, 2)?;
        let mut rows = Vec::new();
        for cast in [1_000, 2_000] {
            for depth in 0..20 {
                rows.push((cast, depth as f64, "Z", depth as f64 * 0.5));
            }
        }
        dec.compute_bounds_from_rows(&mut narrow_profile_rows(&rows), 0)?;
        assert_eq!(dec.bounds().map(BTreeMap::len), Some(2));

        let count = dec.process_results(&mut narrow_profile_rows(&rows), 0)?;
        assert!(count <= 2 * (2 + 2), "got {count} blocks");

        let out = dec.builder().map(|b| b.rows().to_vec()).unwrap_or_default();
        for cast in [1_000, 2_000] {
            let first = vec![ts(cast), CellValue::Double(0.0), CellValue::Double(0.0)];
            let last = vec![ts(cast), CellValue::Double(19.0), CellValue::Double(9.5)];
            assert!(out.contains(&first), "cast {cast} lost its first depth");
            assert!(out.contains(&last), "cast {cast} lost its last depth");
        }
        // each cast opens and closes with its own raw endpoints
        let cast_rows: Vec<_> = out.iter().filter(|r| r[0] == ts(2_000)).collect();
        assert_eq!(cast_rows.first().map(|r| &r[1]), Some(&CellValue::Double(0.0)));
        assert_eq!(cast_rows.last().map(|r| &r[1]), Some(&CellValue::Double(19.0)));
        Ok(())
    }

    #[test]
    fn missing_series_bounds_is_illegal() -> TestResult {
        let proc = profile_procedure(&[("Z", FieldType::Quantity)]);
        let mut dec = ResultDecimator::new(proc, data_array(), 2)?;
        dec.set_bounds(Some(utc_millis(1_000)), 0.0, 10.0);
        let err = dec
            .process_results(&mut narrow_profile_rows(&[(2_000, 0.0, "Z", 1.0)]), 0)
            .expect_err("cast 2000 has no bounds");
        assert!(matches!(err, ObservationError::IllegalState { .. }));
        Ok(())
    }

    #[test]
    fn aggregate_bounds_merge_across_tables() -> TestResult {
        let mut dec = decimator(4)?;
        let mut first = RowCursor::new(
            ["min_value", "max_value"],
            vec![vec![ts(1_000), ts(5_000)]],
        );
        let mut second = RowCursor::new(
            ["min_value", "max_value"],
            vec![vec![ts(0), ts(3_000)]],
        );
        dec.compute_bounds(&mut first)?;
        dec.compute_bounds(&mut second)?;
        assert_eq!(
            dec.bounds().and_then(|b| b.get(&None)).copied(),
            Some(SeriesBounds {
                min: 0.0,
                max: 5_000.0
            })
        );
        Ok(())
    }

    #[test]
    fn bounds_request_aggregates_per_cast() -> TestResult {
        let proc = profile_procedure(&[("Z", FieldType::Quantity)]);
        let dec = ResultDecimator::new(proc, data_array(), 2)?;
        let mut request = SqlRequest::new("mesure1").with_alias("m1");
        dec.compute_request(&mut request, 0)?;
        request.push_condition(r#"m1."obsprop_id" IN ($1)"#);

        let bounds = dec.bounds_request(&request, 0)?;
        assert_eq!(
            bounds.to_sql(),
            r#"SELECT m1."time" AS series_time, MIN(m1."depth") AS min_value, MAX(m1."depth") AS max_value FROM "mesure1" AS m1 WHERE (m1."obsprop_id" IN ($1)) GROUP BY m1."time" ORDER BY series_time"#
        );
        Ok(())
    }

    #[test]
    fn bucket_of_clamps_to_last_bucket() {
        let b = SeriesBounds {
            min: 0.0,
            max: 100.0,
        };
        assert_eq!(b.bucket_of(0.0, 10), 0);
        assert_eq!(b.bucket_of(55.0, 10), 5);
        assert_eq!(b.bucket_of(100.0, 10), 9);
        let flat = SeriesBounds { min: 3.0, max: 3.0 };
        assert_eq!(flat.bucket_of(3.0, 10), 0);
    }
}
