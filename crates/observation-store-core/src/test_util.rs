//! Shared fixtures for unit tests.
use chrono::{DateTime, Utc};

use crate::{
    catalog::{Field, FieldType, ProcedureInfo, ProcedureType},
    cursor::{CellValue, RowCursor, columns},
};

pub(crate) type TestResult = Result<(), Box<dyn std::error::Error>>;

pub(crate) fn utc_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).expect("valid timestamp")
}

pub(crate) fn ts(ms: i64) -> CellValue {
    CellValue::Timestamp(utc_millis(ms))
}

fn procedure(
    procedure_type: ProcedureType,
    main: Field,
    fields: &[(&str, FieldType)],
) -> ProcedureInfo {
    let mut all = vec![main.clone()];
    all.extend(
        fields
            .iter()
            .enumerate()
            .map(|(i, (name, ty))| Field::new(*name, *ty, i + 1)),
    );
    ProcedureInfo {
        procedure_id: format!("urn:sensor:{procedure_type}"),
        internal_id: 1,
        procedure_type,
        main_field: main,
        fields: all,
    }
}

/// Time series with main field `time` followed by `fields`.
pub(crate) fn timeseries_procedure(fields: &[(&str, FieldType)]) -> ProcedureInfo {
    procedure(
        ProcedureType::Timeseries,
        Field::new("time", FieldType::Time, 0),
        fields,
    )
}

/// Profile with main field `depth` followed by `fields`.
pub(crate) fn profile_procedure(fields: &[(&str, FieldType)]) -> ProcedureInfo {
    procedure(
        ProcedureType::Profile,
        Field::new("depth", FieldType::Quantity, 0),
        fields,
    )
}

pub(crate) fn names(fields: &[Field]) -> Vec<&str> {
    fields.iter().map(|f| f.name.as_str()).collect()
}

/// Narrow time-series rows `(time ms, obsprop, result)`.
pub(crate) fn narrow_timeseries_rows(rows: &[(i64, &str, f64)]) -> RowCursor {
    RowCursor::new(
        [columns::TIME, columns::OBSERVED_PROPERTY, columns::RESULT],
        rows.iter()
            .map(|(t, prop, v)| {
                vec![ts(*t), CellValue::Text(prop.to_string()), CellValue::Double(*v)]
            })
            .collect(),
    )
}

/// Narrow profile rows `(cast time ms, depth, obsprop, result)`.
pub(crate) fn narrow_profile_rows(rows: &[(i64, f64, &str, f64)]) -> RowCursor {
    RowCursor::new(
        [
            columns::TIME,
            "depth",
            columns::OBSERVED_PROPERTY,
            columns::RESULT,
        ],
        rows.iter()
            .map(|(t, d, prop, v)| {
                vec![
                    ts(*t),
                    CellValue::Double(*d),
                    CellValue::Text(prop.to_string()),
                    CellValue::Double(*v),
                ]
            })
            .collect(),
    )
}
