//! Fields spread over several measure tables read back like one table.
#![allow(missing_docs)]

use chrono::{DateTime, Utc};
use observation_store_core::{
    CellValue, Field, FieldType, MeasureFilter, MeasureRequestBuilder, MergedCursor,
    ProcedureInfo, ProcedureType, ProcessorOptions, ResultCursor, ResultMode, ResultProcessor,
    RowCursor, RowProcessor,
    catalog::assign_tables,
    request::{ComparisonOperator, FilterValue},
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const FIELDS: [&str; 5] = ["temp", "sal", "oxy", "turb", "chl"];

fn procedure(max_fields_per_table: usize) -> ProcedureInfo {
    let main = Field::new("time", FieldType::Time, 0);
    let measures: Vec<Field> = FIELDS
        .iter()
        .enumerate()
        .map(|(i, name)| Field::new(*name, FieldType::Quantity, i + 1))
        .collect();
    let mut fields = vec![main.clone()];
    fields.extend(assign_tables(&measures, max_fields_per_table));
    ProcedureInfo {
        procedure_id: "urn:sensor:mooring-3".to_string(),
        internal_id: 3,
        procedure_type: ProcedureType::Timeseries,
        main_field: main,
        fields,
    }
}

/// Narrow rows for three timestamps, restricted to `fields`; `sal` is missing at t=1.
fn table_rows(fields: &[Field]) -> Result<RowCursor, &'static str> {
    let mut rows = Vec::new();
    for t in 0..3i64 {
        let time = DateTime::<Utc>::from_timestamp_millis(t * 1_000).ok_or("invalid timestamp")?;
        for field in fields {
            if field.name == "sal" && t == 1 {
                continue;
            }
            rows.push(vec![
                CellValue::Timestamp(time),
                CellValue::Text(field.name.clone()),
                CellValue::Double(t as f64 * 10.0 + field.index as f64),
            ]);
        }
    }
    Ok(RowCursor::new(["time", "obsprop_id", "result"], rows))
}

fn options() -> ProcessorOptions {
    ProcessorOptions {
        mode: ResultMode::DataArray,
        ..ProcessorOptions::default()
    }
}

fn pivot_rows(processor: &mut ResultProcessor, cursor: &mut dyn ResultCursor) -> Result<Vec<Vec<CellValue>>, Box<dyn std::error::Error>> {
    processor.process_results(cursor, 0)?;
    let builder = processor.take_builder().ok_or("results expected")?;
    Ok(builder.rows().to_vec())
}

fn same_cells(a: &[Vec<CellValue>], b: &[Vec<CellValue>]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.len() == y.len()
                && x.iter().zip(y).all(|(p, q)| match (p, q) {
                    (CellValue::Double(l), CellValue::Double(r)) => {
                        (l.is_nan() && r.is_nan()) || l == r
                    }
                    _ => p == q,
                })
        })
}

#[test]
fn split_tables_merge_to_the_single_table_baseline() -> TestResult {
    let single = procedure(100);
    let mut baseline = ResultProcessor::new(single.clone(), options());
    let expected = pivot_rows(&mut baseline, &mut table_rows(&single.fields[1..])?)?;

    let split = procedure(2);
    let mut processor = ResultProcessor::new(split.clone(), options());
    let requests = MeasureRequestBuilder::default().build(&processor, 0)?;
    assert_eq!(requests.len(), 3);

    let mut children: Vec<(usize, Box<dyn ResultCursor>)> = Vec::new();
    for request in &requests {
        let cursor: Box<dyn ResultCursor> = Box::new(table_rows(&request.fields)?);
        children.push((request.table_number, cursor));
    }
    let mut merged = MergedCursor::new(children);
    let actual = pivot_rows(&mut processor, &mut merged)?;

    assert_eq!(actual.len(), 3);
    assert!(same_cells(&actual, &expected), "{actual:?} != {expected:?}");
    assert!(matches!(actual[1][2], CellValue::Double(v) if v.is_nan()));
    Ok(())
}

#[test]
fn mismatched_filters_render_false_in_every_table() -> TestResult {
    let processor = ResultProcessor::new(procedure(2), options());
    let requests = MeasureRequestBuilder::default()
        .with_filter(MeasureFilter::Result {
            field: Some("temp".to_string()),
            operator: ComparisonOperator::Eq,
            value: FilterValue::Text("warm".to_string()),
        })
        .build(&processor, 0)?;

    for request in &requests {
        let last = request.request.conditions.last().ok_or("filter expected")?;
        assert_eq!(last, "FALSE");
        assert!(request.request.to_sql().contains("(FALSE)"));
    }
    Ok(())
}

#[test]
fn phenomenon_restriction_skips_unneeded_tables() -> TestResult {
    let mut processor = ResultProcessor::new(procedure(2), options());
    processor = ResultProcessor::from_pivot(
        processor
            .pivot()
            .clone()
            .with_phenomena(vec!["chl".to_string()]),
    );
    let requests = MeasureRequestBuilder::default().build(&processor, 0)?;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].table_number, 3);
    assert_eq!(requests[0].request.table, "mesure3_3");
    Ok(())
}
