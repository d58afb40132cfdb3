//! Loading procedure descriptions, filters and narrow measure rows.
use std::{
    fs::File,
    io::{Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::datatypes::{DataType, Field as ArrowField, Schema, SchemaRef, TimeUnit};
use arrow_csv::{ReaderBuilder, reader::Format};
use chrono::{DateTime, Utc};
use log::debug;
use observation_store_core::{
    FieldType, MeasureFilter, MergedCursor, ProcedureInfo, RecordBatchCursor, ResultCursor,
    catalog::FIRST_TABLE, cursor::columns,
};
use snafu::{OptionExt, ResultExt};

use crate::error::{
    CliResult, DecodeRowsSnafu, InvalidInstantSnafu, MissingHeaderSnafu, ParseFiltersSnafu,
    ParseProcedureSnafu, ReadFiltersSnafu, ReadProcedureSnafu, ReadRowsSnafu,
};

pub fn read_procedure(path: &Path) -> CliResult<ProcedureInfo> {
    let json = std::fs::read_to_string(path).context(ReadProcedureSnafu {
        path: path.display().to_string(),
    })?;
    serde_json::from_str(&json).context(ParseProcedureSnafu {
        path: path.display().to_string(),
    })
}

pub fn read_filters(path: &Path) -> CliResult<Vec<MeasureFilter>> {
    let json = std::fs::read_to_string(path).context(ReadFiltersSnafu {
        path: path.display().to_string(),
    })?;
    serde_json::from_str(&json).context(ParseFiltersSnafu {
        path: path.display().to_string(),
    })
}

pub fn parse_instant(flag: &str, value: &str) -> CliResult<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value).context(InvalidInstantSnafu {
        flag: flag.to_string(),
        value: value.to_string(),
    })?;
    Ok(parsed.with_timezone(&Utc))
}

/// Arrow type of a narrow-row column, derived from the procedure.
fn column_type(name: &str, procedure: &ProcedureInfo) -> DataType {
    match name {
        columns::ID => DataType::Int64,
        columns::TIME => DataType::Timestamp(TimeUnit::Millisecond, None),
        columns::OBSERVED_PROPERTY => DataType::Utf8,
        columns::RESULT => {
            let all_quantities = procedure
                .fields
                .iter()
                .filter(|f| f.name != procedure.main_field.name)
                .all(|f| f.data_type == FieldType::Quantity);
            if all_quantities {
                DataType::Float64
            } else {
                DataType::Utf8
            }
        }
        other if other == procedure.main_field.name => match procedure.main_field.data_type {
            FieldType::Time => DataType::Timestamp(TimeUnit::Millisecond, None),
            FieldType::Quantity => DataType::Float64,
            FieldType::Boolean => DataType::Boolean,
            FieldType::Text => DataType::Utf8,
        },
        _ => DataType::Utf8,
    }
}

fn header_schema(path: &Path, file: &mut File, procedure: &ProcedureInfo) -> CliResult<SchemaRef> {
    // header names only; column types come from the procedure
    let (header, _) = Format::default()
        .with_header(true)
        .infer_schema(&mut *file, Some(0))
        .context(DecodeRowsSnafu {
            path: path.display().to_string(),
        })?;
    file.seek(SeekFrom::Start(0)).context(ReadRowsSnafu {
        path: path.display().to_string(),
    })?;

    let first = header.fields().first().context(MissingHeaderSnafu {
        path: path.display().to_string(),
    })?;
    debug!("{}: header starts with {}", path.display(), first.name());

    let fields: Vec<ArrowField> = header
        .fields()
        .iter()
        .map(|f| ArrowField::new(f.name().trim(), column_type(f.name().trim(), procedure), true))
        .collect();
    Ok(Arc::new(Schema::new(fields)))
}

/// Narrow rows of one measure table, read into memory.
#[derive(Debug, Clone)]
pub struct TableRows {
    pub table_number: usize,
    pub cursor: RecordBatchCursor,
}

pub fn read_rows(path: &Path, table_number: usize, procedure: &ProcedureInfo) -> CliResult<TableRows> {
    let mut file = File::open(path).context(ReadRowsSnafu {
        path: path.display().to_string(),
    })?;
    let schema = header_schema(path, &mut file, procedure)?;

    let reader = ReaderBuilder::new(schema.clone())
        .with_format(Format::default().with_header(true))
        .build(file)
        .context(DecodeRowsSnafu {
            path: path.display().to_string(),
        })?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .context(DecodeRowsSnafu {
            path: path.display().to_string(),
        })?;

    let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    debug!(
        "read {rows} narrow row(s) for table {table_number} from {}",
        path.display()
    );
    Ok(TableRows {
        table_number,
        cursor: RecordBatchCursor::new(schema, batches),
    })
}

/// Reads each `--rows` file as the next measure table, starting at table 1.
pub fn read_tables(paths: &[PathBuf], procedure: &ProcedureInfo) -> CliResult<Vec<TableRows>> {
    paths
        .iter()
        .enumerate()
        .map(|(i, path)| read_rows(path, FIRST_TABLE + i, procedure))
        .collect()
}

/// Fresh cursor over `tables`; several tables are merged on the grouping key.
pub fn open_cursor(tables: &[TableRows], procedure: &ProcedureInfo) -> Box<dyn ResultCursor> {
    if let [only] = tables {
        if only.table_number == FIRST_TABLE {
            return Box::new(only.cursor.clone());
        }
    }

    let children: Vec<(usize, Box<dyn ResultCursor>)> = tables
        .iter()
        .map(|t| {
            let cursor: Box<dyn ResultCursor> = Box::new(t.cursor.clone());
            (t.table_number, cursor)
        })
        .collect();
    let merged = MergedCursor::new(children);
    if procedure.procedure_type.is_profile() {
        Box::new(merged.with_leading_key(columns::TIME))
    } else {
        Box::new(merged)
    }
}
