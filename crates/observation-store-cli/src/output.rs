//! Writing pivot results to stdout or a file.
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
};

use arrow::record_batch::RecordBatch;
use observation_store_core::Observation;
use snafu::ResultExt;

use crate::error::{CliResult, WriteArrowSnafu, WriteJsonSnafu, WriteOutputSnafu};

/// Tabular encodings of a data-array result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchFormat {
    Csv,
    Jsonl,
}

/// Destination named by `--output`, stdout when absent.
pub struct Output {
    label: String,
    writer: Box<dyn Write>,
}

impl Output {
    pub fn open(path: Option<&PathBuf>) -> CliResult<Self> {
        match path {
            Some(path) => {
                let file = File::create(path).context(WriteOutputSnafu {
                    path: path.display().to_string(),
                })?;
                Ok(Output {
                    label: path.display().to_string(),
                    writer: Box::new(BufWriter::new(file)),
                })
            }
            None => Ok(Output {
                label: "stdout".to_string(),
                writer: Box::new(io::stdout().lock()),
            }),
        }
    }

    pub fn write_observations(&mut self, observations: &[Observation]) -> CliResult<()> {
        serde_json::to_writer_pretty(&mut self.writer, observations).context(WriteJsonSnafu)?;
        writeln!(self.writer).context(WriteOutputSnafu {
            path: self.label.clone(),
        })?;
        self.flush()
    }

    pub fn write_batch(&mut self, format: BatchFormat, batch: &RecordBatch) -> CliResult<()> {
        match format {
            BatchFormat::Csv => {
                let mut writer = arrow_csv::WriterBuilder::new()
                    .with_header(true)
                    .build(&mut self.writer);
                writer.write(batch).context(WriteArrowSnafu)?;
            }
            BatchFormat::Jsonl => {
                let mut writer = arrow_json::LineDelimitedWriter::new(&mut self.writer);
                writer.write_batches(&[batch]).context(WriteArrowSnafu)?;
                writer.finish().context(WriteArrowSnafu)?;
            }
        }
        self.flush()
    }

    pub fn write_text(&mut self, text: &str) -> CliResult<()> {
        writeln!(self.writer, "{text}").context(WriteOutputSnafu {
            path: self.label.clone(),
        })
    }

    pub fn flush(&mut self) -> CliResult<()> {
        self.writer.flush().context(WriteOutputSnafu {
            path: self.label.clone(),
        })
    }
}
