use observation_store_core::{ConfigError, ObservationError};

use arrow::error::ArrowError;
use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("Procedure file not found or not accessible: {path}"))]
    ReadProcedure {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Invalid procedure description in {path}: {source}"))]
    ParseProcedure {
        path: String,
        source: serde_json::Error,
    },

    #[snafu(display("Filter file not found or not accessible: {path}"))]
    ReadFilters {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Invalid filter list in {path}: {source}"))]
    ParseFilters {
        path: String,
        source: serde_json::Error,
    },

    #[snafu(display("{source}"))]
    Config { source: ConfigError },

    #[snafu(display("Rows file not found or not accessible: {path}"))]
    ReadRows {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Rows file has no header line: {path}"))]
    MissingHeader { path: String },

    #[snafu(display("Failed to decode CSV rows from {path}: {source}"))]
    DecodeRows { path: String, source: ArrowError },

    #[snafu(display("Invalid --{flag} '{value}': expected an RFC 3339 instant"))]
    InvalidInstant {
        flag: String,
        value: String,
        source: chrono::ParseError,
    },

    #[snafu(display("--decimate must be a positive width"))]
    ZeroWidth,

    #[snafu(display("--max-fields must be positive"))]
    ZeroMaxFields,

    #[snafu(display("Failed to read observations: {source}"))]
    Observation {
        #[snafu(source(from(ObservationError, Box::new)))]
        source: Box<ObservationError>,
    },

    #[snafu(display("Failed to write output: {source}"))]
    WriteArrow { source: ArrowError },

    #[snafu(display("Failed to serialize observations: {source}"))]
    WriteJson { source: serde_json::Error },

    #[snafu(display("Failed to write output to {path}: {source}"))]
    WriteOutput {
        path: String,
        source: std::io::Error,
    },
}

impl From<ObservationError> for CliError {
    fn from(source: ObservationError) -> Self {
        CliError::Observation {
            source: Box::new(source),
        }
    }
}
