//! Error types and SNAFU context selectors for the observation engine.
//!
//! This module centralizes the `ObservationError` enum returned by the pivot,
//! decimation and assembly entry points, and exposes context selectors (via
//! `#[snafu(visibility(pub(crate)))]`) so sibling modules can attach context
//! without re-exporting everything at the crate root.
//!
//! Every variant is fatal for the current read: once a pivot has begun, no
//! partial result is handed back to the caller. Filter type mismatches are not
//! errors at all; the request builder downgrades them to `FALSE` predicates.

use arrow::error::ArrowError;
use snafu::prelude::*;

use crate::cursor::CursorError;

/// Errors from reading, pivoting, decimating and assembling observations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ObservationError {
    /// A column the engine needs is missing from the cursor metadata.
    #[snafu(display("Malformed cursor: required column {column} is missing"))]
    MalformedCursor {
        /// Name of the missing column.
        column: String,
    },

    /// A value (or a declared field type) is not usable for the field it belongs to.
    #[snafu(display("Unsupported value for field {field}: expected {expected}, found {found}"))]
    UnsupportedFieldType {
        /// Field (or column) being read.
        field: String,
        /// Type the engine expected.
        expected: String,
        /// Type actually encountered.
        found: String,
    },

    /// A textual value could not be parsed into the field's declared type.
    #[snafu(display("Failed to parse value {value:?} for field {field}"))]
    FieldParse {
        /// Field being read.
        field: String,
        /// Raw value that failed to parse.
        value: String,
    },

    /// Two fields of one working set share a name.
    #[snafu(display("Field {name} appears more than once in the working set"))]
    DuplicateField {
        /// Offending field name.
        name: String,
    },

    /// An operation was invoked out of order (programming error).
    #[snafu(display("Illegal state: {message}"))]
    IllegalState {
        /// What went wrong.
        message: String,
    },

    /// Decimation needs at least one bucket per series.
    #[snafu(display("Invalid decimation width {width} (expect width > 0)"))]
    InvalidDecimationWidth {
        /// Width supplied by the caller.
        width: usize,
    },

    /// Cursor access failed.
    #[snafu(display("Cursor error: {source}"))]
    Cursor {
        /// Underlying cursor error.
        source: CursorError,
    },

    /// Arrow error while materializing the structured result.
    #[snafu(display("Arrow error while building result batch: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },
}

impl From<CursorError> for ObservationError {
    fn from(source: CursorError) -> Self {
        ObservationError::Cursor { source }
    }
}
