//! Core engine for assembling sensor observations from narrow measure rows.
//!
//! This crate provides the foundational pieces for `observation-store`:
//!
//! - A static field / procedure catalog describing what a sensor measures and
//!   which field orders its series (`catalog` module).
//! - A forward-only cursor contract over pre-ordered relational rows, with
//!   in-memory, Arrow-backed and multi-table merging implementations
//!   (`cursor` module).
//! - A row-grouping pivot that rebuilds one fixed-width block per distinct key
//!   (`pivot` module) and a two-phase decimator that bounds the number of
//!   blocks per series (`decimate` module).
//! - A measure-request builder that fans one logical field set out over the
//!   physical measure tables hosting it (`request` module).
//! - Observation assembly on top of flushed blocks (`observation` module).
//!
//! Protocol front-ends, marshalling and connection management are expected to
//! live in higher-level crates that depend on this one.
#![deny(missing_docs)]
pub mod block;
pub mod catalog;
pub mod config;
pub mod cursor;
pub mod decimate;
pub mod error;
pub mod observation;
pub mod pivot;
pub mod request;
pub mod results;

#[cfg(test)]
pub(crate) mod test_util;

pub use catalog::{Field, FieldType, ProcedureInfo, ProcedureType, TableLayout, WorkingSet};
pub use config::{ConfigError, StoreConfig};
pub use cursor::{
    CellValue, CursorError, MergedCursor, RecordBatchCursor, ResultCursor, RowCursor,
};
pub use decimate::ResultDecimator;
pub use error::ObservationError;
pub use observation::{
    BoundsSource, Observation, ObservationReader, ReferenceResolver, StaticReferences,
};
pub use pivot::{ProcessorOptions, ResultProcessor, RowProcessor};
pub use request::{MeasureFilter, MeasureRequestBuilder, SqlRequest, TableRequest};
pub use results::{ResultBuilder, ResultMode, TextEncoding};
