//! # observation-store
//!
//! Assembles sensor observations from narrow measure rows: a row-grouping
//! pivot, a bounded-output decimator and the per-table request fan-out that
//! feeds them.
//!
//! This crate is the supported public entry point and provides a small, stable surface.
//!
//! ## Example
//!
//! ```rust,ignore
//! use observation_store::prelude::*;
//!
//! let reader = ObservationReader::from_config(procedure, &StoreConfig::default());
//! let observations = reader.read(&mut cursor, 0)?;
//! ```

/// Convenience prelude with the stable, supported surface.
pub mod prelude;

/// Cursor namespace (wrapper-only).
pub mod cursor {
    pub use observation_store_core::cursor::{
        CellValue, CursorError, MergedCursor, RecordBatchCursor, ResultCursor, RowCursor, columns,
    };
}

/// Request namespace (wrapper-only).
pub mod request {
    pub use observation_store_core::request::{
        ComparisonOperator, FilterValue, MeasureFilter, MeasureRequestBuilder, SqlRequest,
        SqlValue, TableRequest,
    };
}

pub use observation_store_core::catalog::{
    Field, FieldType, ProcedureInfo, ProcedureType, TableLayout, WorkingSet, assign_tables,
};
pub use observation_store_core::config::{ConfigError, StoreConfig};
pub use observation_store_core::decimate::ResultDecimator;
pub use observation_store_core::error::ObservationError;
pub use observation_store_core::observation::type_codes;
pub use observation_store_core::observation::{
    BoundsSource, IdTemplates, Observation, ObservationReader, ObservationResult,
    ReferenceResolver, SamplingTime, StaticReferences,
};
pub use observation_store_core::pivot::{ProcessorOptions, ResultProcessor, RowProcessor};
pub use observation_store_core::results::{ResultBuilder, ResultMode, TextEncoding};
