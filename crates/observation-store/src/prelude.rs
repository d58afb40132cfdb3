//! Wrapper prelude.
//!
//! The `observation-store` crate is the supported public entry point.
//! Downstream code should prefer importing from this prelude instead of
//! depending on internal core module paths.

pub use crate::{cursor, request};
pub use crate::{
    BoundsSource, ConfigError, Field, FieldType, Observation,
    ObservationError, ObservationReader, ProcedureInfo, ProcedureType, ProcessorOptions,
    ResultDecimator, ResultMode, ResultProcessor, RowProcessor, StoreConfig,
};
pub use crate::cursor::{CellValue, ResultCursor, RowCursor};
pub use crate::request::{MeasureFilter, MeasureRequestBuilder};
