//! Store configuration.
//!
//! A [`StoreConfig`] gathers the knobs a deployment sets once: where measure
//! tables live, how results are rendered and how observations are identified.
//! It is read from JSON; every key is optional and falls back to the defaults
//! below.
//!
//! ```json
//! {
//!   "schema": "observations",
//!   "table_prefix": "mesure",
//!   "max_fields_per_table": 100,
//!   "result_mode": "csv",
//!   "encoding": { "token_separator": ",", "block_separator": "@@" },
//!   "include_id": false,
//!   "include_time_for_profile": false,
//!   "separated_profile": true,
//!   "decimation_width": 500
//! }
//! ```
use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

use crate::{
    catalog::ProcedureInfo,
    observation::IdTemplates,
    pivot::ProcessorOptions,
    request::{DEFAULT_TABLE_PREFIX, MeasureRequestBuilder},
    results::{ResultMode, TextEncoding},
};

/// Errors from loading or validating a [`StoreConfig`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[snafu(display("Failed to read configuration {path}: {source}"))]
    Read {
        /// File path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
        /// Backtrace at the failure.
        backtrace: Backtrace,
    },

    /// The configuration is not valid JSON for [`StoreConfig`].
    #[snafu(display("Failed to parse configuration: {source}"))]
    Parse {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// A value is out of range.
    #[snafu(display("Invalid configuration: {message}"))]
    Invalid {
        /// What is wrong.
        message: String,
    },
}

/// Deployment settings of the observation store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Schema holding the measure tables.
    pub schema: Option<String>,
    /// Prefix of measure table names.
    pub table_prefix: String,
    /// Column ceiling per physical measure table.
    pub max_fields_per_table: usize,
    /// Output shape of results.
    pub result_mode: ResultMode,
    /// Separators of text results.
    pub encoding: TextEncoding,
    /// Emit an identity column in every block.
    pub include_id: bool,
    /// Emit the cast time column for profiles.
    pub include_time_for_profile: bool,
    /// One observation per profile cast instead of one per procedure.
    pub separated_profile: bool,
    /// Single-value, single-quantity results become measurements.
    pub single_value_as_measurement: bool,
    /// Default decimation width; `None` disables decimation.
    pub decimation_width: Option<usize>,
    /// Observation identifier templates.
    pub templates: IdTemplates,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            schema: None,
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            max_fields_per_table: 100,
            result_mode: ResultMode::Csv,
            encoding: TextEncoding::default(),
            include_id: false,
            include_time_for_profile: false,
            separated_profile: false,
            single_value_as_measurement: false,
            decimation_width: None,
            templates: IdTemplates::default(),
        }
    }
}

impl StoreConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = serde_json::from_str(json).context(ParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).context(ReadSnafu {
            path: path.display().to_string(),
        })?;
        StoreConfig::from_json_str(&json)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.max_fields_per_table > 0,
            InvalidSnafu {
                message: "max_fields_per_table must be positive",
            }
        );
        ensure!(
            self.decimation_width != Some(0),
            InvalidSnafu {
                message: "decimation_width must be positive when set",
            }
        );
        ensure!(
            !self.table_prefix.is_empty(),
            InvalidSnafu {
                message: "table_prefix must not be empty",
            }
        );
        ensure!(
            !self.encoding.token_separator.is_empty() && !self.encoding.block_separator.is_empty(),
            InvalidSnafu {
                message: "text separators must not be empty",
            }
        );
        Ok(())
    }

    /// Pivot options for reads of `procedure`.
    pub fn processor_options(&self, procedure: &ProcedureInfo) -> ProcessorOptions {
        ProcessorOptions {
            mode: self.result_mode,
            encoding: self.encoding.clone(),
            include_id: self.include_id,
            include_time: self.include_time_for_profile,
            block_id_prefix: self.templates.block_id_prefix(procedure),
        }
    }

    /// Request builder targeting the configured measure tables.
    pub fn request_builder(&self) -> MeasureRequestBuilder {
        MeasureRequestBuilder::new(self.schema.clone(), self.table_prefix.clone())
    }
}
