//! Observations assembled from pivoted blocks.
//!
//! An [`Observation`] wraps the blocks of one read with the metadata protocol
//! layers need: deterministic identifiers, the sampling time covered by the
//! blocks, references to the observed phenomenon and feature of interest, and
//! the result payload itself.
//!
//! [`ObservationReader`] is the entry point. It drives a pivot (or a
//! decimator) over a cursor and feeds every flushed block to an assembler that
//! emits either one observation per procedure or, for profiles read with
//! `separated_profile`, one observation per cast.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::{Field, ProcedureInfo},
    config::StoreConfig,
    cursor::ResultCursor,
    decimate::ResultDecimator,
    error::ObservationError,
    pivot::{Pivot, RowProcessor},
    results::{ResultColumn, ResultValues, TextEncoding},
};

mod assemble;

pub use assemble::ObservationAssembler;

/// Observation type codes.
pub mod type_codes {
    /// Multi-field, multi-block result.
    pub const COMPLEX_OBSERVATION: &str =
        "http://www.opengis.net/def/observationType/OGC-OM/2.0/OM_ComplexObservation";
    /// Single numeric value.
    pub const MEASUREMENT: &str =
        "http://www.opengis.net/def/observationType/OGC-OM/2.0/OM_Measurement";
}

/// Time covered by an observation.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplingTime {
    /// All blocks share one instant.
    Instant {
        /// The instant.
        time: DateTime<Utc>,
    },
    /// First and last instant of the blocks.
    Period {
        /// First instant.
        begin: DateTime<Utc>,
        /// Last instant.
        end: DateTime<Utc>,
    },
}

impl SamplingTime {
    /// Instant when `first == last`, period otherwise.
    pub fn between(first: DateTime<Utc>, last: DateTime<Utc>) -> Self {
        if first == last {
            SamplingTime::Instant { time: first }
        } else {
            SamplingTime::Period {
                begin: first.min(last),
                end: first.max(last),
            }
        }
    }
}

/// Scalar result of a measurement.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MeasureResult {
    /// Measured field.
    pub field: String,
    /// Unit of measure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uom: Option<String>,
    /// Value.
    pub value: f64,
}

/// Block-encoded result of a complex observation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ComplexResult {
    /// Columns of every block.
    pub fields: Vec<ResultColumn>,
    /// Text separators used by `values` when it is text.
    pub encoding: TextEncoding,
    /// Number of blocks.
    pub block_count: usize,
    /// Rendered blocks.
    pub values: ResultValues,
}

/// Result payload of an observation.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ObservationResult {
    /// Single value.
    Measure(MeasureResult),
    /// Repeated blocks.
    Complex(ComplexResult),
}

/// One assembled observation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Observation {
    /// Stable identifier.
    pub id: String,
    /// Observation name.
    pub name: String,
    /// Observation type code, see [`type_codes`].
    pub type_code: String,
    /// Procedure identifier.
    pub procedure: String,
    /// Time covered by the result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling_time: Option<SamplingTime>,
    /// Feature of interest reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_of_interest: Option<String>,
    /// Observed phenomenon reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phenomenon: Option<String>,
    /// Result payload.
    pub result: ObservationResult,
    /// Free-form properties (`type`, `decimated`).
    pub properties: BTreeMap<String, String>,
}

/// Resolves references the engine does not own.
pub trait ReferenceResolver {
    /// Phenomenon observed by `fields` of `procedure`.
    fn phenomenon(&self, procedure: &ProcedureInfo, fields: &[Field]) -> Option<String>;

    /// Feature of interest observed by `procedure` at `time`.
    fn feature_of_interest(
        &self,
        procedure: &ProcedureInfo,
        time: Option<DateTime<Utc>>,
    ) -> Option<String>;
}

/// Fixed references.
///
/// Without an explicit phenomenon, a single-field read refers to that field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticReferences {
    /// Phenomenon of every observation.
    pub phenomenon: Option<String>,
    /// Feature of interest of every observation.
    pub feature_of_interest: Option<String>,
}

impl ReferenceResolver for StaticReferences {
    fn phenomenon(&self, _procedure: &ProcedureInfo, fields: &[Field]) -> Option<String> {
        match (&self.phenomenon, fields) {
            (Some(p), _) => Some(p.clone()),
            (None, [single]) => Some(single.name.clone()),
            (None, _) => None,
        }
    }

    fn feature_of_interest(
        &self,
        _procedure: &ProcedureInfo,
        _time: Option<DateTime<Utc>>,
    ) -> Option<String> {
        self.feature_of_interest.clone()
    }
}

/// Identifier templates.
///
/// Placeholders: `{procedure}` (procedure id), `{pid}` (internal id),
/// `{name}` (rendered observation name, cast templates only) and `{measure}`
/// (first measurement id of the cast, cast templates only).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdTemplates {
    /// Name of a whole-procedure observation.
    pub observation_name: String,
    /// Id of a whole-procedure observation.
    pub observation_id: String,
    /// Name of one profile cast.
    pub cast_name: String,
    /// Id of one profile cast.
    pub cast_id: String,
    /// Prefix of block identity values.
    pub block_id: String,
}

impl Default for IdTemplates {
    fn default() -> Self {
        IdTemplates {
            observation_name: "urn:ogc:object:observation:{pid}".to_string(),
            observation_id: "obs-{pid}".to_string(),
            cast_name: "{name}-{measure}".to_string(),
            cast_id: "obs-{pid}-{measure}".to_string(),
            block_id: "obs-{pid}-".to_string(),
        }
    }
}

fn render(template: &str, procedure: &ProcedureInfo, name: &str, measure: Option<i64>) -> String {
    let mut out = template
        .replace("{procedure}", &procedure.procedure_id)
        .replace("{pid}", &procedure.internal_id.to_string())
        .replace("{name}", name);
    if let Some(measure) = measure {
        out = out.replace("{measure}", &measure.to_string());
    }
    out
}

impl IdTemplates {
    /// Name of the whole-procedure observation.
    pub fn observation_name(&self, procedure: &ProcedureInfo) -> String {
        render(&self.observation_name, procedure, "", None)
    }

    /// Id of the whole-procedure observation.
    pub fn observation_id(&self, procedure: &ProcedureInfo) -> String {
        render(&self.observation_id, procedure, "", None)
    }

    /// Name of the cast starting with measurement `measure`.
    pub fn cast_name(&self, procedure: &ProcedureInfo, measure: i64) -> String {
        let base = self.observation_name(procedure);
        render(&self.cast_name, procedure, &base, Some(measure))
    }

    /// Id of the cast starting with measurement `measure`.
    pub fn cast_id(&self, procedure: &ProcedureInfo, measure: i64) -> String {
        let base = self.observation_name(procedure);
        render(&self.cast_id, procedure, &base, Some(measure))
    }

    /// Prefix prepended to measurement ids in the identity column.
    pub fn block_id_prefix(&self, procedure: &ProcedureInfo) -> String {
        render(&self.block_id, procedure, "", None)
    }
}

/// Where decimation bounds come from.
pub enum BoundsSource<'c> {
    /// Aggregate cursor from [`ResultDecimator::bounds_request`].
    Aggregate(&'c mut dyn ResultCursor),
    /// A first pass over raw measure rows.
    Rows(&'c mut dyn ResultCursor),
}

/// Reads observations of one procedure.
pub struct ObservationReader<R: ReferenceResolver = StaticReferences> {
    pivot: Pivot,
    templates: IdTemplates,
    resolver: R,
    separated_profile: bool,
    single_value_as_measurement: bool,
}

impl ObservationReader<StaticReferences> {
    /// Reader configured from `config`, with no external references.
    pub fn from_config(procedure: ProcedureInfo, config: &StoreConfig) -> Self {
        let options = config.processor_options(&procedure);
        ObservationReader {
            pivot: Pivot::new(procedure, options),
            templates: config.templates.clone(),
            resolver: StaticReferences::default(),
            separated_profile: config.separated_profile,
            single_value_as_measurement: config.single_value_as_measurement,
        }
    }
}

impl<R: ReferenceResolver> ObservationReader<R> {
    /// Use another reference resolver.
    pub fn with_resolver<S: ReferenceResolver>(self, resolver: S) -> ObservationReader<S> {
        ObservationReader {
            pivot: self.pivot,
            templates: self.templates,
            resolver,
            separated_profile: self.separated_profile,
            single_value_as_measurement: self.single_value_as_measurement,
        }
    }

    /// Restrict reads to the named phenomena.
    pub fn with_phenomena(mut self, phenomena: Vec<String>) -> Self {
        self.pivot = self.pivot.with_phenomena(phenomena);
        self
    }

    /// Emit one observation per profile cast.
    pub fn separated_profile(mut self, separated: bool) -> Self {
        self.separated_profile = separated;
        self
    }

    /// Pivot settings used for reads.
    pub fn pivot(&self) -> &Pivot {
        &self.pivot
    }

    fn assembler(
        &self,
        field_offset: usize,
        decimated: bool,
    ) -> Result<ObservationAssembler<'_>, ObservationError> {
        Ok(ObservationAssembler::new(
            &self.pivot,
            field_offset,
            &self.templates,
            &self.resolver,
        )?
        .separated(self.separated_profile)
        .single_value_as_measurement(self.single_value_as_measurement)
        .decimated(decimated))
    }

    /// One block per distinct key.
    pub fn read(
        &self,
        cursor: &mut dyn ResultCursor,
        field_offset: usize,
    ) -> Result<Vec<Observation>, ObservationError> {
        let mut assembler = self.assembler(field_offset, false)?;
        self.pivot.pivot_into(cursor, field_offset, &mut assembler)?;
        assembler.finish()
    }

    /// At most `width + 2` blocks per series.
    pub fn read_decimated(
        &self,
        bounds: BoundsSource<'_>,
        cursor: &mut dyn ResultCursor,
        field_offset: usize,
        width: usize,
    ) -> Result<Vec<Observation>, ObservationError> {
        let mut decimator = ResultDecimator::from_pivot(self.pivot.clone(), width)?;
        match bounds {
            BoundsSource::Aggregate(c) => {
                decimator.compute_bounds(c)?;
            }
            BoundsSource::Rows(c) => {
                decimator.compute_bounds_from_rows(c, field_offset)?;
            }
        }

        let mut assembler = self.assembler(field_offset, true)?;
        decimator.process_into(cursor, field_offset, &mut assembler)?;
        assembler.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FieldType;
    use crate::cursor::RowCursor;
    use crate::results::ResultMode;
    use crate::test_util::*;

    #[test]
    fn sampling_time_collapses_equal_bounds() {
        assert_eq!(
            SamplingTime::between(utc_millis(5), utc_millis(5)),
            SamplingTime::Instant {
                time: utc_millis(5)
            }
        );
        assert_eq!(
            SamplingTime::between(utc_millis(9), utc_millis(5)),
            SamplingTime::Period {
                begin: utc_millis(5),
                end: utc_millis(9)
            }
        );
    }

    #[test]
    fn templates_render_placeholders() {
        let mut proc = timeseries_procedure(&[]);
        proc.internal_id = 42;
        let templates = IdTemplates::default();
        assert_eq!(templates.observation_id(&proc), "obs-42");
        assert_eq!(
            templates.cast_name(&proc, 7),
            "urn:ogc:object:observation:42-7"
        );
        assert_eq!(templates.cast_id(&proc, 7), "obs-42-7");

        let custom = IdTemplates {
            observation_name: "{procedure}/obs".into(),
            ..IdTemplates::default()
        };
        assert_eq!(
            custom.observation_name(&proc),
            "urn:sensor:timeseries/obs"
        );
    }

    #[test]
    fn read_builds_one_complex_observation() -> TestResult {
        let proc = timeseries_procedure(&[("A", FieldType::Quantity), ("B", FieldType::Quantity)]);
        let reader = ObservationReader::from_config(proc, &StoreConfig::default());
        let mut cursor =
            narrow_timeseries_rows(&[(1_000, "A", 1.0), (1_000, "B", 2.0), (2_000, "A", 3.0)]);

        let observations = reader.read(&mut cursor, 0)?;
        assert_eq!(observations.len(), 1);
        let obs = &observations[0];
        assert_eq!(obs.id, "obs-1");
        assert_eq!(obs.type_code, type_codes::COMPLEX_OBSERVATION);
        assert_eq!(
            obs.sampling_time,
            Some(SamplingTime::Period {
                begin: utc_millis(1_000),
                end: utc_millis(2_000)
            })
        );
        assert_eq!(obs.properties.get("decimated").map(String::as_str), Some("false"));
        let ObservationResult::Complex(result) = &obs.result else {
            return Err("expected a complex result".into());
        };
        assert_eq!(result.block_count, 2);
        assert_eq!(result.fields.len(), 3);
        Ok(())
    }

    #[test]
    fn single_value_becomes_measurement() -> TestResult {
        let proc = timeseries_procedure(&[("A", FieldType::Quantity)]);
        let config = StoreConfig {
            single_value_as_measurement: true,
            ..StoreConfig::default()
        };
        let reader = ObservationReader::from_config(proc, &config).with_resolver(StaticReferences {
            phenomenon: None,
            feature_of_interest: Some("station-1".into()),
        });
        let observations = reader.read(&mut narrow_timeseries_rows(&[(1_000, "A", 4.5)]), 0)?;

        let obs = &observations[0];
        assert_eq!(obs.type_code, type_codes::MEASUREMENT);
        assert_eq!(obs.phenomenon.as_deref(), Some("A"));
        assert_eq!(obs.feature_of_interest.as_deref(), Some("station-1"));
        assert_eq!(
            obs.result,
            ObservationResult::Measure(MeasureResult {
                field: "A".into(),
                uom: None,
                value: 4.5
            })
        );
        assert_eq!(
            obs.sampling_time,
            Some(SamplingTime::Instant {
                time: utc_millis(1_000)
            })
        );
        Ok(())
    }

    #[test]
    fn separated_profile_yields_one_observation_per_cast() -> TestResult {
        let proc = profile_procedure(&[("Z", FieldType::Quantity)]);
        let config = StoreConfig {
            separated_profile: true,
            result_mode: ResultMode::DataArray,
            ..StoreConfig::default()
        };
        let reader = ObservationReader::from_config(proc, &config);
        let mut cursor = narrow_profile_rows(&[
            (1_000, 0.0, "Z", 1.0),
            (1_000, 10.0, "Z", 2.0),
            (2_000, 0.0, "Z", 3.0),
            (2_000, 10.0, "Z", 4.0),
        ]);

        let observations = reader.read(&mut cursor, 0)?;
        assert_eq!(observations.len(), 2);
        assert_ne!(observations[0].id, observations[1].id);
        assert_eq!(
            observations[1].sampling_time,
            Some(SamplingTime::Instant {
                time: utc_millis(2_000)
            })
        );
        for obs in &observations {
            let ObservationResult::Complex(result) = &obs.result else {
                return Err("expected a complex result".into());
            };
            assert_eq!(result.block_count, 2);
        }
        Ok(())
    }

    #[test]
    fn decimated_read_flags_the_observation() -> TestResult {
        let proc = timeseries_procedure(&[("A", FieldType::Quantity)]);
        let reader = ObservationReader::from_config(proc, &StoreConfig::default());
        let rows: Vec<(i64, &str, f64)> = (0..100).map(|i| (i * 10, "A", i as f64)).collect();
        let mut bounds = RowCursor::new(
            ["min_value", "max_value"],
            vec![vec![ts(0), ts(990)]],
        );

        let observations = reader.read_decimated(
            BoundsSource::Aggregate(&mut bounds),
            &mut narrow_timeseries_rows(&rows),
            0,
            5,
        )?;
        let obs = &observations[0];
        assert_eq!(obs.properties.get("decimated").map(String::as_str), Some("true"));
        let ObservationResult::Complex(result) = &obs.result else {
            return Err("expected a complex result".into());
        };
        assert!(result.block_count <= 7);
        Ok(())
    }

    #[test]
    fn empty_read_yields_no_observation() -> TestResult {
        let proc = timeseries_procedure(&[("A", FieldType::Quantity)]);
        let reader = ObservationReader::from_config(proc, &StoreConfig::default());
        let observations = reader.read(&mut narrow_timeseries_rows(&[]), 0)?;
        assert!(observations.is_empty());
        Ok(())
    }
}
