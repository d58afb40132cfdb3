//! Block sink turning flushed blocks into observations.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::debug;

use crate::{
    block::Block,
    catalog::{FieldType, ProcedureInfo, WorkingSet},
    cursor::CellValue,
    error::{IllegalStateSnafu, ObservationError},
    pivot::Pivot,
    results::{BlockSink, ResultBuilder},
};

use super::{
    ComplexResult, IdTemplates, MeasureResult, Observation, ObservationResult, ReferenceResolver,
    SamplingTime, type_codes,
};

struct Pending {
    cast: Option<i64>,
    builder: ResultBuilder,
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
    measurement_id: i64,
    single_value: Option<f64>,
}

impl Pending {
    fn observe(&mut self, block: &Block) {
        if let Some(t) = block.instant() {
            self.first = Some(self.first.map_or(t, |f| f.min(t)));
            self.last = Some(self.last.map_or(t, |l| l.max(t)));
        }
        self.single_value = match block.values() {
            [CellValue::Double(v)] => Some(*v),
            _ => None,
        };
    }
}

/// Groups flushed blocks into observations.
///
/// Profiles read with `separated` start a new observation on every cast time;
/// everything else yields one observation for the whole read. An empty read
/// yields none.
pub struct ObservationAssembler<'a> {
    procedure: &'a ProcedureInfo,
    working: WorkingSet,
    templates: &'a IdTemplates,
    resolver: &'a dyn ReferenceResolver,
    empty: ResultBuilder,
    split_casts: bool,
    single_value_as_measurement: bool,
    decimated: bool,
    current: Option<Pending>,
    observations: Vec<Observation>,
}

impl<'a> ObservationAssembler<'a> {
    /// Assembler for blocks pivoted by `pivot` at `field_offset`.
    pub fn new(
        pivot: &'a Pivot,
        field_offset: usize,
        templates: &'a IdTemplates,
        resolver: &'a dyn ReferenceResolver,
    ) -> Result<Self, ObservationError> {
        Ok(ObservationAssembler {
            procedure: pivot.procedure(),
            working: pivot.working_set(field_offset)?,
            templates,
            resolver,
            empty: pivot.new_builder(field_offset)?,
            split_casts: false,
            single_value_as_measurement: false,
            decimated: false,
            current: None,
            observations: Vec::new(),
        })
    }

    /// One observation per cast (profiles only).
    pub fn separated(mut self, separated: bool) -> Self {
        self.split_casts = separated && self.procedure.procedure_type.is_profile();
        self
    }

    /// Render lone quantities as measurements.
    pub fn single_value_as_measurement(mut self, enabled: bool) -> Self {
        self.single_value_as_measurement = enabled;
        self
    }

    /// Mark observations as decimated.
    pub fn decimated(mut self, decimated: bool) -> Self {
        self.decimated = decimated;
        self
    }

    /// Close the pending observation and return everything assembled.
    pub fn finish(mut self) -> Result<Vec<Observation>, ObservationError> {
        if let Some(pending) = self.current.take() {
            let observation = self.build(pending);
            self.observations.push(observation);
        }
        debug!(
            "assembled {} observation(s) for {}",
            self.observations.len(),
            self.procedure.procedure_id
        );
        Ok(self.observations)
    }

    fn measurement(&self, pending: &Pending) -> Option<MeasureResult> {
        if !self.single_value_as_measurement || pending.builder.count() != 1 {
            return None;
        }
        let [field] = self.working.fields() else {
            return None;
        };
        if field.data_type != FieldType::Quantity {
            return None;
        }
        match pending.single_value {
            Some(value) if !value.is_nan() => Some(MeasureResult {
                field: field.name.clone(),
                uom: field.uom.clone(),
                value,
            }),
            _ => None,
        }
    }

    fn build(&self, pending: Pending) -> Observation {
        let (id, name) = if self.split_casts {
            (
                self.templates
                    .cast_id(self.procedure, pending.measurement_id),
                self.templates
                    .cast_name(self.procedure, pending.measurement_id),
            )
        } else {
            (
                self.templates.observation_id(self.procedure),
                self.templates.observation_name(self.procedure),
            )
        };

        let sampling_time = match (pending.first, pending.last) {
            (Some(first), Some(last)) => Some(SamplingTime::between(first, last)),
            _ => None,
        };

        let (type_code, result) = match self.measurement(&pending) {
            Some(measure) => (type_codes::MEASUREMENT, ObservationResult::Measure(measure)),
            None => {
                let builder = pending.builder;
                (
                    type_codes::COMPLEX_OBSERVATION,
                    ObservationResult::Complex(ComplexResult {
                        fields: builder.layout().columns().to_vec(),
                        encoding: builder.encoding().clone(),
                        block_count: builder.count(),
                        values: builder.into_values(),
                    }),
                )
            }
        };

        let mut properties = BTreeMap::new();
        properties.insert(
            "type".to_string(),
            self.procedure.procedure_type.to_string(),
        );
        properties.insert("decimated".to_string(), self.decimated.to_string());

        Observation {
            id,
            name,
            type_code: type_code.to_string(),
            procedure: self.procedure.procedure_id.clone(),
            sampling_time,
            feature_of_interest: self
                .resolver
                .feature_of_interest(self.procedure, pending.first),
            phenomenon: self
                .resolver
                .phenomenon(self.procedure, self.working.fields()),
            result,
            properties,
        }
    }
}

impl BlockSink for ObservationAssembler<'_> {
    fn write_block(&mut self, block: &Block) -> Result<(), ObservationError> {
        let cast = if self.split_casts {
            block.key().and_then(|k| k.time).map(|t| t.timestamp_millis())
        } else {
            None
        };

        let start_new = match &self.current {
            None => true,
            Some(pending) => self.split_casts && pending.cast != cast,
        };
        if start_new {
            if let Some(done) = self.current.take() {
                let observation = self.build(done);
                self.observations.push(observation);
            }
            self.current = Some(Pending {
                cast,
                builder: self.empty.empty_like(),
                first: None,
                last: None,
                measurement_id: block.measurement_id(),
                single_value: None,
            });
        }

        let Some(pending) = self.current.as_mut() else {
            return IllegalStateSnafu {
                message: "no pending observation for block",
            }
            .fail();
        };
        pending.builder.write_block(block)?;
        pending.observe(block);
        Ok(())
    }
}
