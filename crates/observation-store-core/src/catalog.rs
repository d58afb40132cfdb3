//! Static description of a procedure's measured fields.
//!
//! A [`ProcedureInfo`] is loaded once per request from the metadata backend and
//! never mutated afterwards. It names:
//!
//! - the procedure type (time series, profile or trajectory),
//! - the single *main* field that orders and groups the series (time for time
//!   series and trajectories, depth/altitude for profiles),
//! - the full ordered field list as stored, each field tagged with the
//!   physical measure table hosting it.
//!
//! Query paths never work on the raw field list directly. They derive a
//! [`WorkingSet`] (the validated, ordered list of measure fields the request
//! touches) and, for fan-out, a [`TableLayout`] (field name → table number and
//! offset within that table).
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{DuplicateFieldSnafu, ObservationError, UnsupportedFieldTypeSnafu};

/// Physical measure tables are numbered from 1.
pub const FIRST_TABLE: usize = 1;

fn default_table_number() -> usize {
    FIRST_TABLE
}

/// Declared value type of a field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    /// Instant values.
    Time,
    /// Numeric measurements.
    Quantity,
    /// Free text.
    Text,
    /// True / false flags.
    Boolean,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Time => write!(f, "TIME"),
            FieldType::Quantity => write!(f, "QUANTITY"),
            FieldType::Text => write!(f, "TEXT"),
            FieldType::Boolean => write!(f, "BOOLEAN"),
        }
    }
}

/// One measured (or ordering) field of a procedure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Field {
    /// Field name, also used as the observed-property identifier in measure rows.
    pub name: String,
    /// Declared value type.
    pub data_type: FieldType,
    /// Ordinal of the field in the procedure's field list.
    pub index: usize,
    /// Physical measure table hosting the field (1-based).
    #[serde(default = "default_table_number")]
    pub table_number: usize,
    /// Optional human readable label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Optional unit of measure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uom: Option<String>,
}

impl Field {
    /// Create a field hosted by the first measure table.
    pub fn new(name: impl Into<String>, data_type: FieldType, index: usize) -> Self {
        Field {
            name: name.into(),
            data_type,
            index,
            table_number: FIRST_TABLE,
            label: None,
            uom: None,
        }
    }

    /// Move the field to another physical table.
    pub fn with_table(mut self, table_number: usize) -> Self {
        self.table_number = table_number;
        self
    }

    /// Attach a unit of measure.
    pub fn with_uom(mut self, uom: impl Into<String>) -> Self {
        self.uom = Some(uom.into());
        self
    }
}

/// Shape of the series a procedure produces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcedureType {
    /// Values ordered by time.
    Timeseries,
    /// Values ordered by depth/altitude, one cast per timestamp.
    Profile,
    /// Values ordered by time along a moving platform.
    Trajectory,
}

impl ProcedureType {
    /// Field type the main field must have for this procedure type.
    pub fn main_field_type(self) -> FieldType {
        match self {
            ProcedureType::Timeseries | ProcedureType::Trajectory => FieldType::Time,
            ProcedureType::Profile => FieldType::Quantity,
        }
    }

    /// Profiles group by `(time, depth)`; everything else groups by the main value alone.
    pub fn is_profile(self) -> bool {
        matches!(self, ProcedureType::Profile)
    }
}

impl fmt::Display for ProcedureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureType::Timeseries => write!(f, "timeseries"),
            ProcedureType::Profile => write!(f, "profile"),
            ProcedureType::Trajectory => write!(f, "trajectory"),
        }
    }
}

/// Catalog entry for one sensor / procedure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcedureInfo {
    /// Public procedure identifier (for example a sensor URN).
    pub procedure_id: String,
    /// Internal numeric id, used to name the physical measure tables.
    pub internal_id: i64,
    /// Procedure type.
    #[serde(rename = "type")]
    pub procedure_type: ProcedureType,
    /// Ordering / grouping field.
    pub main_field: Field,
    /// All fields as stored, usually starting with the main field.
    pub fields: Vec<Field>,
}

impl ProcedureInfo {
    /// Build the working set starting at `field_offset` in [`ProcedureInfo::fields`].
    ///
    /// The main field is skipped wherever it appears: it is always emitted as
    /// the grouping column of a block and never as a regular measure column.
    pub fn working_set(&self, field_offset: usize) -> Result<WorkingSet, ObservationError> {
        let fields = self
            .fields
            .iter()
            .skip(field_offset)
            .filter(|f| f.name != self.main_field.name)
            .cloned()
            .collect();
        WorkingSet::new(self.procedure_type, self.main_field.clone(), fields)
    }

    /// Build the working set and keep only the fields named in `phenomena`.
    ///
    /// An empty `phenomena` list keeps every field.
    pub fn working_set_for(
        &self,
        field_offset: usize,
        phenomena: &[String],
    ) -> Result<WorkingSet, ObservationError> {
        let working = self.working_set(field_offset)?;
        if phenomena.is_empty() {
            return Ok(working);
        }
        Ok(working.restrict(phenomena))
    }
}

/// Validated, ordered set of measure fields a request works on.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingSet {
    procedure_type: ProcedureType,
    main: Field,
    fields: Vec<Field>,
    positions: HashMap<String, usize>,
}

impl WorkingSet {
    /// Validate and build a working set.
    ///
    /// Fails when two fields share a name or when the main field type does not
    /// match what `procedure_type` requires.
    pub fn new(
        procedure_type: ProcedureType,
        main: Field,
        fields: Vec<Field>,
    ) -> Result<Self, ObservationError> {
        let expected = procedure_type.main_field_type();
        if main.data_type != expected {
            return UnsupportedFieldTypeSnafu {
                field: main.name.clone(),
                expected: expected.to_string(),
                found: main.data_type.to_string(),
            }
            .fail();
        }

        let mut positions = HashMap::with_capacity(fields.len());
        for (pos, field) in fields.iter().enumerate() {
            if field.name == main.name || positions.insert(field.name.clone(), pos).is_some() {
                return DuplicateFieldSnafu {
                    name: field.name.clone(),
                }
                .fail();
            }
        }

        Ok(WorkingSet {
            procedure_type,
            main,
            fields,
            positions,
        })
    }

    /// Keep only the named fields, preserving catalog order.
    pub fn restrict(&self, names: &[String]) -> WorkingSet {
        for name in names {
            if !self.positions.contains_key(name) {
                debug!("ignoring unknown phenomenon {name} for working set restriction");
            }
        }
        let fields: Vec<Field> = self
            .fields
            .iter()
            .filter(|f| names.iter().any(|n| n == &f.name))
            .cloned()
            .collect();
        let positions = fields
            .iter()
            .enumerate()
            .map(|(pos, f)| (f.name.clone(), pos))
            .collect();
        WorkingSet {
            procedure_type: self.procedure_type,
            main: self.main.clone(),
            fields,
            positions,
        }
    }

    /// Procedure type the set was built for.
    pub fn procedure_type(&self) -> ProcedureType {
        self.procedure_type
    }

    /// The grouping field.
    pub fn main(&self) -> &Field {
        &self.main
    }

    /// Measure fields in output order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Position of a field in every flushed block.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    /// Number of measure fields (the main field excluded).
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when only the main field is requested (`onlyMain` mode).
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Where a field lives physically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLocation {
    /// 1-based table number.
    pub table_number: usize,
    /// Offset of the field among the fields hosted by that table.
    pub offset: usize,
}

/// Explicit field name → physical table map, built once per procedure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableLayout {
    locations: HashMap<String, FieldLocation>,
    tables: BTreeMap<usize, Vec<Field>>,
}

impl TableLayout {
    /// Build the layout from the fields' declared table numbers.
    pub fn from_fields(fields: &[Field]) -> Self {
        let mut layout = TableLayout::default();
        for field in fields {
            let hosted = layout.tables.entry(field.table_number).or_default();
            layout.locations.insert(
                field.name.clone(),
                FieldLocation {
                    table_number: field.table_number,
                    offset: hosted.len(),
                },
            );
            hosted.push(field.clone());
        }
        layout
    }

    /// Location of a field, if it is part of the layout.
    pub fn location(&self, name: &str) -> Option<FieldLocation> {
        self.locations.get(name).copied()
    }

    /// Table numbers hosting at least one field, ascending.
    pub fn table_numbers(&self) -> impl Iterator<Item = usize> + '_ {
        self.tables.keys().copied()
    }

    /// Fields hosted by `table_number`, in catalog order.
    pub fn fields_in(&self, table_number: usize) -> &[Field] {
        self.tables
            .get(&table_number)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of physical tables involved.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

/// Spread `fields` over physical tables holding at most `max_fields_per_table` each.
///
/// Table numbers start at [`FIRST_TABLE`]; field order is preserved.
pub fn assign_tables(fields: &[Field], max_fields_per_table: usize) -> Vec<Field> {
    debug_assert!(max_fields_per_table > 0, "table width must be positive");
    let width = max_fields_per_table.max(1);
    fields
        .iter()
        .enumerate()
        .map(|(i, f)| f.clone().with_table(FIRST_TABLE + i / width))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;

    #[test]
    fn working_set_skips_main_field_and_offset() -> TestResult {
        let proc = timeseries_procedure(&[("A", FieldType::Quantity), ("B", FieldType::Text)]);

        let all = proc.working_set(0)?;
        assert_eq!(names(all.fields()), vec!["A", "B"]);

        let tail = proc.working_set(2)?;
        assert_eq!(names(tail.fields()), vec!["B"]);
        assert_eq!(tail.position("B"), Some(0));
        assert_eq!(tail.position("A"), None);
        Ok(())
    }

    #[test]
    fn working_set_rejects_duplicate_names() {
        let main = Field::new("time", FieldType::Time, 0);
        let fields = vec![
            Field::new("A", FieldType::Quantity, 1),
            Field::new("A", FieldType::Quantity, 2),
        ];
        let err = WorkingSet::new(ProcedureType::Timeseries, main, fields)
            .expect_err("duplicate names must fail");
        assert!(matches!(err, ObservationError::DuplicateField { ref name } if name == "A"));
    }

    #[test]
    fn working_set_rejects_main_field_of_wrong_type() {
        let main = Field::new("depth", FieldType::Quantity, 0);
        let err = WorkingSet::new(ProcedureType::Timeseries, main, vec![])
            .expect_err("timeseries needs a TIME main field");
        assert!(matches!(err, ObservationError::UnsupportedFieldType { .. }));
    }

    #[test]
    fn restrict_keeps_catalog_order() -> TestResult {
        let proc = timeseries_procedure(&[
            ("A", FieldType::Quantity),
            ("B", FieldType::Quantity),
            ("C", FieldType::Quantity),
        ]);
        let working = proc.working_set_for(0, &["C".to_string(), "A".to_string()])?;
        assert_eq!(names(working.fields()), vec!["A", "C"]);
        assert_eq!(working.position("C"), Some(1));
        Ok(())
    }

    #[test]
    fn profile_without_phenomena_is_only_main() -> TestResult {
        let proc = profile_procedure(&[]);
        let working = proc.working_set(0)?;
        assert!(working.is_empty());
        assert_eq!(working.main().name, "depth");
        Ok(())
    }

    #[test]
    fn assign_tables_chunks_fields() {
        let fields: Vec<Field> = (0..5)
            .map(|i| Field::new(format!("f{i}"), FieldType::Quantity, i))
            .collect();
        let assigned = assign_tables(&fields, 2);
        let tables: Vec<usize> = assigned.iter().map(|f| f.table_number).collect();
        assert_eq!(tables, vec![1, 1, 2, 2, 3]);

        let layout = TableLayout::from_fields(&assigned);
        assert_eq!(layout.table_count(), 3);
        assert_eq!(
            layout.location("f3"),
            Some(FieldLocation {
                table_number: 2,
                offset: 1
            })
        );
        assert_eq!(names(layout.fields_in(3)), vec!["f4"]);
        assert!(layout.fields_in(9).is_empty());
    }

    #[test]
    fn procedure_info_reads_json() -> TestResult {
        let json = r#"{
            "procedure_id": "urn:sensor:ctd-1",
            "internal_id": 7,
            "type": "PROFILE",
            "main_field": {"name": "depth", "data_type": "QUANTITY", "index": 0},
            "fields": [
                {"name": "depth", "data_type": "QUANTITY", "index": 0},
                {"name": "temp", "data_type": "QUANTITY", "index": 1, "uom": "degC"},
                {"name": "flag", "data_type": "BOOLEAN", "index": 2, "table_number": 2}
            ]
        }"#;
        let proc: ProcedureInfo = serde_json::from_str(json)?;
        assert_eq!(proc.procedure_type, ProcedureType::Profile);
        let working = proc.working_set(0)?;
        assert_eq!(names(working.fields()), vec!["temp", "flag"]);
        assert_eq!(working.fields()[1].table_number, 2);
        assert_eq!(working.fields()[0].uom.as_deref(), Some("degC"));
        Ok(())
    }
}
