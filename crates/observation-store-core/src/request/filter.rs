//! Abstract measure filters and their per-table SQL rendering.
//!
//! Filters arrive from protocol front-ends as typed placeholders. A result
//! filter carries the declared type of its value; when it is rendered for one
//! physical table it expands into one predicate per candidate field hosted by
//! that table:
//!
//! ```text
//! (mN."obsprop_id" = $a AND mN."result" op $b)   -- field type matches
//! FALSE                                          -- type mismatch
//! ```
//!
//! Candidates are OR-combined. A filter never disappears and never raises a
//! type error: with no usable candidate it renders `FALSE`.
use std::fmt;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    catalog::{Field, FieldType},
    cursor::columns,
};

use super::{SqlRequest, SqlValue};

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
}

impl ComparisonOperator {
    /// SQL spelling.
    pub fn as_sql(self) -> &'static str {
        match self {
            ComparisonOperator::Eq => "=",
            ComparisonOperator::NotEq => "<>",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::LtEq => "<=",
            ComparisonOperator::Gt => ">",
            ComparisonOperator::GtEq => ">=",
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Typed literal of a result filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterValue {
    /// Instant literal.
    Time(DateTime<Utc>),
    /// Numeric literal.
    Quantity(f64),
    /// Text literal.
    Text(String),
    /// Boolean literal.
    Boolean(bool),
}

impl FilterValue {
    /// Field type the literal can be compared with.
    pub fn declared_type(&self) -> FieldType {
        match self {
            FilterValue::Time(_) => FieldType::Time,
            FilterValue::Quantity(_) => FieldType::Quantity,
            FilterValue::Text(_) => FieldType::Text,
            FilterValue::Boolean(_) => FieldType::Boolean,
        }
    }

    fn to_sql_value(&self) -> SqlValue {
        match self {
            FilterValue::Time(t) => SqlValue::Timestamp(*t),
            FilterValue::Quantity(v) => SqlValue::Double(*v),
            FilterValue::Text(v) => SqlValue::Text(v.clone()),
            FilterValue::Boolean(v) => SqlValue::Boolean(*v),
        }
    }
}

/// One predicate on measure rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasureFilter {
    /// Compare the series' time column with an instant.
    Time {
        /// Operator.
        operator: ComparisonOperator,
        /// Instant.
        value: DateTime<Utc>,
    },
    /// Time column within `[begin, end]`.
    TimeDuring {
        /// Inclusive lower bound.
        begin: DateTime<Utc>,
        /// Inclusive upper bound.
        end: DateTime<Utc>,
    },
    /// Compare measured values of one field (or any field when `field` is `None`).
    Result {
        /// Restrict to this field.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        /// Operator.
        operator: ComparisonOperator,
        /// Typed literal.
        value: FilterValue,
    },
}

/// Rendering context: one physical table.
pub(crate) struct TableScope<'a> {
    /// Time column of the series (main field, or `time` for profiles).
    pub(crate) time_column: &'a str,
    /// Requested fields hosted by the table.
    pub(crate) fields: &'a [Field],
}

/// Literal `FALSE` predicate.
pub const FALSE: &str = "FALSE";

impl MeasureFilter {
    /// Render the filter against `request`'s alias, binding values as parameters.
    pub(crate) fn render(&self, request: &mut SqlRequest, scope: &TableScope<'_>) -> String {
        match self {
            MeasureFilter::Time { operator, value } => {
                let column = request.column(scope.time_column);
                let param = request.bind(SqlValue::Timestamp(*value));
                format!("{column} {operator} {param}")
            }
            MeasureFilter::TimeDuring { begin, end } => {
                let column = request.column(scope.time_column);
                let lower = request.bind(SqlValue::Timestamp(*begin));
                let upper = request.bind(SqlValue::Timestamp(*end));
                format!("{column} >= {lower} AND {column} <= {upper}")
            }
            MeasureFilter::Result {
                field,
                operator,
                value,
            } => render_result(request, scope, field.as_deref(), *operator, value),
        }
    }
}

fn render_result(
    request: &mut SqlRequest,
    scope: &TableScope<'_>,
    field: Option<&str>,
    operator: ComparisonOperator,
    value: &FilterValue,
) -> String {
    let candidates: Vec<&Field> = scope
        .fields
        .iter()
        .filter(|f| field.is_none_or(|name| f.name == name))
        .collect();

    if candidates.is_empty() {
        debug!(
            "result filter on {} has no candidate in table {}, rendering FALSE",
            field.unwrap_or("<any>"),
            request.table
        );
        return FALSE.to_string();
    }

    let declared = value.declared_type();
    let property = request.column(columns::OBSERVED_PROPERTY);
    let result = request.column(columns::RESULT);
    let parts: Vec<String> = candidates
        .into_iter()
        .map(|candidate| {
            if candidate.data_type != declared {
                debug!(
                    "result filter of type {declared} does not apply to {} field {}, rendering FALSE",
                    candidate.data_type, candidate.name
                );
                return FALSE.to_string();
            }
            let name = request.bind(SqlValue::Text(candidate.name.clone()));
            let literal = request.bind(value.to_sql_value());
            format!("({property} = {name} AND {result} {operator} {literal})")
        })
        .collect();

    parts.join(" OR ")
}
