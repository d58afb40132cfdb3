//! Measure-request fan-out.
//!
//! Databases cap the number of columns per table, so a procedure with many
//! fields stores its measures over several physical tables
//! (`mesure<pid>`, `mesure<pid>_2`, ...). One logical read therefore becomes
//! one [`SqlRequest`] per table hosting at least one requested field. Every
//! per-table request:
//!
//! - projects and orders rows the way the pivot needs them
//!   ([`RowProcessor::compute_request`]);
//! - is scoped with `obsprop_id IN (...)` to the requested fields it hosts
//!   (omitted in only-main mode, which reads the first table alone);
//! - carries the same time and result predicates, rewritten against its own
//!   alias (see [`filter`]).
//!
//! The engine never executes SQL; callers run the rendered statements and hand
//! back cursors (merged with [`MergedCursor`](crate::cursor::MergedCursor)).
use std::fmt;

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;

use crate::{
    catalog::{FIRST_TABLE, Field, TableLayout},
    cursor::columns,
    error::ObservationError,
    pivot::RowProcessor,
};

pub mod filter;

pub use filter::{ComparisonOperator, FilterValue, MeasureFilter};

use filter::TableScope;

/// Quote a SQL identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    let escaped = name.replace('"', "\"\"");
    format!("\"{escaped}\"")
}

/// Value bound to a `$n` placeholder.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    /// Text parameter.
    Text(String),
    /// Floating point parameter.
    Double(f64),
    /// Integer parameter.
    Integer(i64),
    /// Boolean parameter.
    Boolean(bool),
    /// Timestamp parameter.
    Timestamp(DateTime<Utc>),
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
            SqlValue::Double(v) => write!(f, "{v}"),
            SqlValue::Integer(v) => write!(f, "{v}"),
            SqlValue::Boolean(v) => write!(f, "{v}"),
            SqlValue::Timestamp(t) => write!(f, "'{}'", crate::results::format_instant(t)),
        }
    }
}

/// A SELECT statement under construction, with positional parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRequest {
    /// Schema of the table, if any.
    pub schema: Option<String>,
    /// Unquoted table name.
    pub table: String,
    /// Table alias used to qualify columns.
    pub alias: Option<String>,
    /// Projected expressions; empty selects `*`.
    pub select: Vec<String>,
    /// AND-combined predicates.
    pub conditions: Vec<String>,
    /// GROUP BY expressions.
    pub group_by: Vec<String>,
    /// ORDER BY expressions.
    pub order_by: Vec<String>,
    /// Values of `$1..$n`.
    pub params: Vec<SqlValue>,
}

impl SqlRequest {
    /// Request on `table`.
    pub fn new(table: impl Into<String>) -> Self {
        SqlRequest {
            table: table.into(),
            ..SqlRequest::default()
        }
    }

    /// Qualify the table with a schema.
    pub fn with_schema(mut self, schema: Option<String>) -> Self {
        self.schema = schema;
        self
    }

    /// Alias the table.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Quoted column reference, qualified by the alias when there is one.
    pub fn column(&self, name: &str) -> String {
        match &self.alias {
            Some(alias) => format!("{alias}.{}", quote_identifier(name)),
            None => quote_identifier(name),
        }
    }

    /// Bind a parameter and return its placeholder.
    pub fn bind(&mut self, value: SqlValue) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    /// Add a predicate; combined with the others by AND.
    pub fn push_condition(&mut self, condition: impl Into<String>) {
        self.conditions.push(condition.into());
    }

    /// Render the statement.
    pub fn to_sql(&self) -> String {
        let mut sql = String::from("SELECT ");
        if self.select.is_empty() {
            sql.push('*');
        } else {
            sql.push_str(&self.select.join(", "));
        }

        sql.push_str(" FROM ");
        if let Some(schema) = &self.schema {
            sql.push_str(&quote_identifier(schema));
            sql.push('.');
        }
        sql.push_str(&quote_identifier(&self.table));
        if let Some(alias) = &self.alias {
            sql.push_str(" AS ");
            sql.push_str(alias);
        }

        if !self.conditions.is_empty() {
            let wrapped: Vec<String> = self.conditions.iter().map(|c| format!("({c})")).collect();
            sql.push_str(" WHERE ");
            sql.push_str(&wrapped.join(" AND "));
        }
        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_by.join(", "));
        }
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        sql
    }
}

impl fmt::Display for SqlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

/// The request for one physical measure table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRequest {
    /// 1-based table number.
    pub table_number: usize,
    /// Requested fields hosted by the table.
    pub fields: Vec<Field>,
    /// Rendered request.
    pub request: SqlRequest,
}

/// Default prefix of measure table names.
pub const DEFAULT_TABLE_PREFIX: &str = "mesure";

/// Builds the per-table requests of one logical read.
#[derive(Debug, Clone)]
pub struct MeasureRequestBuilder {
    schema: Option<String>,
    table_prefix: String,
    filters: Vec<MeasureFilter>,
}

impl Default for MeasureRequestBuilder {
    fn default() -> Self {
        MeasureRequestBuilder::new(None, DEFAULT_TABLE_PREFIX)
    }
}

impl MeasureRequestBuilder {
    /// Builder for tables `<schema>.<prefix><pid>[_<n>]`.
    pub fn new(schema: Option<String>, table_prefix: impl Into<String>) -> Self {
        MeasureRequestBuilder {
            schema,
            table_prefix: table_prefix.into(),
            filters: Vec::new(),
        }
    }

    /// Add a predicate applied to every per-table request.
    pub fn with_filter(mut self, filter: MeasureFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add several predicates.
    pub fn with_filters(mut self, filters: impl IntoIterator<Item = MeasureFilter>) -> Self {
        self.filters.extend(filters);
        self
    }

    /// Predicates applied to every request.
    pub fn filters(&self) -> &[MeasureFilter] {
        &self.filters
    }

    /// Name of measure table `table_number` of procedure `internal_id`.
    pub fn table_name(&self, internal_id: i64, table_number: usize) -> String {
        if table_number == FIRST_TABLE {
            format!("{}{internal_id}", self.table_prefix)
        } else {
            format!("{}{internal_id}_{table_number}", self.table_prefix)
        }
    }

    /// One request per physical table hosting a requested field, ascending by
    /// table number.
    pub fn build(
        &self,
        processor: &dyn RowProcessor,
        field_offset: usize,
    ) -> Result<Vec<TableRequest>, ObservationError> {
        let procedure = processor.procedure();
        let working = processor.working_set(field_offset)?;
        let time_column = if working.procedure_type().is_profile() {
            columns::TIME
        } else {
            working.main().name.as_str()
        };

        let layout = TableLayout::from_fields(working.fields());
        let tables: Vec<(usize, Vec<Field>)> = if working.is_empty() {
            vec![(FIRST_TABLE, Vec::new())]
        } else {
            layout
                .table_numbers()
                .map(|n| (n, layout.fields_in(n).to_vec()))
                .collect()
        };

        let mut out = Vec::with_capacity(tables.len());
        for (table_number, fields) in tables {
            let mut request = SqlRequest::new(self.table_name(procedure.internal_id, table_number))
                .with_schema(self.schema.clone())
                .with_alias(format!("m{table_number}"));
            processor.compute_request(&mut request, field_offset)?;

            if !fields.is_empty() {
                let column = request.column(columns::OBSERVED_PROPERTY);
                let placeholders: Vec<String> = fields
                    .iter()
                    .map(|f| request.bind(SqlValue::Text(f.name.clone())))
                    .collect();
                request.push_condition(format!("{column} IN ({})", placeholders.join(", ")));
            }

            let scope = TableScope {
                time_column,
                fields: &fields,
            };
            for filter in &self.filters {
                let rendered = filter.render(&mut request, &scope);
                request.push_condition(rendered);
            }

            out.push(TableRequest {
                table_number,
                fields,
                request,
            });
        }

        debug!(
            "fanned out {} field(s) of {} over {} measure table(s)",
            working.len(),
            procedure.procedure_id,
            out.len()
        );
        Ok(out)
    }
}
