//! Binding resolution and table data exchange.

use std::collections::BTreeMap;

use serde_json::Value;

use super::errors::{DomainError, DomainResult};
use super::models::{AppId, PropValue, Table};
use super::parser::Binding;
use super::workspace::Workspace;

/// Render-time scope a binding is resolved in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderContext {
    /// The current item when rendering inside a repeater.
    pub item: Option<Value>,
}

impl RenderContext {
    pub fn with_item(item: Value) -> Self {
        Self { item: Some(item) }
    }
}

/// A prop value ready for display, with the warning shown inline when its
/// binding could not be resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedProp {
    pub value: Value,
    pub warning: Option<String>,
}

/// Resolves bindings against one app of a workspace snapshot.
///
/// Resolution is a pure function of the snapshot and the [`RenderContext`].
///
/// # Examples
///
/// ```
/// use pagecraft::domain::{AppId, Binding, BindingResolver, RenderContext, Workspace};
/// use serde_json::json;
///
/// let workspace = Workspace::seeded("Demo");
/// let app = AppId::from("app-1");
/// let resolver = BindingResolver::new(&workspace, &app);
///
/// let item = RenderContext::with_item(json!({ "name": "Ada" }));
/// let binding = Binding::parse("Hi {{ item.name }}").unwrap();
/// assert_eq!(resolver.resolve(&binding, &item).unwrap(), json!("Hi Ada"));
/// ```
pub struct BindingResolver<'a> {
    workspace: &'a Workspace,
    app_id: &'a AppId,
}

impl<'a> BindingResolver<'a> {
    pub fn new(workspace: &'a Workspace, app_id: &'a AppId) -> Self {
        Self { workspace, app_id }
    }

    pub fn resolve(&self, binding: &Binding, context: &RenderContext) -> DomainResult<Value> {
        match binding {
            Binding::Literal { value } => Ok(value.clone()),
            Binding::TableReference { table } => {
                let table = self.table(table)?;
                Ok(Value::Array(table.records.iter().map(|r| r.to_json()).collect()))
            }
            Binding::FieldReference { table, field, row } => {
                let table = self.table(table)?;
                if table.field(field).is_none() {
                    return Err(DomainError::binding(format!(
                        "table '{}' has no field '{field}'",
                        table.name
                    )));
                }
                let value_of = |index: usize| {
                    table.records[index]
                        .values
                        .get(field)
                        .cloned()
                        .unwrap_or(Value::Null)
                };
                match row {
                    Some(index) if *index < table.records.len() => Ok(value_of(*index)),
                    Some(index) => Err(DomainError::binding(format!(
                        "table '{}' has no row {index}",
                        table.name
                    ))),
                    None => Ok(Value::Array((0..table.records.len()).map(value_of).collect())),
                }
            }
            Binding::RepeaterItemReference { field } => {
                let item = context
                    .item
                    .as_ref()
                    .ok_or_else(|| DomainError::binding("no repeater item in scope"))?;
                match field {
                    None => Ok(item.clone()),
                    Some(field) => item.get(field).cloned().ok_or_else(|| {
                        DomainError::binding(format!("repeater item has no field '{field}'"))
                    }),
                }
            }
            Binding::Template { parts } => {
                let mut text = String::new();
                for part in parts {
                    text.push_str(&display_text(&self.resolve(part, context)?));
                }
                Ok(Value::String(text))
            }
        }
    }

    /// Resolves a prop, turning binding failures into an empty value plus a warning.
    pub fn render(&self, prop: &PropValue, context: &RenderContext) -> RenderedProp {
        match prop {
            PropValue::Static(value) => RenderedProp { value: value.clone(), warning: None },
            PropValue::Bound(binding) => match self.resolve(binding, context) {
                Ok(value) => RenderedProp { value, warning: None },
                Err(err) => RenderedProp { value: Value::Null, warning: Some(err.to_string()) },
            },
        }
    }

    fn table(&self, name: &str) -> DomainResult<&'a Table> {
        self.workspace
            .table_by_name(self.app_id, name)
            .ok_or_else(|| DomainError::binding(format!("unknown table '{name}'")))
    }
}

/// How a resolved value appears inside interpolated text.
pub fn display_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(items) => items.iter().map(display_text).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

/// CSV export and import of table records.
pub struct RecordExporter;

impl RecordExporter {
    /// Writes the table as CSV: a header row of field names, then one row per record.
    pub fn export_csv(table: &Table) -> DomainResult<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        let csv_error = |e: csv::Error| DomainError::validation(format!("CSV export failed: {e}"));

        writer
            .write_record(table.fields.iter().map(|field| field.name.as_str()))
            .map_err(csv_error)?;
        for record in &table.records {
            let row = table
                .fields
                .iter()
                .map(|field| record.values.get(&field.name).map(display_text).unwrap_or_default());
            writer.write_record(row).map_err(csv_error)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| DomainError::validation(format!("CSV export failed: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|e| DomainError::validation(format!("CSV export failed: {e}")))
    }

    /// Parses CSV text into typed value maps for `table`.
    ///
    /// The header row must name fields of the table; cells are coerced to the
    /// field's type. Columns the CSV omits are left out of the maps so record
    /// creation fills them in.
    pub fn import_csv(table: &Table, data: &str) -> DomainResult<Vec<BTreeMap<String, Value>>> {
        let mut reader = csv::Reader::from_reader(data.as_bytes());
        let csv_error = |e: csv::Error| DomainError::validation(format!("CSV import failed: {e}"));

        let headers = reader.headers().map_err(csv_error)?.clone();
        let mut columns = Vec::with_capacity(headers.len());
        for header in headers.iter() {
            let field = table.field(header.trim()).ok_or_else(|| {
                DomainError::validation(format!("table '{}' has no field '{}'", table.name, header))
            })?;
            columns.push(field);
        }

        let mut rows = Vec::new();
        for (line, result) in reader.records().enumerate() {
            let record = result.map_err(csv_error)?;
            let mut values = BTreeMap::new();
            for (field, cell) in columns.iter().zip(record.iter()) {
                let value = field
                    .field_type
                    .coerce_text(cell)
                    .map_err(|e| DomainError::validation(format!("row {}: {e}", line + 1)))?;
                values.insert(field.name.clone(), value);
            }
            rows.push(values);
        }
        Ok(rows)
    }
}
