use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{DomainError, DomainResult};
use super::parser::Binding;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

entity_id!(
    /// Identifier of an [`App`].
    AppId,
    "app"
);
entity_id!(
    /// Identifier of a [`Page`].
    PageId,
    "page"
);
entity_id!(
    /// Identifier of a [`Component`] in the workspace arena.
    ComponentId,
    "comp"
);
entity_id!(
    /// Identifier of a [`Table`].
    TableId,
    "table"
);
entity_id!(
    /// Identifier of a [`Record`]. Always a random UUID.
    RecordId,
    "rec"
);

impl RecordId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// A top-level project owning pages, library components and tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub id: AppId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered; the first page is the app's default page.
    pub pages: Vec<PageId>,
    /// Root ids of reusable component definitions.
    pub components: Vec<ComponentId>,
    pub tables: Vec<TableId>,
}

impl App {
    pub fn default_page(&self) -> Option<&PageId> {
        self.pages.first()
    }
}

/// A path-addressed container of a component tree within an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: PageId,
    pub app_id: AppId,
    pub name: String,
    pub path: String,
    /// Ordered root components of the page.
    pub components: Vec<ComponentId>,
}

/// The closed set of component kinds the builder can place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Text,
    Button,
    Input,
    Container,
    Form,
    Repeater,
    Navigation,
    Table,
    Image,
    Checkbox,
}

impl ComponentType {
    pub const ALL: [ComponentType; 10] = [
        ComponentType::Text,
        ComponentType::Button,
        ComponentType::Input,
        ComponentType::Container,
        ComponentType::Form,
        ComponentType::Repeater,
        ComponentType::Navigation,
        ComponentType::Table,
        ComponentType::Image,
        ComponentType::Checkbox,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Text => "text",
            ComponentType::Button => "button",
            ComponentType::Input => "input",
            ComponentType::Container => "container",
            ComponentType::Form => "form",
            ComponentType::Repeater => "repeater",
            ComponentType::Navigation => "navigation",
            ComponentType::Table => "table",
            ComponentType::Image => "image",
            ComponentType::Checkbox => "checkbox",
        }
    }

    /// Whether instances of this type may own child components.
    pub fn accepts_children(&self) -> bool {
        matches!(
            self,
            ComponentType::Container | ComponentType::Form | ComponentType::Repeater
        )
    }

    /// Props a freshly dropped component starts with.
    pub fn default_props(&self) -> BTreeMap<String, PropValue> {
        let entries: Vec<(&str, Value)> = match self {
            ComponentType::Text => vec![("text", Value::from("Text"))],
            ComponentType::Button => vec![
                ("label", Value::from("Button")),
                ("variant", Value::from("primary")),
            ],
            ComponentType::Input => vec![
                ("label", Value::from("Input")),
                ("placeholder", Value::from("")),
                ("field", Value::Null),
            ],
            ComponentType::Container => vec![("direction", Value::from("column"))],
            ComponentType::Form => vec![
                ("table", Value::Null),
                ("submit_label", Value::from("Submit")),
            ],
            ComponentType::Repeater => vec![("source", Value::Null)],
            ComponentType::Navigation => vec![("links", Value::Array(Vec::new()))],
            ComponentType::Table => vec![("source", Value::Null)],
            ComponentType::Image => vec![("src", Value::from("")), ("alt", Value::from(""))],
            ComponentType::Checkbox => vec![
                ("label", Value::from("Checkbox")),
                ("checked", Value::Bool(false)),
            ],
        };

        entries
            .into_iter()
            .map(|(name, value)| (name.to_string(), PropValue::Static(value)))
            .collect()
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A component property: either a fixed value or a binding resolved at render time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PropValue {
    Static(Value),
    Bound(Binding),
}

impl PropValue {
    /// Interprets text typed into the property panel.
    ///
    /// Text containing `{{` is parsed as a binding, anything else is kept as a
    /// static string.
    ///
    /// # Examples
    ///
    /// ```
    /// use pagecraft::domain::{Binding, PropValue};
    ///
    /// let plain = PropValue::from_input("Hello").unwrap();
    /// assert_eq!(plain, PropValue::Static("Hello".into()));
    ///
    /// let bound = PropValue::from_input("{{ Users }}").unwrap();
    /// assert_eq!(bound, PropValue::Bound(Binding::TableReference { table: "Users".into() }));
    /// ```
    pub fn from_input(input: &str) -> DomainResult<Self> {
        if input.contains("{{") {
            Ok(PropValue::Bound(Binding::parse(input)?))
        } else {
            Ok(PropValue::Static(Value::from(input)))
        }
    }
}

/// Where a component is attached in the ownership tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ParentRef {
    Page(PageId),
    Component(ComponentId),
    /// Root of a reusable definition in an app's component library.
    Library(AppId),
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentRef::Page(id) => write!(f, "page {id}"),
            ParentRef::Component(id) => write!(f, "component {id}"),
            ParentRef::Library(id) => write!(f, "library of {id}"),
        }
    }
}

/// A typed node in a page's render tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: ComponentId,
    pub component_type: ComponentType,
    pub props: BTreeMap<String, PropValue>,
    pub parent: ParentRef,
    pub children: Vec<ComponentId>,
}

impl Component {
    pub fn new(id: ComponentId, component_type: ComponentType, parent: ParentRef) -> Self {
        Self {
            id,
            component_type,
            props: component_type.default_props(),
            parent,
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Boolean,
    Uuid,
    Date,
}

impl FieldType {
    /// The explicit value stored when a record does not supply this field.
    pub fn empty_value(&self) -> Value {
        match self {
            FieldType::Text => Value::from(""),
            _ => Value::Null,
        }
    }

    pub fn generates_values(&self) -> bool {
        matches!(self, FieldType::Uuid)
    }

    /// Whether `value` may be stored in a field of this type. `null` is always accepted.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (FieldType::Text, Value::String(_)) => true,
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Uuid, Value::String(s)) => uuid::Uuid::parse_str(s).is_ok(),
            (FieldType::Date, Value::String(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
            _ => false,
        }
    }

    /// Converts raw text (a CSV cell, a form input) into a typed value.
    pub fn coerce_text(&self, raw: &str) -> DomainResult<Value> {
        let trimmed = raw.trim();
        match self {
            FieldType::Text => Ok(Value::from(raw)),
            _ if trimmed.is_empty() => Ok(self.empty_value()),
            FieldType::Number => trimmed
                .parse::<f64>()
                .ok()
                .and_then(|n| {
                    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                        Some(Value::from(n as i64))
                    } else {
                        serde_json::Number::from_f64(n).map(Value::Number)
                    }
                })
                .ok_or_else(|| DomainError::validation(format!("'{raw}' is not a number"))),
            FieldType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "0" => Ok(Value::Bool(false)),
                _ => Err(DomainError::validation(format!("'{raw}' is not a boolean"))),
            },
            FieldType::Uuid | FieldType::Date => {
                let value = Value::from(trimmed);
                if self.accepts(&value) {
                    Ok(value)
                } else {
                    Err(DomainError::validation(format!("'{raw}' is not a valid {self}")))
                }
            }
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Uuid => "uuid",
            FieldType::Date => "date",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

/// One row of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub values: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Record {
    /// The record as a flat JSON object, as seen by bindings.
    pub fn to_json(&self) -> Value {
        let mut object = serde_json::Map::new();
        object.insert("id".to_string(), Value::from(self.id.as_str()));
        for (name, value) in &self.values {
            object.insert(name.clone(), value.clone());
        }
        Value::Object(object)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub id: TableId,
    pub app_id: AppId,
    pub name: String,
    pub fields: Vec<Field>,
    pub records: Vec<Record>,
}

impl Table {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn record(&self, id: &RecordId) -> Option<&Record> {
        self.records.iter().find(|record| &record.id == id)
    }

    /// Validates `values` against the schema and fills in every missing field.
    ///
    /// UUID fields get a fresh identifier, every other field gets its explicit
    /// empty value.
    pub fn build_values(
        &self,
        values: BTreeMap<String, Value>,
    ) -> DomainResult<BTreeMap<String, Value>> {
        self.check_values(&values)?;

        let mut complete = values;
        for field in &self.fields {
            if !complete.contains_key(&field.name) {
                let value = if field.field_type.generates_values() {
                    Value::from(uuid::Uuid::new_v4().to_string())
                } else {
                    field.field_type.empty_value()
                };
                complete.insert(field.name.clone(), value);
            }
        }
        Ok(complete)
    }

    /// Rejects unknown keys and values that do not match their field type.
    pub fn check_values(&self, values: &BTreeMap<String, Value>) -> DomainResult<()> {
        for (name, value) in values {
            let field = self.field(name).ok_or_else(|| {
                DomainError::validation(format!("table '{}' has no field '{}'", self.name, name))
            })?;
            if !field.field_type.accepts(value) {
                return Err(DomainError::validation(format!(
                    "value {value} does not match {} field '{}'",
                    field.field_type, name
                )));
            }
        }
        Ok(())
    }
}
