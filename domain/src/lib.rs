use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize}; // For schema definition & record values
use serde_json::{Number, Value}; // To represent arbitrary cell values
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error; // For domain-specific errors

// --- Housekeeping Columns ---

/// Generated row identifier column.
pub const ROW_ID_COLUMN: &str = "rowId";
/// Creation timestamp column.
pub const CREATED_AT_COLUMN: &str = "createdAt";
/// Last-modified timestamp column.
pub const UPDATED_AT_COLUMN: &str = "updatedAt";

/// System-owned columns appended after the declared ones in the physical layout.
pub const HOUSEKEEPING_COLUMNS: [&str; 3] = [ROW_ID_COLUMN, CREATED_AT_COLUMN, UPDATED_AT_COLUMN];

pub fn is_housekeeping_column(name: &str) -> bool {
    HOUSEKEEPING_COLUMNS.contains(&name)
}

// --- Domain Errors ---
#[derive(Error, Debug, PartialEq)]
pub enum DomainError {
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),
    #[error("Invalid field value for field '{field}': {reason}")]
    InvalidFieldValue { field: String, reason: String },
    #[error("Field '{0}' not found in schema")]
    FieldNotFound(String),
    #[error("Missing required field '{0}'")]
    MissingField(String),
    #[error("Field '{0}' is generated by the repository and cannot be supplied")]
    GeneratedColumn(String),
}

// --- Schema Definition ---

/// Defines the type of a column in a table schema.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")] // Allows "text", "number" in JSON
pub enum FieldType {
    Text,
    Number,
    Boolean,
}

impl FieldType {
    /// The value a blank record carries for this type.
    pub fn zero_value(self) -> Value {
        match self {
            FieldType::Text => Value::String(String::new()),
            FieldType::Number => Value::Number(Number::from(0)),
            FieldType::Boolean => Value::Bool(false),
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::Text => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
        }
    }

    /// Converts a raw cell read from a store into a value of this type.
    ///
    /// Stores hand back loosely typed cells (numbers typed as text, empty
    /// strings for blank cells), so this is deliberately more lenient than
    /// the validation applied to caller input.
    fn coerce(self, raw: Value) -> Result<Value, String> {
        match (self, raw) {
            (_, Value::Null) => Ok(self.zero_value()),
            (FieldType::Text, Value::String(s)) => Ok(Value::String(s)),
            (FieldType::Text, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (FieldType::Text, Value::Bool(b)) => Ok(Value::String(b.to_string())),
            (FieldType::Number, Value::Number(n)) => Ok(normalize_value(Value::Number(n))),
            (FieldType::Number, Value::String(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Ok(self.zero_value());
                }
                trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(|n| normalize_value(Value::Number(n)))
                    .ok_or_else(|| format!("Expected a number, got {:?}", s))
            }
            (FieldType::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
            (FieldType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "" | "false" => Ok(Value::Bool(false)),
                "true" => Ok(Value::Bool(true)),
                _ => Err(format!("Expected a boolean, got {:?}", s)),
            },
            (field_type, other) => Err(format!("Cannot read {:?} as {:?}", other, field_type)),
        }
    }
}

/// Collapses integral floats (`1.0`) to integers so equal keys serialize identically.
fn normalize_value(value: Value) -> Value {
    match value {
        Value::Number(n) if !n.is_i64() && !n.is_u64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Value::Number(Number::from(f as i64))
            }
            _ => Value::Number(n),
        },
        other => other,
    }
}

/// Defines a single column within a table schema.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")] // Map 'type' JSON key to 'field_type' field
    pub field_type: FieldType,
}

/// Represents the schema for a table: column shape, identity and generated columns.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// The unique name of the table.
    pub name: String,
    /// Declared columns, in physical order.
    pub fields: Vec<FieldDefinition>,
    /// Columns whose values together identify a row.
    pub key_columns: Vec<String>,
    /// Optional surrogate identifier column assigned on insert.
    #[serde(default)]
    pub primary_column: Option<String>,

    // Internal cache for faster lookups
    #[serde(skip)]
    field_lookup: Option<HashMap<String, FieldDefinition>>,
}

impl TableSchema {
    pub fn new(name: &str, fields: Vec<FieldDefinition>, key_columns: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            fields,
            key_columns,
            primary_column: None,
            field_lookup: None,
        }
    }

    pub fn with_primary_column(mut self, column: &str) -> Self {
        self.primary_column = Some(column.to_string());
        self
    }

    /// Validates the schema and precomputes the lookup map.
    pub fn build(mut self) -> Result<Self, DomainError> {
        if self.name.trim().is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(DomainError::InvalidSchema(
                "Table name must be non-empty and contain only ASCII alphanumeric characters or underscores.".to_string()
            ));
        }
        if self.fields.is_empty() {
            return Err(DomainError::InvalidSchema(
                "Schema must contain at least one field.".to_string(),
            ));
        }

        let mut lookup = HashMap::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(DomainError::InvalidSchema(
                    "Field names cannot be empty.".to_string(),
                ));
            }
            if is_housekeeping_column(&field.name) {
                return Err(DomainError::InvalidSchema(format!(
                    "'{}' is a reserved column name and cannot be declared in the schema.",
                    field.name
                )));
            }
            if lookup.insert(field.name.clone(), field.clone()).is_some() {
                return Err(DomainError::InvalidSchema(format!(
                    "Duplicate field name found: '{}'",
                    field.name
                )));
            }
        }

        if self.key_columns.is_empty() {
            return Err(DomainError::InvalidSchema(
                "Schema must declare at least one key column.".to_string(),
            ));
        }
        let mut seen_keys = HashSet::new();
        for key in &self.key_columns {
            if !lookup.contains_key(key) {
                return Err(DomainError::InvalidSchema(format!(
                    "Key column '{}' is not a declared field",
                    key
                )));
            }
            if !seen_keys.insert(key.as_str()) {
                return Err(DomainError::InvalidSchema(format!(
                    "Duplicate key column found: '{}'",
                    key
                )));
            }
        }

        if let Some(primary) = &self.primary_column {
            match lookup.get(primary) {
                None => {
                    return Err(DomainError::InvalidSchema(format!(
                        "Primary column '{}' is not a declared field",
                        primary
                    )));
                }
                Some(field) if field.field_type != FieldType::Number => {
                    return Err(DomainError::InvalidSchema(format!(
                        "Primary column '{}' must be a number field",
                        primary
                    )));
                }
                Some(_) => {}
            }
            if seen_keys.contains(primary.as_str()) {
                return Err(DomainError::InvalidSchema(format!(
                    "Primary column '{}' is generated and cannot be part of the key",
                    primary
                )));
            }
        }

        self.field_lookup = Some(lookup);
        Ok(self)
    }

    /// Gets a field definition by name. Uses the precomputed lookup when built.
    pub fn get_field(&self, name: &str) -> Option<&FieldDefinition> {
        match &self.field_lookup {
            Some(lookup) => lookup.get(name),
            None => self.fields.iter().find(|f| f.name == name),
        }
    }

    /// Declared column names in physical order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn primary_column(&self) -> Option<&str> {
        self.primary_column.as_deref()
    }

    /// Header of a freshly created table: declared columns followed by housekeeping ones.
    pub fn physical_header(&self) -> Vec<String> {
        self.columns()
            .chain(HOUSEKEEPING_COLUMNS)
            .map(str::to_string)
            .collect()
    }

    /// A record body with every declared column set to its type's zero value.
    pub fn create_blank(&self) -> HashMap<String, Value> {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.field_type.zero_value()))
            .collect()
    }

    /// Builds a record body from caller-supplied values, failing fast on any
    /// missing, unknown, generated or mistyped column.
    ///
    /// The primary column, when declared, may be omitted or `null`; the
    /// repository fills it in.
    pub fn create_from_values(
        &self,
        values: HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, DomainError> {
        let mut record = HashMap::with_capacity(self.fields.len());

        for (name, value) in values {
            if is_housekeeping_column(&name) {
                return Err(DomainError::GeneratedColumn(name));
            }
            let field = self
                .get_field(&name)
                .ok_or_else(|| DomainError::FieldNotFound(name.clone()))?;
            let is_primary = self.primary_column() == Some(name.as_str());
            if !(field.field_type.accepts(&value) || (is_primary && value.is_null())) {
                return Err(DomainError::InvalidFieldValue {
                    reason: format!("Expected {:?}, got {:?}", field.field_type, value),
                    field: name,
                });
            }
            record.insert(name, normalize_value(value));
        }

        for field in &self.fields {
            if record.contains_key(&field.name) {
                continue;
            }
            if self.primary_column() == Some(field.name.as_str()) {
                record.insert(field.name.clone(), Value::Null);
            } else {
                return Err(DomainError::MissingField(field.name.clone()));
            }
        }

        Ok(record)
    }

    /// Projects `values` onto the key columns. Extra columns are ignored.
    ///
    /// Key values must already have their column's declared type.
    pub fn key_of(&self, values: &HashMap<String, Value>) -> Result<RecordKey, DomainError> {
        let mut parts = Vec::with_capacity(self.key_columns.len());
        for key in &self.key_columns {
            let value = values
                .get(key)
                .ok_or_else(|| DomainError::MissingField(key.clone()))?;
            let field = self
                .get_field(key)
                .ok_or_else(|| DomainError::FieldNotFound(key.clone()))?;
            if !field.field_type.accepts(value) {
                return Err(DomainError::InvalidFieldValue {
                    field: key.clone(),
                    reason: format!("Expected {:?}, got {:?}", field.field_type, value),
                });
            }
            parts.push(normalize_value(value.clone()));
        }
        Ok(RecordKey::from_parts(parts))
    }

    /// Reads a raw store cell into the declared type of `column`.
    pub fn coerce_cell(&self, column: &str, raw: Value) -> Result<Value, DomainError> {
        let field = self
            .get_field(column)
            .ok_or_else(|| DomainError::FieldNotFound(column.to_string()))?;
        field
            .field_type
            .coerce(raw)
            .map_err(|reason| DomainError::InvalidFieldValue {
                field: column.to_string(),
                reason,
            })
    }
}

// --- Record Key ---

/// Structural key: the JSON array of key-column values, in key-column order.
///
/// Encoding as a JSON array keeps `["a,b"]` and `["a", "b"]` distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey(String);

impl RecordKey {
    fn from_parts(parts: Vec<Value>) -> Self {
        Self(Value::Array(parts).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Records ---

/// System-owned housekeeping values of a stored row.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RowMeta {
    pub row_id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored row: the caller-visible column values plus the system-owned metadata.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Record {
    values: HashMap<String, Value>,
    meta: RowMeta,
}

impl Record {
    pub fn new(values: HashMap<String, Value>, meta: RowMeta) -> Self {
        Self { values, meta }
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn meta(&self) -> &RowMeta {
        &self.meta
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Turns this record into an update submission whose baseline is the
    /// last-modified timestamp observed when the record was read.
    pub fn to_input(&self) -> RecordInput {
        RecordInput {
            values: self.values.clone(),
            baseline: Some(self.meta.updated_at),
        }
    }
}

/// A record as submitted to the repository for insert or update.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecordInput {
    pub values: HashMap<String, Value>,
    /// Last-modified timestamp the caller based this submission on.
    #[serde(default)]
    pub baseline: Option<DateTime<Utc>>,
}

impl RecordInput {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self {
            values,
            baseline: None,
        }
    }

    /// Replaces one column value, keeping the baseline.
    pub fn set(mut self, column: &str, value: Value) -> Self {
        self.values.insert(column.to_string(), value);
        self
    }
}
