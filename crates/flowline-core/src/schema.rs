use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FlowlineError, Result};
use crate::types::{Content, TypedValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Any => "any",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Declared shape of structured run input.
///
/// A run only proceeds if its input is already a [`TypedValue`] of this
/// schema, or a record that decodes into one without losing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl InputSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: vec![],
        }
    }

    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            field_type,
            required: true,
        });
        self
    }

    pub fn optional_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            field_type,
            required: false,
        });
        self
    }

    /// Validate run input, returning it as typed content.
    pub fn validate(&self, input: Option<&Content>) -> Result<Content> {
        match input {
            None => Err(FlowlineError::InputValidation(
                "Input required when input_schema is set".into(),
            )),
            Some(Content::Typed(typed)) => {
                if typed.type_name != self.name {
                    return Err(FlowlineError::InputValidation(format!(
                        "Expected {} but got {}",
                        self.name, typed.type_name
                    )));
                }
                self.check_fields(&typed.value)?;
                Ok(Content::Typed(typed.clone()))
            }
            Some(Content::Record(map)) => {
                self.check_fields(map)?;
                Ok(Content::Typed(TypedValue {
                    type_name: self.name.clone(),
                    value: map.clone(),
                }))
            }
            Some(other) => Err(FlowlineError::InputValidation(format!(
                "Cannot validate {} input against schema {}",
                other.kind_name(),
                self.name
            ))),
        }
    }

    fn check_fields(&self, map: &Map<String, Value>) -> Result<()> {
        if let Some(unknown) = map
            .keys()
            .find(|k| !self.fields.iter().any(|f| &f.name == *k))
        {
            return Err(FlowlineError::InputValidation(format!(
                "Unknown field '{}' for {}",
                unknown, self.name
            )));
        }

        for field in &self.fields {
            match map.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(FlowlineError::InputValidation(format!(
                        "Missing required field '{}' for {}",
                        field.name, self.name
                    )));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.field_type.accepts(value) => {
                    return Err(FlowlineError::InputValidation(format!(
                        "Field '{}' of {} must be {}",
                        field.name,
                        self.name,
                        field.field_type.as_str()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}
