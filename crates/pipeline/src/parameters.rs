//! Per-request processor parameters.
//!
//! A processor may declare the settings a caller can override per request.
//! The declaration is a [`ParameterSchema`]; the caller's values arrive as a
//! [`ParameterMap`] and are checked against it before the processor runs.
//!
//! | Type | Accepts |
//! |------|---------|
//! | `Boolean` | JSON `true` / `false` |
//! | `Integer` | whole JSON numbers inside the optional bounds |
//! | `Number` | any JSON number |
//! | `String` | JSON strings |

use serde_json::{json, Map, Value};

use crate::ParameterMap;

/// Value type of one declared parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterType {
    Boolean,
    Integer {
        minimum: Option<i64>,
        maximum: Option<i64>,
    },
    Number,
    String,
}

impl ParameterType {
    fn check(&self, name: &str, value: &Value) -> Result<(), String> {
        match self {
            ParameterType::Boolean if value.is_boolean() => Ok(()),
            ParameterType::Number if value.is_number() => Ok(()),
            ParameterType::String if value.is_string() => Ok(()),
            ParameterType::Integer { minimum, maximum } => {
                let Some(n) = value.as_i64() else {
                    return Err(format!("'{name}' must be an integer"));
                };
                if minimum.is_some_and(|min| n < min) || maximum.is_some_and(|max| n > max) {
                    return Err(format!(
                        "'{name}' must be between {} and {}, got {n}",
                        minimum.map_or("-inf".to_string(), |m| m.to_string()),
                        maximum.map_or("+inf".to_string(), |m| m.to_string()),
                    ));
                }
                Ok(())
            }
            other => Err(format!("'{name}' must be a {}", other.json_type())),
        }
    }

    fn json_type(&self) -> &'static str {
        match self {
            ParameterType::Boolean => "boolean",
            ParameterType::Integer { .. } => "integer",
            ParameterType::Number => "number",
            ParameterType::String => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterField {
    pub name: String,
    pub kind: ParameterType,
    pub description: String,
}

/// The parameters a processor accepts per request. Empty by default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSchema {
    fields: Vec<ParameterField>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `name`. A later declaration of the same name replaces the
    /// earlier one.
    #[must_use]
    pub fn field(
        mut self,
        name: impl Into<String>,
        kind: ParameterType,
        description: impl Into<String>,
    ) -> Self {
        let name = name.into();
        self.fields.retain(|f| f.name != name);
        self.fields.push(ParameterField {
            name,
            kind,
            description: description.into(),
        });
        self
    }

    pub fn fields(&self) -> &[ParameterField] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Checks every entry of `values`. Undeclared keys are errors.
    pub fn validate(&self, values: &ParameterMap) -> Result<(), Vec<String>> {
        let errors: Vec<String> = values
            .iter()
            .filter_map(|(name, value)| {
                match self.fields.iter().find(|f| &f.name == name) {
                    Some(field) => field.kind.check(name, value).err(),
                    None => Some(format!("unknown parameter '{name}'")),
                }
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// JSON Schema `properties` object for the declared fields.
    pub fn to_json_properties(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|field| {
                let mut property = json!({
                    "type": field.kind.json_type(),
                    "description": field.description,
                });
                if let ParameterType::Integer { minimum, maximum } = field.kind {
                    if let Some(min) = minimum {
                        property["minimum"] = json!(min);
                    }
                    if let Some(max) = maximum {
                        property["maximum"] = json!(max);
                    }
                }
                (field.name.clone(), property)
            })
            .collect()
    }
}
