//! Structured-output schemas and local validation for LLM responses.
//!
//! Every LLM call in the runtime declares an [`OutputSchema`]; the raw text
//! response is parsed with [`extract_json`] and checked with
//! [`OutputSchema::validate`] before anything downstream consumes it. A
//! deterministic fallback producing the same record shape backs every
//! schema, so callers never branch on "LLM or not".

use serde_json::Value;
use std::fmt;

/// Supported field types.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    /// A string restricted to a fixed set of values.
    Enum(Vec<&'static str>),
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Enum(allowed) => value
                .as_str()
                .map(|s| allowed.iter().any(|a| a.eq_ignore_ascii_case(s)))
                .unwrap_or(false),
        }
    }

    fn hint(&self) -> String {
        match self {
            Self::String => "string".to_string(),
            Self::Number => "number".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::Array => "array".to_string(),
            Self::Object => "object".to_string(),
            Self::Enum(allowed) => format!("one of [{}]", allowed.join(", ")),
        }
    }
}

/// Specification of one output field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
    /// Numeric range for Number fields.
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Arity bounds for Array fields.
    pub min_items: Option<usize>,
    pub max_items: Option<usize>,
}

impl FieldSpec {
    pub fn new(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            required: true,
            min: None,
            max: None,
            min_items: None,
            max_items: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn items(mut self, min_items: usize, max_items: usize) -> Self {
        self.min_items = Some(min_items);
        self.max_items = Some(max_items);
        self
    }
}

/// A violation found while validating an LLM response.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaViolation {
    NotAnObject,
    MissingField { field: String },
    TypeMismatch { field: String, expected: String },
    OutOfRange { field: String, min: f64, max: f64 },
    ArityViolation { field: String, min: usize, max: usize },
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "response is not a JSON object"),
            Self::MissingField { field } => write!(f, "missing required field '{}'", field),
            Self::TypeMismatch { field, expected } => {
                write!(f, "field '{}' must be {}", field, expected)
            }
            Self::OutOfRange { field, min, max } => {
                write!(f, "field '{}' must be within [{}, {}]", field, min, max)
            }
            Self::ArityViolation { field, min, max } => {
                write!(f, "field '{}' must have between {} and {} items", field, min, max)
            }
        }
    }
}

/// A flat schema over a JSON object response.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    pub fields: Vec<FieldSpec>,
}

impl OutputSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// Validate a parsed response against the schema.
    pub fn validate(&self, value: &Value) -> Vec<SchemaViolation> {
        let Some(object) = value.as_object() else {
            return vec![SchemaViolation::NotAnObject];
        };

        let mut violations = Vec::new();
        for spec in &self.fields {
            let Some(field_value) = object.get(spec.name) else {
                if spec.required {
                    violations.push(SchemaViolation::MissingField {
                        field: spec.name.to_string(),
                    });
                }
                continue;
            };

            if !spec.field_type.matches(field_value) {
                violations.push(SchemaViolation::TypeMismatch {
                    field: spec.name.to_string(),
                    expected: spec.field_type.hint(),
                });
                continue;
            }

            if let (Some(min), Some(max)) = (spec.min, spec.max) {
                if let Some(n) = field_value.as_f64() {
                    if n < min || n > max {
                        violations.push(SchemaViolation::OutOfRange {
                            field: spec.name.to_string(),
                            min,
                            max,
                        });
                    }
                }
            }

            if let (Some(min_items), Some(max_items)) = (spec.min_items, spec.max_items) {
                if let Some(items) = field_value.as_array() {
                    if items.len() < min_items || items.len() > max_items {
                        violations.push(SchemaViolation::ArityViolation {
                            field: spec.name.to_string(),
                            min: min_items,
                            max: max_items,
                        });
                    }
                }
            }
        }
        violations
    }

    /// Render the schema as prompt instructions.
    pub fn prompt_instructions(&self) -> String {
        let mut out = String::from("Respond with a single JSON object containing exactly these fields:\n");
        for spec in &self.fields {
            out.push_str(&format!(
                "- \"{}\": {}{}\n",
                spec.name,
                spec.field_type.hint(),
                if spec.required { "" } else { " (optional)" }
            ));
        }
        out.push_str("No prose outside the JSON object.");
        out
    }
}

/// Extract the first balanced JSON object from free-form LLM text.
///
/// Tolerates code fences and prose around the object.
pub fn extract_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> OutputSchema {
        OutputSchema::new(vec![
            FieldSpec::new("tool_name", FieldType::String),
            FieldSpec::new("rationale", FieldType::String),
            FieldSpec::new("confidence", FieldType::Number).range(0.0, 1.0).optional(),
        ])
    }

    #[test]
    fn test_valid_response() {
        let value = json!({"tool_name": "pattern", "rationale": "next signal"});
        assert!(schema().validate(&value).is_empty());
    }

    #[test]
    fn test_missing_field() {
        let value = json!({"tool_name": "pattern"});
        let violations = schema().validate(&value);
        assert_eq!(violations.len(), 1);
        assert!(matches!(&violations[0], SchemaViolation::MissingField { field } if field == "rationale"));
    }

    #[test]
    fn test_out_of_range() {
        let value = json!({"tool_name": "p", "rationale": "r", "confidence": 1.7});
        let violations = schema().validate(&value);
        assert!(violations
            .iter()
            .any(|v| matches!(v, SchemaViolation::OutOfRange { field, .. } if field == "confidence")));
    }

    #[test]
    fn test_enum_case_insensitive() {
        let severity = OutputSchema::new(vec![FieldSpec::new(
            "severity",
            FieldType::Enum(vec!["low", "medium", "high", "critical"]),
        )]);
        assert!(severity.validate(&json!({"severity": "HIGH"})).is_empty());
        assert!(!severity.validate(&json!({"severity": "urgent"})).is_empty());
    }

    #[test]
    fn test_arity_bounds() {
        let hypotheses = OutputSchema::new(vec![
            FieldSpec::new("hypotheses", FieldType::Array).items(2, 4)
        ]);
        assert!(!hypotheses.validate(&json!({"hypotheses": ["a"]})).is_empty());
        assert!(hypotheses.validate(&json!({"hypotheses": ["a", "b"]})).is_empty());
    }

    #[test]
    fn test_extract_json_from_fenced_text() {
        let text = "Here is the plan:\n```json\n{\"tool_name\": \"context\", \"rationale\": \"start\"}\n```";
        let value = extract_json(text).unwrap();
        assert_eq!(value["tool_name"], "context");
    }

    #[test]
    fn test_extract_json_nested_braces_in_string() {
        let text = r#"{"rationale": "uses {braces} inside", "tool_name": "pattern"}"#;
        let value = extract_json(text).unwrap();
        assert_eq!(value["tool_name"], "pattern");
    }

    #[test]
    fn test_extract_json_none_for_prose() {
        assert!(extract_json("no json here").is_none());
    }
}
