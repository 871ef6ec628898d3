use serde_json::{json, Value};

use crate::model::issue::parse_timestamp;
use crate::model::mapping::FieldDataType;
use crate::util::adf::{adf_to_text, is_adf_doc, prefix_adf, text_to_adf};

#[derive(Debug, Clone, PartialEq)]
pub struct PrefixOutcome {
    pub value: Value,
    /// The value looked like a document but couldn't be prefixed safely.
    pub fell_back: bool,
}

/// Annotate a value with `prefix`. Strings and ADF documents are prefixed at
/// most once; every other shape passes through.
pub fn apply_prefix(value: &Value, prefix: &str) -> PrefixOutcome {
    match value {
        Value::String(s) if s.starts_with(prefix) => unchanged(value),
        Value::String(s) => PrefixOutcome {
            value: Value::String(format!("{prefix} {s}")),
            fell_back: false,
        },
        Value::Object(obj) if obj.get("type").and_then(Value::as_str) == Some("doc") => {
            match prefix_adf(value, prefix) {
                Some(prefixed) => PrefixOutcome {
                    value: prefixed,
                    fell_back: false,
                },
                None => PrefixOutcome {
                    value: value.clone(),
                    fell_back: true,
                },
            }
        }
        _ => unchanged(value),
    }
}

fn unchanged(value: &Value) -> PrefixOutcome {
    PrefixOutcome {
        value: value.clone(),
        fell_back: false,
    }
}

/// Shape a value the way the receiving field expects it.
pub fn format_for_field(value: Value, data_type: Option<&FieldDataType>) -> Value {
    let Some(data_type) = data_type else {
        return value;
    };
    match (data_type, value) {
        (FieldDataType::Option, Value::String(s)) => json!({ "value": s }),
        (FieldDataType::MultiSelect, Value::Array(items)) => Value::Array(
            items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => json!({ "value": s }),
                    other => other,
                })
                .collect(),
        ),
        (FieldDataType::MultiSelect, Value::String(s)) => json!([{ "value": s }]),
        (FieldDataType::String, value) if is_adf_doc(&value) => {
            adf_to_text(&value).map(Value::String).unwrap_or(value)
        }
        (FieldDataType::Date, Value::String(s)) => match s.split_once('T') {
            Some((date, _)) => Value::String(date.to_string()),
            None => Value::String(s),
        },
        (FieldDataType::Document, Value::String(s)) => text_to_adf(&s),
        (_, value) => value,
    }
}

/// Whether a field with this hint and candidate value counts as scalar.
///
/// Multi-selects, documents, arrays and arbitrary objects are never scalar.
pub fn is_scalar(data_type: Option<&FieldDataType>, candidate: &Value) -> bool {
    if let Some(data_type) = data_type {
        return data_type.is_scalar();
    }
    match candidate {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => true,
        Value::Object(obj) => !obj.contains_key("type") && option_label(candidate).is_some(),
        _ => false,
    }
}

/// Comparable identity of a scalar value: the string itself, or the label of
/// a select option / priority object.
pub fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(_) => option_label(value).map(str::to_string),
        _ => None,
    }
}

fn option_label(value: &Value) -> Option<&str> {
    value
        .get("value")
        .and_then(Value::as_str)
        .or_else(|| value.get("name").and_then(Value::as_str))
}

/// True when writing `candidate` would not change a scalar field.
pub fn is_noop(data_type: Option<&FieldDataType>, candidate: &Value, current: Option<&Value>) -> bool {
    let Some(current) = current.filter(|v| !v.is_null()) else {
        return false;
    };
    if !is_scalar(data_type, candidate) {
        return false;
    }
    let (Some(new_key), Some(cur_key)) = (scalar_key(candidate), scalar_key(current)) else {
        return false;
    };
    if new_key == cur_key {
        return true;
    }
    match data_type {
        Some(FieldDataType::Date) => cur_key.starts_with(&new_key) && cur_key[new_key.len()..].starts_with('T'),
        Some(FieldDataType::DateTime) => match (parse_timestamp(&new_key), parse_timestamp(&cur_key)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        _ => false,
    }
}
