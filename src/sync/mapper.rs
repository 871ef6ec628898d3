use serde_json::{json, Value};

use crate::error::MappingError;
use crate::model::mapping::{Direction, ValueMapping};

impl ValueMapping {
    pub fn forward(&self, value: &str) -> Option<&str> {
        self.forward
            .iter()
            .find(|(from, _)| from == value)
            .map(|(_, to)| to.as_str())
    }

    /// Explicit reverse entry first, then the first forward key (in
    /// declaration order) that maps onto `value`.
    pub fn reverse(&self, value: &str) -> Option<&str> {
        let explicit = self
            .reverse
            .as_ref()
            .and_then(|rev| rev.iter().find(|(from, _)| from == value))
            .map(|(_, to)| to.as_str());
        explicit.or_else(|| self.reverse_fallback(value))
    }

    pub fn reverse_fallback(&self, value: &str) -> Option<&str> {
        self.forward
            .iter()
            .find(|(_, to)| to == value)
            .map(|(from, _)| from.as_str())
    }
}

/// Translate a MAPPED_SYNC value in the given direction, keeping the JSON
/// shape it came in (`{"name": ..}`, `{"value": ..}` or a bare string).
pub fn map_value(
    value: &Value,
    mapping: &ValueMapping,
    direction: Direction,
    field: &str,
) -> Result<Value, MappingError> {
    let (label, shape) = match value {
        Value::String(s) => (Some(s.as_str()), Shape::Bare),
        Value::Object(obj) => match (obj.get("value"), obj.get("name")) {
            (Some(Value::String(s)), _) => (Some(s.as_str()), Shape::Value),
            (_, Some(Value::String(s))) => (Some(s.as_str()), Shape::Name),
            _ => (None, Shape::Bare),
        },
        _ => (None, Shape::Bare),
    };
    let unmapped = || MappingError::Unmapped {
        value: label.map_or_else(|| value.to_string(), str::to_string),
        field: field.to_string(),
    };
    let label = label.ok_or_else(unmapped)?;

    let mapped = match direction {
        Direction::SourceToTarget => mapping.forward(label),
        Direction::TargetToSource => mapping.reverse(label),
    }
    .ok_or_else(unmapped)?;

    Ok(match shape {
        Shape::Bare => Value::String(mapped.to_string()),
        Shape::Value => json!({ "value": mapped }),
        Shape::Name => json!({ "name": mapped }),
    })
}

enum Shape {
    Bare,
    Value,
    Name,
}
