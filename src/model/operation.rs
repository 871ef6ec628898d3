use serde::Serialize;
use serde_json::Value;

use super::issue::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateReason {
    DirectCopy,
    Mapped,
    Static,
    Metadata,
}

/// One planned field write, consumed by the tracker client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldUpdateOperation {
    pub target_field_id: String,
    pub new_value: Value,
    pub applies_to: Side,
    pub reason: UpdateReason,
}
