use serde::Deserialize;
use serde_json::{Map, Value};

use super::issue::Side;
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    System,
    Custom,
}

/// Direction declared on a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    SourceToTarget,
    TargetToSource,
    Bidirectional,
}

/// Direction a single write actually flows in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SourceToTarget,
    TargetToSource,
}

impl Direction {
    pub fn reading_side(self) -> Side {
        match self {
            Direction::SourceToTarget => Side::Source,
            Direction::TargetToSource => Side::Target,
        }
    }

    pub fn receiving_side(self) -> Side {
        self.reading_side().other()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::SourceToTarget => "S2T",
            Direction::TargetToSource => "T2S",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Create,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerOn {
    pub create: bool,
    pub update: bool,
}

impl Default for TriggerOn {
    fn default() -> Self {
        Self {
            create: true,
            update: true,
        }
    }
}

impl TriggerOn {
    pub fn allows(&self, pass: PassKind) -> bool {
        match pass {
            PassKind::Create => self.create,
            PassKind::Update => self.update,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataType {
    CustomerIssueId,
    LastSyncTime,
}

/// Hint about the receiving field's shape, used for formatting and no-op checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldDataType {
    Option,
    MultiSelect,
    String,
    Number,
    Date,
    DateTime,
    Document,
    Other(String),
}

impl FieldDataType {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "option" | "select" | "com.atlassian.jira.plugin.system.customfieldtypes:select" => {
                FieldDataType::Option
            }
            "array" | "multiselect" | "com.atlassian.jira.plugin.system.customfieldtypes:multiselect" => {
                FieldDataType::MultiSelect
            }
            "string" | "text" | "textarea" => FieldDataType::String,
            "number" | "float" => FieldDataType::Number,
            "date" => FieldDataType::Date,
            "datetime" => FieldDataType::DateTime,
            "adf" | "doc" | "document" => FieldDataType::Document,
            _ => FieldDataType::Other(raw.to_string()),
        }
    }

    /// Scalar types are eligible for no-op suppression.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            FieldDataType::Option
                | FieldDataType::String
                | FieldDataType::Number
                | FieldDataType::Date
                | FieldDataType::DateTime
        )
    }
}

/// Ordered value translation table for MAPPED_SYNC.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueMapping {
    pub forward: Vec<(String, String)>,
    pub reverse: Option<Vec<(String, String)>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    DirectCopy,
    MappedSync(ValueMapping),
    StaticValue(Value),
    SyncMetadata(MetadataType),
}

impl Strategy {
    pub fn is_metadata(&self) -> bool {
        matches!(self, Strategy::SyncMetadata(_))
    }
}

/// One validated mapping rule. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMappingRule {
    pub kind: FieldKind,
    /// Absent only for strategies that never read a source value.
    pub source_field_id: Option<String>,
    pub target_field_id: String,
    pub direction: SyncDirection,
    pub strategy: Strategy,
    pub prefix: Option<String>,
    pub trigger_on: TriggerOn,
    pub target_data_type: Option<FieldDataType>,
}

impl FieldMappingRule {
    pub fn field_for(&self, side: Side) -> Option<&str> {
        match side {
            Side::Source => self.source_field_id.as_deref(),
            Side::Target => Some(self.target_field_id.as_str()),
        }
    }

    /// Attachments are reconciled separately and never written as a field.
    pub fn is_attachment_field(&self) -> bool {
        self.kind == FieldKind::System && self.target_field_id == "attachment"
    }
}

/// A rule as it appears in the mapping file, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRule {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub field_id: Option<String>,
    pub source_field_id: Option<String>,
    pub target_field_id: Option<String>,
    pub sync_direction: Option<String>,
    pub strategy: Option<String>,
    pub prefix: Option<String>,
    pub value_mapping: Option<Map<String, Value>>,
    #[serde(alias = "reverse_mapping_default")]
    pub reverse_mapping: Option<Map<String, Value>>,
    #[serde(alias = "static_value")]
    pub static_value: Option<Value>,
    #[serde(alias = "trigger_on")]
    pub trigger_on: Option<Vec<String>>,
    pub metadata_type: Option<String>,
    #[serde(alias = "dataType")]
    pub target_field_data_type: Option<String>,
}

/// Validate raw rules, preserving file order.
pub fn load(raw_rules: Vec<RawRule>) -> Result<Vec<FieldMappingRule>, ConfigError> {
    raw_rules
        .into_iter()
        .enumerate()
        .map(|(i, raw)| load_rule(i + 1, raw))
        .collect()
}

fn load_rule(rule: usize, raw: RawRule) -> Result<FieldMappingRule, ConfigError> {
    let kind = match raw.kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("system") => FieldKind::System,
        Some("custom") => FieldKind::Custom,
        None if raw.field_id.is_some() => FieldKind::System,
        None => FieldKind::Custom,
        Some(other) => {
            return Err(ConfigError::UnknownValue {
                rule,
                what: "type",
                value: other.to_string(),
            })
        }
    };

    let direction = match raw.sync_direction.as_deref().map(str::to_ascii_uppercase).as_deref() {
        None | Some("S2T") => SyncDirection::SourceToTarget,
        Some("T2S") => SyncDirection::TargetToSource,
        Some("BIDIRECTIONAL") => SyncDirection::Bidirectional,
        Some(other) => {
            return Err(ConfigError::UnknownValue {
                rule,
                what: "syncDirection",
                value: other.to_string(),
            })
        }
    };

    let strategy = match raw.strategy.as_deref().map(str::to_ascii_uppercase).as_deref() {
        None | Some("DIRECT_COPY") => Strategy::DirectCopy,
        Some("MAPPED_SYNC") => {
            let forward = raw.value_mapping.as_ref().ok_or(ConfigError::MissingProperty {
                rule,
                property: "valueMapping",
            })?;
            Strategy::MappedSync(ValueMapping {
                forward: string_pairs(rule, "valueMapping", forward)?,
                reverse: raw
                    .reverse_mapping
                    .as_ref()
                    .map(|m| string_pairs(rule, "reverseMapping", m))
                    .transpose()?,
            })
        }
        Some("STATIC_VALUE") => {
            let value = match raw.static_value.as_ref() {
                Some(Value::Object(obj)) if obj.contains_key("value") => obj["value"].clone(),
                Some(value) if !value.is_null() => value.clone(),
                _ => {
                    return Err(ConfigError::MissingProperty {
                        rule,
                        property: "staticValue",
                    })
                }
            };
            Strategy::StaticValue(value)
        }
        Some("SYNC_METADATA") => {
            let metadata = match raw.metadata_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
                Some("customer_issue_id") => MetadataType::CustomerIssueId,
                Some("last_sync_time") => MetadataType::LastSyncTime,
                Some(other) => {
                    return Err(ConfigError::UnknownValue {
                        rule,
                        what: "metadataType",
                        value: other.to_string(),
                    })
                }
                None => {
                    return Err(ConfigError::MissingProperty {
                        rule,
                        property: "metadataType",
                    })
                }
            };
            Strategy::SyncMetadata(metadata)
        }
        Some(other) => {
            return Err(ConfigError::UnknownValue {
                rule,
                what: "strategy",
                value: other.to_string(),
            })
        }
    };

    let (source_field_id, target_field_id) = match kind {
        FieldKind::System => {
            if raw.source_field_id.is_some() || raw.target_field_id.is_some() {
                return Err(ConfigError::InvalidRule {
                    rule,
                    message: "system rules take `fieldId` only".into(),
                });
            }
            let id = raw.field_id.ok_or(ConfigError::MissingProperty {
                rule,
                property: "fieldId",
            })?;
            (Some(id.clone()), id)
        }
        FieldKind::Custom => {
            if raw.field_id.is_some() {
                return Err(ConfigError::InvalidRule {
                    rule,
                    message: "custom rules take `sourceFieldId`/`targetFieldId`, not `fieldId`".into(),
                });
            }
            let target = raw.target_field_id.ok_or(ConfigError::MissingProperty {
                rule,
                property: "targetFieldId",
            })?;
            let reads_source = matches!(strategy, Strategy::DirectCopy | Strategy::MappedSync(_));
            if reads_source && raw.source_field_id.is_none() {
                return Err(ConfigError::MissingProperty {
                    rule,
                    property: "sourceFieldId",
                });
            }
            (raw.source_field_id, target)
        }
    };

    let trigger_on = match raw.trigger_on {
        None => TriggerOn::default(),
        Some(events) => {
            let mut trigger = TriggerOn {
                create: false,
                update: false,
            };
            for event in events {
                match event.to_ascii_uppercase().as_str() {
                    "CREATE" => trigger.create = true,
                    "UPDATE" => trigger.update = true,
                    _ => {
                        return Err(ConfigError::UnknownValue {
                            rule,
                            what: "triggerOn event",
                            value: event,
                        })
                    }
                }
            }
            trigger
        }
    };

    Ok(FieldMappingRule {
        kind,
        source_field_id,
        target_field_id,
        direction,
        strategy,
        prefix: raw.prefix.filter(|p| !p.is_empty()),
        trigger_on,
        target_data_type: raw.target_field_data_type.as_deref().map(FieldDataType::parse),
    })
}

fn string_pairs(
    rule: usize,
    property: &'static str,
    map: &Map<String, Value>,
) -> Result<Vec<(String, String)>, ConfigError> {
    map.iter()
        .map(|(k, v)| match v {
            Value::String(s) => Ok((k.clone(), s.clone())),
            _ => Err(ConfigError::InvalidRule {
                rule,
                message: format!("`{property}` entry `{k}` must map to a string"),
            }),
        })
        .collect()
}

/// Target field id holding the given kind of sync metadata, if configured.
pub fn metadata_field(rules: &[FieldMappingRule], kind: MetadataType) -> Option<&str> {
    rules.iter().find_map(|rule| match rule.strategy {
        Strategy::SyncMetadata(k) if k == kind => Some(rule.target_field_id.as_str()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> Vec<RawRule> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn loads_rules_in_file_order() {
        let rules = load(raw(json!([
            {"type": "system", "fieldId": "summary", "syncDirection": "S2T",
             "strategy": "DIRECT_COPY", "prefix": "[MB-EAL]"},
            {"type": "custom", "sourceFieldId": "customfield_10037",
             "targetFieldId": "customfield_10229", "syncDirection": "BIDIRECTIONAL",
             "strategy": "MAPPED_SYNC", "valueMapping": {"Sev-0": "Low", "Sev-1": "Medium"}},
            {"type": "custom", "targetFieldId": "customfield_10100",
             "strategy": "SYNC_METADATA", "metadataType": "customer_issue_id"}
        ])))
        .unwrap();

        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].kind, FieldKind::System);
        assert_eq!(rules[0].source_field_id.as_deref(), Some("summary"));
        assert_eq!(rules[0].target_field_id, "summary");
        assert_eq!(rules[0].prefix.as_deref(), Some("[MB-EAL]"));
        assert_eq!(rules[1].direction, SyncDirection::Bidirectional);
        match &rules[1].strategy {
            Strategy::MappedSync(m) => {
                assert_eq!(m.forward[0], ("Sev-0".to_string(), "Low".to_string()));
                assert_eq!(m.forward[1], ("Sev-1".to_string(), "Medium".to_string()));
                assert!(m.reverse.is_none());
            }
            other => panic!("unexpected strategy {other:?}"),
        }
        assert_eq!(
            rules[2].strategy,
            Strategy::SyncMetadata(MetadataType::CustomerIssueId)
        );
        assert_eq!(rules[2].source_field_id, None);
    }

    #[test]
    fn mapped_sync_requires_value_mapping() {
        let err = load(raw(json!([
            {"type": "custom", "sourceFieldId": "a", "targetFieldId": "b", "strategy": "MAPPED_SYNC"}
        ])))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingProperty {
                rule: 1,
                property: "valueMapping"
            }
        );
    }

    #[test]
    fn static_value_requires_a_value() {
        let err = load(raw(json!([
            {"type": "custom", "targetFieldId": "b", "strategy": "STATIC_VALUE"}
        ])))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingProperty { property: "staticValue", .. }));
    }

    #[test]
    fn static_value_unwraps_value_object() {
        let rules = load(raw(json!([
            {"type": "custom", "targetFieldId": "b", "strategy": "STATIC_VALUE",
             "static_value": {"value": "Customer"}, "trigger_on": ["CREATE"]}
        ])))
        .unwrap();
        assert_eq!(rules[0].strategy, Strategy::StaticValue(json!("Customer")));
        assert!(rules[0].trigger_on.allows(PassKind::Create));
        assert!(!rules[0].trigger_on.allows(PassKind::Update));
    }

    #[test]
    fn sync_metadata_requires_known_type() {
        let err = load(raw(json!([
            {"type": "custom", "targetFieldId": "b", "strategy": "SYNC_METADATA", "metadataType": "etag"}
        ])))
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownValue { what: "metadataType", .. }));

        let err = load(raw(json!([
            {"type": "custom", "targetFieldId": "b", "strategy": "SYNC_METADATA"}
        ])))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingProperty { property: "metadataType", .. }));
    }

    #[test]
    fn system_rules_reject_split_ids() {
        let err = load(raw(json!([
            {"type": "system", "fieldId": "summary", "targetFieldId": "summary"}
        ])))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRule { rule: 1, .. }));
    }

    #[test]
    fn copy_rules_need_a_source_field() {
        let err = load(raw(json!([
            {"type": "custom", "targetFieldId": "customfield_1", "strategy": "DIRECT_COPY"}
        ])))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingProperty { property: "sourceFieldId", .. }));
    }

    #[test]
    fn unknown_strategy_and_direction_are_rejected() {
        assert!(load(raw(json!([{"fieldId": "summary", "strategy": "MERGE"}]))).is_err());
        assert!(load(raw(json!([{"fieldId": "summary", "syncDirection": "SIDEWAYS"}]))).is_err());
    }

    #[test]
    fn reverse_mapping_default_alias_is_accepted() {
        let rules = load(raw(json!([
            {"fieldId": "priority", "strategy": "MAPPED_SYNC", "syncDirection": "BIDIRECTIONAL",
             "valueMapping": {"Sev-1": "Medium", "Sev-2": "Medium"},
             "reverse_mapping_default": {"Medium": "Sev-1"}}
        ])))
        .unwrap();
        match &rules[0].strategy {
            Strategy::MappedSync(m) => {
                assert_eq!(m.reverse.as_deref(), Some(&[("Medium".to_string(), "Sev-1".to_string())][..]));
            }
            other => panic!("unexpected strategy {other:?}"),
        }
    }

    #[test]
    fn metadata_field_lookup() {
        let rules = load(raw(json!([
            {"fieldId": "summary"},
            {"targetFieldId": "customfield_2", "strategy": "SYNC_METADATA", "metadataType": "last_sync_time"},
            {"targetFieldId": "customfield_1", "strategy": "SYNC_METADATA", "metadataType": "customer_issue_id"}
        ])))
        .unwrap();
        assert_eq!(metadata_field(&rules, MetadataType::CustomerIssueId), Some("customfield_1"));
        assert_eq!(metadata_field(&rules, MetadataType::LastSyncTime), Some("customfield_2"));
    }

    #[test]
    fn data_type_hints() {
        let rules = load(raw(json!([
            {"fieldId": "duedate", "targetFieldDataType": "date"},
            {"fieldId": "labels", "dataType": "multiselect"}
        ])))
        .unwrap();
        assert_eq!(rules[0].target_data_type, Some(FieldDataType::Date));
        assert!(rules[0].target_data_type.as_ref().unwrap().is_scalar());
        assert_eq!(rules[1].target_data_type, Some(FieldDataType::MultiSelect));
        assert!(!rules[1].target_data_type.as_ref().unwrap().is_scalar());
    }
}
