use chrono::{DateTime, Utc};
use serde_json::Value;

use super::direction;
use super::mapper::map_value;
use super::transform::{apply_prefix, format_for_field, is_noop};
use crate::error::MappingError;
use crate::model::issue::{format_timestamp, IssueSnapshot, Side};
use crate::model::mapping::{
    Direction, FieldDataType, FieldMappingRule, MetadataType, PassKind, Strategy, SyncDirection,
};
use crate::model::operation::{FieldUpdateOperation, UpdateReason};

/// Everything the planner needs to know about one issue pair.
#[derive(Debug, Clone, Copy)]
pub struct PairContext<'a> {
    pub source: &'a IssueSnapshot,
    /// `None` while the target issue is still to be created.
    pub target: Option<&'a IssueSnapshot>,
    pub last_sync: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl<'a> PairContext<'a> {
    pub fn pass(&self) -> PassKind {
        if self.target.is_some() {
            PassKind::Update
        } else {
            PassKind::Create
        }
    }

    fn issue(&self, side: Side) -> Option<&'a IssueSnapshot> {
        match side {
            Side::Source => Some(self.source),
            Side::Target => self.target,
        }
    }

    fn current_value(&self, side: Side, field_id: &str) -> Option<&'a Value> {
        self.issue(side).and_then(|issue| issue.field(field_id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanFailure {
    pub field: String,
    pub error: MappingError,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FieldPlan {
    pub operations: Vec<FieldUpdateOperation>,
    /// Receiving field ids dropped because the value was already there.
    pub unchanged: Vec<String>,
    pub failures: Vec<PlanFailure>,
    /// Field ids whose document prefix couldn't be applied.
    pub prefix_fallbacks: Vec<String>,
}

impl FieldPlan {
    pub fn content_operations(&self) -> impl Iterator<Item = &FieldUpdateOperation> {
        self.operations
            .iter()
            .filter(|op| op.reason != UpdateReason::Metadata)
    }
}

/// Plan every field write for one pair, in rule order.
///
/// Metadata rules are moved behind everything else on both passes. On update
/// passes `last_sync_time` is only refreshed when some content field actually
/// moved.
pub fn plan_fields(rules: &[FieldMappingRule], pair: &PairContext<'_>) -> FieldPlan {
    let mut plan = FieldPlan::default();

    let mut content_moved = false;
    for rule in rules {
        if rule.strategy.is_metadata() || rule.is_attachment_field() {
            continue;
        }
        if let Some(op) = plan_rule(rule, pair, &mut plan) {
            if matches!(op.reason, UpdateReason::DirectCopy | UpdateReason::Mapped) {
                content_moved = true;
            }
            plan.operations.push(op);
        }
    }

    // metadata always lands after the content writes
    for rule in rules {
        if let Strategy::SyncMetadata(kind) = rule.strategy {
            if let Some(op) = plan_metadata(rule, kind, pair, content_moved, &mut plan) {
                plan.operations.push(op);
            }
        }
    }
    plan
}

fn plan_rule(
    rule: &FieldMappingRule,
    pair: &PairContext<'_>,
    plan: &mut FieldPlan,
) -> Option<FieldUpdateOperation> {
    let (direction, candidate, reason) = match &rule.strategy {
        Strategy::StaticValue(value) => {
            if !rule.trigger_on.allows(pair.pass()) {
                return None;
            }
            let value = format_for_field(value.clone(), rule.target_data_type.as_ref());
            (Direction::SourceToTarget, value, UpdateReason::Static)
        }
        Strategy::DirectCopy | Strategy::MappedSync(_) => {
            let direction = effective_direction(rule, pair)?;
            let read_side = direction.reading_side();
            let read_field = rule.field_for(read_side)?;
            let value = pair.current_value(read_side, read_field)?;

            let (mut candidate, reason) = match &rule.strategy {
                Strategy::MappedSync(mapping) => match map_value(value, mapping, direction, read_field) {
                    Ok(mapped) => (mapped, UpdateReason::Mapped),
                    Err(error) => {
                        plan.failures.push(PlanFailure {
                            field: read_field.to_string(),
                            error,
                        });
                        return None;
                    }
                },
                _ => (value.clone(), UpdateReason::DirectCopy),
            };

            if direction == Direction::SourceToTarget {
                if let Some(prefix) = rule.prefix.as_deref() {
                    let outcome = apply_prefix(&candidate, prefix);
                    if outcome.fell_back {
                        plan.prefix_fallbacks.push(rule.target_field_id.clone());
                    }
                    candidate = outcome.value;
                }
                candidate = format_for_field(candidate, rule.target_data_type.as_ref());
            }
            (direction, candidate, reason)
        }
        Strategy::SyncMetadata(_) => return None,
    };

    let receiving_side = direction.receiving_side();
    let receiving_field = rule.field_for(receiving_side)?;
    let hint = receiving_hint(rule, receiving_side);
    let current = pair.current_value(receiving_side, receiving_field);
    if is_noop(hint, &candidate, current) {
        plan.unchanged.push(receiving_field.to_string());
        return None;
    }

    Some(FieldUpdateOperation {
        target_field_id: receiving_field.to_string(),
        new_value: candidate,
        applies_to: receiving_side,
        reason,
    })
}

fn effective_direction(rule: &FieldMappingRule, pair: &PairContext<'_>) -> Option<Direction> {
    match pair.target {
        // nothing to read from or write back to before the target exists
        None => match rule.direction {
            SyncDirection::TargetToSource => None,
            _ => Some(Direction::SourceToTarget),
        },
        Some(target) => direction::resolve(
            rule.direction,
            pair.source.updated,
            target.updated,
            pair.last_sync,
        ),
    }
}

/// The data-type hint describes the target field only.
fn receiving_hint(rule: &FieldMappingRule, side: Side) -> Option<&FieldDataType> {
    match side {
        Side::Target => rule.target_data_type.as_ref(),
        Side::Source => None,
    }
}

fn plan_metadata(
    rule: &FieldMappingRule,
    kind: MetadataType,
    pair: &PairContext<'_>,
    content_moved: bool,
    plan: &mut FieldPlan,
) -> Option<FieldUpdateOperation> {
    let value = match kind {
        MetadataType::CustomerIssueId => Value::String(pair.source.key.clone()),
        MetadataType::LastSyncTime => {
            if pair.pass() == PassKind::Update && !content_moved {
                return None;
            }
            Value::String(format_timestamp(&pair.now))
        }
    };
    let value = format_for_field(value, rule.target_data_type.as_ref());
    let current = pair.current_value(Side::Target, &rule.target_field_id);
    if is_noop(rule.target_data_type.as_ref(), &value, current) {
        plan.unchanged.push(rule.target_field_id.clone());
        return None;
    }
    Some(FieldUpdateOperation {
        target_field_id: rule.target_field_id.clone(),
        new_value: value,
        applies_to: Side::Target,
        reason: UpdateReason::Metadata,
    })
}
