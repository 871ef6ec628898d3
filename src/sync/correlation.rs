use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use super::transform::scalar_key;
use crate::model::issue::{parse_timestamp, IssueSnapshot};
use crate::model::mapping::{metadata_field, FieldMappingRule, MetadataType};

/// The two reserved target-side fields that link a pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFields {
    pub customer_issue_id: Option<String>,
    pub last_sync_time: Option<String>,
}

impl MetadataFields {
    pub fn from_rules(rules: &[FieldMappingRule]) -> Self {
        Self {
            customer_issue_id: metadata_field(rules, MetadataType::CustomerIssueId).map(String::from),
            last_sync_time: metadata_field(rules, MetadataType::LastSyncTime).map(String::from),
        }
    }

    /// Source issue key stored on a target issue, if any.
    pub fn correlation_key(&self, target: &IssueSnapshot) -> Option<String> {
        let field = self.customer_issue_id.as_deref()?;
        target
            .field(field)
            .and_then(scalar_key)
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }

    /// A target issue is synced iff its correlation field names a known source issue.
    pub fn is_synced(&self, target: &IssueSnapshot, source_keys: &HashSet<String>) -> bool {
        self.correlation_key(target)
            .map_or(false, |key| source_keys.contains(&key))
    }

    pub fn last_sync(&self, target: &IssueSnapshot) -> Option<DateTime<Utc>> {
        let field = self.last_sync_time.as_deref()?;
        let raw = target.field(field).and_then(scalar_key)?;
        let parsed = parse_timestamp(&raw);
        if parsed.is_none() {
            tracing::warn!(issue = %target.key, value = %raw, "unreadable last sync time, treating pair as never synced");
        }
        parsed
    }

    /// Index target issues by the source key they point at. The first target
    /// claiming a source key keeps it.
    pub fn index_targets(
        &self,
        targets: Vec<IssueSnapshot>,
        source_keys: &HashSet<String>,
    ) -> HashMap<String, IssueSnapshot> {
        let mut index: HashMap<String, IssueSnapshot> = HashMap::new();
        for target in targets {
            if !self.is_synced(&target, source_keys) {
                continue;
            }
            if let Some(key) = self.correlation_key(&target) {
                if let Some(existing) = index.get(&key) {
                    tracing::warn!(source = %key, kept = %existing.key, ignored = %target.key, "several target issues claim the same source issue");
                    continue;
                }
                index.insert(key, target);
            }
        }
        index
    }
}
