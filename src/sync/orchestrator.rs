use chrono::Utc;
use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;

use super::attachments::{self, AttachmentOutcome};
use super::cache::AttachmentCache;
use super::correlation::MetadataFields;
use super::log::{new_event, ActivityLog};
use super::planner::{plan_fields, FieldPlan, PairContext};
use crate::error::TrackerError;
use crate::model::issue::{IssueSnapshot, Side};
use crate::model::mapping::FieldMappingRule;
use crate::model::operation::{FieldUpdateOperation, UpdateReason};
use crate::tracker::{IssueQuery, Tracker};

/// Knobs for one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub dry_run: bool,
    /// Restrict the pass to this source issue.
    pub only_issue_key: Option<String>,
    pub source_issue_types: Vec<String>,
    /// Issue type for new target issues; defaults to the source issue's type.
    pub create_issue_type: Option<String>,
    pub updated_within: Option<String>,
    pub concurrency: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            only_issue_key: None,
            source_issue_types: Vec::new(),
            create_issue_type: None,
            updated_within: None,
            concurrency: 1,
        }
    }
}

/// What happened to one issue pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PairSummary {
    pub source_key: String,
    pub target_key: Option<String>,
    pub created: bool,
    pub fields_updated: Vec<String>,
    pub fields_unchanged: Vec<String>,
    pub fields_failed: Vec<(String, String)>,
    pub attachments_transferred: Vec<String>,
    pub attachments_failed: Vec<(String, String)>,
    pub prefix_fallbacks: usize,
    /// Set when the pair could not be processed at all.
    pub error: Option<String>,
}

impl PairSummary {
    fn new(source_key: &str, target_key: Option<&str>) -> Self {
        Self {
            source_key: source_key.to_string(),
            target_key: target_key.map(String::from),
            ..Default::default()
        }
    }

    pub fn has_failures(&self) -> bool {
        self.error.is_some() || !self.fields_failed.is_empty() || !self.attachments_failed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub dry_run: bool,
    pub pairs: Vec<PairSummary>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        self.pairs.iter().any(PairSummary::has_failures)
    }

    pub fn created(&self) -> usize {
        self.pairs.iter().filter(|p| p.created).count()
    }

    pub fn fields_updated(&self) -> usize {
        self.pairs.iter().map(|p| p.fields_updated.len()).sum()
    }
}

/// Drives one pass: fetch, correlate, then plan and apply every pair.
pub struct Orchestrator<'a> {
    source: &'a dyn Tracker,
    target: &'a dyn Tracker,
    rules: &'a [FieldMappingRule],
    metadata: MetadataFields,
    run: RunConfig,
    cache: Option<AttachmentCache>,
    activity: Option<ActivityLog>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        source: &'a dyn Tracker,
        target: &'a dyn Tracker,
        rules: &'a [FieldMappingRule],
        run: RunConfig,
    ) -> Self {
        Self {
            source,
            target,
            rules,
            metadata: MetadataFields::from_rules(rules),
            run,
            cache: None,
            activity: None,
        }
    }

    pub fn with_cache(mut self, cache: AttachmentCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_activity_log(mut self, log: ActivityLog) -> Self {
        self.activity = Some(log);
        self
    }

    /// Run the pass. Only auth failures, or failing to list the source
    /// issues at all, end it early with `Err`.
    pub async fn run(&self) -> Result<RunSummary, TrackerError> {
        let query = IssueQuery {
            project_key: self.source.project_key().to_string(),
            issue_types: self.run.source_issue_types.clone(),
            updated_within: self.run.updated_within.clone(),
            require_field: None,
        };
        let mut sources = self.source.fetch_issues(&query).await?;
        if let Some(only) = &self.run.only_issue_key {
            sources.retain(|issue| &issue.key == only);
        }
        tracing::info!(count = sources.len(), tracker = self.source.name(), "source issues fetched");

        let source_keys: HashSet<String> = sources.iter().map(|i| i.key.clone()).collect();
        let targets = match &self.metadata.customer_issue_id {
            Some(field) => {
                let query = IssueQuery {
                    project_key: self.target.project_key().to_string(),
                    require_field: Some(field.clone()),
                    ..Default::default()
                };
                self.target.fetch_issues(&query).await?
            }
            None => {
                tracing::warn!("no customer_issue_id rule; every source issue will create a new target issue");
                Vec::new()
            }
        };
        let index = self.metadata.index_targets(targets, &source_keys);

        let pairs: Vec<PairSummary> = stream::iter(sources.iter())
            .map(|source| self.sync_pair(source, index.get(&source.key)))
            .buffered(self.run.concurrency.max(1))
            .try_collect()
            .await?;

        Ok(RunSummary {
            dry_run: self.run.dry_run,
            pairs,
        })
    }

    async fn sync_pair(
        &self,
        source: &IssueSnapshot,
        indexed: Option<&IssueSnapshot>,
    ) -> Result<PairSummary, TrackerError> {
        let looked_up = match indexed {
            Some(_) => None,
            None => match self.lookup_target(source).await {
                Ok(found) => found,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => return Ok(self.pair_failed(PairSummary::new(&source.key, None), err)),
            },
        };
        match indexed.or(looked_up.as_ref()) {
            Some(target) => self.update_pair(source, target).await,
            None => self.create_pair(source).await,
        }
    }

    /// Targets the bulk query missed, found through the correlation field.
    async fn lookup_target(&self, source: &IssueSnapshot) -> Result<Option<IssueSnapshot>, TrackerError> {
        let Some(field) = &self.metadata.customer_issue_id else {
            return Ok(None);
        };
        let found = self.target.fetch_issue_by_correlation_field(field, &source.key).await?;
        if let Some(target) = &found {
            tracing::debug!(source = %source.key, target = %target.key, "target found by correlation lookup");
        }
        Ok(found)
    }

    async fn update_pair(&self, source: &IssueSnapshot, target: &IssueSnapshot) -> Result<PairSummary, TrackerError> {
        let pair = PairContext {
            source,
            target: Some(target),
            last_sync: self.metadata.last_sync(target),
            now: Utc::now(),
        };
        let plan = plan_fields(self.rules, &pair);
        let mut summary = PairSummary::new(&source.key, Some(&target.key));
        self.absorb_plan(&mut summary, &plan);

        for op in &plan.operations {
            let issue_key = match op.applies_to {
                Side::Source => &source.key,
                Side::Target => &target.key,
            };
            self.write(&mut summary, issue_key, op).await?;
        }

        self.merge_attachments(&mut summary, &source.key, &target.key).await?;
        tracing::info!(
            source = %source.key,
            target = %target.key,
            updated = summary.fields_updated.len(),
            unchanged = summary.fields_unchanged.len(),
            failed = summary.fields_failed.len(),
            "pair synced"
        );
        Ok(summary)
    }

    /// New target issue: content fields go into the create call, static and
    /// metadata fields are written after it one at a time.
    async fn create_pair(&self, source: &IssueSnapshot) -> Result<PairSummary, TrackerError> {
        let pair = PairContext {
            source,
            target: None,
            last_sync: None,
            now: Utc::now(),
        };
        let plan = plan_fields(self.rules, &pair);
        let mut summary = PairSummary::new(&source.key, None);
        self.absorb_plan(&mut summary, &plan);

        let (initial, deferred): (Vec<&FieldUpdateOperation>, Vec<&FieldUpdateOperation>) = plan
            .operations
            .iter()
            .partition(|op| matches!(op.reason, UpdateReason::DirectCopy | UpdateReason::Mapped));
        let fields: Map<String, Value> = initial
            .iter()
            .map(|op| (op.target_field_id.clone(), op.new_value.clone()))
            .collect();
        let issue_type = self
            .run
            .create_issue_type
            .clone()
            .unwrap_or_else(|| source.issue_type.clone());

        if self.run.dry_run {
            tracing::info!(source = %source.key, %issue_type, fields = plan.operations.len(), "would create target issue");
            summary.created = true;
            summary
                .fields_updated
                .extend(plan.operations.iter().map(|op| op.target_field_id.clone()));
            return Ok(summary);
        }

        let created = match self.target.create_issue(&issue_type, &fields).await {
            Ok(created) => created,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => return Ok(self.pair_failed(summary, err)),
        };
        tracing::info!(source = %source.key, target = %created.key, "target issue created");
        self.record("created", &source.key, Some(&created.key), None, None);
        summary.created = true;
        summary.target_key = Some(created.key.clone());
        summary
            .fields_updated
            .extend(initial.iter().map(|op| op.target_field_id.clone()));

        for op in deferred {
            self.write(&mut summary, &created.key, op).await?;
        }

        self.merge_attachments(&mut summary, &source.key, &created.key).await?;
        Ok(summary)
    }

    fn absorb_plan(&self, summary: &mut PairSummary, plan: &FieldPlan) {
        summary.fields_unchanged = plan.unchanged.clone();
        for failure in &plan.failures {
            tracing::warn!(source = %summary.source_key, field = %failure.field, error = %failure.error, "field not mapped");
            self.record(
                "field_failed",
                &summary.source_key,
                summary.target_key.as_deref(),
                Some(&failure.field),
                Some(&failure.error.to_string()),
            );
            summary
                .fields_failed
                .push((failure.field.clone(), failure.error.to_string()));
        }
        for field in &plan.prefix_fallbacks {
            tracing::warn!(source = %summary.source_key, %field, "document prefix could not be applied, value sent unchanged");
            self.record(
                "adf_prefix_fallback",
                &summary.source_key,
                summary.target_key.as_deref(),
                Some(field),
                None,
            );
        }
        summary.prefix_fallbacks = plan.prefix_fallbacks.len();
    }

    /// Apply one write. Anything but an auth failure is recorded on the
    /// summary and the pair carries on.
    async fn write(
        &self,
        summary: &mut PairSummary,
        issue_key: &str,
        op: &FieldUpdateOperation,
    ) -> Result<(), TrackerError> {
        let field = &op.target_field_id;
        if self.run.dry_run {
            tracing::info!(issue = issue_key, %field, value = %op.new_value, "would write field");
            summary.fields_updated.push(field.clone());
            return Ok(());
        }
        let tracker = match op.applies_to {
            Side::Source => self.source,
            Side::Target => self.target,
        };
        match tracker.write_field(issue_key, field, &op.new_value).await {
            Ok(()) => {
                tracing::debug!(side = %tracker.side(), issue = issue_key, %field, "field written");
                self.record("field_updated", &summary.source_key, Some(issue_key), Some(field), None);
                summary.fields_updated.push(field.clone());
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                tracing::warn!(issue = issue_key, %field, %err, "field write failed");
                self.record(
                    "field_failed",
                    &summary.source_key,
                    Some(issue_key),
                    Some(field),
                    Some(&err.to_string()),
                );
                summary.fields_failed.push((field.clone(), err.to_string()));
                Ok(())
            }
        }
    }

    async fn merge_attachments(
        &self,
        summary: &mut PairSummary,
        source_key: &str,
        target_key: &str,
    ) -> Result<(), TrackerError> {
        let outcome: AttachmentOutcome = attachments::reconcile(
            self.source,
            self.target,
            source_key,
            target_key,
            self.cache.as_ref(),
            self.run.dry_run,
        )
        .await?;
        if self.run.dry_run && outcome.planned > 0 {
            tracing::info!(source = source_key, target = target_key, count = outcome.planned, "would transfer attachments");
        }
        for name in &outcome.transferred {
            self.record("attachment_transferred", source_key, Some(target_key), Some(name), None);
        }
        for (name, err) in &outcome.failed {
            self.record(
                "attachment_failed",
                source_key,
                Some(target_key),
                Some(name),
                Some(&err.to_string()),
            );
        }
        summary.attachments_transferred = outcome.transferred;
        summary.attachments_failed = outcome
            .failed
            .into_iter()
            .map(|(name, err)| (name, err.to_string()))
            .collect();
        Ok(())
    }

    fn pair_failed(&self, mut summary: PairSummary, err: TrackerError) -> PairSummary {
        tracing::warn!(source = %summary.source_key, %err, "pair skipped");
        self.record("pair_failed", &summary.source_key, summary.target_key.as_deref(), None, Some(&err.to_string()));
        summary.error = Some(err.to_string());
        summary
    }

    fn record(&self, event: &str, source_key: &str, target_key: Option<&str>, field: Option<&str>, message: Option<&str>) {
        if self.run.dry_run {
            return;
        }
        if let Some(log) = &self.activity {
            log.record(new_event(event, source_key, target_key, field, message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::issue::parse_timestamp;
    use crate::model::mapping::{load, RawRule};
    use crate::tracker::tests::{at, snapshot, MockTracker};
    use serde_json::json;

    fn rules(value: Value) -> Vec<FieldMappingRule> {
        let raw: Vec<RawRule> = serde_json::from_value(value).unwrap();
        load(raw).unwrap()
    }

    fn standard_rules() -> Vec<FieldMappingRule> {
        rules(json!([
            {"fieldId": "summary", "syncDirection": "S2T", "prefix": "[MB-EAL]"},
            {"fieldId": "priority", "syncDirection": "BIDIRECTIONAL", "strategy": "MAPPED_SYNC",
             "valueMapping": {"Highest": "P1", "High": "P2"}},
            {"type": "custom", "targetFieldId": "customfield_100", "strategy": "SYNC_METADATA",
             "metadataType": "customer_issue_id"},
            {"type": "custom", "targetFieldId": "customfield_200", "strategy": "SYNC_METADATA",
             "metadataType": "last_sync_time"},
            {"type": "custom", "targetFieldId": "customfield_300", "strategy": "STATIC_VALUE",
             "staticValue": "Customer", "triggerOn": ["create"], "targetFieldDataType": "option"}
        ]))
    }

    fn source_tracker() -> MockTracker {
        MockTracker::new(Side::Source, "SRC").with_issue(snapshot(
            "SRC-1",
            "Bug",
            at(10),
            json!({"summary": "Login fails", "priority": {"name": "Highest"}}),
        ))
    }

    fn linked_target(last_sync: &str, updated: u32) -> IssueSnapshot {
        snapshot(
            "TGT-1",
            "Bug",
            at(updated),
            json!({
                "summary": "[MB-EAL] Login fails",
                "priority": {"name": "P2"},
                "customfield_100": "SRC-1",
                "customfield_200": last_sync
            }),
        )
    }

    #[tokio::test]
    async fn creates_missing_target_with_metadata_last() {
        let rules = standard_rules();
        let source = source_tracker().with_attachment("SRC-1", "a.png", b"A");
        let target = MockTracker::new(Side::Target, "TGT");

        let summary = Orchestrator::new(&source, &target, &rules, RunConfig::default())
            .run()
            .await
            .unwrap();

        let pair = &summary.pairs[0];
        assert!(pair.created);
        assert!(!pair.has_failures());
        let key = pair.target_key.clone().unwrap();
        let created = target.issue(&key).unwrap();
        assert_eq!(created.field("summary"), Some(&json!("[MB-EAL] Login fails")));
        assert_eq!(created.field("priority"), Some(&json!({"name": "P1"})));
        assert_eq!(created.field("customfield_100"), Some(&json!("SRC-1")));
        assert_eq!(created.field("customfield_300"), Some(&json!({"value": "Customer"})));
        let last_sync = created.field("customfield_200").and_then(Value::as_str).unwrap();
        assert!(parse_timestamp(last_sync).is_some());

        let writes: Vec<String> = target.state.lock().unwrap().writes.iter().map(|w| w.1.clone()).collect();
        assert_eq!(writes, vec!["customfield_300", "customfield_100", "customfield_200"]);
        assert_eq!(target.attachment_names(&key), vec!["[SRC] a.png"]);
        assert_eq!(pair.attachments_transferred, vec!["[SRC] a.png"]);
    }

    #[tokio::test]
    async fn second_pass_after_create_changes_nothing() {
        let rules = standard_rules();
        let source = source_tracker().with_attachment("SRC-1", "a.png", b"A");
        let target = MockTracker::new(Side::Target, "TGT");
        let orchestrator = Orchestrator::new(&source, &target, &rules, RunConfig::default());

        orchestrator.run().await.unwrap();
        let writes_after_first = target.state.lock().unwrap().writes.len();

        let second = orchestrator.run().await.unwrap();
        let pair = &second.pairs[0];
        assert!(!pair.created);
        assert!(pair.fields_updated.is_empty(), "unexpected writes: {:?}", pair.fields_updated);
        assert!(pair.attachments_transferred.is_empty());
        assert_eq!(target.state.lock().unwrap().writes.len(), writes_after_first);
        assert_eq!(target.state.lock().unwrap().created.len(), 1);
    }

    #[tokio::test]
    async fn later_source_edit_wins_and_refreshes_last_sync() {
        let rules = standard_rules();
        let source = source_tracker();
        let target = MockTracker::new(Side::Target, "TGT")
            .with_issue(linked_target("2024-06-01T08:00:00.000+0000", 9));

        let summary = Orchestrator::new(&source, &target, &rules, RunConfig::default())
            .run()
            .await
            .unwrap();

        let pair = &summary.pairs[0];
        assert_eq!(pair.fields_updated, vec!["priority", "customfield_200"]);
        assert_eq!(pair.fields_unchanged, vec!["summary", "customfield_100"]);
        let updated = target.issue("TGT-1").unwrap();
        assert_eq!(updated.field("priority"), Some(&json!({"name": "P1"})));
        assert_eq!(updated.field("customfield_300"), None);
    }

    #[tokio::test]
    async fn later_target_edit_flows_back_to_source() {
        let rules = standard_rules();
        let source = MockTracker::new(Side::Source, "SRC").with_issue(snapshot(
            "SRC-1",
            "Bug",
            at(7),
            json!({"summary": "Login fails", "priority": {"name": "Highest"}}),
        ));
        let target = MockTracker::new(Side::Target, "TGT")
            .with_issue(linked_target("2024-06-01T08:00:00.000+0000", 9));

        Orchestrator::new(&source, &target, &rules, RunConfig::default())
            .run()
            .await
            .unwrap();

        assert_eq!(source.issue("SRC-1").unwrap().field("priority"), Some(&json!({"name": "High"})));
    }

    #[tokio::test]
    async fn failed_field_is_isolated() {
        let rules = standard_rules();
        let source = source_tracker();
        let target = MockTracker::new(Side::Target, "TGT")
            .with_issue(linked_target("2024-06-01T08:00:00.000+0000", 9))
            .with_failure("write:priority", TrackerError::ValidationFailed("bad option".into()));

        let summary = Orchestrator::new(&source, &target, &rules, RunConfig::default())
            .run()
            .await
            .unwrap();

        let pair = &summary.pairs[0];
        assert_eq!(pair.fields_failed.len(), 1);
        assert_eq!(pair.fields_failed[0].0, "priority");
        assert_eq!(pair.fields_updated, vec!["customfield_200"]);
        assert!(summary.has_failures());
    }

    #[tokio::test]
    async fn auth_failure_aborts_the_run() {
        let rules = standard_rules();
        let source = source_tracker();
        let target = MockTracker::new(Side::Target, "TGT")
            .with_issue(linked_target("2024-06-01T08:00:00.000+0000", 9))
            .with_failure("write_field", TrackerError::Unauthorized);

        let result = Orchestrator::new(&source, &target, &rules, RunConfig::default())
            .run()
            .await;
        assert_eq!(result.unwrap_err(), TrackerError::Unauthorized);
    }

    #[tokio::test]
    async fn failed_create_skips_only_that_pair() {
        let rules = standard_rules();
        let source = source_tracker().with_issue(snapshot("SRC-2", "Bug", at(10), json!({"summary": "Other"})));
        let target = MockTracker::new(Side::Target, "TGT")
            .with_issue(snapshot(
                "TGT-1",
                "Bug",
                at(9),
                json!({"customfield_100": "SRC-2", "customfield_200": "2024-06-01T08:00:00.000+0000"}),
            ))
            .with_failure("create_issue", TrackerError::ValidationFailed("summary required".into()));

        let summary = Orchestrator::new(&source, &target, &rules, RunConfig::default())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.pairs.len(), 2);
        assert!(summary.pairs[0].error.is_some());
        assert_eq!(summary.pairs[1].target_key.as_deref(), Some("TGT-1"));
        assert!(summary.pairs[1].error.is_none());
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let rules = standard_rules();
        let source = source_tracker().with_attachment("SRC-1", "a.png", b"A");
        let target = MockTracker::new(Side::Target, "TGT");
        let run = RunConfig {
            dry_run: true,
            ..Default::default()
        };

        let summary = Orchestrator::new(&source, &target, &rules, run).run().await.unwrap();

        assert!(summary.dry_run);
        assert!(summary.pairs[0].created);
        assert!(!summary.pairs[0].fields_updated.is_empty());
        let state = target.state.lock().unwrap();
        assert!(state.created.is_empty());
        assert!(state.writes.is_empty());
        assert!(state.uploads.is_empty());
    }

    #[tokio::test]
    async fn only_issue_key_restricts_the_pass() {
        let rules = standard_rules();
        let source = source_tracker().with_issue(snapshot("SRC-2", "Bug", at(10), json!({"summary": "Other"})));
        let target = MockTracker::new(Side::Target, "TGT");
        let run = RunConfig {
            only_issue_key: Some("SRC-2".into()),
            ..Default::default()
        };

        let summary = Orchestrator::new(&source, &target, &rules, run).run().await.unwrap();

        assert_eq!(summary.pairs.len(), 1);
        assert_eq!(summary.pairs[0].source_key, "SRC-2");
    }

    #[tokio::test]
    async fn correlation_lookup_finds_targets_search_missed() {
        let rules = standard_rules();
        let source = source_tracker();
        let target = MockTracker::new(Side::Target, "TGT")
            .with_unindexed_issue(linked_target("2024-06-01T08:00:00.000+0000", 9));

        let summary = Orchestrator::new(&source, &target, &rules, RunConfig::default())
            .run()
            .await
            .unwrap();

        assert!(!summary.pairs[0].created);
        assert_eq!(summary.pairs[0].target_key.as_deref(), Some("TGT-1"));
        assert!(target.state.lock().unwrap().created.is_empty());
    }

    #[tokio::test]
    async fn concurrent_pairs_keep_source_order() {
        let rules = standard_rules();
        let mut source = MockTracker::new(Side::Source, "SRC");
        for n in 1..=5 {
            source = source.with_issue(snapshot(&format!("SRC-{n}"), "Bug", at(10), json!({"summary": format!("Issue {n}")})));
        }
        let target = MockTracker::new(Side::Target, "TGT");
        let run = RunConfig {
            concurrency: 3,
            ..Default::default()
        };

        let summary = Orchestrator::new(&source, &target, &rules, run).run().await.unwrap();

        let keys: Vec<&str> = summary.pairs.iter().map(|p| p.source_key.as_str()).collect();
        assert_eq!(keys, vec!["SRC-1", "SRC-2", "SRC-3", "SRC-4", "SRC-5"]);
        assert_eq!(summary.created(), 5);
    }

    #[tokio::test]
    async fn activity_log_records_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActivityLog::at(dir.path().join("activity.jsonl"));
        let rules = standard_rules();
        let source = source_tracker();
        let target = MockTracker::new(Side::Target, "TGT");

        Orchestrator::new(&source, &target, &rules, RunConfig::default())
            .with_activity_log(log.clone())
            .run()
            .await
            .unwrap();

        let events = log.read(Some("SRC-1"), None);
        assert_eq!(events[0].event, "created");
        assert!(events.iter().any(|e| e.event == "field_updated" && e.field.as_deref() == Some("customfield_100")));
    }
}
