use std::collections::HashSet;

use super::cache::AttachmentCache;
use crate::error::TrackerError;
use crate::model::issue::{AttachmentRecord, Side};
use crate::tracker::Tracker;

/// Merge identity of an attachment owned by `owner`: `[KEY] name`.
///
/// Only a `[KEY] ` prefix naming one of the pair's two projects counts as an
/// origin mark, so an item copied across keeps the identity it had on its
/// origin side while user names like `[Draft] plan.pdf` still get the owner's key.
pub fn identity(filename: &str, owner: &str, other: &str) -> String {
    if has_origin_prefix(filename, owner) || has_origin_prefix(filename, other) {
        filename.to_string()
    } else {
        format!("[{owner}] {filename}")
    }
}

fn has_origin_prefix(filename: &str, project_key: &str) -> bool {
    filename
        .strip_prefix('[')
        .and_then(|rest| rest.strip_prefix(project_key))
        .and_then(|rest| rest.strip_prefix("] "))
        .map_or(false, |name| !project_key.is_empty() && !name.is_empty())
}

/// One attachment to copy, uploaded under `identity` on the `to` side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub record: AttachmentRecord,
    pub identity: String,
    pub to: Side,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentPlan {
    pub to_target: Vec<Transfer>,
    pub to_source: Vec<Transfer>,
}

impl AttachmentPlan {
    pub fn is_empty(&self) -> bool {
        self.to_target.is_empty() && self.to_source.is_empty()
    }

    pub fn transfers(&self) -> impl Iterator<Item = &Transfer> {
        self.to_target.iter().chain(self.to_source.iter())
    }
}

/// Identities in listing order; the first record of a duplicated identity wins.
fn identities<'a>(records: &'a [AttachmentRecord], owner: &str, other: &str) -> Vec<(String, &'a AttachmentRecord)> {
    let mut seen = HashSet::new();
    records
        .iter()
        .map(|r| (identity(&r.filename, owner, other), r))
        .filter(|(id, _)| seen.insert(id.clone()))
        .collect()
}

/// Set-union plan: everything one side has that the other lacks, by identity.
/// Never removes anything.
pub fn plan_attachments(
    source: &[AttachmentRecord],
    target: &[AttachmentRecord],
    source_project: &str,
    target_project: &str,
) -> AttachmentPlan {
    let source_ids = identities(source, source_project, target_project);
    let target_ids = identities(target, target_project, source_project);
    let on_source: HashSet<&str> = source_ids.iter().map(|(id, _)| id.as_str()).collect();
    let on_target: HashSet<&str> = target_ids.iter().map(|(id, _)| id.as_str()).collect();

    let missing = |from: &[(String, &AttachmentRecord)], present: &HashSet<&str>, to: Side| -> Vec<Transfer> {
        from.iter()
            .filter(|(id, _)| !present.contains(id.as_str()))
            .map(|(id, record)| Transfer {
                record: (*record).clone(),
                identity: id.clone(),
                to,
            })
            .collect()
    };

    AttachmentPlan {
        to_target: missing(&source_ids, &on_target, Side::Target),
        to_source: missing(&target_ids, &on_source, Side::Source),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentOutcome {
    pub planned: usize,
    pub transferred: Vec<String>,
    pub failed: Vec<(String, TrackerError)>,
}

/// Bring both issues of a pair to the union of their attachments.
///
/// Per-item failures are recorded and the rest continue. Auth failures end
/// the pass with `Err`.
pub async fn reconcile(
    source: &dyn Tracker,
    target: &dyn Tracker,
    source_key: &str,
    target_key: &str,
    cache: Option<&AttachmentCache>,
    dry_run: bool,
) -> Result<AttachmentOutcome, TrackerError> {
    let mut outcome = AttachmentOutcome::default();

    let listed = match (source.list_attachments(source_key).await, target.list_attachments(target_key).await) {
        (Ok(s), Ok(t)) => (s, t),
        (Err(err), _) | (_, Err(err)) => {
            if err.is_fatal() {
                return Err(err);
            }
            tracing::warn!(%err, source = source_key, target = target_key, "could not list attachments");
            outcome.failed.push(("<listing>".to_string(), err));
            return Ok(outcome);
        }
    };
    let plan = plan_attachments(&listed.0, &listed.1, source.project_key(), target.project_key());
    outcome.planned = plan.to_target.len() + plan.to_source.len();
    if dry_run || plan.is_empty() {
        return Ok(outcome);
    }

    for transfer in plan.transfers() {
        let (from, to, to_key) = match transfer.to {
            Side::Target => (source, target, target_key),
            Side::Source => (target, source, source_key),
        };
        match copy_one(from, to, to_key, transfer, cache, target_key).await {
            Ok(()) => {
                tracing::info!(file = %transfer.identity, to = %transfer.to, issue = to_key, "attachment transferred");
                outcome.transferred.push(transfer.identity.clone());
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::warn!(%err, file = %transfer.identity, issue = to_key, "attachment transfer failed");
                outcome.failed.push((transfer.identity.clone(), err));
            }
        }
    }
    Ok(outcome)
}

/// Download must finish before upload starts.
async fn copy_one(
    from: &dyn Tracker,
    to: &dyn Tracker,
    to_key: &str,
    transfer: &Transfer,
    cache: Option<&AttachmentCache>,
    cache_key: &str,
) -> Result<(), TrackerError> {
    let cached = cache.and_then(|c| c.get(cache_key, &transfer.identity));
    let bytes = match cached {
        Some(bytes) => bytes,
        None => {
            let bytes = from.download_attachment(&transfer.record).await?;
            if let Some(cache) = cache {
                if let Err(err) = cache.put(cache_key, &transfer.identity, &bytes) {
                    tracing::debug!(%err, "attachment cache write failed");
                }
            }
            bytes
        }
    };
    to.upload_attachment(to_key, &transfer.identity, bytes).await
}
