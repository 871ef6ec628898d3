use chrono::{DateTime, Utc};

use crate::model::mapping::{Direction, SyncDirection};

/// Decide which way a bidirectional rule writes this pass. `None` means skip.
///
/// Without a recorded sync the source is authoritative. Otherwise the side
/// that changed since the last sync wins; if both changed the later edit
/// wins and an exact tie goes to the source.
pub fn resolve_bidirectional(
    source_updated: DateTime<Utc>,
    target_updated: DateTime<Utc>,
    last_sync: Option<DateTime<Utc>>,
) -> Option<Direction> {
    let Some(last_sync) = last_sync else {
        return Some(Direction::SourceToTarget);
    };
    let source_changed = source_updated > last_sync;
    let target_changed = target_updated > last_sync;
    match (source_changed, target_changed) {
        (true, false) => Some(Direction::SourceToTarget),
        (false, true) => Some(Direction::TargetToSource),
        (true, true) if target_updated > source_updated => Some(Direction::TargetToSource),
        (true, true) => Some(Direction::SourceToTarget),
        (false, false) => None,
    }
}

/// Effective direction for a rule; fixed directions bypass arbitration.
pub fn resolve(
    declared: SyncDirection,
    source_updated: DateTime<Utc>,
    target_updated: DateTime<Utc>,
    last_sync: Option<DateTime<Utc>>,
) -> Option<Direction> {
    match declared {
        SyncDirection::SourceToTarget => Some(Direction::SourceToTarget),
        SyncDirection::TargetToSource => Some(Direction::TargetToSource),
        SyncDirection::Bidirectional => resolve_bidirectional(source_updated, target_updated, last_sync),
    }
}
