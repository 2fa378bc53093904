//! Bounded-retention selection over expired artifacts.

use std::collections::HashMap;

use uuid::Uuid;

use crate::artifact::Artifact;

/// How many artifacts a schedule currently holds and how many it must keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionBudget {
    /// Live artifacts of the schedule, expired or not.
    pub total: u64,
    pub min_to_retain: u32,
}

impl RetentionBudget {
    /// Number of expired artifacts that may go: never more than were given,
    /// never enough to drop the schedule below `min_to_retain`.
    pub fn deletable(&self, expired: usize) -> usize {
        let surplus = self.total.saturating_sub(u64::from(self.min_to_retain));
        expired.min(usize::try_from(surplus).unwrap_or(usize::MAX))
    }
}

/// Pick the expired artifacts to delete.
///
/// Orphans (no schedule) are always selected. For a schedule, the oldest
/// `budget.deletable(n)` of its `n` expired artifacts are selected. A
/// schedule without a budget keeps everything.
pub fn select_for_deletion(
    expired: &[Artifact],
    budgets: &HashMap<Uuid, RetentionBudget>,
) -> Vec<Artifact> {
    let mut orphans = Vec::new();
    let mut by_schedule: HashMap<Uuid, Vec<&Artifact>> = HashMap::new();
    for artifact in expired {
        match artifact.schedule_id {
            Some(schedule_id) => by_schedule.entry(schedule_id).or_default().push(artifact),
            None => orphans.push(artifact.clone()),
        }
    }

    let mut selected = orphans;
    for (schedule_id, mut artifacts) in by_schedule {
        let Some(budget) = budgets.get(&schedule_id) else {
            tracing::warn!(
                schedule_id = %schedule_id,
                expired = artifacts.len(),
                "No retention budget for schedule, keeping its artifacts"
            );
            continue;
        };
        artifacts.sort_by_key(|a| a.created_at);
        let take = budget.deletable(artifacts.len());
        selected.extend(artifacts.into_iter().take(take).cloned());
    }

    selected.sort_by_key(|a| a.created_at);
    selected
}
