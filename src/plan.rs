//! Position-stable mutation plans.
//!
//! The service removes by position and shifts every later item down after
//! each removal. A plan therefore removes from the highest position to the
//! lowest: when an occurrence is removed, every occurrence still pending sits
//! at a strictly lower position and keeps its index. [`MutationPlan::new`] is
//! the only way to build a plan and it establishes that order, including
//! across batch boundaries.

use crate::api::RemovalEntry;
use crate::config::{Config, RemovalStrategy};
use crate::error::SyncError;
use crate::models::{CollectionSnapshot, DedupPolicy, DuplicateGroup};
use std::collections::HashSet;

/// One positional appearance of a uri that the plan will remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub uri: String,
    pub position: usize,
}

impl Occurrence {
    pub fn new(uri: impl Into<String>, position: usize) -> Self {
        Self {
            uri: uri.into(),
            position,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOp {
    /// Remove `uri` at exactly these positions (descending).
    Remove { uri: String, positions: Vec<usize> },
    /// Append `uri` at the end; position independent.
    Add { uri: String },
}

/// One remote call worth of operations; all removes or all adds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<MutationOp>,
}

impl Batch {
    pub fn ops(&self) -> &[MutationOp] {
        &self.ops
    }

    pub fn is_removal(&self) -> bool {
        matches!(self.ops.first(), Some(MutationOp::Remove { .. }))
    }

    /// Occurrences removed or uris appended by this batch.
    pub fn item_count(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                MutationOp::Remove { positions, .. } => positions.len(),
                MutationOp::Add { .. } => 1,
            })
            .sum()
    }

    pub fn positions(&self) -> Vec<usize> {
        self.ops
            .iter()
            .flat_map(|op| match op {
                MutationOp::Remove { positions, .. } => positions.clone(),
                MutationOp::Add { .. } => Vec::new(),
            })
            .collect()
    }

    pub fn removal_entries(&self) -> Vec<RemovalEntry> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                MutationOp::Remove { uri, positions } => Some(RemovalEntry {
                    uri: uri.clone(),
                    positions: positions.clone(),
                }),
                MutationOp::Add { .. } => None,
            })
            .collect()
    }

    pub fn addition_uris(&self) -> Vec<String> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                MutationOp::Add { uri } => Some(uri.clone()),
                MutationOp::Remove { .. } => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlanOptions {
    /// Service maximum of items per call.
    pub batch_limit: usize,
    pub strategy: RemovalStrategy,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            batch_limit: 100,
            strategy: RemovalStrategy::PerOccurrence,
        }
    }
}

impl From<&Config> for PlanOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            batch_limit: cfg.max_batch_size,
            strategy: cfg.removal_strategy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationPlan {
    /// Removals in execution order (strictly descending position).
    removals: Vec<Occurrence>,
    additions: Vec<String>,
    batches: Vec<Batch>,
    consistency_token: Option<String>,
}

impl MutationPlan {
    pub fn new(
        mut removals: Vec<Occurrence>,
        additions: Vec<String>,
        options: &PlanOptions,
        consistency_token: Option<String>,
    ) -> Result<Self, SyncError> {
        if options.batch_limit == 0 {
            return Err(SyncError::InvalidPlan("batch limit must be at least 1".into()));
        }
        let mut seen = HashSet::new();
        for occ in &removals {
            if !seen.insert(occ.position) {
                return Err(SyncError::InvalidPlan(format!(
                    "position {} is targeted more than once",
                    occ.position
                )));
            }
        }

        removals.sort_by(|a, b| b.position.cmp(&a.position));

        let mut batches: Vec<Batch> = removals
            .chunks(options.batch_limit)
            .map(|chunk| Batch {
                ops: removal_ops(chunk, options.strategy),
            })
            .collect();
        batches.extend(additions.chunks(options.batch_limit).map(|chunk| Batch {
            ops: chunk.iter().map(|u| MutationOp::Add { uri: u.clone() }).collect(),
        }));

        Ok(Self {
            removals,
            additions,
            batches,
            consistency_token,
        })
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn consistency_token(&self) -> Option<&str> {
        self.consistency_token.as_deref()
    }

    /// Removal positions in execution order.
    pub fn removal_positions(&self) -> Vec<usize> {
        self.removals.iter().map(|o| o.position).collect()
    }

    pub fn additions(&self) -> &[String] {
        &self.additions
    }

    pub fn removal_count(&self) -> usize {
        self.removals.len()
    }

    pub fn addition_count(&self) -> usize {
        self.additions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// The part of the plan that starts at batch `index`. A suffix of an
    /// ordered plan is still ordered, so the invariant carries over.
    pub fn remaining_from(&self, index: usize) -> MutationPlan {
        let batches: Vec<Batch> = self.batches.iter().skip(index).cloned().collect();
        let mut removals: Vec<Occurrence> = Vec::new();
        for op in batches.iter().flat_map(|b| b.ops.iter()) {
            if let MutationOp::Remove { uri, positions } = op {
                removals.extend(positions.iter().map(|p| Occurrence::new(uri.clone(), *p)));
            }
        }
        removals.sort_by(|a, b| b.position.cmp(&a.position));
        let additions = batches.iter().flat_map(|b| b.addition_uris()).collect();
        MutationPlan {
            removals,
            additions,
            batches,
            consistency_token: self.consistency_token.clone(),
        }
    }
}

fn removal_ops(chunk: &[Occurrence], strategy: RemovalStrategy) -> Vec<MutationOp> {
    match strategy {
        RemovalStrategy::PerOccurrence => chunk
            .iter()
            .map(|o| MutationOp::Remove {
                uri: o.uri.clone(),
                positions: vec![o.position],
            })
            .collect(),
        RemovalStrategy::GroupedPositions => {
            let mut ops: Vec<MutationOp> = Vec::new();
            for o in chunk {
                let existing = ops
                    .iter()
                    .position(|op| matches!(op, MutationOp::Remove { uri, .. } if *uri == o.uri));
                match existing {
                    Some(i) => {
                        if let MutationOp::Remove { positions, .. } = &mut ops[i] {
                            positions.push(o.position);
                        }
                    }
                    None => ops.push(MutationOp::Remove {
                        uri: o.uri.clone(),
                        positions: vec![o.position],
                    }),
                }
            }
            ops
        }
    }
}

fn checked_occurrence(snapshot: &CollectionSnapshot, uri: &str, position: usize) -> Result<Occurrence, SyncError> {
    match snapshot.item_at(position) {
        Some(item) if item.available && item.uri == uri => Ok(Occurrence::new(uri, position)),
        _ => Err(SyncError::InvalidPlan(format!(
            "{} is not at position {} in snapshot of {}",
            uri, position, snapshot.collection_id
        ))),
    }
}

/// Build the dedup plan for `groups` detected in `snapshot`.
///
/// `KeepFirst` removes every member but the first of each group.
/// `RestoreCanonical` removes every member and appends the first member's
/// uri once per group after all removals.
pub fn plan_removals(
    snapshot: &CollectionSnapshot,
    groups: &[DuplicateGroup],
    policy: DedupPolicy,
    options: &PlanOptions,
) -> Result<MutationPlan, SyncError> {
    let mut removals = Vec::new();
    let mut additions = Vec::new();
    for group in groups {
        let targets = match policy {
            DedupPolicy::KeepFirst => group.extras(),
            DedupPolicy::RestoreCanonical => {
                additions.push(group.keep().uri.clone());
                &group.members[..]
            }
        };
        for member in targets {
            removals.push(checked_occurrence(snapshot, &member.uri, member.position)?);
        }
    }
    MutationPlan::new(removals, additions, options, snapshot.consistency_token.clone())
}

/// Build a plan removing the occurrences at `positions` of `snapshot`.
pub fn plan_position_removals(
    snapshot: &CollectionSnapshot,
    positions: &[usize],
    options: &PlanOptions,
) -> Result<MutationPlan, SyncError> {
    let mut removals = Vec::with_capacity(positions.len());
    for &pos in positions {
        let item = snapshot.item_at(pos).filter(|i| i.available).ok_or_else(|| {
            SyncError::InvalidPlan(format!(
                "position {} is out of range or unavailable ({} items)",
                pos,
                snapshot.len()
            ))
        })?;
        removals.push(Occurrence::new(item.uri.clone(), pos));
    }
    MutationPlan::new(removals, Vec::new(), options, snapshot.consistency_token.clone())
}

/// Build an append-only plan.
pub fn plan_additions(uris: Vec<String>, options: &PlanOptions) -> Result<MutationPlan, SyncError> {
    MutationPlan::new(Vec::new(), uris, options, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::detect_groups;
    use crate::models::RemoteItem;
    use proptest::prelude::*;

    fn opts(batch_limit: usize, strategy: RemovalStrategy) -> PlanOptions {
        PlanOptions { batch_limit, strategy }
    }

    fn snapshot_of(names: &[(&str, &str)]) -> CollectionSnapshot {
        CollectionSnapshot {
            collection_id: "pl".into(),
            items: names
                .iter()
                .enumerate()
                .map(|(i, (uri, name))| RemoteItem::new(*uri, *name, vec!["artist".into()], i))
                .collect(),
            consistency_token: Some("snap-1".into()),
            warning: None,
        }
    }

    #[test]
    fn abacb_keep_first_removes_four_then_two() {
        let snap = snapshot_of(&[("a", "A"), ("b", "B"), ("a2", "A"), ("c", "C"), ("b2", "B")]);
        let groups = detect_groups(&snap);
        let plan = plan_removals(&snap, &groups, DedupPolicy::KeepFirst, &PlanOptions::default()).unwrap();
        assert_eq!(plan.removal_positions(), vec![4, 2]);
        assert_eq!(plan.batches().len(), 1);
        assert_eq!(plan.consistency_token(), Some("snap-1"));
        let entries = plan.batches()[0].removal_entries();
        assert_eq!(entries[0].uri, "b2");
        assert_eq!(entries[1].uri, "a2");
    }

    #[test]
    fn batch_limit_two_keeps_global_order() {
        let removals = vec![
            Occurrence::new("x", 3),
            Occurrence::new("y", 10),
            Occurrence::new("z", 1),
            Occurrence::new("x", 7),
            Occurrence::new("w", 5),
        ];
        let plan = MutationPlan::new(removals, Vec::new(), &opts(2, RemovalStrategy::PerOccurrence), None).unwrap();
        let per_batch: Vec<Vec<usize>> = plan.batches().iter().map(|b| b.positions()).collect();
        assert_eq!(per_batch, vec![vec![10, 7], vec![5, 3], vec![1]]);
        assert!(plan.batches().iter().all(|b| b.item_count() <= 2));
    }

    #[test]
    fn keep_occurrence_is_never_removed_even_when_uri_repeats() {
        // Same uri at 0, 3 and 5: keep 0, remove 5 then 3.
        let snap = snapshot_of(&[("s", "Song"), ("t", "T"), ("u", "U"), ("s", "Song"), ("v", "V"), ("s", "Song")]);
        let groups = detect_groups(&snap);
        let plan = plan_removals(&snap, &groups, DedupPolicy::KeepFirst, &PlanOptions::default()).unwrap();
        assert_eq!(plan.removal_positions(), vec![5, 3]);
        assert!(!plan.removal_positions().contains(&0));
    }

    #[test]
    fn grouped_strategy_merges_same_uri_within_batch() {
        let removals = vec![Occurrence::new("s", 3), Occurrence::new("t", 4), Occurrence::new("s", 5)];
        let plan = MutationPlan::new(removals, Vec::new(), &opts(100, RemovalStrategy::GroupedPositions), None).unwrap();
        assert_eq!(plan.batches().len(), 1);
        assert_eq!(
            plan.batches()[0].ops(),
            &[
                MutationOp::Remove { uri: "s".into(), positions: vec![5, 3] },
                MutationOp::Remove { uri: "t".into(), positions: vec![4] },
            ]
        );
    }

    #[test]
    fn grouping_never_crosses_batch_boundaries() {
        let removals = vec![Occurrence::new("s", 9), Occurrence::new("t", 8), Occurrence::new("s", 2)];
        let plan = MutationPlan::new(removals, Vec::new(), &opts(2, RemovalStrategy::GroupedPositions), None).unwrap();
        let per_batch: Vec<Vec<usize>> = plan.batches().iter().map(|b| b.positions()).collect();
        assert_eq!(per_batch, vec![vec![9, 8], vec![2]]);
    }

    #[test]
    fn restore_canonical_removes_all_then_appends_once_per_group() {
        let snap = snapshot_of(&[("a", "A"), ("b", "B"), ("a2", "A"), ("c", "C"), ("b2", "B")]);
        let groups = detect_groups(&snap);
        let plan = plan_removals(&snap, &groups, DedupPolicy::RestoreCanonical, &opts(3, RemovalStrategy::PerOccurrence)).unwrap();
        assert_eq!(plan.removal_positions(), vec![4, 2, 1, 0]);
        assert_eq!(plan.additions(), &["a".to_string(), "b".to_string()]);
        let kinds: Vec<bool> = plan.batches().iter().map(|b| b.is_removal()).collect();
        assert_eq!(kinds, vec![true, true, false]);
    }

    #[test]
    fn duplicate_position_and_zero_limit_are_rejected() {
        let dup = vec![Occurrence::new("a", 1), Occurrence::new("b", 1)];
        assert!(matches!(
            MutationPlan::new(dup, Vec::new(), &PlanOptions::default(), None),
            Err(SyncError::InvalidPlan(_))
        ));
        assert!(matches!(
            MutationPlan::new(Vec::new(), Vec::new(), &opts(0, RemovalStrategy::PerOccurrence), None),
            Err(SyncError::InvalidPlan(_))
        ));
    }

    #[test]
    fn group_not_matching_snapshot_is_rejected() {
        let snap = snapshot_of(&[("a", "A"), ("a2", "A")]);
        let mut groups = detect_groups(&snap);
        groups[0].members[1].uri = "zzz".into();
        assert!(plan_removals(&snap, &groups, DedupPolicy::KeepFirst, &PlanOptions::default()).is_err());
    }

    #[test]
    fn position_removals_validate_range() {
        let snap = snapshot_of(&[("a", "A"), ("b", "B")]);
        assert!(plan_position_removals(&snap, &[2], &PlanOptions::default()).is_err());
        let plan = plan_position_removals(&snap, &[0, 1], &PlanOptions::default()).unwrap();
        assert_eq!(plan.removal_positions(), vec![1, 0]);
    }

    #[test]
    fn remaining_from_is_a_suffix() {
        let removals = (0..5).map(|p| Occurrence::new(format!("u{}", p), p)).collect();
        let plan = MutationPlan::new(removals, vec!["x".into()], &opts(2, RemovalStrategy::PerOccurrence), Some("t".into())).unwrap();
        let rest = plan.remaining_from(1);
        assert_eq!(rest.removal_positions(), vec![2, 1, 0]);
        assert_eq!(rest.addition_count(), 1);
        assert_eq!(rest.batches(), &plan.batches()[1..]);
    }

    proptest! {
        #[test]
        fn removal_order_is_strictly_descending(
            positions in proptest::collection::btree_set(0usize..500, 0..80),
            limit in 1usize..10,
            grouped in any::<bool>(),
        ) {
            let strategy = if grouped { RemovalStrategy::GroupedPositions } else { RemovalStrategy::PerOccurrence };
            let removals: Vec<Occurrence> = positions
                .iter()
                .map(|p| Occurrence::new(format!("u{}", p % 7), *p))
                .collect();
            let plan = MutationPlan::new(removals, Vec::new(), &opts(limit, strategy), None).unwrap();

            let order = plan.removal_positions();
            prop_assert_eq!(order.len(), positions.len());
            for w in order.windows(2) {
                prop_assert!(w[0] > w[1]);
            }
            for b in plan.batches() {
                prop_assert!(b.item_count() <= limit);
            }
            for w in plan.batches().windows(2) {
                let prev_min = w[0].positions().into_iter().min().unwrap();
                let next_max = w[1].positions().into_iter().max().unwrap();
                prop_assert!(prev_min > next_max);
            }
        }
    }
}
