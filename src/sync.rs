//! Fetch, detect, confirm, mutate, report.

use crate::api::PlaylistApi;
use crate::config::Config;
use crate::dedup::detect_groups;
use crate::error::SyncError;
use crate::executor::RequestExecutor;
use crate::fetcher::CollectionFetcher;
use crate::models::{CollectionSnapshot, DedupPolicy, DuplicateGroup, FetchWarning, RemoteItem};
use crate::mutator::{BatchMutator, PartialMutationResult};
use crate::plan::{self, MutationPlan, PlanOptions};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// What the user is asked to approve before anything is changed.
#[derive(Debug)]
pub enum ConfirmRequest<'a> {
    Dedup {
        collection_id: &'a str,
        groups: &'a [DuplicateGroup],
        policy: DedupPolicy,
        warning: Option<&'a FetchWarning>,
    },
    RemoveSelected {
        collection_id: &'a str,
        items: &'a [RemoteItem],
    },
}

/// Approval step owned by the caller (terminal prompt, UI, auto-approve).
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, request: &ConfirmRequest<'_>) -> bool;
}

/// Answers every request the same way.
pub struct AutoConfirm(pub bool);

#[async_trait]
impl Confirmer for AutoConfirm {
    async fn confirm(&self, _request: &ConfirmRequest<'_>) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Nothing matched; no confirmation was requested.
    #[default]
    NothingToDo,
    Declined,
    Applied,
    /// The plan was refused or stopped part way; see `failures`.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub batch_index: usize,
    pub kind: String,
    pub message: String,
    pub unapplied_removals: usize,
    pub unapplied_additions: usize,
}

impl From<&PartialMutationResult> for SyncFailure {
    fn from(p: &PartialMutationResult) -> Self {
        Self {
            batch_index: p.failed_at,
            kind: p.error.kind().to_string(),
            message: p.error.to_string(),
            unapplied_removals: p.remaining.removal_count(),
            unapplied_additions: p.remaining.addition_count(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub collection_id: String,
    pub outcome: RunOutcome,
    pub groups: usize,
    pub planned_removals: usize,
    pub planned_additions: usize,
    pub removed_count: usize,
    pub added_count: usize,
    pub failures: Vec<SyncFailure>,
    pub fetch_warning: Option<FetchWarning>,
    /// Full re-fetch/re-plan cycles triggered by staleness.
    pub replans: u32,
}

impl SyncReport {
    fn new(collection_id: &str) -> Self {
        Self {
            collection_id: collection_id.to_string(),
            ..Default::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
            && self.removed_count == self.planned_removals
            && self.added_count == self.planned_additions
    }

    fn record_plan(&mut self, plan: &MutationPlan) {
        self.planned_removals += plan.removal_count();
        self.planned_additions += plan.addition_count();
    }

    /// Record `plan` as not attempted because its positions span versions.
    fn refuse_unstable(&mut self, plan: &MutationPlan, expected: Option<String>) {
        let error = SyncError::StaleSnapshot { expected };
        self.record_plan(plan);
        self.failures.push(SyncFailure {
            batch_index: 0,
            kind: error.kind().to_string(),
            message: error.to_string(),
            unapplied_removals: plan.removal_count(),
            unapplied_additions: plan.addition_count(),
        });
        self.outcome = RunOutcome::Partial;
    }

    /// Process exit status for a command that produced this report.
    pub fn exit_code(&self) -> i32 {
        if self.is_complete() {
            0
        } else {
            1
        }
    }

    /// Drop the unapplied tail of an abandoned plan from the planned totals.
    fn forget_unapplied(&mut self, partial: &PartialMutationResult) {
        self.planned_removals -= partial.remaining.removal_count();
        self.planned_additions -= partial.remaining.addition_count();
    }
}

/// Version the snapshot started from when its pages were read across
/// several versions of the collection.
fn changed_during_fetch(snapshot: &CollectionSnapshot) -> Option<Option<String>> {
    match &snapshot.warning {
        Some(FetchWarning::ChangedDuringFetch { before, .. }) => Some(before.clone()),
        _ => None,
    }
}

pub struct Deduplicator {
    fetcher: CollectionFetcher,
    mutator: BatchMutator,
    confirmer: Arc<dyn Confirmer>,
    plan_options: PlanOptions,
    stale_replan_limit: u32,
}

impl Deduplicator {
    pub fn new(
        api: Arc<dyn PlaylistApi>,
        executor: Arc<RequestExecutor>,
        confirmer: Arc<dyn Confirmer>,
        cfg: &Config,
    ) -> Self {
        Self {
            fetcher: CollectionFetcher::new(api.clone(), executor.clone(), cfg.page_size),
            mutator: BatchMutator::new(api, executor, cfg.use_consistency_token),
            confirmer,
            plan_options: PlanOptions::from(cfg),
            stale_replan_limit: cfg.stale_replan_limit,
        }
    }

    pub async fn fetch_all(&self, collection_id: &str) -> Result<CollectionSnapshot, SyncError> {
        self.fetcher.fetch_all(collection_id).await
    }

    pub fn plan_removals(
        &self,
        snapshot: &CollectionSnapshot,
        groups: &[DuplicateGroup],
        policy: DedupPolicy,
    ) -> Result<MutationPlan, SyncError> {
        plan::plan_removals(snapshot, groups, policy, &self.plan_options)
    }

    /// Run a prepared plan and report exact counts.
    pub async fn execute(&self, collection_id: &str, plan: &MutationPlan) -> SyncReport {
        let mut report = SyncReport::new(collection_id);
        report.record_plan(plan);
        match self.mutator.execute(collection_id, plan).await {
            Ok(applied) => {
                report.removed_count = applied.removed;
                report.added_count = applied.added;
                report.outcome = RunOutcome::Applied;
            }
            Err(partial) => {
                report.removed_count = partial.applied.removed;
                report.added_count = partial.applied.added;
                report.failures.push(SyncFailure::from(&partial));
                report.outcome = RunOutcome::Partial;
            }
        }
        report
    }

    /// Remove duplicate occurrences from `collection_id`.
    ///
    /// Every call starts from a fresh fetch. A stale-snapshot rejection, or a
    /// collection that moved while it was being read, triggers a complete
    /// re-fetch, re-detect, re-confirm and re-plan, up to the configured
    /// limit. A collection still moving during the last allowed fetch is
    /// left untouched and reported as a stale-snapshot failure.
    pub async fn deduplicate(&self, collection_id: &str, policy: DedupPolicy) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new(collection_id);
        loop {
            let snapshot = self.fetcher.fetch_all(collection_id).await?;
            if matches!(snapshot.warning, Some(FetchWarning::ChangedDuringFetch { .. }))
                && report.replans < self.stale_replan_limit
            {
                report.replans += 1;
                warn!(collection = collection_id, "playlist moved during fetch; fetching again");
                continue;
            }
            report.fetch_warning = snapshot.warning.clone();

            let groups = detect_groups(&snapshot);
            report.groups = groups.len();
            if groups.is_empty() {
                info!(collection = collection_id, "no duplicates found");
                report.outcome = RunOutcome::NothingToDo;
                return Ok(report);
            }

            if let Some(expected) = changed_during_fetch(&snapshot) {
                let plan = self.plan_removals(&snapshot, &groups, policy)?;
                warn!(collection = collection_id, "playlist kept changing while being read; not applying");
                report.refuse_unstable(&plan, expected);
                return Ok(report);
            }

            let request = ConfirmRequest::Dedup {
                collection_id,
                groups: &groups,
                policy,
                warning: snapshot.warning.as_ref(),
            };
            if !self.confirmer.confirm(&request).await {
                info!(collection = collection_id, "dedup declined");
                report.outcome = RunOutcome::Declined;
                return Ok(report);
            }

            let plan = self.plan_removals(&snapshot, &groups, policy)?;
            report.record_plan(&plan);
            info!(
                collection = collection_id,
                groups = groups.len(),
                removals = plan.removal_count(),
                additions = plan.addition_count(),
                batches = plan.batches().len(),
                "executing dedup plan"
            );

            match self.mutator.execute(collection_id, &plan).await {
                Ok(applied) => {
                    report.removed_count += applied.removed;
                    report.added_count += applied.added;
                    report.outcome = RunOutcome::Applied;
                    return Ok(report);
                }
                Err(partial) => {
                    report.removed_count += partial.applied.removed;
                    report.added_count += partial.applied.added;
                    if partial.error.is_stale() && report.replans < self.stale_replan_limit {
                        report.replans += 1;
                        report.forget_unapplied(&partial);
                        warn!(collection = collection_id, "snapshot went stale mid-plan; re-planning from a fresh fetch");
                        continue;
                    }
                    report.failures.push(SyncFailure::from(&partial));
                    report.outcome = RunOutcome::Partial;
                    return Ok(report);
                }
            }
        }
    }

    /// Deduplicate several collections concurrently. Each collection's own
    /// plan still runs strictly in order.
    pub async fn deduplicate_many(
        &self,
        collection_ids: &[String],
        policy: DedupPolicy,
    ) -> Vec<(String, Result<SyncReport, SyncError>)> {
        let runs = collection_ids.iter().map(|id| async move {
            let res = self.deduplicate(id, policy).await;
            (id.clone(), res)
        });
        join_all(runs).await
    }

    /// Remove the occurrences at `positions` (as seen in a fresh fetch),
    /// after confirmation.
    pub async fn remove_positions(&self, collection_id: &str, positions: &[usize]) -> Result<SyncReport, SyncError> {
        let snapshot = self.fetcher.fetch_all(collection_id).await?;
        let plan = plan::plan_position_removals(&snapshot, positions, &self.plan_options)?;
        if let Some(expected) = changed_during_fetch(&snapshot) {
            warn!(collection = collection_id, "playlist changed while being read; not removing");
            let mut report = SyncReport::new(collection_id);
            report.fetch_warning = snapshot.warning.clone();
            report.refuse_unstable(&plan, expected);
            return Ok(report);
        }
        let selected: Vec<RemoteItem> = plan
            .removal_positions()
            .iter()
            .filter_map(|p| snapshot.item_at(*p).cloned())
            .collect();
        let request = ConfirmRequest::RemoveSelected {
            collection_id,
            items: &selected,
        };
        if !self.confirmer.confirm(&request).await {
            let mut report = SyncReport::new(collection_id);
            report.outcome = RunOutcome::Declined;
            return Ok(report);
        }
        let mut report = self.execute(collection_id, &plan).await;
        report.fetch_warning = snapshot.warning;
        Ok(report)
    }

    /// Append `uris` in batches of at most the configured size.
    pub async fn append_items(&self, collection_id: &str, uris: Vec<String>) -> Result<SyncReport, SyncError> {
        let plan = plan::plan_additions(uris, &self.plan_options)?;
        Ok(self.execute(collection_id, &plan).await)
    }
}
