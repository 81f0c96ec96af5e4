use crate::api::PlaylistApi;
use crate::error::SyncError;
use crate::executor::RequestExecutor;
use crate::plan::MutationPlan;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedCounts {
    pub batches: usize,
    pub removed: usize,
    pub added: usize,
}

/// A plan that stopped part way. Applied batches stay applied.
#[derive(Debug, Error)]
#[error(
    "plan stopped at batch {failed_at} after removing {} and adding {}: {error}",
    .applied.removed,
    .applied.added
)]
pub struct PartialMutationResult {
    pub applied: AppliedCounts,
    /// Index of the batch that failed.
    pub failed_at: usize,
    #[source]
    pub error: SyncError,
    /// Batches from `failed_at` on, never attempted or rejected.
    pub remaining: MutationPlan,
}

/// Executes mutation plans batch by batch, in plan order.
pub struct BatchMutator {
    api: Arc<dyn PlaylistApi>,
    executor: Arc<RequestExecutor>,
    use_consistency_token: bool,
}

impl BatchMutator {
    pub fn new(api: Arc<dyn PlaylistApi>, executor: Arc<RequestExecutor>, use_consistency_token: bool) -> Self {
        Self {
            api,
            executor,
            use_consistency_token,
        }
    }

    /// Apply `plan` to `collection_id`.
    ///
    /// Removal batches carry the expected collection version when token
    /// guarding is on. The expected version follows the version the service
    /// reports after each applied batch, since our own edits move it too.
    pub async fn execute(&self, collection_id: &str, plan: &MutationPlan) -> Result<AppliedCounts, PartialMutationResult> {
        let api = self.api.as_ref();
        let mut applied = AppliedCounts::default();
        let mut expected_version: Option<String> = if self.use_consistency_token {
            plan.consistency_token().map(str::to_string)
        } else {
            None
        };
        let total = plan.batches().len();

        for (index, batch) in plan.batches().iter().enumerate() {
            let outcome = if batch.is_removal() {
                let entries = batch.removal_entries();
                let entries = entries.as_slice();
                let expected = expected_version.as_deref();
                debug!(
                    collection = collection_id,
                    batch = index,
                    positions = ?batch.positions(),
                    "removing batch"
                );
                self.executor
                    .execute("remove_occurrences", |token| async move {
                        api.remove_occurrences(&token, collection_id, entries, expected).await
                    })
                    .await
            } else {
                let uris = batch.addition_uris();
                let uris = uris.as_slice();
                debug!(collection = collection_id, batch = index, count = uris.len(), "appending batch");
                self.executor
                    .execute("append", |token| async move { api.append(&token, collection_id, uris).await })
                    .await
            };

            match outcome {
                Ok(new_version) => {
                    applied.batches += 1;
                    if batch.is_removal() {
                        applied.removed += batch.item_count();
                    } else {
                        applied.added += batch.item_count();
                    }
                    if self.use_consistency_token {
                        if new_version.is_none() {
                            debug!(collection = collection_id, "service returned no version; later batches run unguarded");
                        }
                        expected_version = new_version;
                    }
                }
                Err(error) => {
                    warn!(
                        collection = collection_id,
                        batch = index,
                        total,
                        kind = error.kind(),
                        "batch failed, abandoning rest of plan: {}",
                        error
                    );
                    return Err(PartialMutationResult {
                        applied,
                        failed_at: index,
                        error,
                        remaining: plan.remaining_from(index),
                    });
                }
            }
        }

        info!(
            collection = collection_id,
            removed = applied.removed,
            added = applied.added,
            batches = applied.batches,
            "plan applied"
        );
        Ok(applied)
    }
}
