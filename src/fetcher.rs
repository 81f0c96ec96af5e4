use crate::api::PlaylistApi;
use crate::error::SyncError;
use crate::executor::RequestExecutor;
use crate::models::{CollectionSnapshot, FetchWarning, RemoteItem};
use std::sync::Arc;
use tracing::{info, warn};

/// Reads a whole playlist page by page into a position-indexed snapshot.
/// Nothing is cached: every call goes back to the service.
pub struct CollectionFetcher {
    api: Arc<dyn PlaylistApi>,
    executor: Arc<RequestExecutor>,
    page_size: usize,
}

impl CollectionFetcher {
    pub fn new(api: Arc<dyn PlaylistApi>, executor: Arc<RequestExecutor>, page_size: usize) -> Self {
        Self {
            api,
            executor,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub async fn fetch_all(&self, collection_id: &str) -> Result<CollectionSnapshot, SyncError> {
        let api = self.api.as_ref();
        info!(collection = collection_id, provider = api.name(), "fetching playlist");

        let before = self
            .executor
            .execute("snapshot_id", |token| async move { api.snapshot_id(&token, collection_id).await })
            .await?;

        let mut items: Vec<RemoteItem> = Vec::new();
        let mut warning: Option<FetchWarning> = None;
        let mut offset = 0usize;
        let limit = self.page_size;
        loop {
            let page = self
                .executor
                .execute("fetch_page", |token| async move {
                    api.fetch_page(&token, collection_id, offset, limit).await
                })
                .await?;

            let entries = match page.items {
                Some(entries) => entries,
                None => {
                    warn!(collection = collection_id, offset, "page without item list; stopping fetch");
                    warning = Some(FetchWarning::MalformedPage {
                        offset,
                        fetched: items.len(),
                    });
                    break;
                }
            };

            let returned = entries.len();
            for entry in entries {
                let position = items.len();
                items.push(match entry.track {
                    Some(t) => RemoteItem::new(t.uri, t.name, t.artists, position),
                    None => RemoteItem::unavailable(position),
                });
            }
            offset += returned;
            if returned < limit {
                break;
            }
        }

        let after = self
            .executor
            .execute("snapshot_id", |token| async move { api.snapshot_id(&token, collection_id).await })
            .await?;

        if warning.is_none() && before != after {
            warn!(collection = collection_id, ?before, ?after, "playlist changed during fetch");
            warning = Some(FetchWarning::ChangedDuringFetch {
                before,
                after: after.clone(),
            });
        }

        info!(collection = collection_id, count = items.len(), "fetched playlist");
        Ok(CollectionSnapshot {
            collection_id: collection_id.to_string(),
            items,
            consistency_token: after,
            warning,
        })
    }
}
