use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::BlobStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeState {
    pub liked: bool,
    pub count: u32,
}

pub fn storage_key(listing_id: &str) -> String {
    format!("comment_likes:{listing_id}")
}

/// Local-only like overlay for the comments of the active listing.
///
/// Nothing here talks to the server. Storage failures degrade to an empty
/// overlay and are never surfaced.
pub struct LikeOverlayStore {
    store: Arc<dyn BlobStore>,
    listing_id: Option<String>,
    entries: BTreeMap<String, LikeState>,
}

impl LikeOverlayStore {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            listing_id: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn listing_id(&self) -> Option<&str> {
        self.listing_id.as_deref()
    }

    pub fn load(&mut self, listing_id: &str) {
        self.listing_id = Some(listing_id.to_string());
        self.entries = match self.store.get(&storage_key(listing_id)) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(listing = %listing_id, "likes: discarding corrupt overlay: {err}");
                    BTreeMap::new()
                }
            },
            Ok(None) => BTreeMap::new(),
            Err(err) => {
                warn!(listing = %listing_id, "likes: load failed: {err:#}");
                BTreeMap::new()
            }
        };
    }

    pub fn state(&self, comment_id: &str) -> LikeState {
        self.entries.get(comment_id).copied().unwrap_or_default()
    }

    /// Flips the like on `comment_id` and persists the whole overlay. Returns
    /// `None` when no listing is loaded.
    pub fn toggle(&mut self, comment_id: &str) -> Option<LikeState> {
        let listing_id = self.listing_id.clone()?;
        let entry = self.entries.entry(comment_id.to_string()).or_default();
        if entry.liked {
            entry.liked = false;
            entry.count = entry.count.saturating_sub(1);
        } else {
            entry.liked = true;
            entry.count = entry.count.saturating_add(1);
        }
        let state = *entry;
        self.persist(&listing_id);
        Some(state)
    }

    pub fn clear(&mut self) {
        self.listing_id = None;
        self.entries.clear();
    }

    fn persist(&self, listing_id: &str) {
        let raw = match serde_json::to_string(&self.entries) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("likes: encode overlay: {err}");
                return;
            }
        };
        if let Err(err) = self.store.put(&storage_key(listing_id), &raw) {
            warn!(listing = %listing_id, "likes: persist failed: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBlobStore, Options, Store};
    use tempfile::tempdir;

    #[test]
    fn toggle_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = Arc::new(Store::open(Options { path: Some(path.clone()) }).unwrap());
            let mut likes = LikeOverlayStore::new(store);
            likes.load("l1");
            let state = likes.toggle("c1").unwrap();
            assert_eq!(state, LikeState { liked: true, count: 1 });
        }

        let store = Arc::new(Store::open(Options { path: Some(path) }).unwrap());
        let mut likes = LikeOverlayStore::new(store);
        likes.load("l1");
        assert_eq!(likes.state("c1"), LikeState { liked: true, count: 1 });
        likes.load("l2");
        assert_eq!(likes.state("c1"), LikeState::default());
    }

    #[test]
    fn toggling_twice_returns_to_zero() {
        let mut likes = LikeOverlayStore::new(Arc::new(MemoryBlobStore::new()));
        likes.load("l1");
        likes.toggle("c1");
        let state = likes.toggle("c1").unwrap();
        assert_eq!(state, LikeState { liked: false, count: 0 });
    }

    #[test]
    fn count_is_floored_at_zero() {
        let store = Arc::new(MemoryBlobStore::new());
        store
            .put(&storage_key("l1"), r#"{"c1":{"liked":true,"count":0}}"#)
            .unwrap();
        let mut likes = LikeOverlayStore::new(store);
        likes.load("l1");
        assert_eq!(likes.toggle("c1").unwrap().count, 0);
    }

    #[test]
    fn corrupt_or_failing_storage_falls_back_to_empty() {
        let store = Arc::new(MemoryBlobStore::new());
        store.put(&storage_key("l1"), "not json").unwrap();
        let mut likes = LikeOverlayStore::new(store.clone());
        likes.load("l1");
        assert_eq!(likes.state("c1"), LikeState::default());

        store.set_failing(true);
        likes.load("l2");
        let state = likes.toggle("c9").unwrap();
        assert!(state.liked);
    }

    #[test]
    fn toggle_without_listing_is_ignored() {
        let mut likes = LikeOverlayStore::new(Arc::new(MemoryBlobStore::new()));
        assert_eq!(likes.toggle("c1"), None);
    }
}
