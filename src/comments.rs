use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::CommentService;
use crate::model::{Author, Comment};
use crate::realtime::{ChangeEvent, ChangeKind, ChangeRecord};

#[derive(Debug, thiserror::Error)]
pub enum CommentError {
    #[error("no listing is active")]
    NoActiveListing,
    #[error("comment is empty")]
    EmptyContent,
    #[error("sign in to comment")]
    NotSignedIn,
    #[error("parent comment {0} is not loaded")]
    UnknownParent(String),
    #[error("comment {0} is not loaded")]
    UnknownComment(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Loaded,
    /// Nothing to fetch: the listing is already loaded, or the root has no
    /// replies.
    AlreadyLoaded,
    /// The response arrived after the active listing changed and was dropped.
    Stale,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied,
    /// The event was already reflected locally.
    Duplicate,
    /// Not about the active listing, or carried no usable record.
    Ignored,
    /// Hydrating the record failed; a later event or reload heals it.
    Dropped,
}

/// Ticket for an in-flight root load. Responses are applied only if the
/// ticket is still the latest one issued.
#[derive(Debug, Clone)]
pub struct RootsRequest {
    pub listing_id: String,
    generation: u64,
}

#[derive(Debug, Clone)]
pub struct RepliesRequest {
    pub root_id: String,
    generation: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RootsPage {
    pub roots: Vec<Comment>,
    pub reply_counts: HashMap<String, usize>,
    pub first_replies: HashMap<String, Comment>,
}

/// Fetches the roots of a listing together with each root's exact reply count
/// and first reply.
pub fn fetch_roots_page(service: &dyn CommentService, listing_id: &str) -> Result<RootsPage> {
    let roots = service.list_roots(listing_id)?;
    let mut page = RootsPage::default();
    for root in &roots {
        let count = service
            .count_replies(&root.id)
            .with_context(|| format!("comments: count replies of {}", root.id))?;
        if count > 0 {
            if let Some(first) = service.first_reply(&root.id)? {
                page.first_replies.insert(root.id.clone(), first);
            }
        }
        page.reply_counts.insert(root.id.clone(), count);
    }
    page.roots = roots;
    Ok(page)
}

/// Working set of comments for the active listing.
///
/// All mutation goes through the optimistic operations and [`reconcile`].
/// Local writes and their realtime echoes are merged by comment id, so each
/// id is visible at most once whichever arrives first.
///
/// [`reconcile`]: CommentThreadStore::reconcile
pub struct CommentThreadStore {
    service: Arc<dyn CommentService>,
    viewer: Option<Author>,
    active_listing: Option<String>,
    loaded_listing: Option<String>,
    generation: u64,
    roots: Vec<Comment>,
    replies: HashMap<String, Vec<Comment>>,
    reply_counts: HashMap<String, usize>,
    first_replies: HashMap<String, Comment>,
}

impl CommentThreadStore {
    pub fn new(service: Arc<dyn CommentService>) -> Self {
        Self {
            service,
            viewer: None,
            active_listing: None,
            loaded_listing: None,
            generation: 0,
            roots: Vec::new(),
            replies: HashMap::new(),
            reply_counts: HashMap::new(),
            first_replies: HashMap::new(),
        }
    }

    pub fn set_viewer(&mut self, viewer: Option<Author>) {
        self.viewer = viewer;
    }

    pub fn listing_id(&self) -> Option<&str> {
        self.active_listing.as_deref()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded_listing.is_some() && self.loaded_listing == self.active_listing
    }

    pub fn roots(&self) -> &[Comment] {
        &self.roots
    }

    pub fn replies(&self, root_id: &str) -> &[Comment] {
        self.replies.get(root_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn reply_count(&self, root_id: &str) -> usize {
        self.reply_counts.get(root_id).copied().unwrap_or(0)
    }

    pub fn has_replies(&self, root_id: &str) -> bool {
        self.reply_count(root_id) > 0
    }

    pub fn first_reply(&self, root_id: &str) -> Option<&Comment> {
        self.first_replies.get(root_id)
    }

    /// Roots plus every root's reply count.
    pub fn total_count(&self) -> usize {
        self.roots.len()
            + self
                .roots
                .iter()
                .map(|root| self.reply_count(&root.id))
                .sum::<usize>()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.roots.iter().any(|c| c.id == id)
            || self.replies.values().flatten().any(|c| c.id == id)
            || self.first_replies.values().any(|c| c.id == id)
    }

    /// Id of the root that owns `id` (itself when `id` is a root).
    pub fn root_of(&self, id: &str) -> Option<String> {
        if self.roots.iter().any(|c| c.id == id) {
            return Some(id.to_string());
        }
        self.replies
            .iter()
            .find(|(_, list)| list.iter().any(|c| c.id == id))
            .map(|(root, _)| root.clone())
            .or_else(|| {
                self.first_replies
                    .iter()
                    .find(|(_, c)| c.id == id)
                    .map(|(root, _)| root.clone())
            })
    }

    /// Starts switching to `listing_id`. Returns `None` when that listing is
    /// already loaded; otherwise the previous working set is dropped and the
    /// returned ticket must be passed to [`finish_load_roots`].
    ///
    /// [`finish_load_roots`]: CommentThreadStore::finish_load_roots
    pub fn begin_load_roots(&mut self, listing_id: &str) -> Option<RootsRequest> {
        if self.loaded_listing.as_deref() == Some(listing_id)
            && self.active_listing.as_deref() == Some(listing_id)
        {
            return None;
        }
        if self.active_listing.as_deref() != Some(listing_id) {
            self.clear_working_set();
        }
        self.active_listing = Some(listing_id.to_string());
        self.loaded_listing = None;
        self.generation += 1;
        Some(RootsRequest {
            listing_id: listing_id.to_string(),
            generation: self.generation,
        })
    }

    pub fn finish_load_roots(
        &mut self,
        request: RootsRequest,
        result: Result<RootsPage>,
    ) -> LoadStatus {
        if request.generation != self.generation
            || self.active_listing.as_deref() != Some(request.listing_id.as_str())
        {
            debug!(listing = %request.listing_id, "comments: discarding stale roots response");
            return LoadStatus::Stale;
        }
        let page = match result {
            Ok(page) => page,
            Err(err) => {
                warn!(listing = %request.listing_id, "comments: load roots failed: {err:#}");
                return LoadStatus::Failed;
            }
        };

        // Anything applied while the request was in flight (optimistic adds,
        // realtime inserts) is kept unless the page already has it.
        let local_roots = std::mem::replace(&mut self.roots, page.roots);
        let local_previews = std::mem::replace(&mut self.first_replies, page.first_replies);
        let local_counts = std::mem::replace(&mut self.reply_counts, page.reply_counts);
        for (root_id, count) in local_counts {
            self.reply_counts.entry(root_id).or_insert(count);
        }
        for root in local_roots {
            if !self.roots.iter().any(|c| c.id == root.id) {
                self.insert_root(root);
            }
        }
        for (root_id, preview) in local_previews {
            self.first_replies.entry(root_id).or_insert(preview);
        }

        self.loaded_listing = Some(request.listing_id);
        LoadStatus::Loaded
    }

    /// Replaces the working set with the roots of `listing_id`. A no-op when
    /// that listing is already loaded.
    pub fn load_roots(&mut self, listing_id: &str) -> LoadStatus {
        let Some(request) = self.begin_load_roots(listing_id) else {
            return LoadStatus::AlreadyLoaded;
        };
        let result = fetch_roots_page(self.service.as_ref(), &request.listing_id);
        self.finish_load_roots(request, result)
    }

    /// Returns `None` when there is nothing to fetch (no active listing, or a
    /// known reply count of zero).
    pub fn begin_load_replies(&self, root_id: &str) -> Option<RepliesRequest> {
        self.active_listing.as_ref()?;
        if !self.has_replies(root_id) {
            return None;
        }
        Some(RepliesRequest {
            root_id: root_id.to_string(),
            generation: self.generation,
        })
    }

    pub fn finish_load_replies(
        &mut self,
        request: RepliesRequest,
        result: Result<Vec<Comment>>,
    ) -> LoadStatus {
        if request.generation != self.generation
            || !self.roots.iter().any(|c| c.id == request.root_id)
        {
            debug!(root = %request.root_id, "comments: discarding stale replies response");
            return LoadStatus::Stale;
        }
        let mut fetched = match result {
            Ok(list) => list,
            Err(err) => {
                warn!(root = %request.root_id, "comments: load replies failed: {err:#}");
                return LoadStatus::Failed;
            }
        };

        let root_id = request.root_id;
        for reply in fetched.iter_mut() {
            reply.parent_comment_id = Some(root_id.clone());
        }
        if let Some(local) = self.replies.remove(&root_id) {
            for reply in local {
                if !fetched.iter().any(|c| c.id == reply.id) {
                    fetched.push(reply);
                }
            }
        }
        fetched.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        self.reply_counts.insert(root_id.clone(), fetched.len());
        match fetched.first() {
            Some(first) => {
                self.first_replies.insert(root_id.clone(), first.clone());
            }
            None => {
                self.first_replies.remove(&root_id);
            }
        }
        self.replies.insert(root_id, fetched);
        LoadStatus::Loaded
    }

    /// Loads the full reply list of a root. Skips the network when the root is
    /// known to have no replies.
    pub fn load_replies(&mut self, root_id: &str) -> LoadStatus {
        let Some(request) = self.begin_load_replies(root_id) else {
            return LoadStatus::AlreadyLoaded;
        };
        let result = self.service.list_replies(&request.root_id);
        self.finish_load_replies(request, result)
    }

    /// Optimistically adds a comment, then writes it to the store. Replying to
    /// a reply attaches to that reply's root. On a failed write the local copy
    /// stays and the error is returned; the change feed settles the final
    /// state.
    pub fn add_comment(
        &mut self,
        content: &str,
        parent_id: Option<&str>,
    ) -> Result<Comment, CommentError> {
        let listing_id = self
            .active_listing
            .clone()
            .ok_or(CommentError::NoActiveListing)?;
        let content = content.trim();
        if content.is_empty() {
            return Err(CommentError::EmptyContent);
        }
        let viewer = self.viewer.clone().ok_or(CommentError::NotSignedIn)?;
        let root_id = match parent_id {
            Some(parent) => Some(
                self.root_of(parent)
                    .ok_or_else(|| CommentError::UnknownParent(parent.to_string()))?,
            ),
            None => None,
        };

        let comment = Comment {
            id: Uuid::new_v4().to_string(),
            listing_id,
            author_id: viewer.id.clone(),
            author: Some(viewer),
            content: content.to_string(),
            created_at: Utc::now(),
            parent_comment_id: root_id,
        };
        self.insert_local(comment.clone());

        self.service
            .insert_comment(&comment)
            .context("comments: publish comment")?;
        Ok(comment)
    }

    /// Optimistically removes a comment, then deletes it in the store.
    pub fn delete_comment(&mut self, id: &str) -> Result<(), CommentError> {
        if self.active_listing.is_none() {
            return Err(CommentError::NoActiveListing);
        }
        if !self.remove_local(id) {
            return Err(CommentError::UnknownComment(id.to_string()));
        }
        self.service
            .delete_comment(id)
            .context("comments: delete comment")?;
        Ok(())
    }

    /// Single entry point for realtime change events on the `comments` table.
    /// Safe under re-delivery and under interleaving across ids.
    pub fn reconcile(&mut self, event: &ChangeEvent) -> ReconcileOutcome {
        let Some(listing_id) = self.active_listing.clone() else {
            return ReconcileOutcome::Ignored;
        };
        let Some(record) = event.record().cloned() else {
            return ReconcileOutcome::Ignored;
        };
        match event.listing_id() {
            Some(event_listing) if event_listing != listing_id => {
                return ReconcileOutcome::Ignored;
            }
            None if !self.contains(&record.id) => return ReconcileOutcome::Ignored,
            _ => {}
        }

        match event.kind {
            ChangeKind::Insert => {
                if self.contains(&record.id) {
                    return ReconcileOutcome::Duplicate;
                }
                self.apply_remote_insert(&record.id, &listing_id)
            }
            ChangeKind::Update => {
                if !self.contains(&record.id) {
                    return self.apply_remote_insert(&record.id, &listing_id);
                }
                self.apply_remote_update(&record);
                ReconcileOutcome::Applied
            }
            ChangeKind::Delete => {
                let root = self.root_of(&record.id);
                if !self.remove_local(&record.id) {
                    return ReconcileOutcome::Duplicate;
                }
                if let Some(root) = root.filter(|root| *root != record.id) {
                    self.refresh_reply_count(&root);
                }
                ReconcileOutcome::Applied
            }
        }
    }

    /// Drops the working set entirely, e.g. when the comments screen closes.
    pub fn teardown(&mut self) {
        self.clear_working_set();
        self.active_listing = None;
        self.loaded_listing = None;
        self.generation += 1;
    }

    fn clear_working_set(&mut self) {
        self.roots.clear();
        self.replies.clear();
        self.reply_counts.clear();
        self.first_replies.clear();
    }

    fn apply_remote_insert(&mut self, id: &str, listing_id: &str) -> ReconcileOutcome {
        let mut hydrated = match self.service.fetch_comment(id) {
            Ok(Some(comment)) => comment,
            Ok(None) => {
                debug!(comment = %id, "comments: inserted row already gone");
                return ReconcileOutcome::Dropped;
            }
            Err(err) => {
                warn!(comment = %id, "comments: hydrate failed, dropping event: {err:#}");
                return ReconcileOutcome::Dropped;
            }
        };
        if hydrated.listing_id != listing_id {
            return ReconcileOutcome::Ignored;
        }
        if self.contains(&hydrated.id) {
            return ReconcileOutcome::Duplicate;
        }

        let Some(parent) = hydrated.parent_comment_id.clone() else {
            self.insert_local(hydrated);
            return ReconcileOutcome::Applied;
        };
        let Some(root) = self.ensure_root(&parent, listing_id) else {
            return ReconcileOutcome::Dropped;
        };
        hydrated.parent_comment_id = Some(root.clone());
        self.insert_local(hydrated);
        self.refresh_reply_count(&root);
        ReconcileOutcome::Applied
    }

    fn apply_remote_update(&mut self, record: &ChangeRecord) {
        let patch = |comment: &mut Comment| {
            if let Some(content) = &record.content {
                comment.content = content.clone();
            }
            if let Some(created_at) = record.created_at {
                comment.created_at = created_at;
            }
        };
        for comment in self.roots.iter_mut().filter(|c| c.id == record.id) {
            patch(comment);
        }
        for comment in self
            .replies
            .values_mut()
            .flatten()
            .filter(|c| c.id == record.id)
        {
            patch(comment);
        }
        for comment in self
            .first_replies
            .values_mut()
            .filter(|c| c.id == record.id)
        {
            patch(comment);
        }
        if let Some(root) = self.root_of(&record.id).filter(|root| *root != record.id) {
            self.refresh_reply_count(&root);
        }
    }

    /// Resolves `parent_id` to a root in the working set, fetching the parent
    /// (and its root, for a reply-to-a-reply) when it is not loaded.
    fn ensure_root(&mut self, parent_id: &str, listing_id: &str) -> Option<String> {
        let mut target = parent_id.to_string();
        for _ in 0..2 {
            if let Some(root) = self.root_of(&target) {
                return Some(root);
            }
            let fetched = match self.service.fetch_comment(&target) {
                Ok(Some(comment)) => comment,
                Ok(None) => return None,
                Err(err) => {
                    warn!(comment = %target, "comments: fetch parent failed: {err:#}");
                    return None;
                }
            };
            match fetched.parent_comment_id.clone() {
                Some(up) => target = up,
                None => {
                    if fetched.listing_id != listing_id {
                        return None;
                    }
                    let id = fetched.id.clone();
                    self.insert_local(fetched);
                    return Some(id);
                }
            }
        }
        None
    }

    /// Re-derives a root's reply count from the store. Never drops below the
    /// replies held locally; keeps the local figure if the count query fails.
    fn refresh_reply_count(&mut self, root_id: &str) {
        match self.service.count_replies(root_id) {
            Ok(count) => {
                let loaded = self.replies(root_id).len();
                self.reply_counts
                    .insert(root_id.to_string(), count.max(loaded));
            }
            Err(err) => {
                warn!(root = %root_id, "comments: reply count refresh failed: {err:#}");
            }
        }
    }

    fn insert_root(&mut self, comment: Comment) {
        let pos = self
            .roots
            .iter()
            .position(|c| c.created_at <= comment.created_at)
            .unwrap_or(self.roots.len());
        self.reply_counts.entry(comment.id.clone()).or_insert(0);
        self.roots.insert(pos, comment);
    }

    fn insert_local(&mut self, comment: Comment) {
        let Some(root_id) = comment.parent_comment_id.clone() else {
            self.insert_root(comment);
            return;
        };

        let replace_preview = self
            .first_replies
            .get(&root_id)
            .map_or(true, |first| comment.created_at < first.created_at);
        if replace_preview {
            self.first_replies.insert(root_id.clone(), comment.clone());
        }

        let list = self.replies.entry(root_id.clone()).or_default();
        let pos = list
            .iter()
            .position(|c| c.created_at > comment.created_at)
            .unwrap_or(list.len());
        list.insert(pos, comment);

        *self.reply_counts.entry(root_id).or_insert(0) += 1;
    }

    fn remove_local(&mut self, id: &str) -> bool {
        if let Some(pos) = self.roots.iter().position(|c| c.id == id) {
            self.roots.remove(pos);
            self.replies.remove(id);
            self.reply_counts.remove(id);
            self.first_replies.remove(id);
            return true;
        }

        let Some(root_id) = self.root_of(id) else {
            return false;
        };
        if let Some(list) = self.replies.get_mut(&root_id) {
            list.retain(|c| c.id != id);
        }
        if let Some(count) = self.reply_counts.get_mut(&root_id) {
            *count = count.saturating_sub(1);
        }
        if self.first_replies.get(&root_id).is_some_and(|c| c.id == id) {
            match self.replies.get(&root_id).and_then(|list| list.first()) {
                Some(next) => {
                    self.first_replies.insert(root_id, next.clone());
                }
                None => {
                    self.first_replies.remove(&root_id);
                }
            }
        }
        true
    }
}
