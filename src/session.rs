use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tracing::debug;

use crate::backend::CommentService;
use crate::comments::{CommentError, CommentThreadStore, LoadStatus, ReconcileOutcome};
use crate::likes::{LikeOverlayStore, LikeState};
use crate::media::{self, MountDecision};
use crate::model::{Author, Comment, CommentView, Listing, ViewSource};
use crate::realtime::ChangeEvent;
use crate::storage::BlobStore;
use crate::views::ViewDwellTracker;

/// Everything a [`FeedSession`] is assembled from.
pub struct Parts {
    pub media: media::Manager,
    pub views: ViewDwellTracker,
    pub comments: Arc<dyn CommentService>,
    pub blobs: Arc<dyn BlobStore>,
    pub changes: Option<Receiver<ChangeEvent>>,
    pub viewer: Option<Author>,
}

/// One open feed screen: the media window, dwell tracking, and the comments
/// and likes of the active listing. All methods run on the owner's thread;
/// time is passed in explicitly.
pub struct FeedSession {
    media: media::Manager,
    views: ViewDwellTracker,
    comments: CommentThreadStore,
    likes: LikeOverlayStore,
    changes: Option<Receiver<ChangeEvent>>,
    feed: Vec<Listing>,
    active: Option<usize>,
    media_positions: HashMap<String, usize>,
    planned_fast: bool,
}

impl FeedSession {
    pub fn new(parts: Parts) -> Self {
        let Parts {
            media,
            mut views,
            comments,
            blobs,
            changes,
            viewer,
        } = parts;
        views.set_viewer(viewer.as_ref().map(|author| author.id.clone()));
        let mut comments = CommentThreadStore::new(comments);
        comments.set_viewer(viewer);
        Self {
            media,
            views,
            comments,
            likes: LikeOverlayStore::new(blobs),
            changes,
            feed: Vec::new(),
            active: None,
            media_positions: HashMap::new(),
            planned_fast: false,
        }
    }

    pub fn feed(&self) -> &[Listing] {
        &self.feed
    }

    pub fn active_listing(&self) -> Option<&Listing> {
        self.active.and_then(|idx| self.feed.get(idx))
    }

    pub fn media(&self) -> &media::Manager {
        &self.media
    }

    pub fn views(&self) -> &ViewDwellTracker {
        &self.views
    }

    pub fn comments(&self) -> &CommentThreadStore {
        &self.comments
    }

    pub fn likes(&self) -> &LikeOverlayStore {
        &self.likes
    }

    /// Replaces the feed. The active item survives if its listing is still
    /// present; otherwise nothing is active.
    pub fn set_feed(&mut self, listings: Vec<Listing>, now: Instant) -> Vec<MountDecision> {
        let active_id = self.active_listing().map(|listing| listing.id.clone());
        self.feed = listings.into_iter().map(Listing::normalized).collect();
        self.media_positions
            .retain(|id, _| self.feed.iter().any(|listing| &listing.id == id));
        self.active = active_id.and_then(|id| self.feed.iter().position(|l| l.id == id));
        if self.active.is_none() {
            self.views.activate_feed(None, now);
        }
        self.plan(now)
    }

    /// The feed's centered item changed. `None` (or an out-of-range index)
    /// means nothing is centered.
    pub fn set_active_listing(&mut self, index: Option<usize>, now: Instant) -> Vec<MountDecision> {
        self.active = index.filter(|idx| *idx < self.feed.len());
        let listing_id = self.active_listing().map(|listing| listing.id.clone());
        self.views.activate_feed(listing_id.as_deref(), now);
        if let Some(listing_id) = listing_id.as_deref() {
            self.open_comments(listing_id);
        }
        self.plan(now)
    }

    /// The horizontal media carousel of `listing_id` moved to `index`.
    pub fn set_active_media(
        &mut self,
        listing_id: &str,
        index: usize,
        now: Instant,
    ) -> Vec<MountDecision> {
        let Some(listing) = self.feed.iter().find(|listing| listing.id == listing_id) else {
            debug!(listing = %listing_id, "session: media position for unknown listing");
            return self.plan(now);
        };
        let clamped = index.min(listing.media.len().saturating_sub(1));
        self.media_positions.insert(listing_id.to_string(), clamped);
        self.plan(now)
    }

    /// Feeds a scroll velocity sample. Returns a new mount plan only when the
    /// decoder window widened or narrowed as a result.
    pub fn on_scroll_velocity_change(
        &mut self,
        px_per_sec: f64,
        now: Instant,
    ) -> Option<Vec<MountDecision>> {
        let fast = self.media.observe_scroll(px_per_sec, now);
        if fast == self.planned_fast {
            return None;
        }
        Some(self.plan(now))
    }

    /// Applies finished downloads and narrows the window once the fast-scroll
    /// cooldown has run out.
    pub fn tick(&mut self, now: Instant) -> Option<Vec<MountDecision>> {
        let applied = self.media.poll_downloads();
        if applied > 0 {
            debug!(applied, "session: downloads applied");
        }
        if self.media.is_fast_scroll(now) == self.planned_fast {
            return None;
        }
        Some(self.plan(now))
    }

    pub fn wait_for_downloads(&mut self, timeout: Duration) -> usize {
        self.media.wait_for_downloads(timeout)
    }

    /// Current mount plan around the active listing.
    pub fn plan(&mut self, now: Instant) -> Vec<MountDecision> {
        self.planned_fast = self.media.is_fast_scroll(now);
        match self.active {
            Some(active) => {
                self.media
                    .plan_window(&self.feed, active, &self.media_positions, now)
            }
            None => {
                self.media.pin_window(std::iter::empty());
                Vec::new()
            }
        }
    }

    pub fn set_search_visibility(&mut self, listing_id: &str, visible_fraction: f64, now: Instant) {
        self.views
            .set_search_visibility(listing_id, visible_fraction, now);
    }

    /// The search results screen went away.
    pub fn leave_search(&mut self, now: Instant) {
        self.views.deactivate(ViewSource::Search, now);
    }

    pub fn blur(&mut self, now: Instant) {
        self.views.suspend(now);
    }

    pub fn focus(&mut self, now: Instant) {
        self.views.resume(now);
    }

    /// Switches the comment working set and like overlay to `listing_id`.
    /// Activating a listing does this implicitly; a no-op when already there.
    pub fn open_comments(&mut self, listing_id: &str) -> LoadStatus {
        if self.likes.listing_id() != Some(listing_id) {
            self.likes.load(listing_id);
        }
        self.comments.load_roots(listing_id)
    }

    pub fn close_comments(&mut self) {
        self.comments.teardown();
        self.likes.clear();
    }

    pub fn load_replies(&mut self, root_id: &str) -> LoadStatus {
        self.comments.load_replies(root_id)
    }

    pub fn add_comment(
        &mut self,
        content: &str,
        parent_id: Option<&str>,
    ) -> Result<Comment, CommentError> {
        self.comments.add_comment(content, parent_id)
    }

    pub fn delete_comment(&mut self, id: &str) -> Result<(), CommentError> {
        self.comments.delete_comment(id)
    }

    pub fn toggle_like(&mut self, comment_id: &str) -> Option<LikeState> {
        self.likes.toggle(comment_id)
    }

    /// Applies one change event directly, bypassing the subscription.
    pub fn reconcile(&mut self, event: &ChangeEvent) -> ReconcileOutcome {
        self.comments.reconcile(event)
    }

    /// Drains the change feed subscription into the comment store.
    pub fn pump_realtime(&mut self) -> Vec<ReconcileOutcome> {
        let Some(changes) = self.changes.as_ref() else {
            return Vec::new();
        };
        let events: Vec<ChangeEvent> = changes.try_iter().collect();
        events
            .iter()
            .map(|event| self.comments.reconcile(event))
            .collect()
    }

    /// Roots newest first, each followed by its loaded replies oldest first,
    /// with the like overlay applied.
    pub fn comment_views(&self) -> Vec<CommentView> {
        let mut out = Vec::new();
        for root in self.comments.roots() {
            out.push(self.view_of(root, self.comments.reply_count(&root.id)));
            for reply in self.comments.replies(&root.id) {
                out.push(self.view_of(reply, 0));
            }
        }
        out
    }

    fn view_of(&self, comment: &Comment, reply_count: usize) -> CommentView {
        let like = self.likes.state(&comment.id);
        CommentView {
            comment: comment.clone(),
            reply_count,
            liked: like.liked,
            like_count: like.count,
        }
    }

    /// Flushes dwell spans, drops the comment working set and releases every
    /// cached artifact.
    pub fn teardown(&mut self, now: Instant) {
        self.views.teardown(now);
        self.close_comments();
        self.media.teardown();
        self.feed.clear();
        self.media_positions.clear();
        self.active = None;
        self.planned_fast = false;
    }
}
