use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::ViewService;
use crate::model::{ViewEvent, ViewSource};

pub const DEFAULT_THRESHOLD: Duration = Duration::from_millis(1000);
pub const DEFAULT_SEARCH_VISIBILITY: f64 = 0.7;

pub trait ViewSink {
    fn record(&self, event: ViewEvent);
}

/// Collects events in memory; clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ViewEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ViewEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<ViewEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl ViewSink for MemorySink {
    fn record(&self, event: ViewEvent) {
        self.events.lock().push(event);
    }
}

/// Forwards events to the backing store. Telemetry is best effort, so write
/// failures are logged and dropped.
pub struct ServiceSink {
    service: Arc<dyn ViewService>,
}

impl ServiceSink {
    pub fn new(service: Arc<dyn ViewService>) -> Self {
        Self { service }
    }
}

impl ViewSink for ServiceSink {
    fn record(&self, event: ViewEvent) {
        if let Err(err) = self.service.record_view(&event) {
            warn!(listing = %event.listing_id, "views: failed to record view: {err:#}");
        }
    }
}

/// Fans one event out to several sinks.
#[derive(Default)]
pub struct TeeSink {
    sinks: Vec<Box<dyn ViewSink>>,
}

impl TeeSink {
    pub fn new(sinks: Vec<Box<dyn ViewSink>>) -> Self {
        Self { sinks }
    }
}

impl ViewSink for TeeSink {
    fn record(&self, event: ViewEvent) {
        for sink in &self.sinks {
            sink.record(event.clone());
        }
    }
}

/// `durationSeconds` for a span that met the threshold.
pub fn duration_seconds(elapsed: Duration) -> u64 {
    let secs = (elapsed.as_millis() as f64 / 1000.0).round() as u64;
    secs.max(1)
}

/// Dwell-time bookkeeping for the feed and search surfaces.
///
/// Every `(listing, source)` pair is Idle until it becomes active, Spanning
/// while active, and on close either yields one [`ViewEvent`] (elapsed at
/// least the threshold) or is discarded. Transitions are driven entirely by
/// the caller's activation callbacks; nothing here polls.
pub struct ViewDwellTracker {
    threshold: Duration,
    search_visibility: f64,
    viewer_id: Option<String>,
    sink: Box<dyn ViewSink>,
    spans: HashMap<(String, ViewSource), Instant>,
    feed_active: Option<String>,
    search_visible: BTreeSet<String>,
    suspended: bool,
}

impl ViewDwellTracker {
    pub fn new(threshold: Duration, sink: Box<dyn ViewSink>) -> Self {
        Self {
            threshold,
            search_visibility: DEFAULT_SEARCH_VISIBILITY,
            viewer_id: None,
            sink,
            spans: HashMap::new(),
            feed_active: None,
            search_visible: BTreeSet::new(),
            suspended: false,
        }
    }

    pub fn with_search_visibility(mut self, fraction: f64) -> Self {
        self.search_visibility = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn set_viewer(&mut self, viewer_id: Option<String>) {
        self.viewer_id = viewer_id;
    }

    pub fn is_spanning(&self, listing_id: &str, source: ViewSource) -> bool {
        self.spans
            .contains_key(&(listing_id.to_string(), source))
    }

    pub fn open_spans(&self) -> usize {
        self.spans.len()
    }

    /// Feed surface: `listing_id` is the single centered item, or `None` when
    /// nothing is centered.
    pub fn activate_feed(&mut self, listing_id: Option<&str>, now: Instant) {
        if self.feed_active.as_deref() == listing_id {
            return;
        }
        if let Some(previous) = self.feed_active.take() {
            self.close(&previous, ViewSource::Feed, now);
        }
        if let Some(next) = listing_id {
            self.feed_active = Some(next.to_string());
            if !self.suspended {
                self.open(next, ViewSource::Feed, now);
            }
        }
    }

    /// Search surface: reports the visible fraction of one result row. Rows at
    /// or above the visibility threshold are active; several may be at once.
    pub fn set_search_visibility(&mut self, listing_id: &str, visible_fraction: f64, now: Instant) {
        let visible = visible_fraction >= self.search_visibility;
        let was_visible = self.search_visible.contains(listing_id);
        match (was_visible, visible) {
            (false, true) => {
                self.search_visible.insert(listing_id.to_string());
                if !self.suspended {
                    self.open(listing_id, ViewSource::Search, now);
                }
            }
            (true, false) => {
                self.search_visible.remove(listing_id);
                self.close(listing_id, ViewSource::Search, now);
            }
            _ => {}
        }
    }

    /// Closes every span of one source, e.g. when the search results screen
    /// loses focus.
    pub fn deactivate(&mut self, source: ViewSource, now: Instant) {
        match source {
            ViewSource::Feed => self.activate_feed(None, now),
            ViewSource::Search => {
                let visible = std::mem::take(&mut self.search_visible);
                for listing_id in visible {
                    self.close(&listing_id, ViewSource::Search, now);
                }
            }
        }
    }

    /// Screen blur or app backgrounding: closes all spans but remembers which
    /// items were active so [`resume`](Self::resume) can reopen them.
    pub fn suspend(&mut self, now: Instant) {
        if self.suspended {
            return;
        }
        self.suspended = true;
        self.flush(now);
    }

    pub fn resume(&mut self, now: Instant) {
        if !self.suspended {
            return;
        }
        self.suspended = false;
        if let Some(listing_id) = self.feed_active.clone() {
            self.open(&listing_id, ViewSource::Feed, now);
        }
        let visible: Vec<String> = self.search_visible.iter().cloned().collect();
        for listing_id in visible {
            self.open(&listing_id, ViewSource::Search, now);
        }
    }

    /// Flushes every open span and forgets all activation state.
    pub fn teardown(&mut self, now: Instant) {
        self.flush(now);
        self.feed_active = None;
        self.search_visible.clear();
        self.suspended = false;
    }

    fn flush(&mut self, now: Instant) {
        let mut open: Vec<(String, ViewSource)> = self.spans.keys().cloned().collect();
        open.sort();
        for (listing_id, source) in open {
            self.close(&listing_id, source, now);
        }
    }

    fn open(&mut self, listing_id: &str, source: ViewSource, now: Instant) {
        self.spans
            .entry((listing_id.to_string(), source))
            .or_insert(now);
    }

    fn close(&mut self, listing_id: &str, source: ViewSource, now: Instant) -> Option<ViewEvent> {
        let started = self.spans.remove(&(listing_id.to_string(), source))?;
        let elapsed = now.saturating_duration_since(started);
        if elapsed < self.threshold {
            debug!(listing = %listing_id, source = source.as_str(), ?elapsed, "views: span below threshold");
            return None;
        }
        let event = ViewEvent {
            listing_id: listing_id.to_string(),
            source,
            duration_seconds: duration_seconds(elapsed),
            viewer_id: self.viewer_id.clone(),
        };
        self.sink.record(event.clone());
        Some(event)
    }
}
