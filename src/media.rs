use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use lru::LruCache;
use reqwest::blocking::Client;
use serde::Serialize;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::model::{Listing, MediaKind};
use crate::scroll::{ScrollGovernor, ScrollPolicy};

pub const DEFAULT_CAPACITY: usize = 12;
pub const DEFAULT_LISTING_WINDOW: usize = 3;
pub const DEFAULT_MEDIA_WINDOW: usize = 2;

#[derive(Debug, Clone)]
pub struct Config {
    pub cache_dir: Option<PathBuf>,
    /// Maximum number of resident artifacts.
    pub capacity: usize,
    pub listing_window: usize,
    pub media_window: usize,
    pub scroll: ScrollPolicy,
    pub workers: usize,
    pub http_client: Option<Client>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            capacity: DEFAULT_CAPACITY,
            listing_window: DEFAULT_LISTING_WINDOW,
            media_window: DEFAULT_MEDIA_WINDOW,
            scroll: ScrollPolicy::default(),
            workers: 2,
            http_client: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub listing_id: String,
    pub media_id: String,
}

impl CacheKey {
    pub fn new(listing_id: impl Into<String>, media_id: impl Into<String>) -> Self {
        Self {
            listing_id: listing_id.into(),
            media_id: media_id.into(),
        }
    }

    fn file_stem(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.listing_id.as_bytes());
        hasher.update(b"/");
        hasher.update(self.media_id.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub local_path: PathBuf,
    pub inserted_at: Instant,
}

/// Decoder-window sizes in effect for one scroll state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub listings: usize,
    pub media: usize,
}

impl Window {
    pub fn contains(&self, listing_distance: i64, media_offset: i64) -> bool {
        listing_distance.unsigned_abs() <= self.listings as u64
            && media_offset.unsigned_abs() <= self.media as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountDecision {
    pub listing_id: String,
    pub media_id: String,
    pub kind: MediaKind,
    pub listing_distance: i64,
    pub media_offset: i64,
    /// Local artifact when resident, otherwise the remote URL to stream.
    pub uri: String,
}

pub trait Fetcher: Send + Sync {
    /// Downloads `url` into `dest`, returning the number of bytes written.
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Option<Client>) -> Result<Self> {
        let client = if let Some(client) = client {
            client
        } else {
            Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .context("media: build http client")?
        };
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self.client.get(url).send().context("media: download")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("media: request failed: {} - {}", status, body));
        }
        let mut file = File::create(dest)
            .with_context(|| format!("media: create {}", dest.display()))?;
        response.copy_to(&mut file).context("media: write body")
    }
}

struct Job {
    key: CacheKey,
    url: String,
    dest: PathBuf,
}

struct Completion {
    key: CacheKey,
    dest: PathBuf,
    result: Result<u64>,
}

/// Bounded on-disk cache for feed videos plus the decoder-window policy.
///
/// Downloads run on a small worker pool, but the entry map is only touched by
/// the owner through `&mut self`: workers hand finished files back over a
/// channel and [`Manager::poll_downloads`] applies them.
pub struct Manager {
    cfg: Config,
    cache_dir: PathBuf,
    entries: LruCache<CacheKey, CacheEntry>,
    pinned: HashSet<CacheKey>,
    pending: HashSet<CacheKey>,
    failed: HashSet<CacheKey>,
    governor: ScrollGovernor,
    jobs: Sender<Job>,
    stop: Sender<()>,
    completions: Receiver<Completion>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Manager {
    pub fn new(cfg: Config) -> Result<Self> {
        let fetcher = HttpFetcher::new(cfg.http_client.clone())?;
        Self::with_fetcher(cfg, Arc::new(fetcher))
    }

    pub fn with_fetcher(cfg: Config, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        let mut cfg = cfg;
        if cfg.workers == 0 {
            cfg.workers = 2;
        }
        if cfg.capacity == 0 {
            cfg.capacity = DEFAULT_CAPACITY;
        }
        let cache_dir = cfg
            .cache_dir
            .clone()
            .or_else(default_cache_dir)
            .context("media: cache dir not configured")?;
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("media: create cache dir {}", cache_dir.display()))?;
        sweep_dir(&cache_dir)?;
        cfg.cache_dir = Some(cache_dir.clone());

        let (job_tx, job_rx) = unbounded::<Job>();
        let (stop_tx, stop_rx) = unbounded::<()>();
        let (done_tx, done_rx) = unbounded::<Completion>();

        let mut handles = Vec::new();
        for _ in 0..cfg.workers {
            let jobs = job_rx.clone();
            let stop = stop_rx.clone();
            let done = done_tx.clone();
            let fetcher = fetcher.clone();
            handles.push(thread::spawn(move || worker(fetcher, jobs, stop, done)));
        }

        Ok(Self {
            governor: ScrollGovernor::new(cfg.scroll),
            cfg,
            cache_dir,
            entries: LruCache::unbounded(),
            pinned: HashSet::new(),
            pending: HashSet::new(),
            failed: HashSet::new(),
            jobs: job_tx,
            stop: stop_tx,
            completions: done_rx,
            handles,
        })
    }

    pub fn capacity(&self) -> usize {
        self.cfg.capacity
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn resident_count(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains(key)
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.pending.contains(key)
    }

    pub fn entry(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.peek(key)
    }

    pub fn observe_scroll(&mut self, px_per_sec: f64, now: Instant) -> bool {
        self.governor.observe(px_per_sec, now)
    }

    pub fn is_fast_scroll(&self, now: Instant) -> bool {
        self.governor.is_fast(now)
    }

    pub fn window(&self, is_fast_scroll: bool) -> Window {
        let widen = usize::from(is_fast_scroll);
        Window {
            listings: self.cfg.listing_window + widen,
            media: self.cfg.media_window + widen,
        }
    }

    pub fn should_mount_decoder(
        &self,
        listing_distance: i64,
        media_offset_from_active: i64,
        is_fast_scroll: bool,
    ) -> bool {
        self.window(is_fast_scroll)
            .contains(listing_distance, media_offset_from_active)
    }

    /// Returns the local artifact for `key` when resident; otherwise queues a
    /// background download (once) and returns `remote_url` so playback can
    /// stream immediately.
    pub fn ensure_cached(&mut self, key: &CacheKey, remote_url: &str) -> String {
        if let Some(entry) = self.entries.get(key) {
            if entry.local_path.exists() {
                return entry.local_path.to_string_lossy().to_string();
            }
            warn!(listing = %key.listing_id, media = %key.media_id, "media: artifact vanished, dropping entry");
            self.entries.pop(key);
        }

        if remote_url.trim().is_empty()
            || self.failed.contains(key)
            || self.pending.contains(key)
        {
            return remote_url.to_string();
        }

        let dest = self.artifact_path(key, remote_url);
        let job = Job {
            key: key.clone(),
            url: remote_url.to_string(),
            dest,
        };
        if self.jobs.send(job).is_ok() {
            self.pending.insert(key.clone());
        } else {
            warn!("media: download workers unavailable");
        }
        remote_url.to_string()
    }

    /// Replaces the set of keys that belong to currently window-eligible items.
    /// Pinned entries are never chosen for eviction.
    pub fn pin_window<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = CacheKey>,
    {
        self.pinned = keys.into_iter().collect();
    }

    /// Computes mount decisions for every media item inside the current window
    /// around `active`, pins their keys and prefetches the videos among them.
    pub fn plan_window(
        &mut self,
        feed: &[Listing],
        active: usize,
        media_positions: &HashMap<String, usize>,
        now: Instant,
    ) -> Vec<MountDecision> {
        let window = self.window(self.is_fast_scroll(now));
        let mut eligible = Vec::new();
        for (idx, listing) in feed.iter().enumerate() {
            let listing_distance = idx as i64 - active as i64;
            if listing_distance.unsigned_abs() > window.listings as u64 {
                continue;
            }
            let active_media = media_positions.get(&listing.id).copied().unwrap_or(0);
            for (seq, item) in listing.media.iter().enumerate() {
                let media_offset = seq as i64 - active_media as i64;
                if !window.contains(listing_distance, media_offset) {
                    continue;
                }
                eligible.push((listing_distance, media_offset, item));
            }
        }

        self.pin_window(
            eligible
                .iter()
                .filter(|(_, _, item)| item.is_video())
                .map(|(_, _, item)| CacheKey::new(item.listing_id.clone(), item.id.clone())),
        );

        eligible
            .into_iter()
            .map(|(listing_distance, media_offset, item)| {
                let uri = if item.is_video() {
                    let key = CacheKey::new(item.listing_id.clone(), item.id.clone());
                    self.ensure_cached(&key, &item.remote_url)
                } else {
                    item.remote_url.clone()
                };
                MountDecision {
                    listing_id: item.listing_id.clone(),
                    media_id: item.id.clone(),
                    kind: item.kind,
                    listing_distance,
                    media_offset,
                    uri,
                }
            })
            .collect()
    }

    /// Applies finished downloads without blocking. Returns how many were
    /// applied.
    pub fn poll_downloads(&mut self) -> usize {
        let done: Vec<Completion> = self.completions.try_iter().collect();
        let count = done.len();
        for completion in done {
            self.apply(completion);
        }
        count
    }

    /// Blocks until every queued download has finished or `timeout` elapses.
    pub fn wait_for_downloads(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut applied = 0;
        while !self.pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completions.recv_timeout(remaining) {
                Ok(completion) => {
                    self.apply(completion);
                    applied += 1;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        applied
    }

    fn apply(&mut self, completion: Completion) {
        let Completion { key, dest, result } = completion;
        self.pending.remove(&key);

        if let Err(err) = result {
            warn!(listing = %key.listing_id, media = %key.media_id, "media: download failed, streaming remote: {err:#}");
            self.failed.insert(key);
            return;
        }

        while self.entries.len() >= self.cfg.capacity {
            let victim = self
                .entries
                .iter()
                .rev()
                .find(|(candidate, _)| !self.pinned.contains(*candidate))
                .map(|(candidate, _)| candidate.clone());
            match victim {
                Some(victim) => self.evict(&victim),
                None => {
                    debug!(listing = %key.listing_id, media = %key.media_id, "media: cache full of pinned entries, discarding download");
                    remove_artifact(&dest);
                    return;
                }
            }
        }

        self.entries.put(
            key.clone(),
            CacheEntry {
                key,
                local_path: dest,
                inserted_at: Instant::now(),
            },
        );
    }

    fn evict(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.pop(key) {
            debug!(listing = %key.listing_id, media = %key.media_id, "media: evict");
            remove_artifact(&entry.local_path);
        }
    }

    fn artifact_path(&self, key: &CacheKey, remote_url: &str) -> PathBuf {
        let ext = extension_for(remote_url);
        self.cache_dir.join(format!("{}.{}", key.file_stem(), ext))
    }

    /// Stops the workers and removes every artifact this manager owns.
    pub fn teardown(&mut self) {
        for _ in &self.handles {
            let _ = self.stop.send(());
        }
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
        for (_, entry) in self.entries.iter() {
            remove_artifact(&entry.local_path);
        }
        self.entries.clear();
        self.pending.clear();
        self.pinned.clear();
        if let Err(err) = sweep_dir(&self.cache_dir) {
            warn!("media: teardown sweep failed: {err:#}");
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn worker(
    fetcher: Arc<dyn Fetcher>,
    jobs: Receiver<Job>,
    stop: Receiver<()>,
    done: Sender<Completion>,
) {
    loop {
        crossbeam_channel::select! {
            recv(stop) -> _ => break,
            recv(jobs) -> msg => {
                match msg {
                    Ok(job) => {
                        let completion = download(fetcher.as_ref(), job);
                        if done.send(completion).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

fn download(fetcher: &dyn Fetcher, job: Job) -> Completion {
    let partial = partial_path(&job.dest);
    let result = fetcher
        .fetch(&job.url, &partial)
        .and_then(|bytes| {
            fs::rename(&partial, &job.dest).context("media: finalize artifact")?;
            Ok(bytes)
        });
    if result.is_err() {
        remove_artifact(&partial);
    }
    Completion {
        key: job.key,
        dest: job.dest,
        result,
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn remove_artifact(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("media: remove {}: {err}", path.display()),
    }
}

/// Removes leftover artifacts. Files not named like one are left alone, so a
/// shared directory keeps its other contents.
fn sweep_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("media: read {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if entry.file_name().to_str().is_some_and(is_artifact_name) {
            remove_artifact(&entry.path());
        }
    }
    Ok(())
}

/// `<40 hex sha1>.<ext>` with an optional `.part` suffix.
fn is_artifact_name(name: &str) -> bool {
    let name = name.strip_suffix(".part").unwrap_or(name);
    let Some((stem, ext)) = name.split_once('.') else {
        return false;
    };
    stem.len() == 40
        && stem.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        && !ext.is_empty()
        && ext.len() <= 5
        && ext.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn extension_for(remote_url: &str) -> String {
    url::Url::parse(remote_url)
        .ok()
        .and_then(|url| {
            Path::new(url.path())
                .extension()
                .and_then(|ext| ext.to_str())
                .filter(|ext| ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
                .map(|ext| ext.to_ascii_lowercase())
        })
        .unwrap_or_else(|| "bin".to_string())
}

pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("homefeed").join("media"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaItem;
    use tempfile::tempdir;

    struct FakeFetcher;

    impl Fetcher for FakeFetcher {
        fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
            if url.contains("broken") {
                return Err(anyhow!("media: request failed: 404"));
            }
            fs::write(dest, url.as_bytes())?;
            Ok(url.len() as u64)
        }
    }

    fn manager(dir: &Path, capacity: usize) -> Manager {
        Manager::with_fetcher(
            Config {
                cache_dir: Some(dir.to_path_buf()),
                capacity,
                ..Config::default()
            },
            Arc::new(FakeFetcher),
        )
        .unwrap()
    }

    fn video_listing(id: &str, videos: usize) -> Listing {
        Listing {
            id: id.into(),
            title: String::new(),
            media: (0..videos)
                .map(|n| MediaItem {
                    id: format!("{id}-v{n}"),
                    kind: MediaKind::Video,
                    remote_url: format!("https://cdn.example/{id}/{n}.mp4"),
                    listing_id: id.into(),
                    sequence_index: n,
                })
                .collect(),
        }
    }

    fn files_in(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn decoder_window_widens_under_fast_scroll() {
        let dir = tempdir().unwrap();
        let m = manager(dir.path(), 4);
        assert!(m.should_mount_decoder(3, 2, false));
        assert!(m.should_mount_decoder(-3, -2, false));
        assert!(!m.should_mount_decoder(4, 0, false));
        assert!(!m.should_mount_decoder(0, 3, false));
        assert!(m.should_mount_decoder(4, 3, true));
        assert!(!m.should_mount_decoder(5, 0, true));
    }

    #[test]
    fn ensure_cached_streams_remote_until_download_lands() {
        let dir = tempdir().unwrap();
        let mut m = manager(dir.path(), 4);
        let key = CacheKey::new("l1", "m1");
        let url = "https://cdn.example/l1/clip.MP4";

        assert_eq!(m.ensure_cached(&key, url), url);
        assert!(m.is_pending(&key));
        assert_eq!(m.ensure_cached(&key, url), url);

        m.wait_for_downloads(Duration::from_secs(5));
        let local = m.ensure_cached(&key, url);
        assert_ne!(local, url);
        assert!(local.ends_with(".mp4"));
        assert!(Path::new(&local).exists());
        assert_eq!(m.resident_count(), 1);
    }

    #[test]
    fn failed_download_is_not_cached_or_retried() {
        let dir = tempdir().unwrap();
        let mut m = manager(dir.path(), 4);
        let key = CacheKey::new("l1", "m1");
        let url = "https://cdn.example/broken.mp4";

        m.ensure_cached(&key, url);
        m.wait_for_downloads(Duration::from_secs(5));
        assert!(!m.contains(&key));
        assert_eq!(m.ensure_cached(&key, url), url);
        assert!(!m.is_pending(&key));
        assert_eq!(files_in(dir.path()), 0);
    }

    #[test]
    fn eviction_skips_pinned_entries() {
        let dir = tempdir().unwrap();
        let mut m = manager(dir.path(), 2);
        let a = CacheKey::new("l1", "a");
        let b = CacheKey::new("l2", "b");
        let c = CacheKey::new("l3", "c");

        m.ensure_cached(&a, "https://cdn.example/a.mp4");
        m.wait_for_downloads(Duration::from_secs(5));
        m.ensure_cached(&b, "https://cdn.example/b.mp4");
        m.wait_for_downloads(Duration::from_secs(5));

        m.pin_window(vec![a.clone(), c.clone()]);
        m.ensure_cached(&c, "https://cdn.example/c.mp4");
        m.wait_for_downloads(Duration::from_secs(5));

        assert!(m.contains(&a));
        assert!(!m.contains(&b));
        assert!(m.contains(&c));
        assert_eq!(m.resident_count(), 2);
        assert_eq!(files_in(dir.path()), 2);
    }

    #[test]
    fn full_cache_of_pinned_entries_discards_incoming() {
        let dir = tempdir().unwrap();
        let mut m = manager(dir.path(), 1);
        let a = CacheKey::new("l1", "a");
        let b = CacheKey::new("l1", "b");
        m.pin_window(vec![a.clone(), b.clone()]);

        m.ensure_cached(&a, "https://cdn.example/a.mp4");
        m.wait_for_downloads(Duration::from_secs(5));
        m.ensure_cached(&b, "https://cdn.example/b.mp4");
        m.wait_for_downloads(Duration::from_secs(5));

        assert!(m.contains(&a));
        assert!(!m.contains(&b));
        assert_eq!(files_in(dir.path()), 1);
    }

    #[test]
    fn fast_scroll_through_feed_stays_within_capacity() {
        let dir = tempdir().unwrap();
        let mut m = manager(dir.path(), 6);
        let feed: Vec<Listing> = (0..12).map(|n| video_listing(&format!("l{n}"), 3)).collect();
        let positions = HashMap::new();
        let t0 = Instant::now();

        for step in 0..5 {
            let now = t0 + Duration::from_millis(step * 120);
            m.observe_scroll(3000.0, now);
            assert!(m.is_fast_scroll(now));
            let plan = m.plan_window(&feed, step as usize, &positions, now);
            assert!(plan.iter().any(|d| d.listing_distance == 4));
            m.wait_for_downloads(Duration::from_secs(5));
            assert!(m.resident_count() <= m.capacity());
        }

        let later = t0 + Duration::from_millis(4 * 120 + 700);
        assert!(!m.is_fast_scroll(later));
        let plan = m.plan_window(&feed, 4, &positions, later);
        assert!(plan.iter().all(|d| d.listing_distance.abs() <= 3));
        assert!(plan.iter().all(|d| d.media_offset.abs() <= 2));
        m.wait_for_downloads(Duration::from_secs(5));
        assert!(m.resident_count() <= m.capacity());
        assert_eq!(files_in(dir.path()), m.resident_count());
    }

    #[test]
    fn teardown_removes_artifacts_and_start_sweeps_orphans() {
        let dir = tempdir().unwrap();
        let orphan = CacheKey::new("gone", "x").file_stem();
        fs::write(dir.path().join(format!("{orphan}.mp4")), b"stale").unwrap();
        fs::write(dir.path().join(format!("{orphan}.webm.part")), b"half").unwrap();
        let notes = dir.path().join("my-notes.txt");
        fs::write(&notes, b"keep me").unwrap();
        {
            let mut m = manager(dir.path(), 3);
            assert_eq!(files_in(dir.path()), 1);
            assert!(notes.exists());
            m.ensure_cached(&CacheKey::new("l1", "a"), "https://cdn.example/a.mp4");
            m.wait_for_downloads(Duration::from_secs(5));
            assert_eq!(files_in(dir.path()), 2);
        }
        assert_eq!(files_in(dir.path()), 1);
        assert_eq!(fs::read(&notes).unwrap(), b"keep me");
    }

    #[test]
    fn artifact_names_are_recognized() {
        let stem = CacheKey::new("l1", "m1").file_stem();
        assert!(is_artifact_name(&format!("{stem}.mp4")));
        assert!(is_artifact_name(&format!("{stem}.bin.part")));
        assert!(!is_artifact_name(&stem));
        assert!(!is_artifact_name("my-notes.txt"));
        assert!(!is_artifact_name(&format!("{}.mp4", stem.to_uppercase())));
    }

    #[test]
    fn extension_falls_back_to_bin() {
        assert_eq!(extension_for("https://cdn.example/v/clip.webm?sig=1"), "webm");
        assert_eq!(extension_for("https://cdn.example/v/stream"), "bin");
        assert_eq!(extension_for("not a url"), "bin");
    }
}
