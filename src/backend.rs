use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::CONTENT_RANGE;
use serde::Serialize;
use url::Url;

use crate::model::{Author, Comment, CommentRow, ViewEvent, ViewSource};
use crate::realtime::ChangeEvent;

pub trait CommentService: Send + Sync {
    /// Root comments of a listing, newest first.
    fn list_roots(&self, listing_id: &str) -> Result<Vec<Comment>>;
    /// Replies of a root, oldest first.
    fn list_replies(&self, root_id: &str) -> Result<Vec<Comment>>;
    fn count_replies(&self, root_id: &str) -> Result<usize>;
    fn first_reply(&self, root_id: &str) -> Result<Option<Comment>>;
    /// Fully hydrated record (author embedded), `None` when the row is gone.
    fn fetch_comment(&self, id: &str) -> Result<Option<Comment>>;
    fn insert_comment(&self, comment: &Comment) -> Result<()>;
    fn delete_comment(&self, id: &str) -> Result<()>;
}

pub trait ViewService: Send + Sync {
    fn record_view(&self, event: &ViewEvent) -> Result<()>;
}

pub trait ChangeFeed: Send + Sync {
    fn subscribe_comments(&self) -> Receiver<ChangeEvent>;
}

/// Fan-out point for the `comments` change feed. The transport adapter calls
/// [`ChannelFeed::publish`]; every subscriber gets its own copy.
#[derive(Default)]
pub struct ChannelFeed {
    subscribers: Mutex<Vec<Sender<ChangeEvent>>>,
}

impl ChannelFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: ChangeEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl ChangeFeed for ChannelFeed {
    fn subscribe_comments(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }
}

const COMMENT_SELECT: &str =
    "id,listing_id,profile_id,content,created_at,parent_comment_id,author:profiles(id,display_name,avatar_url)";

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub access_token: Option<String>,
    pub user_agent: String,
    pub http_client: Option<Client>,
}

/// Row-store client speaking a PostgREST-style REST dialect.
pub struct RestClient {
    base: Url,
    api_key: String,
    access_token: Option<String>,
    http: Client,
}

impl RestClient {
    pub fn new(cfg: ClientConfig) -> Result<Self> {
        if cfg.base_url.trim().is_empty() {
            bail!("backend: base url required");
        }
        let mut raw = cfg.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw).with_context(|| format!("backend: parse base url {raw}"))?;

        let http = if let Some(client) = cfg.http_client {
            client
        } else {
            let agent = if cfg.user_agent.trim().is_empty() {
                format!("homefeed/{}", crate::VERSION)
            } else {
                cfg.user_agent.clone()
            };
            Client::builder()
                .timeout(Duration::from_secs(15))
                .user_agent(agent)
                .build()
                .context("backend: build http client")?
        };

        Ok(Self {
            base,
            api_key: cfg.api_key,
            access_token: cfg.access_token,
            http,
        })
    }

    fn table_url(&self, table: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .base
            .join(&format!("rest/v1/{table}"))
            .with_context(|| format!("backend: build url for {table}"))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        builder
            .header("apikey", self.api_key.as_str())
            .bearer_auth(bearer)
    }

    fn fetch_rows(&self, url: Url) -> Result<Vec<Comment>> {
        let response = self
            .authorize(self.http.get(url))
            .send()
            .context("backend: request comments")?;
        let rows: Vec<CommentRow> = check(response)?
            .json()
            .context("backend: decode comment rows")?;
        Ok(rows.into_iter().map(Comment::from).collect())
    }

    fn insert_row<T: Serialize>(&self, table: &str, body: &T) -> Result<()> {
        let url = self.table_url(table, &[])?;
        let response = self
            .authorize(self.http.post(url))
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .with_context(|| format!("backend: insert into {table}"))?;
        check(response)?;
        Ok(())
    }
}

fn check(response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().unwrap_or_default();
    Err(anyhow!("backend: request failed: {} - {}", status, body))
}

fn parse_content_range_total(value: &str) -> Option<usize> {
    value.rsplit('/').next()?.trim().parse().ok()
}

impl CommentService for RestClient {
    fn list_roots(&self, listing_id: &str) -> Result<Vec<Comment>> {
        let listing = format!("eq.{listing_id}");
        let url = self.table_url(
            "comments",
            &[
                ("select", COMMENT_SELECT),
                ("listing_id", listing.as_str()),
                ("parent_comment_id", "is.null"),
                ("order", "created_at.desc"),
            ],
        )?;
        self.fetch_rows(url).context("backend: list root comments")
    }

    fn list_replies(&self, root_id: &str) -> Result<Vec<Comment>> {
        let parent = format!("eq.{root_id}");
        let url = self.table_url(
            "comments",
            &[
                ("select", COMMENT_SELECT),
                ("parent_comment_id", parent.as_str()),
                ("order", "created_at.asc"),
            ],
        )?;
        self.fetch_rows(url).context("backend: list replies")
    }

    fn count_replies(&self, root_id: &str) -> Result<usize> {
        let parent = format!("eq.{root_id}");
        let url = self.table_url(
            "comments",
            &[("select", "id"), ("parent_comment_id", parent.as_str())],
        )?;
        let response = self
            .authorize(self.http.head(url))
            .header("Prefer", "count=exact")
            .send()
            .context("backend: count replies")?;
        let response = check(response)?;
        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|val| val.to_str().ok())
            .and_then(parse_content_range_total)
            .context("backend: reply count missing from content-range")
    }

    fn first_reply(&self, root_id: &str) -> Result<Option<Comment>> {
        let parent = format!("eq.{root_id}");
        let url = self.table_url(
            "comments",
            &[
                ("select", COMMENT_SELECT),
                ("parent_comment_id", parent.as_str()),
                ("order", "created_at.asc"),
                ("limit", "1"),
            ],
        )?;
        Ok(self
            .fetch_rows(url)
            .context("backend: first reply")?
            .into_iter()
            .next())
    }

    fn fetch_comment(&self, id: &str) -> Result<Option<Comment>> {
        let filter = format!("eq.{id}");
        let url = self.table_url(
            "comments",
            &[("select", COMMENT_SELECT), ("id", filter.as_str()), ("limit", "1")],
        )?;
        Ok(self
            .fetch_rows(url)
            .context("backend: fetch comment")?
            .into_iter()
            .next())
    }

    fn insert_comment(&self, comment: &Comment) -> Result<()> {
        self.insert_row("comments", &CommentRow::from(comment))
    }

    fn delete_comment(&self, id: &str) -> Result<()> {
        let filter = format!("eq.{id}");
        let url = self.table_url("comments", &[("id", filter.as_str())])?;
        let response = self
            .authorize(self.http.delete(url))
            .send()
            .context("backend: delete comment")?;
        check(response)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct ViewRow<'a> {
    listing_id: &'a str,
    source: ViewSource,
    duration_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    viewer_id: Option<&'a str>,
}

impl ViewService for RestClient {
    fn record_view(&self, event: &ViewEvent) -> Result<()> {
        self.insert_row(
            "listing_views",
            &ViewRow {
                listing_id: &event.listing_id,
                source: event.source,
                duration_seconds: event.duration_seconds,
                viewer_id: event.viewer_id.as_deref(),
            },
        )
    }
}

#[derive(Default)]
struct MemoryState {
    rows: Vec<Comment>,
    authors: HashMap<String, Author>,
    views: Vec<ViewEvent>,
    offline: bool,
}

/// In-process row store. Every write is echoed on the change feed, the same
/// way the hosted store echoes a client's own mutations.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    feed: ChannelFeed,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_author(&self, author: Author) {
        self.state.lock().authors.insert(author.id.clone(), author);
    }

    /// Stores a row without emitting a change event.
    pub fn seed(&self, comment: Comment) {
        self.state.lock().rows.push(comment);
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn recorded_views(&self) -> Vec<ViewEvent> {
        self.state.lock().views.clone()
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().rows.len()
    }

    /// Simulates another client editing a row.
    pub fn update_remote(&self, id: &str, content: &str) -> Option<Comment> {
        let updated = {
            let mut state = self.state.lock();
            let row = state.rows.iter_mut().find(|row| row.id == id)?;
            row.content = content.to_string();
            row.clone()
        };
        self.feed.publish(ChangeEvent::update(&updated));
        Some(updated)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.state.lock().offline {
            bail!("backend: offline");
        }
        Ok(())
    }

    fn hydrate(state: &MemoryState, comment: &Comment) -> Comment {
        let mut comment = comment.clone();
        if comment.author.is_none() {
            comment.author = state.authors.get(&comment.author_id).cloned();
        }
        comment
    }

    fn sorted_replies(state: &MemoryState, root_id: &str) -> Vec<Comment> {
        let mut replies: Vec<Comment> = state
            .rows
            .iter()
            .filter(|row| row.parent_comment_id.as_deref() == Some(root_id))
            .map(|row| Self::hydrate(state, row))
            .collect();
        replies.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        replies
    }
}

impl CommentService for MemoryBackend {
    fn list_roots(&self, listing_id: &str) -> Result<Vec<Comment>> {
        self.ensure_online()?;
        let state = self.state.lock();
        let mut roots: Vec<Comment> = state
            .rows
            .iter()
            .filter(|row| row.listing_id == listing_id && row.is_root())
            .map(|row| Self::hydrate(&state, row))
            .collect();
        roots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(roots)
    }

    fn list_replies(&self, root_id: &str) -> Result<Vec<Comment>> {
        self.ensure_online()?;
        Ok(Self::sorted_replies(&self.state.lock(), root_id))
    }

    fn count_replies(&self, root_id: &str) -> Result<usize> {
        self.ensure_online()?;
        let state = self.state.lock();
        Ok(state
            .rows
            .iter()
            .filter(|row| row.parent_comment_id.as_deref() == Some(root_id))
            .count())
    }

    fn first_reply(&self, root_id: &str) -> Result<Option<Comment>> {
        self.ensure_online()?;
        Ok(Self::sorted_replies(&self.state.lock(), root_id)
            .into_iter()
            .next())
    }

    fn fetch_comment(&self, id: &str) -> Result<Option<Comment>> {
        self.ensure_online()?;
        let state = self.state.lock();
        Ok(state
            .rows
            .iter()
            .find(|row| row.id == id)
            .map(|row| Self::hydrate(&state, row)))
    }

    fn insert_comment(&self, comment: &Comment) -> Result<()> {
        self.ensure_online()?;
        let stored = {
            let mut state = self.state.lock();
            if state.rows.iter().any(|row| row.id == comment.id) {
                bail!("backend: duplicate comment id {}", comment.id);
            }
            let mut stored = comment.clone();
            stored.author = None;
            if stored.created_at.timestamp() == 0 {
                stored.created_at = Utc::now();
            }
            state.rows.push(stored.clone());
            stored
        };
        self.feed.publish(ChangeEvent::insert(&stored));
        Ok(())
    }

    fn delete_comment(&self, id: &str) -> Result<()> {
        self.ensure_online()?;
        let removed: Vec<String> = {
            let mut state = self.state.lock();
            let mut removed = Vec::new();
            state.rows.retain(|row| {
                let cascade = row.id == id || row.parent_comment_id.as_deref() == Some(id);
                if cascade {
                    removed.push(row.id.clone());
                }
                !cascade
            });
            removed
        };
        for removed_id in removed {
            self.feed.publish(ChangeEvent::delete(&removed_id));
        }
        Ok(())
    }
}

impl ViewService for MemoryBackend {
    fn record_view(&self, event: &ViewEvent) -> Result<()> {
        self.ensure_online()?;
        self.state.lock().views.push(event.clone());
        Ok(())
    }
}

impl ChangeFeed for MemoryBackend {
    fn subscribe_comments(&self) -> Receiver<ChangeEvent> {
        self.feed.subscribe_comments()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::ChangeKind;
    use chrono::TimeZone;

    fn comment(id: &str, parent: Option<&str>, secs: i64) -> Comment {
        Comment {
            id: id.into(),
            listing_id: "l1".into(),
            author_id: "p1".into(),
            author: None,
            content: format!("body {id}"),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            parent_comment_id: parent.map(str::to_string),
        }
    }

    #[test]
    fn content_range_total() {
        assert_eq!(parse_content_range_total("0-0/3"), Some(3));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn rest_client_builds_filtered_urls() {
        let client = RestClient::new(ClientConfig {
            base_url: "https://db.example.com".into(),
            api_key: "anon".into(),
            ..ClientConfig::default()
        })
        .unwrap();
        let url = client
            .table_url("comments", &[("listing_id", "eq.l 1")])
            .unwrap();
        assert_eq!(url.path(), "/rest/v1/comments");
        assert_eq!(url.query(), Some("listing_id=eq.l+1"));
    }

    #[test]
    fn memory_orders_roots_and_replies() {
        let backend = MemoryBackend::new();
        backend.seed(comment("r1", None, 1));
        backend.seed(comment("r2", None, 5));
        backend.seed(comment("a2", Some("r1"), 9));
        backend.seed(comment("a1", Some("r1"), 7));

        let roots = backend.list_roots("l1").unwrap();
        assert_eq!(roots[0].id, "r2");
        let replies = backend.list_replies("r1").unwrap();
        assert_eq!(replies[0].id, "a1");
        assert_eq!(backend.count_replies("r1").unwrap(), 2);
        assert_eq!(backend.first_reply("r1").unwrap().unwrap().id, "a1");
    }

    #[test]
    fn memory_echoes_writes() {
        let backend = MemoryBackend::new();
        let rx = backend.subscribe_comments();
        backend.insert_comment(&comment("r1", None, 1)).unwrap();
        backend.insert_comment(&comment("a1", Some("r1"), 2)).unwrap();
        backend.delete_comment("r1").unwrap();

        let kinds: Vec<ChangeKind> = rx.try_iter().map(|event| event.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChangeKind::Insert,
                ChangeKind::Insert,
                ChangeKind::Delete,
                ChangeKind::Delete
            ]
        );
        assert_eq!(backend.row_count(), 0);
    }

    #[test]
    fn memory_hydrates_registered_authors() {
        let backend = MemoryBackend::new();
        backend.register_author(Author {
            id: "p1".into(),
            display_name: "Priya".into(),
            avatar_url: None,
        });
        backend.seed(comment("r1", None, 1));
        backend.insert_comment(&comment("a1", Some("r1"), 2)).unwrap();

        let root = backend.fetch_comment("r1").unwrap().unwrap();
        assert_eq!(root.author.map(|a| a.display_name).as_deref(), Some("Priya"));
        let reply = backend.first_reply("r1").unwrap().unwrap();
        assert_eq!(reply.author.map(|a| a.id).as_deref(), Some("p1"));
    }

    #[test]
    fn offline_backend_fails() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        assert!(backend.list_roots("l1").is_err());
        assert!(backend.insert_comment(&comment("r1", None, 1)).is_err());
    }
}
