use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{ChangeFeed, ClientConfig, CommentService, MemoryBackend, RestClient, ViewService};
use crate::comments::{LoadStatus, ReconcileOutcome};
use crate::config::{self, Config};
use crate::likes::LikeState;
use crate::media::{self, MountDecision};
use crate::model::{Author, CommentView, Listing, ViewEvent};
use crate::realtime::ChangeEvent;
use crate::session::{FeedSession, Parts};
use crate::storage::{self, BlobStore};
use crate::views::{MemorySink, ServiceSink, TeeSink, ViewDwellTracker};

const LOCAL_VIEWER: &str = "local";

/// One line of replay input. `at_ms` is the offset from the start of the
/// replay; when omitted the previous line's offset is reused.
#[derive(Debug, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub at_ms: Option<u64>,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Feed {
        listings: Vec<Listing>,
    },
    Activate {
        index: Option<usize>,
    },
    Media {
        listing_id: String,
        index: usize,
    },
    Scroll {
        velocity: f64,
    },
    Tick {
        /// Block until pending downloads finish before ticking.
        #[serde(default)]
        wait_downloads: bool,
    },
    Search {
        listing_id: String,
        visible: f64,
    },
    LeaveSearch,
    Comments {
        listing_id: String,
    },
    CloseComments,
    Replies {
        root_id: String,
    },
    Comment {
        content: String,
        #[serde(default)]
        parent_id: Option<String>,
    },
    Delete {
        id: String,
    },
    Like {
        comment_id: String,
    },
    /// Applies `event` when given, otherwise drains the change feed.
    Realtime {
        #[serde(default)]
        event: Option<ChangeEvent>,
    },
    Blur,
    Focus,
    Teardown,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Output {
    View(ViewEvent),
    Mount {
        at_ms: u64,
        decisions: Vec<MountDecision>,
    },
    Comments {
        listing_id: Option<String>,
        status: LoadStatus,
        total: usize,
        comments: Vec<CommentView>,
    },
    Like {
        comment_id: String,
        state: LikeState,
    },
    Reconcile {
        outcomes: Vec<ReconcileOutcome>,
    },
    Error {
        line: usize,
        message: String,
    },
}

pub fn run(input: Option<PathBuf>) -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let sink = MemorySink::new();
    let mut session = build_session(&cfg, sink.clone())?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match input {
        Some(path) => {
            let file = File::open(&path)
                .with_context(|| format!("open replay file {}", path.display()))?;
            replay(&mut session, &sink, BufReader::new(file), &mut out)
        }
        None => {
            let stdin = io::stdin();
            let reader = stdin.lock();
            replay(&mut session, &sink, reader, &mut out)
        }
    }
}

fn build_session(cfg: &Config, sink: MemorySink) -> Result<FeedSession> {
    let store = Arc::new(
        storage::Store::open(storage::Options {
            path: cfg.storage.path.clone(),
        })
        .context("open storage")?,
    );

    let comments: Arc<dyn CommentService>;
    let views: Arc<dyn ViewService>;
    let mut changes = None;
    let mut viewer_id = cfg.backend.viewer_id.clone();
    if cfg.backend.base_url.trim().is_empty() {
        info!("backend: no base url configured, using in-process store");
        let backend = Arc::new(MemoryBackend::new());
        changes = Some(backend.subscribe_comments());
        viewer_id.get_or_insert_with(|| LOCAL_VIEWER.to_string());
        comments = backend.clone();
        views = backend;
    } else {
        let client = Arc::new(
            RestClient::new(ClientConfig {
                base_url: cfg.backend.base_url.clone(),
                api_key: cfg.backend.api_key.clone(),
                access_token: cfg.backend.access_token.clone(),
                user_agent: cfg.backend.user_agent.clone(),
                http_client: None,
            })
            .context("create backend client")?,
        );
        comments = client.clone();
        views = client;
    }

    let viewer = viewer_id.map(|id| Author {
        display_name: id.clone(),
        id,
        avatar_url: None,
    });

    let tracker = ViewDwellTracker::new(
        cfg.views.threshold,
        Box::new(TeeSink::new(vec![
            Box::new(sink),
            Box::new(ServiceSink::new(views)),
        ])),
    )
    .with_search_visibility(cfg.views.search_visibility);

    let media = media::Manager::new(cfg.media.to_manager_config()).context("start media cache")?;

    let blobs: Arc<dyn BlobStore> = store;
    Ok(FeedSession::new(Parts {
        media,
        views: tracker,
        comments,
        blobs,
        changes,
        viewer,
    }))
}

/// Drives `session` from JSON-lines `input`, writing JSON-lines results to
/// `out`. Malformed lines and failed operations are reported inline and do not
/// stop the replay. The session is torn down at end of input.
pub fn replay<R, W>(session: &mut FeedSession, sink: &MemorySink, input: R, out: &mut W) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    let start = Instant::now();
    let mut at_ms = 0u64;
    let mut torn_down = false;

    for (idx, line) in input.lines().enumerate() {
        let line = line.context("read replay input")?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let step: Step = match serde_json::from_str(trimmed) {
            Ok(step) => step,
            Err(err) => {
                emit(
                    out,
                    &Output::Error {
                        line: idx + 1,
                        message: format!("parse: {err}"),
                    },
                )?;
                continue;
            }
        };
        if let Some(offset) = step.at_ms {
            at_ms = at_ms.max(offset);
        }
        let now = start + Duration::from_millis(at_ms);
        debug!(line = idx + 1, at_ms, "replay: step");

        torn_down = matches!(step.command, Command::Teardown);
        let outputs = apply(session, step.command, at_ms, now, idx + 1);
        for output in outputs {
            emit(out, &output)?;
        }
        for event in sink.take() {
            emit(out, &Output::View(event))?;
        }
    }

    if !torn_down {
        session.teardown(start + Duration::from_millis(at_ms));
        for event in sink.take() {
            emit(out, &Output::View(event))?;
        }
    }
    out.flush().context("flush replay output")?;
    Ok(())
}

fn apply(
    session: &mut FeedSession,
    command: Command,
    at_ms: u64,
    now: Instant,
    line: usize,
) -> Vec<Output> {
    let mount = |decisions: Vec<MountDecision>| Output::Mount { at_ms, decisions };
    match command {
        Command::Feed { listings } => vec![mount(session.set_feed(listings, now))],
        Command::Activate { index } => vec![mount(session.set_active_listing(index, now))],
        Command::Media { listing_id, index } => {
            vec![mount(session.set_active_media(&listing_id, index, now))]
        }
        Command::Scroll { velocity } => session
            .on_scroll_velocity_change(velocity, now)
            .map(mount)
            .into_iter()
            .collect(),
        Command::Tick { wait_downloads } => {
            if wait_downloads {
                session.wait_for_downloads(Duration::from_secs(30));
                return vec![mount(session.plan(now))];
            }
            session.tick(now).map(mount).into_iter().collect()
        }
        Command::Search {
            listing_id,
            visible,
        } => {
            session.set_search_visibility(&listing_id, visible, now);
            Vec::new()
        }
        Command::LeaveSearch => {
            session.leave_search(now);
            Vec::new()
        }
        Command::Comments { listing_id } => {
            let status = session.open_comments(&listing_id);
            vec![snapshot(session, status)]
        }
        Command::CloseComments => {
            session.close_comments();
            Vec::new()
        }
        Command::Replies { root_id } => {
            let status = session.load_replies(&root_id);
            vec![snapshot(session, status)]
        }
        Command::Comment { content, parent_id } => {
            match session.add_comment(&content, parent_id.as_deref()) {
                Ok(_) => vec![snapshot(session, LoadStatus::Loaded)],
                Err(err) => vec![
                    error(line, format!("comment: {err:#}")),
                    snapshot(session, LoadStatus::Loaded),
                ],
            }
        }
        Command::Delete { id } => match session.delete_comment(&id) {
            Ok(()) => vec![snapshot(session, LoadStatus::Loaded)],
            Err(err) => vec![error(line, format!("delete: {err:#}"))],
        },
        Command::Like { comment_id } => match session.toggle_like(&comment_id) {
            Some(state) => vec![Output::Like { comment_id, state }],
            None => vec![error(line, "like: no comments panel open".to_string())],
        },
        Command::Realtime { event } => {
            let outcomes = match event {
                Some(event) => vec![session.reconcile(&event)],
                None => session.pump_realtime(),
            };
            vec![
                Output::Reconcile { outcomes },
                snapshot(session, LoadStatus::Loaded),
            ]
        }
        Command::Blur => {
            session.blur(now);
            Vec::new()
        }
        Command::Focus => {
            session.focus(now);
            Vec::new()
        }
        Command::Teardown => {
            session.teardown(now);
            Vec::new()
        }
    }
}

fn snapshot(session: &FeedSession, status: LoadStatus) -> Output {
    Output::Comments {
        listing_id: session.comments().listing_id().map(str::to_string),
        status,
        total: session.comments().total_count(),
        comments: session.comment_views(),
    }
}

fn error(line: usize, message: String) -> Output {
    Output::Error { line, message }
}

fn emit<W: Write>(out: &mut W, output: &Output) -> Result<()> {
    serde_json::to_writer(&mut *out, output).context("encode replay output")?;
    out.write_all(b"\n").context("write replay output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;
    use crate::views::DEFAULT_THRESHOLD;
    use tempfile::tempdir;

    fn session(dir: &std::path::Path, sink: MemorySink) -> FeedSession {
        let backend = Arc::new(MemoryBackend::new());
        let changes = backend.subscribe_comments();
        FeedSession::new(Parts {
            media: media::Manager::new(media::Config {
                cache_dir: Some(dir.to_path_buf()),
                ..media::Config::default()
            })
            .unwrap(),
            views: ViewDwellTracker::new(DEFAULT_THRESHOLD, Box::new(sink)),
            comments: backend,
            blobs: Arc::new(MemoryBlobStore::new()),
            changes: Some(changes),
            viewer: Some(Author {
                id: "me".into(),
                display_name: "Me".into(),
                avatar_url: None,
            }),
        })
    }

    fn run_lines(input: &str) -> Vec<serde_json::Value> {
        let dir = tempdir().unwrap();
        let sink = MemorySink::new();
        let mut session = session(dir.path(), sink.clone());
        let mut out = Vec::new();
        replay(&mut session, &sink, input.as_bytes(), &mut out).unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn dwell_is_reported_between_steps() {
        let lines = run_lines(
            r#"{"op":"feed","at_ms":0,"listings":[{"id":"a","media":[]},{"id":"b","media":[]}]}
{"op":"activate","index":0}
{"op":"activate","at_ms":1600,"index":1}
{"op":"activate","at_ms":1900,"index":null}
"#,
        );
        let views: Vec<&serde_json::Value> =
            lines.iter().filter(|line| line["kind"] == "view").collect();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0]["listing_id"], "a");
        assert_eq!(views[0]["source"], "feed");
        assert_eq!(views[0]["duration_seconds"], 2);
    }

    #[test]
    fn bad_lines_are_reported_and_skipped() {
        let lines = run_lines(
            "not json\n# comment\n{\"op\":\"like\",\"comment_id\":\"c1\"}\n",
        );
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "error");
        assert_eq!(lines[0]["line"], 1);
        assert_eq!(lines[1]["kind"], "error");
        assert_eq!(lines[1]["line"], 3);
    }

    #[test]
    fn comment_round_trip_through_change_feed() {
        let lines = run_lines(
            r#"{"op":"comments","listing_id":"a"}
{"op":"comment","content":"Great view"}
{"op":"realtime"}
"#,
        );
        let reconcile = lines
            .iter()
            .find(|line| line["kind"] == "reconcile")
            .unwrap();
        assert_eq!(reconcile["outcomes"], serde_json::json!(["duplicate"]));
        let last = lines.iter().rev().find(|l| l["kind"] == "comments").unwrap();
        assert_eq!(last["total"], 1);
        assert_eq!(last["comments"][0]["comment"]["content"], "Great view");
    }
}
