use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Photo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub remote_url: String,
    #[serde(default)]
    pub listing_id: String,
    #[serde(default)]
    pub sequence_index: usize,
}

impl MediaItem {
    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }
}

/// One entry of the vertical feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub media: Vec<MediaItem>,
}

impl Listing {
    /// Fills in the back-references a feed page usually omits on nested media.
    pub fn normalized(mut self) -> Self {
        for (idx, item) in self.media.iter_mut().enumerate() {
            if item.listing_id.is_empty() {
                item.listing_id = self.id.clone();
            }
            item.sequence_index = idx;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub listing_id: String,
    pub author_id: String,
    #[serde(default)]
    pub author: Option<Author>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub parent_comment_id: Option<String>,
}

impl Comment {
    pub fn is_root(&self) -> bool {
        self.parent_comment_id.is_none()
    }
}

/// Row shape of the `comments` table, with the author embedded the way the
/// row API returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentRow {
    pub id: String,
    pub listing_id: String,
    pub profile_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub parent_comment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
}

impl From<CommentRow> for Comment {
    fn from(row: CommentRow) -> Self {
        Self {
            id: row.id,
            listing_id: row.listing_id,
            author_id: row.profile_id,
            author: row.author,
            content: row.content,
            created_at: row.created_at,
            parent_comment_id: row.parent_comment_id,
        }
    }
}

impl From<&Comment> for CommentRow {
    fn from(comment: &Comment) -> Self {
        Self {
            id: comment.id.clone(),
            listing_id: comment.listing_id.clone(),
            profile_id: comment.author_id.clone(),
            content: comment.content.clone(),
            created_at: comment.created_at,
            parent_comment_id: comment.parent_comment_id.clone(),
            author: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewSource {
    Feed,
    Search,
}

impl ViewSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ViewSource::Feed => "feed",
            ViewSource::Search => "search",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewEvent {
    pub listing_id: String,
    pub source: ViewSource,
    pub duration_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer_id: Option<String>,
}

/// A comment as the rendering layer sees it: server state plus the local like
/// overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentView {
    pub comment: Comment,
    pub reply_count: usize,
    pub liked: bool,
    pub like_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_maps_profile_to_author_id() {
        let raw = r#"{
            "id": "c1",
            "listing_id": "l1",
            "profile_id": "p1",
            "content": "Nice kitchen",
            "created_at": "2024-05-01T10:00:00Z",
            "parent_comment_id": null,
            "author": {"id": "p1", "display_name": "Dana"}
        }"#;
        let row: CommentRow = serde_json::from_str(raw).unwrap();
        let comment = Comment::from(row);
        assert_eq!(comment.author_id, "p1");
        assert!(comment.is_root());
        assert_eq!(comment.author.unwrap().display_name, "Dana");
    }

    #[test]
    fn normalized_listing_backfills_media() {
        let listing = Listing {
            id: "l9".into(),
            title: String::new(),
            media: vec![
                MediaItem {
                    id: "m1".into(),
                    kind: MediaKind::Photo,
                    remote_url: "https://cdn.example/a.jpg".into(),
                    listing_id: String::new(),
                    sequence_index: 7,
                },
                MediaItem {
                    id: "m2".into(),
                    kind: MediaKind::Video,
                    remote_url: "https://cdn.example/b.mp4".into(),
                    listing_id: String::new(),
                    sequence_index: 0,
                },
            ],
        }
        .normalized();
        assert_eq!(listing.media[0].listing_id, "l9");
        assert_eq!(listing.media[0].sequence_index, 0);
        assert_eq!(listing.media[1].sequence_index, 1);
    }
}
