use serde::{Deserialize, Serialize};

use crate::model::Comment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Partial `comments` row as carried by the change feed. DELETE payloads
/// usually only carry the primary key, so everything else is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_comment_id: Option<String>,
}

impl From<&Comment> for ChangeRecord {
    fn from(comment: &Comment) -> Self {
        Self {
            id: comment.id.clone(),
            listing_id: Some(comment.listing_id.clone()),
            profile_id: Some(comment.author_id.clone()),
            content: Some(comment.content.clone()),
            created_at: Some(comment.created_at),
            parent_comment_id: comment.parent_comment_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub new: Option<ChangeRecord>,
    #[serde(default)]
    pub old: Option<ChangeRecord>,
}

impl ChangeEvent {
    pub fn insert(comment: &Comment) -> Self {
        Self {
            kind: ChangeKind::Insert,
            new: Some(comment.into()),
            old: None,
        }
    }

    pub fn update(comment: &Comment) -> Self {
        Self {
            kind: ChangeKind::Update,
            new: Some(comment.into()),
            old: Some(ChangeRecord {
                id: comment.id.clone(),
                ..ChangeRecord::default()
            }),
        }
    }

    pub fn delete(id: &str) -> Self {
        Self {
            kind: ChangeKind::Delete,
            new: None,
            old: Some(ChangeRecord {
                id: id.to_string(),
                ..ChangeRecord::default()
            }),
        }
    }

    /// The record the event is about: `new` for INSERT/UPDATE, `old` for DELETE.
    pub fn record(&self) -> Option<&ChangeRecord> {
        fn keyed(record: &Option<ChangeRecord>) -> Option<&ChangeRecord> {
            record.as_ref().filter(|r| !r.id.is_empty())
        }
        match self.kind {
            ChangeKind::Insert | ChangeKind::Update => keyed(&self.new).or_else(|| keyed(&self.old)),
            ChangeKind::Delete => keyed(&self.old).or_else(|| keyed(&self.new)),
        }
    }

    pub fn listing_id(&self) -> Option<&str> {
        self.new
            .as_ref()
            .and_then(|record| record.listing_id.as_deref())
            .or_else(|| self.old.as_ref().and_then(|r| r.listing_id.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_delete_with_key_only() {
        let raw = r#"{"eventType":"DELETE","new":null,"old":{"id":"c7"}}"#;
        let event: ChangeEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert_eq!(event.record().unwrap().id, "c7");
        assert_eq!(event.listing_id(), None);
    }

    #[test]
    fn parses_delete_with_empty_new_record() {
        let raw = r#"{"eventType":"DELETE","new":{},"old":{"id":"c7"}}"#;
        let event: ChangeEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.record().unwrap().id, "c7");

        let raw = r#"{"eventType":"INSERT","new":{},"old":{}}"#;
        let event: ChangeEvent = serde_json::from_str(raw).unwrap();
        assert!(event.record().is_none());
    }

    #[test]
    fn insert_exposes_listing() {
        let raw = r#"{
            "eventType": "INSERT",
            "new": {"id": "c1", "listing_id": "l1", "parent_comment_id": "r1"},
            "old": null
        }"#;
        let event: ChangeEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.listing_id(), Some("l1"));
        assert_eq!(
            event.record().unwrap().parent_comment_id.as_deref(),
            Some("r1")
        );
    }

    #[test]
    fn empty_id_has_no_record() {
        let raw = r#"{"eventType":"UPDATE","new":{"id":""},"old":null}"#;
        let event: ChangeEvent = serde_json::from_str(raw).unwrap();
        assert!(event.record().is_none());
    }
}
