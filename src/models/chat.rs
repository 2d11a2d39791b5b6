use super::{Message, timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    #[default]
    Active,
    Archived,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatMetadata {
    #[serde(default)]
    pub message_count: u32,
    #[serde(default)]
    pub token_count: u64,
    #[serde(default, with = "timestamp::option")]
    pub last_activity: Option<DateTime<Utc>>,
}

impl ChatMetadata {
    /// Token usage is estimated at four characters per token.
    pub fn record(&mut self, message: &Message) {
        self.message_count += 1;
        self.token_count += message.content.chars().count() as u64 / 4;
        self.last_activity = Some(message.created_at.max(self.last_activity.unwrap_or_default()));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: ChatStatus,
    #[serde(default, deserialize_with = "super::null_as_default")]
    pub bookmarked: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default, deserialize_with = "super::null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "super::null_as_default")]
    pub metadata: ChatMetadata,
}

impl Chat {
    pub fn new(title: &str, user_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            user_id,
            created_at: now,
            updated_at: Some(now),
            status: ChatStatus::Active,
            bookmarked: false,
            model: None,
            system_prompt: None,
            tags: Vec::new(),
            metadata: ChatMetadata::default(),
        }
    }

    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_CHAT_TITLE
    }

    /// Most recent activity, falling back to the row timestamps.
    pub fn last_active(&self) -> DateTime<Utc> {
        self.metadata
            .last_activity
            .or(self.updated_at)
            .unwrap_or(self.created_at)
    }

    pub fn apply(&mut self, patch: &ChatPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(bookmarked) = patch.bookmarked {
            self.bookmarked = bookmarked;
        }
        self.updated_at = Some(patch.updated_at);
    }
}

/// Partial update for a chat row. Unset fields are left untouched.
#[derive(Debug, Clone, Serialize)]
pub struct ChatPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ChatStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bookmarked: Option<bool>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl Default for ChatPatch {
    fn default() -> Self {
        Self {
            title: None,
            status: None,
            bookmarked: None,
            updated_at: Utc::now(),
        }
    }
}

impl ChatPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn status(status: ChatStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn bookmarked(bookmarked: bool) -> Self {
        Self {
            bookmarked: Some(bookmarked),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_backend_row_without_client_fields() {
        let row = serde_json::json!({
            "id": "c1",
            "title": "New Chat",
            "user_id": "u1",
            "created_at": "2025-01-02T03:04:05.000001",
            "updated_at": "2025-01-02T03:04:05.000001",
            "model": "gemini-1.5-flash",
            "tags": [],
            "bookmarked": false,
            "archived": false,
            "version": 1
        });
        let chat: Chat = serde_json::from_value(row).unwrap();
        assert_eq!(chat.status, ChatStatus::Active);
        assert!(chat.has_default_title());
        assert_eq!(chat.metadata.message_count, 0);
    }

    #[test]
    fn null_tags_and_metadata_read_as_defaults() {
        let row = serde_json::json!({
            "id": "c2",
            "title": "Cleanup",
            "user_id": "u1",
            "created_at": "2025-01-02T03:04:05.000001",
            "tags": null,
            "metadata": null,
            "bookmarked": null
        });
        let chat: Chat = serde_json::from_value(row).unwrap();
        assert!(chat.tags.is_empty());
        assert!(!chat.bookmarked);
        assert_eq!(chat.metadata, ChatMetadata::default());
    }

    #[test]
    fn patch_serializes_only_set_fields() {
        let value = serde_json::to_value(ChatPatch::bookmarked(true)).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(object["bookmarked"], true);
        assert!(object.contains_key("updated_at"));
    }
}
