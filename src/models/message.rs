use super::timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Sending,
    #[default]
    Sent,
    Delivered,
    Read,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Delivery {
    #[serde(default)]
    pub state: DeliveryState,
    #[serde(default)]
    pub retries: u32,
}

impl Delivery {
    pub fn sending() -> Self {
        Self {
            state: DeliveryState::Sending,
            retries: 0,
        }
    }

    pub fn sent() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub role: Role,
    pub content: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "super::null_as_default")]
    pub deleted: bool,
    #[serde(default, deserialize_with = "super::null_as_default")]
    pub delivery: Delivery,
    #[serde(
        default,
        deserialize_with = "super::null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub reactions: Vec<Reaction>,
    #[serde(
        default,
        deserialize_with = "super::null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    fn local(chat_id: &str, role: Role, content: &str, delivery: Delivery) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            user_id: None,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
            updated_at: None,
            deleted: false,
            delivery,
            reactions: Vec::new(),
            attachments: Vec::new(),
            metadata: None,
        }
    }

    pub fn user(chat_id: &str, content: &str) -> Self {
        Self::local(chat_id, Role::User, content, Delivery::sent())
    }

    pub fn assistant(chat_id: &str, content: &str) -> Self {
        Self::local(chat_id, Role::Assistant, content, Delivery::sent())
    }

    /// Empty assistant row that streamed chunks are appended to.
    pub fn placeholder(chat_id: &str) -> Self {
        Self::local(chat_id, Role::Assistant, "", Delivery::sending())
    }

    pub fn reaction_by(&self, user_id: &str) -> Option<&Reaction> {
        self.reactions.iter().find(|r| r.user_id == user_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl MessagePatch {
    pub fn soft_delete() -> Self {
        Self {
            content: None,
            deleted: Some(true),
            updated_at: Utc::now(),
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            deleted: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionType {
    ThumbsUp,
    ThumbsDown,
    Flag,
}

impl fmt::Display for ReactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReactionType::ThumbsUp => "thumbs_up",
            ReactionType::ThumbsDown => "thumbs_down",
            ReactionType::Flag => "flag",
        };
        f.write_str(name)
    }
}

impl FromStr for ReactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thumbs_up" | "like" | "up" => Ok(ReactionType::ThumbsUp),
            "thumbs_down" | "dislike" | "down" => Ok(ReactionType::ThumbsDown),
            "flag" => Ok(ReactionType::Flag),
            other => Err(format!("Unknown reaction type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: ReactionType,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Reaction {
    pub fn new(message_id: &str, user_id: &str, kind: ReactionType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            kind,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    /// Content address once uploaded, or a local object URL before that.
    pub reference: String,
    #[serde(default)]
    pub confirmed: bool,
}

impl Attachment {
    pub fn staged(name: &str, mime_type: &str, size: u64, reference: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            size,
            reference: reference.to_string(),
            confirmed: false,
        }
    }
}
