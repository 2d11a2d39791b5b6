//! Remote persistence and auth.
//!
//! Chats, messages, reactions, attachments, tasks and profiles live behind
//! the [`Persistence`] trait. [`RestPersistence`] talks to a PostgREST-style
//! API; [`MemoryPersistence`] keeps everything in process.

use crate::models::{
    Attachment, Chat, ChatPatch, Message, MessagePatch, NewTask, Profile, Reaction, ReactionType,
    Session, Task, TaskPatch, timestamp,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use tokio::{sync::mpsc, task::AbortHandle};

mod memory;
mod rest;

pub use memory::MemoryPersistence;
pub use rest::RestPersistence;

pub const SUBSCRIPTION_CAPACITY: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("No active session")]
    Unauthenticated,
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Parse(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Chats,
    Messages,
    Reactions,
    Attachments,
    Tasks,
    Profiles,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Chats => "chats",
            Table::Messages => "messages",
            Table::Reactions => "reactions",
            Table::Attachments => "attachments",
            Table::Tasks => "tasks",
            Table::Profiles => "profiles",
        }
    }

    /// Columns that move when a row is written, checked by the poller.
    pub fn stamp_columns(self) -> &'static [&'static str] {
        match self {
            Table::Chats | Table::Messages | Table::Tasks => &["created_at", "updated_at"],
            Table::Reactions | Table::Attachments | Table::Profiles => &["created_at"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change. Deletes may carry nothing but the row's `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub record: serde_json::Value,
}

impl ChangeEvent {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PersistenceError> {
        Ok(serde_json::from_value(self.record.clone())?)
    }

    pub fn record_id(&self) -> Option<&str> {
        self.record.get("id").and_then(|v| v.as_str())
    }
}

/// Live change feed for one table.
pub struct Subscription {
    rx: mpsc::Receiver<ChangeEvent>,
    handle: AbortHandle,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<ChangeEvent>, handle: AbortHandle) -> Self {
        Self { rx, handle }
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    pub fn into_parts(self) -> (mpsc::Receiver<ChangeEvent>, Unsubscribe) {
        (self.rx, Unsubscribe::new(self.handle))
    }
}

/// Stops a running subscription. Dropping it leaves the feed running; the
/// owner has to call [`Unsubscribe::unsubscribe`].
#[derive(Debug)]
pub struct Unsubscribe {
    handles: Vec<AbortHandle>,
}

impl Unsubscribe {
    pub fn new(handle: AbortHandle) -> Self {
        Self {
            handles: vec![handle],
        }
    }

    pub fn also(mut self, handle: AbortHandle) -> Self {
        self.handles.push(handle);
        self
    }

    pub fn unsubscribe(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn session(&self) -> Result<Option<Session>, PersistenceError>;

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, PersistenceError>;

    async fn list_chats(&self, user_id: &str) -> Result<Vec<Chat>, PersistenceError>;

    async fn insert_chat(&self, chat: &Chat) -> Result<Chat, PersistenceError>;

    async fn update_chat(&self, chat_id: &str, patch: &ChatPatch)
    -> Result<Chat, PersistenceError>;

    async fn delete_chat(&self, chat_id: &str) -> Result<(), PersistenceError>;

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, PersistenceError>;

    async fn insert_message(&self, message: &Message) -> Result<Message, PersistenceError>;

    async fn update_message(
        &self,
        message_id: &str,
        patch: &MessagePatch,
    ) -> Result<Message, PersistenceError>;

    async fn list_reactions(
        &self,
        message_ids: &[String],
    ) -> Result<Vec<Reaction>, PersistenceError>;

    async fn find_reaction(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> Result<Option<Reaction>, PersistenceError>;

    async fn insert_reaction(&self, reaction: &Reaction) -> Result<Reaction, PersistenceError>;

    async fn update_reaction(
        &self,
        reaction_id: &str,
        kind: ReactionType,
    ) -> Result<Reaction, PersistenceError>;

    async fn delete_reaction(&self, reaction_id: &str) -> Result<(), PersistenceError>;

    async fn upload_attachment(
        &self,
        attachment: &Attachment,
    ) -> Result<Attachment, PersistenceError>;

    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>, PersistenceError>;

    async fn insert_task(&self, task: &NewTask) -> Result<Task, PersistenceError>;

    async fn update_task(&self, task_id: &str, patch: &TaskPatch)
    -> Result<Task, PersistenceError>;

    async fn subscribe(&self, table: Table) -> Result<Subscription, PersistenceError>;
}

/// Incremental view of a polled table.
///
/// Remembers the change stamp of every row it has reported, so a poll only
/// needs the rows stamped at or after [`PollCursor::since`] plus the list of
/// live ids for the deletion sweep.
#[derive(Debug)]
pub(crate) struct PollCursor {
    table: Table,
    seen: HashMap<String, Option<DateTime<Utc>>>,
    since: Option<DateTime<Utc>>,
}

impl PollCursor {
    pub(crate) fn new(table: Table) -> Self {
        Self {
            table,
            seen: HashMap::new(),
            since: None,
        }
    }

    /// Records the current rows without reporting them.
    pub(crate) fn seed(&mut self, rows: Vec<serde_json::Value>) {
        for row in rows {
            if let Some(id) = row_id(&row) {
                let stamp = self.stamp_of(&row);
                self.advance(stamp);
                self.seen.insert(id, stamp);
            }
        }
    }

    /// Filter selecting rows created or updated since the newest stamp seen.
    /// `None` until a stamped row has been seen.
    pub(crate) fn filter(&self) -> Option<(&'static str, String)> {
        let since = self.since?.to_rfc3339_opts(SecondsFormat::Micros, true);
        Some(match self.table.stamp_columns() {
            [column] => (*column, format!("gte.{}", since)),
            columns => {
                let clauses: Vec<String> = columns
                    .iter()
                    .map(|c| format!("{}.gte.{}", c, since))
                    .collect();
                ("or", format!("({})", clauses.join(",")))
            }
        })
    }

    /// Events for rows that are new or restamped since the last call.
    pub(crate) fn changed(&mut self, rows: Vec<serde_json::Value>) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        for row in rows {
            let Some(id) = row_id(&row) else {
                continue;
            };
            let stamp = self.stamp_of(&row);
            let kind = match self.seen.get(&id) {
                None => ChangeKind::Insert,
                Some(previous) if stamp > *previous => ChangeKind::Update,
                Some(_) => continue,
            };
            self.advance(stamp);
            self.seen.insert(id, stamp);
            events.push(ChangeEvent {
                table: self.table,
                kind,
                record: row,
            });
        }
        events
    }

    /// Delete events for reported rows missing from `live_ids`.
    pub(crate) fn removed(&mut self, live_ids: &HashSet<String>) -> Vec<ChangeEvent> {
        let gone: Vec<String> = self
            .seen
            .keys()
            .filter(|id| !live_ids.contains(*id))
            .cloned()
            .collect();
        gone.into_iter()
            .map(|id| {
                self.seen.remove(&id);
                ChangeEvent {
                    table: self.table,
                    kind: ChangeKind::Delete,
                    record: serde_json::json!({ "id": id }),
                }
            })
            .collect()
    }

    fn stamp_of(&self, row: &serde_json::Value) -> Option<DateTime<Utc>> {
        self.table
            .stamp_columns()
            .iter()
            .filter_map(|c| row.get(*c)?.as_str().and_then(timestamp::parse))
            .max()
    }

    fn advance(&mut self, stamp: Option<DateTime<Utc>>) {
        self.since = self.since.max(stamp);
    }
}

fn row_id(row: &serde_json::Value) -> Option<String> {
    Some(row.get("id")?.as_str()?.to_string())
}
