use super::{
    ChangeEvent, ChangeKind, Persistence, PersistenceError, SUBSCRIPTION_CAPACITY, Subscription,
    Table,
};
use crate::models::{
    Attachment, Chat, ChatPatch, Message, MessagePatch, NewTask, Profile, Reaction, ReactionType,
    Session, Task, TaskPatch,
};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

#[derive(Default)]
struct Tables {
    chats: Vec<Chat>,
    messages: Vec<Message>,
    reactions: Vec<Reaction>,
    attachments: Vec<Attachment>,
    tasks: Vec<Task>,
    profiles: Vec<Profile>,
}

/// In-process tables with a broadcast change feed.
pub struct MemoryPersistence {
    tables: Mutex<Tables>,
    session: Mutex<Option<Session>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(SUBSCRIPTION_CAPACITY);
        Self {
            tables: Mutex::new(Tables::default()),
            session: Mutex::new(None),
            changes,
        }
    }

    pub fn with_session(session: Session) -> Self {
        let persistence = Self::new();
        persistence.set_session(Some(session));
        persistence
    }

    pub fn set_session(&self, session: Option<Session>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }

    pub fn add_profile(&self, profile: Profile) {
        self.tables().profiles.push(profile);
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, table: Table, kind: ChangeKind, record: &impl Serialize) {
        let Ok(record) = serde_json::to_value(record) else {
            return;
        };
        // No receivers is fine.
        let _ = self.changes.send(ChangeEvent {
            table,
            kind,
            record,
        });
    }
}

fn not_found(table: Table, id: &str) -> PersistenceError {
    PersistenceError::NotFound(format!("{} {}", table.as_str(), id))
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn session(&self) -> Result<Option<Session>, PersistenceError> {
        Ok(self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, PersistenceError> {
        Ok(self
            .tables()
            .profiles
            .iter()
            .find(|p| p.id == user_id)
            .cloned())
    }

    async fn list_chats(&self, user_id: &str) -> Result<Vec<Chat>, PersistenceError> {
        let mut chats: Vec<Chat> = self
            .tables()
            .chats
            .iter()
            .filter(|c| c.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        chats.sort_by_key(|c| std::cmp::Reverse(c.last_active()));
        Ok(chats)
    }

    async fn insert_chat(&self, chat: &Chat) -> Result<Chat, PersistenceError> {
        self.tables().chats.push(chat.clone());
        self.publish(Table::Chats, ChangeKind::Insert, chat);
        Ok(chat.clone())
    }

    async fn update_chat(
        &self,
        chat_id: &str,
        patch: &ChatPatch,
    ) -> Result<Chat, PersistenceError> {
        let updated = {
            let mut tables = self.tables();
            let chat = tables
                .chats
                .iter_mut()
                .find(|c| c.id == chat_id)
                .ok_or_else(|| not_found(Table::Chats, chat_id))?;
            chat.apply(patch);
            chat.clone()
        };
        self.publish(Table::Chats, ChangeKind::Update, &updated);
        Ok(updated)
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<(), PersistenceError> {
        let (removed, messages) = {
            let mut tables = self.tables();
            let index = tables
                .chats
                .iter()
                .position(|c| c.id == chat_id)
                .ok_or_else(|| not_found(Table::Chats, chat_id))?;
            let removed = tables.chats.remove(index);
            let (gone, kept): (Vec<Message>, Vec<Message>) = tables
                .messages
                .drain(..)
                .partition(|m| m.chat_id == chat_id);
            tables.messages = kept;
            (removed, gone)
        };
        for message in &messages {
            self.publish(Table::Messages, ChangeKind::Delete, message);
        }
        self.publish(Table::Chats, ChangeKind::Delete, &removed);
        Ok(())
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, PersistenceError> {
        let mut messages: Vec<Message> = self
            .tables()
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn insert_message(&self, message: &Message) -> Result<Message, PersistenceError> {
        self.tables().messages.push(message.clone());
        self.publish(Table::Messages, ChangeKind::Insert, message);
        Ok(message.clone())
    }

    async fn update_message(
        &self,
        message_id: &str,
        patch: &MessagePatch,
    ) -> Result<Message, PersistenceError> {
        let updated = {
            let mut tables = self.tables();
            let message = tables
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or_else(|| not_found(Table::Messages, message_id))?;
            if let Some(content) = &patch.content {
                message.content = content.clone();
            }
            if let Some(deleted) = patch.deleted {
                message.deleted = deleted;
            }
            message.updated_at = Some(patch.updated_at);
            message.clone()
        };
        self.publish(Table::Messages, ChangeKind::Update, &updated);
        Ok(updated)
    }

    async fn list_reactions(
        &self,
        message_ids: &[String],
    ) -> Result<Vec<Reaction>, PersistenceError> {
        Ok(self
            .tables()
            .reactions
            .iter()
            .filter(|r| message_ids.contains(&r.message_id))
            .cloned()
            .collect())
    }

    async fn find_reaction(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> Result<Option<Reaction>, PersistenceError> {
        Ok(self
            .tables()
            .reactions
            .iter()
            .find(|r| r.message_id == message_id && r.user_id == user_id)
            .cloned())
    }

    async fn insert_reaction(&self, reaction: &Reaction) -> Result<Reaction, PersistenceError> {
        self.tables().reactions.push(reaction.clone());
        self.publish(Table::Reactions, ChangeKind::Insert, reaction);
        Ok(reaction.clone())
    }

    async fn update_reaction(
        &self,
        reaction_id: &str,
        kind: ReactionType,
    ) -> Result<Reaction, PersistenceError> {
        let updated = {
            let mut tables = self.tables();
            let reaction = tables
                .reactions
                .iter_mut()
                .find(|r| r.id == reaction_id)
                .ok_or_else(|| not_found(Table::Reactions, reaction_id))?;
            reaction.kind = kind;
            reaction.clone()
        };
        self.publish(Table::Reactions, ChangeKind::Update, &updated);
        Ok(updated)
    }

    async fn delete_reaction(&self, reaction_id: &str) -> Result<(), PersistenceError> {
        let removed = {
            let mut tables = self.tables();
            let index = tables
                .reactions
                .iter()
                .position(|r| r.id == reaction_id)
                .ok_or_else(|| not_found(Table::Reactions, reaction_id))?;
            tables.reactions.remove(index)
        };
        self.publish(Table::Reactions, ChangeKind::Delete, &removed);
        Ok(())
    }

    async fn upload_attachment(
        &self,
        attachment: &Attachment,
    ) -> Result<Attachment, PersistenceError> {
        let mut stored = attachment.clone();
        stored.reference = format!("attachments/{}/{}", stored.id, stored.name);
        stored.confirmed = true;
        self.tables().attachments.push(stored.clone());
        self.publish(Table::Attachments, ChangeKind::Insert, &stored);
        Ok(stored)
    }

    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>, PersistenceError> {
        let mut tasks: Vec<Task> = self
            .tables()
            .tasks
            .iter()
            .filter(|t| t.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        Ok(tasks)
    }

    async fn insert_task(&self, task: &NewTask) -> Result<Task, PersistenceError> {
        let task = task.clone().into_task();
        self.tables().tasks.push(task.clone());
        self.publish(Table::Tasks, ChangeKind::Insert, &task);
        Ok(task)
    }

    async fn update_task(
        &self,
        task_id: &str,
        patch: &TaskPatch,
    ) -> Result<Task, PersistenceError> {
        let updated = {
            let mut tables = self.tables();
            let task = tables
                .tasks
                .iter_mut()
                .find(|t| t.id == task_id)
                .ok_or_else(|| not_found(Table::Tasks, task_id))?;
            task.apply(patch);
            task.clone()
        };
        self.publish(Table::Tasks, ChangeKind::Update, &updated);
        Ok(updated)
    }

    async fn subscribe(&self, table: Table) -> Result<Subscription, PersistenceError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut changes = self.changes.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(event) if event.table == table => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("{} subscription lagged by {} events", table.as_str(), skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(rx, handle.abort_handle()))
    }
}
