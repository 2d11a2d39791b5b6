//! Client-side chat state.
//!
//! [`ChatStore`] owns the chat list, the loaded messages, pending
//! attachments and per-chat streaming flags. Collaborators are injected at
//! construction; the UI observes changes through [`ChatStore::subscribe`].

use crate::{
    backend::{AiBackend, BackendError},
    models::{
        Attachment, Chat, ChatPatch, ChatStatus, DEFAULT_CHAT_TITLE, Message, MessagePatch,
        Reaction, ReactionType, Role, Session,
    },
    persistence::{ChangeEvent, ChangeKind, Persistence, PersistenceError, Table, Unsubscribe},
    stream::{Step, StreamPhase, StreamReconciler},
    title::generate_title,
};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

pub const STREAM_CHANNEL_CAPACITY: usize = 128;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Request streamed replies instead of a single response.
    pub streaming: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { streaming: true }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Message content is empty")]
    EmptyMessage,
    #[error("Chat not found: {0}")]
    ChatNotFound(String),
    #[error("Message not found: {0}")]
    MessageNotFound(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// State changes published to the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    ChatsLoaded,
    ChatCreated(Chat),
    ChatUpdated(Chat),
    ChatRemoved(String),
    CurrentChatChanged(Option<String>),
    MessagesLoaded {
        chat_id: String,
    },
    MessageAppended {
        chat_id: String,
        message: Message,
    },
    MessageUpdated {
        chat_id: String,
        message: Message,
    },
    MessageReplaced {
        chat_id: String,
        old_id: String,
        message: Message,
    },
    MessageRemoved {
        chat_id: String,
        message_id: String,
    },
    StreamingChanged {
        chat_id: String,
        streaming: bool,
    },
    AttachmentsChanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReactionChange {
    Added(Reaction),
    Updated(Reaction),
    Removed(Reaction),
}

struct ChatEntry {
    chat: Chat,
    messages: Vec<Message>,
}

#[derive(Default)]
struct State {
    chats: Vec<ChatEntry>,
    current: Option<String>,
    pending: Vec<Attachment>,
    streaming: HashSet<String>,
    /// Locally built user messages the server has not echoed back yet.
    unconfirmed: HashSet<String>,
}

impl State {
    fn entry(&self, chat_id: &str) -> Option<&ChatEntry> {
        self.chats.iter().find(|e| e.chat.id == chat_id)
    }

    fn entry_mut(&mut self, chat_id: &str) -> Option<&mut ChatEntry> {
        self.chats.iter_mut().find(|e| e.chat.id == chat_id)
    }

    fn chat_of_message(&self, message_id: &str) -> Option<String> {
        self.chats
            .iter()
            .find(|e| e.messages.iter().any(|m| m.id == message_id))
            .map(|e| e.chat.id.clone())
    }
}

fn insert_sorted(messages: &mut Vec<Message>, message: Message) {
    let index = messages.partition_point(|m| m.created_at <= message.created_at);
    messages.insert(index, message);
}

pub struct ChatStore {
    persistence: Arc<dyn Persistence>,
    backend: Arc<dyn AiBackend>,
    options: StoreOptions,
    state: RwLock<State>,
    send_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Held while a send without a target creates its chat.
    creating: tokio::sync::Mutex<()>,
    events: broadcast::Sender<StoreEvent>,
}

/// Marks a chat as streaming for as long as it lives.
struct StreamingGuard<'a> {
    store: &'a ChatStore,
    chat_id: String,
}

impl<'a> StreamingGuard<'a> {
    fn new(store: &'a ChatStore, chat_id: &str) -> Self {
        store.set_streaming(chat_id, true);
        Self {
            store,
            chat_id: chat_id.to_string(),
        }
    }
}

impl Drop for StreamingGuard<'_> {
    fn drop(&mut self) {
        self.store.set_streaming(&self.chat_id, false);
    }
}

impl ChatStore {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        backend: Arc<dyn AiBackend>,
        options: StoreOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            persistence,
            backend,
            options,
            state: RwLock::new(State::default()),
            send_locks: Mutex::new(HashMap::new()),
            creating: tokio::sync::Mutex::new(()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Snapshots ──

    pub fn chats(&self) -> Vec<Chat> {
        self.read().chats.iter().map(|e| e.chat.clone()).collect()
    }

    pub fn chat(&self, chat_id: &str) -> Option<Chat> {
        self.read().entry(chat_id).map(|e| e.chat.clone())
    }

    pub fn messages(&self, chat_id: &str) -> Vec<Message> {
        self.read()
            .entry(chat_id)
            .map(|e| e.messages.clone())
            .unwrap_or_default()
    }

    pub fn current_chat_id(&self) -> Option<String> {
        self.read().current.clone()
    }

    pub fn pending_attachments(&self) -> Vec<Attachment> {
        self.read().pending.clone()
    }

    /// True while any chat has a reply in flight.
    pub fn is_streaming(&self) -> bool {
        !self.read().streaming.is_empty()
    }

    pub fn is_chat_streaming(&self, chat_id: &str) -> bool {
        self.read().streaming.contains(chat_id)
    }

    fn set_streaming(&self, chat_id: &str, streaming: bool) {
        let changed = {
            let mut state = self.write();
            if streaming {
                state.streaming.insert(chat_id.to_string())
            } else {
                state.streaming.remove(chat_id)
            }
        };
        if changed {
            self.emit(StoreEvent::StreamingChanged {
                chat_id: chat_id.to_string(),
                streaming,
            });
        }
    }

    fn send_lock(&self, chat_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.send_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(chat_id.to_string())
            .or_default()
            .clone()
    }

    async fn session_or_warn(&self, action: &str) -> Result<Option<Session>, PersistenceError> {
        match self.persistence.session().await {
            Ok(Some(session)) => Ok(Some(session)),
            Ok(None) | Err(PersistenceError::Unauthenticated) => {
                warn!("Cannot {}: no active session", action);
                Ok(None)
            }
            Err(e) => {
                error!("Failed to read session: {}", e);
                Err(e)
            }
        }
    }

    // ── Sending ──

    /// Sends `content` to `chat_id`, or to the current chat, or to a chat
    /// created for it. Returns the chat the message went to.
    ///
    /// Blank content while the target chat is streaming asks the backend to
    /// stop that stream instead.
    pub async fn send_message(
        &self,
        content: &str,
        chat_id: Option<&str>,
    ) -> Result<String, StoreError> {
        let content = content.trim();
        let target = chat_id.map(String::from).or_else(|| self.current_chat_id());

        if content.is_empty() {
            return match target {
                Some(id) if self.is_chat_streaming(&id) => {
                    self.stop_streaming(&id).await?;
                    Ok(id)
                }
                _ => Err(StoreError::EmptyMessage),
            };
        }

        let chat_id = match target {
            Some(id) => {
                if self.chat(&id).is_none() {
                    return Err(StoreError::ChatNotFound(id));
                }
                id
            }
            None => self.chat_for_first_message(content).await?,
        };

        let lock = self.send_lock(&chat_id);
        let _serial = lock.lock().await;
        let _streaming = StreamingGuard::new(self, &chat_id);

        let mut user_message = Message::user(&chat_id, content);
        user_message.attachments = self.pending_attachments();
        self.append_message(&chat_id, user_message.clone(), true);
        self.write().unconfirmed.insert(user_message.id.clone());
        self.clear_pending_attachments();
        self.maybe_generate_title(&chat_id, content);

        if self.options.streaming {
            self.stream_reply(&chat_id, content).await?;
        } else {
            self.direct_reply(&chat_id, content).await?;
        }

        Ok(chat_id)
    }

    /// Creates the chat for a send that has no target. Concurrent sends wait
    /// for the first creation and reuse its chat.
    async fn chat_for_first_message(&self, content: &str) -> Result<String, StoreError> {
        let _creating = self.creating.lock().await;
        if let Some(id) = self.current_chat_id()
            && self.chat(&id).is_some()
        {
            debug!("Reusing chat {} created by a concurrent send", id);
            return Ok(id);
        }
        Ok(self.new_chat(Some(&generate_title(content))).await?.id)
    }

    pub async fn stop_streaming(&self, chat_id: &str) -> Result<(), StoreError> {
        info!("Stop requested for chat {}", chat_id);
        self.backend.stop_stream(chat_id).await.map_err(|e| {
            error!("Failed to send stop request for chat {}: {}", chat_id, e);
            StoreError::from(e)
        })
    }

    async fn direct_reply(&self, chat_id: &str, content: &str) -> Result<(), StoreError> {
        match self.backend.send_message(chat_id, content).await {
            Ok(reply) => {
                self.append_message(chat_id, reply, true);
                Ok(())
            }
            Err(e) => {
                error!("Failed to get reply for chat {}: {}", chat_id, e);
                Err(e.into())
            }
        }
    }

    async fn stream_reply(&self, chat_id: &str, content: &str) -> Result<(), StoreError> {
        let mut reconciler = StreamReconciler::new(chat_id);
        self.append_message(chat_id, reconciler.begin(), false);

        let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let backend = self.backend.clone();
        let stream_chat_id = chat_id.to_string();
        let stream_content = content.to_string();
        let handle = tokio::spawn(async move {
            backend
                .send_message_stream(&stream_chat_id, &stream_content, tx)
                .await
        });

        while let Some(event) = rx.recv().await {
            let step = reconciler.apply(event);
            self.apply_step(chat_id, step);
            if reconciler.is_settled() {
                break;
            }
        }

        if reconciler.phase() == StreamPhase::Finalized {
            return Ok(());
        }

        if reconciler.is_settled() {
            handle.abort();
        } else {
            let reason = match handle.await {
                Ok(Ok(())) => "stream ended before completion".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };
            let step = reconciler.abort(reason);
            self.apply_step(chat_id, step);
        }

        warn!(
            "Streaming reply for chat {} failed after {} chars, retrying without streaming",
            chat_id,
            reconciler.content().chars().count()
        );
        self.direct_reply(chat_id, content).await
    }

    fn apply_step(&self, chat_id: &str, step: Step) {
        match step {
            Step::Append {
                placeholder_id,
                delta,
            } => {
                let updated = {
                    let mut state = self.write();
                    state.entry_mut(chat_id).and_then(|entry| {
                        let message = entry.messages.iter_mut().find(|m| m.id == placeholder_id)?;
                        message.content.push_str(&delta);
                        Some(message.clone())
                    })
                };
                if let Some(message) = updated {
                    self.emit(StoreEvent::MessageUpdated {
                        chat_id: chat_id.to_string(),
                        message,
                    });
                }
            }
            Step::Insert(message) => self.append_message(chat_id, message, true),
            Step::Finalize {
                placeholder_id,
                message,
            } => self.finalize_placeholder(chat_id, &placeholder_id, message),
            Step::Abort {
                placeholder_id,
                reason,
            } => {
                warn!("Stream for chat {} aborted: {}", chat_id, reason);
                self.remove_local_message(chat_id, &placeholder_id);
            }
            Step::Ignore => {}
        }
    }

    fn finalize_placeholder(&self, chat_id: &str, placeholder_id: &str, message: Message) {
        let replaced = {
            let mut state = self.write();
            let Some(entry) = state.entry_mut(chat_id) else {
                return;
            };
            // A realtime insert may already have delivered the stored row.
            let echoed = message.id != placeholder_id
                && entry.messages.iter().any(|m| m.id == message.id);
            if echoed {
                entry.messages.retain(|m| m.id != placeholder_id);
                if let Some(existing) = entry.messages.iter_mut().find(|m| m.id == message.id) {
                    *existing = message.clone();
                }
            } else if let Some(slot) = entry.messages.iter_mut().find(|m| m.id == placeholder_id) {
                slot.id = message.id.clone();
                slot.content = message.content.clone();
                slot.created_at = message.created_at;
                slot.updated_at = message.updated_at;
                slot.delivery = message.delivery;
                slot.metadata = message.metadata.clone();
            } else {
                insert_sorted(&mut entry.messages, message.clone());
            }
            entry.messages.sort_by_key(|m| m.created_at);
            if !echoed {
                entry.chat.metadata.record(&message);
            }
            entry.messages.iter().find(|m| m.id == message.id).cloned()
        };

        if let Some(message) = replaced {
            self.emit(StoreEvent::MessageReplaced {
                chat_id: chat_id.to_string(),
                old_id: placeholder_id.to_string(),
                message,
            });
        }
    }

    fn append_message(&self, chat_id: &str, message: Message, counted: bool) {
        let appended = {
            let mut state = self.write();
            match state.entry_mut(chat_id) {
                Some(entry) => {
                    if let Some(existing) = entry.messages.iter_mut().find(|m| m.id == message.id) {
                        *existing = message.clone();
                        Some(false)
                    } else {
                        if counted {
                            entry.chat.metadata.record(&message);
                        }
                        insert_sorted(&mut entry.messages, message.clone());
                        Some(true)
                    }
                }
                None => None,
            }
        };
        let chat_id = chat_id.to_string();
        match appended {
            Some(true) => self.emit(StoreEvent::MessageAppended { chat_id, message }),
            Some(false) => self.emit(StoreEvent::MessageUpdated { chat_id, message }),
            None => {}
        }
    }

    fn remove_local_message(&self, chat_id: &str, message_id: &str) -> bool {
        let removed = {
            let mut state = self.write();
            state.unconfirmed.remove(message_id);
            match state.entry_mut(chat_id) {
                Some(entry) => {
                    let before = entry.messages.len();
                    entry.messages.retain(|m| m.id != message_id);
                    entry.messages.len() != before
                }
                None => false,
            }
        };
        if removed {
            self.emit(StoreEvent::MessageRemoved {
                chat_id: chat_id.to_string(),
                message_id: message_id.to_string(),
            });
        }
        removed
    }

    /// Titles a chat from its first message, once.
    fn maybe_generate_title(&self, chat_id: &str, content: &str) {
        let titled = {
            let mut state = self.write();
            let Some(entry) = state.entry_mut(chat_id) else {
                return;
            };
            if entry.messages.len() != 1 || !entry.chat.has_default_title() {
                return;
            }
            entry.chat.title = generate_title(content);
            entry.chat.clone()
        };

        self.emit(StoreEvent::ChatUpdated(titled.clone()));

        let persistence = self.persistence.clone();
        tokio::spawn(async move {
            if let Err(e) = persistence
                .update_chat(&titled.id, &ChatPatch::title(titled.title.clone()))
                .await
            {
                warn!("Failed to save title for chat {}: {}", titled.id, e);
            }
        });
    }

    // ── Chats ──

    /// Creates a chat and makes it current.
    pub async fn new_chat(&self, title: Option<&str>) -> Result<Chat, StoreError> {
        let title = title.unwrap_or(DEFAULT_CHAT_TITLE);
        let chat = self.backend.create_chat(title).await.map_err(|e| {
            error!("Failed to create chat: {}", e);
            StoreError::from(e)
        })?;
        info!("Created chat {} ({})", chat.id, chat.title);

        {
            let mut state = self.write();
            state.chats.insert(
                0,
                ChatEntry {
                    chat: chat.clone(),
                    messages: Vec::new(),
                },
            );
            state.current = Some(chat.id.clone());
        }

        self.emit(StoreEvent::ChatCreated(chat.clone()));
        self.emit(StoreEvent::CurrentChatChanged(Some(chat.id.clone())));
        Ok(chat)
    }

    /// Replaces the chat list with the session user's chats, most recently
    /// active first. Without a session the list is left empty.
    pub async fn load_chats(&self) -> Result<Vec<Chat>, StoreError> {
        let Some(session) = self.session_or_warn("load chats").await? else {
            return Ok(Vec::new());
        };

        let mut chats = self
            .persistence
            .list_chats(&session.user_id)
            .await
            .map_err(|e| {
                error!("Failed to load chats: {}", e);
                e
            })?;
        chats.retain(|c| c.status != ChatStatus::Deleted);
        chats.sort_by_key(|c| std::cmp::Reverse(c.last_active()));

        {
            let mut state = self.write();
            let mut previous: HashMap<String, Vec<Message>> = state
                .chats
                .drain(..)
                .map(|e| (e.chat.id, e.messages))
                .collect();
            state.chats = chats
                .iter()
                .map(|chat| ChatEntry {
                    chat: chat.clone(),
                    messages: previous.remove(&chat.id).unwrap_or_default(),
                })
                .collect();
            if let Some(current) = state.current.clone()
                && state.entry(&current).is_none()
            {
                state.current = None;
            }
        }

        debug!("Loaded {} chats", chats.len());
        self.emit(StoreEvent::ChatsLoaded);
        Ok(chats)
    }

    /// Makes `chat_id` current and loads its messages with their reactions.
    pub async fn select_chat(&self, chat_id: &str) -> Result<Vec<Message>, StoreError> {
        if self.chat(chat_id).is_none() {
            return Err(StoreError::ChatNotFound(chat_id.to_string()));
        }

        self.write().current = Some(chat_id.to_string());
        self.emit(StoreEvent::CurrentChatChanged(Some(chat_id.to_string())));

        // Reloading mid-stream would drop the placeholder.
        if self.is_chat_streaming(chat_id) {
            return Ok(self.messages(chat_id));
        }

        let mut messages = self.persistence.list_messages(chat_id).await.map_err(|e| {
            error!("Failed to load messages for chat {}: {}", chat_id, e);
            e
        })?;
        messages.retain(|m| !m.deleted);
        messages.sort_by_key(|m| m.created_at);

        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        let reactions = self.persistence.list_reactions(&ids).await?;
        for message in &mut messages {
            message.reactions = reactions
                .iter()
                .filter(|r| r.message_id == message.id)
                .cloned()
                .collect();
        }

        {
            let mut state = self.write();
            if let Some(entry) = state.entry_mut(chat_id) {
                entry.chat.metadata.message_count = messages.len() as u32;
                entry.messages = messages.clone();
            }
        }

        self.emit(StoreEvent::MessagesLoaded {
            chat_id: chat_id.to_string(),
        });
        Ok(messages)
    }

    async fn patch_chat(&self, chat_id: &str, patch: ChatPatch) -> Result<Chat, StoreError> {
        if self.chat(chat_id).is_none() {
            return Err(StoreError::ChatNotFound(chat_id.to_string()));
        }

        self.persistence
            .update_chat(chat_id, &patch)
            .await
            .map_err(|e| {
                error!("Failed to update chat {}: {}", chat_id, e);
                e
            })?;

        let updated = {
            let mut state = self.write();
            state.entry_mut(chat_id).map(|entry| {
                entry.chat.apply(&patch);
                entry.chat.clone()
            })
        }
        .ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))?;

        self.emit(StoreEvent::ChatUpdated(updated.clone()));
        Ok(updated)
    }

    pub async fn rename_chat(&self, chat_id: &str, title: &str) -> Result<Chat, StoreError> {
        let title = title.trim();
        let title = if title.is_empty() {
            DEFAULT_CHAT_TITLE
        } else {
            title
        };
        self.patch_chat(chat_id, ChatPatch::title(title)).await
    }

    pub async fn set_chat_status(
        &self,
        chat_id: &str,
        status: ChatStatus,
    ) -> Result<Chat, StoreError> {
        if status == ChatStatus::Deleted {
            let mut chat = self
                .chat(chat_id)
                .ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))?;
            self.delete_chat(chat_id, false).await?;
            chat.status = ChatStatus::Deleted;
            return Ok(chat);
        }
        self.patch_chat(chat_id, ChatPatch::status(status)).await
    }

    pub async fn toggle_bookmark(&self, chat_id: &str) -> Result<Chat, StoreError> {
        let bookmarked = self
            .chat(chat_id)
            .map(|c| c.bookmarked)
            .ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))?;
        self.patch_chat(chat_id, ChatPatch::bookmarked(!bookmarked))
            .await
    }

    /// Soft delete marks the row deleted; hard delete removes it. Either way
    /// the chat leaves the local list.
    pub async fn delete_chat(&self, chat_id: &str, hard: bool) -> Result<(), StoreError> {
        if self.chat(chat_id).is_none() {
            return Err(StoreError::ChatNotFound(chat_id.to_string()));
        }

        let result = if hard {
            self.persistence.delete_chat(chat_id).await
        } else {
            self.persistence
                .update_chat(chat_id, &ChatPatch::status(ChatStatus::Deleted))
                .await
                .map(|_| ())
        };
        result.map_err(|e| {
            error!("Failed to delete chat {}: {}", chat_id, e);
            e
        })?;

        let cleared_current = {
            let mut state = self.write();
            state.chats.retain(|e| e.chat.id != chat_id);
            if state.current.as_deref() == Some(chat_id) {
                state.current = None;
                true
            } else {
                false
            }
        };
        self.send_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(chat_id);

        info!("Deleted chat {} (hard: {})", chat_id, hard);
        self.emit(StoreEvent::ChatRemoved(chat_id.to_string()));
        if cleared_current {
            self.emit(StoreEvent::CurrentChatChanged(None));
        }
        Ok(())
    }

    /// Soft-deletes a message. Messages that only exist locally are just
    /// dropped from the list.
    pub async fn delete_message(&self, message_id: &str) -> Result<(), StoreError> {
        let (chat_id, local_only) = {
            let state = self.read();
            let chat_id = state
                .chat_of_message(message_id)
                .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;
            (chat_id, state.unconfirmed.contains(message_id))
        };

        if !local_only {
            match self
                .persistence
                .update_message(message_id, &MessagePatch::soft_delete())
                .await
            {
                Ok(_) => {}
                Err(PersistenceError::NotFound(_)) => {
                    debug!("Message {} was never stored remotely", message_id);
                }
                Err(e) => {
                    error!("Failed to delete message {}: {}", message_id, e);
                    return Err(e.into());
                }
            }
        }

        self.remove_local_message(&chat_id, message_id);
        Ok(())
    }

    // ── Reactions ──

    /// Toggles the session user's reaction on a message: the same type
    /// clears it, a different type replaces it, no reaction adds one.
    /// Returns `None` without a session.
    pub async fn react_to_message(
        &self,
        message_id: &str,
        kind: ReactionType,
    ) -> Result<Option<ReactionChange>, StoreError> {
        let Some(session) = self.session_or_warn("react to message").await? else {
            return Ok(None);
        };

        let change = self
            .toggle_reaction(message_id, &session.user_id, kind)
            .await
            .map_err(|e| {
                error!("Failed to react to message {}: {}", message_id, e);
                e
            })?;

        self.mirror_reaction(message_id, &session.user_id, &change);
        Ok(Some(change))
    }

    async fn toggle_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        kind: ReactionType,
    ) -> Result<ReactionChange, PersistenceError> {
        match self.persistence.find_reaction(message_id, user_id).await? {
            Some(existing) if existing.kind == kind => {
                self.persistence.delete_reaction(&existing.id).await?;
                Ok(ReactionChange::Removed(existing))
            }
            Some(existing) => {
                let updated = self.persistence.update_reaction(&existing.id, kind).await?;
                Ok(ReactionChange::Updated(updated))
            }
            None => {
                let reaction = Reaction::new(message_id, user_id, kind);
                let inserted = self.persistence.insert_reaction(&reaction).await?;
                Ok(ReactionChange::Added(inserted))
            }
        }
    }

    fn mirror_reaction(&self, message_id: &str, user_id: &str, change: &ReactionChange) {
        let updated = {
            let mut state = self.write();
            let Some(chat_id) = state.chat_of_message(message_id) else {
                return;
            };
            state.entry_mut(&chat_id).and_then(|entry| {
                let message = entry.messages.iter_mut().find(|m| m.id == message_id)?;
                message.reactions.retain(|r| r.user_id != user_id);
                match change {
                    ReactionChange::Added(r) | ReactionChange::Updated(r) => {
                        message.reactions.push(r.clone())
                    }
                    ReactionChange::Removed(_) => {}
                }
                Some((chat_id.clone(), message.clone()))
            })
        };
        if let Some((chat_id, message)) = updated {
            self.emit(StoreEvent::MessageUpdated { chat_id, message });
        }
    }

    // ── Attachments ──

    pub fn stage_attachment(
        &self,
        name: &str,
        mime_type: &str,
        size: u64,
        reference: &str,
    ) -> Attachment {
        let attachment = Attachment::staged(name, mime_type, size, reference);
        self.write().pending.push(attachment.clone());
        self.emit(StoreEvent::AttachmentsChanged);
        attachment
    }

    pub fn remove_pending_attachment(&self, attachment_id: &str) -> bool {
        let removed = {
            let mut state = self.write();
            let before = state.pending.len();
            state.pending.retain(|a| a.id != attachment_id);
            state.pending.len() != before
        };
        if removed {
            self.emit(StoreEvent::AttachmentsChanged);
        }
        removed
    }

    fn clear_pending_attachments(&self) {
        let had_any = {
            let mut state = self.write();
            let had_any = !state.pending.is_empty();
            state.pending.clear();
            had_any
        };
        if had_any {
            self.emit(StoreEvent::AttachmentsChanged);
        }
    }

    /// Uploads unconfirmed pending attachments and swaps in the stored
    /// records.
    pub async fn confirm_attachments(&self) -> Result<Vec<Attachment>, StoreError> {
        let unconfirmed: Vec<Attachment> = self
            .read()
            .pending
            .iter()
            .filter(|a| !a.confirmed)
            .cloned()
            .collect();

        for attachment in unconfirmed {
            let stored = self
                .persistence
                .upload_attachment(&attachment)
                .await
                .map_err(|e| {
                    error!("Failed to upload attachment {}: {}", attachment.name, e);
                    e
                })?;
            if let Some(slot) = self
                .write()
                .pending
                .iter_mut()
                .find(|a| a.id == attachment.id)
            {
                *slot = stored;
            }
        }

        self.emit(StoreEvent::AttachmentsChanged);
        Ok(self.pending_attachments())
    }

    // ── Realtime ──

    /// Keeps loaded chats in step with remote message changes until the
    /// returned handle is used to unsubscribe.
    pub async fn watch_messages(self: &Arc<Self>) -> Result<Unsubscribe, StoreError> {
        let subscription = self.persistence.subscribe(Table::Messages).await?;
        let (mut rx, unsubscribe) = subscription.into_parts();
        let store = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.apply_change(&event);
            }
        });

        Ok(unsubscribe.also(handle.abort_handle()))
    }

    pub(crate) fn apply_change(&self, event: &ChangeEvent) {
        if event.kind == ChangeKind::Delete {
            let Some(message_id) = event.record_id() else {
                return;
            };
            let chat_id = self.read().chat_of_message(message_id);
            if let Some(chat_id) = chat_id {
                self.remove_local_message(&chat_id, message_id);
            }
            return;
        }

        let message: Message = match event.decode() {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring undecodable message change: {}", e);
                return;
            }
        };
        let chat_id = message.chat_id.clone();

        match event.kind {
            ChangeKind::Insert if !message.deleted => self.apply_remote_insert(message),
            ChangeKind::Insert => {}
            ChangeKind::Update if message.deleted => {
                self.remove_local_message(&chat_id, &message.id);
            }
            ChangeKind::Update => self.apply_remote_update(message),
            ChangeKind::Delete => {}
        }
    }

    fn apply_remote_insert(&self, message: Message) {
        let chat_id = message.chat_id.clone();
        let outcome = {
            let mut state = self.write();
            let adopt = if message.role == Role::User {
                state.entry(&chat_id).and_then(|entry| {
                    entry
                        .messages
                        .iter()
                        .find(|m| {
                            m.role == Role::User
                                && m.content.trim() == message.content.trim()
                                && state.unconfirmed.contains(&m.id)
                        })
                        .map(|m| m.id.clone())
                })
            } else {
                None
            };

            let Some(entry) = state.entry_mut(&chat_id) else {
                return;
            };
            if entry.messages.iter().any(|m| m.id == message.id) {
                return;
            }

            match adopt {
                Some(local_id) => {
                    let Some(slot) = entry.messages.iter_mut().find(|m| m.id == local_id) else {
                        return;
                    };
                    slot.id = message.id.clone();
                    slot.created_at = message.created_at;
                    slot.user_id = message.user_id.clone();
                    let adopted = slot.clone();
                    entry.messages.sort_by_key(|m| m.created_at);
                    state.unconfirmed.remove(&local_id);
                    Some((Some(local_id), adopted))
                }
                None => {
                    entry.chat.metadata.record(&message);
                    insert_sorted(&mut entry.messages, message.clone());
                    Some((None, message))
                }
            }
        };

        match outcome {
            Some((Some(old_id), message)) => self.emit(StoreEvent::MessageReplaced {
                chat_id,
                old_id,
                message,
            }),
            Some((None, message)) => self.emit(StoreEvent::MessageAppended { chat_id, message }),
            None => {}
        }
    }

    fn apply_remote_update(&self, message: Message) {
        let chat_id = message.chat_id.clone();
        let updated = {
            let mut state = self.write();
            state.entry_mut(&chat_id).and_then(|entry| {
                let slot = entry.messages.iter_mut().find(|m| m.id == message.id)?;
                slot.content = message.content.clone();
                slot.updated_at = message.updated_at;
                slot.metadata = message.metadata.clone();
                Some(slot.clone())
            })
        };
        if let Some(message) = updated {
            self.emit(StoreEvent::MessageUpdated { chat_id, message });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::StreamEvent,
        models::DeliveryState,
        persistence::MemoryPersistence,
        testing::{Call, ScriptedBackend, StreamScript, USER_ID, eventually, session},
    };
    use tokio::sync::Notify;

    fn setup(streaming: bool) -> (Arc<ChatStore>, Arc<ScriptedBackend>, Arc<MemoryPersistence>) {
        let persistence = Arc::new(MemoryPersistence::with_session(session()));
        let backend = ScriptedBackend::new(persistence.clone());
        let store = ChatStore::new(
            persistence.clone(),
            backend.clone(),
            StoreOptions { streaming },
        );
        (store, backend, persistence)
    }

    fn contents(store: &ChatStore, chat_id: &str) -> Vec<(Role, String)> {
        store
            .messages(chat_id)
            .into_iter()
            .map(|m| (m.role, m.content))
            .collect()
    }

    #[tokio::test]
    async fn first_message_creates_exactly_one_titled_chat() {
        let (store, backend, _) = setup(false);

        let chat_id = store
            .send_message("Please organize my **Downloads** folder", None)
            .await
            .unwrap();

        assert_eq!(store.chats().len(), 1);
        assert_eq!(store.current_chat_id().as_deref(), Some(chat_id.as_str()));
        assert_eq!(
            backend.calls()[0],
            Call::CreateChat("Please organize my Downloads folder".into())
        );
        assert_eq!(backend.count(|c| matches!(c, Call::CreateChat(_))), 1);
        assert_eq!(
            contents(&store, &chat_id),
            vec![
                (Role::User, "Please organize my **Downloads** folder".into()),
                (Role::Assistant, "ok".into()),
            ]
        );
        assert_eq!(store.chat(&chat_id).unwrap().metadata.message_count, 2);
        assert!(!store.is_streaming());
    }

    #[tokio::test]
    async fn streamed_first_message_creates_chat_and_settles() {
        let (store, backend, _) = setup(true);
        backend.push_stream(StreamScript::reply(&["Sorting ", "your Downloads"]));

        let chat_id = store.send_message("organize Downloads", None).await.unwrap();

        assert_eq!(store.chats().len(), 1);
        assert!(!store.chat(&chat_id).unwrap().has_default_title());
        assert_eq!(backend.count(|c| matches!(c, Call::CreateChat(_))), 1);
        assert_eq!(backend.count(|c| matches!(c, Call::Stream { .. })), 1);
        assert_eq!(backend.count(|c| matches!(c, Call::Send { .. })), 0);
        assert_eq!(
            contents(&store, &chat_id),
            vec![
                (Role::User, "organize Downloads".into()),
                (Role::Assistant, "Sorting your Downloads".into()),
            ]
        );
        assert!(!store.is_streaming());
    }

    #[tokio::test]
    async fn concurrent_first_messages_share_one_chat() {
        let (store, backend, _) = setup(false);

        let sends: Vec<_> = ["first question", "second question"]
            .into_iter()
            .map(|content| {
                let store = store.clone();
                tokio::spawn(async move { store.send_message(content, None).await })
            })
            .collect();
        let mut targets = Vec::new();
        for send in sends {
            targets.push(send.await.unwrap().unwrap());
        }

        assert_eq!(targets[0], targets[1]);
        assert_eq!(store.chats().len(), 1);
        assert_eq!(backend.count(|c| matches!(c, Call::CreateChat(_))), 1);
        assert_eq!(store.messages(&targets[0]).len(), 4);
    }

    #[tokio::test]
    async fn surrounding_whitespace_is_trimmed_before_sending() {
        let (store, backend, _) = setup(false);
        let chat = store.new_chat(None).await.unwrap();

        store
            .send_message("hello there \n", Some(&chat.id))
            .await
            .unwrap();
        assert!(backend.calls().contains(&Call::Send {
            chat_id: chat.id.clone(),
            content: "hello there".into(),
        }));

        let mut echo = Message::user(&chat.id, "hello there");
        echo.user_id = Some(USER_ID.to_string());
        store.apply_change(&ChangeEvent {
            table: Table::Messages,
            kind: ChangeKind::Insert,
            record: serde_json::to_value(&echo).unwrap(),
        });

        assert_eq!(
            contents(&store, &chat.id),
            vec![
                (Role::User, "hello there".into()),
                (Role::Assistant, "ok".into()),
            ]
        );
        assert!(store.messages(&chat.id).iter().any(|m| m.id == echo.id));
        assert!(store.read().unconfirmed.is_empty());
    }

    #[tokio::test]
    async fn empty_content_is_rejected_when_nothing_streams() {
        let (store, backend, _) = setup(true);
        assert!(matches!(
            store.send_message("   ", None).await,
            Err(StoreError::EmptyMessage)
        ));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_chat_is_rejected() {
        let (store, _, _) = setup(true);
        assert!(matches!(
            store.send_message("hi", Some("missing")).await,
            Err(StoreError::ChatNotFound(_))
        ));
    }

    #[tokio::test]
    async fn streamed_reply_replaces_the_placeholder() {
        let (store, backend, _) = setup(true);
        let chat = store.new_chat(Some("Greetings")).await.unwrap();
        backend.push_stream(StreamScript::reply(&["Hel", "lo ", "there"]));
        let mut events = store.subscribe();

        store.send_message("hi", Some(&chat.id)).await.unwrap();

        let messages = store.messages(&chat.id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Hello there");
        assert_eq!(messages[1].delivery.state, DeliveryState::Sent);
        assert!(messages.iter().all(|m| !m.content.is_empty()));
        assert!(!store.is_chat_streaming(&chat.id));

        let mut appended_deltas = 0;
        let mut replaced = false;
        while let Ok(event) = events.try_recv() {
            match event {
                StoreEvent::MessageUpdated { .. } => appended_deltas += 1,
                StoreEvent::MessageReplaced { message, .. } => {
                    replaced = message.content == "Hello there"
                }
                _ => {}
            }
        }
        assert_eq!(appended_deltas, 3);
        assert!(replaced);
    }

    #[tokio::test]
    async fn command_events_become_their_own_messages() {
        let (store, backend, _) = setup(true);
        let chat = store.new_chat(None).await.unwrap();
        backend.push_stream(StreamScript::Reply {
            commands: vec!["Created folder Projects".into()],
            chunks: vec!["Done.".into()],
        });

        store
            .send_message("make a Projects folder", Some(&chat.id))
            .await
            .unwrap();

        assert_eq!(
            contents(&store, &chat.id),
            vec![
                (Role::User, "make a Projects folder".into()),
                (Role::Assistant, "Created folder Projects".into()),
                (Role::Assistant, "Done.".into()),
            ]
        );
    }

    #[tokio::test]
    async fn complete_without_row_keeps_streamed_text() {
        let (store, backend, _) = setup(true);
        let chat = store.new_chat(None).await.unwrap();
        backend.push_stream(StreamScript::Events(vec![
            StreamEvent::Chunk("partial ".into()),
            StreamEvent::Chunk("answer".into()),
            StreamEvent::Complete(None),
        ]));

        store.send_message("q", Some(&chat.id)).await.unwrap();

        assert_eq!(
            contents(&store, &chat.id)[1],
            (Role::Assistant, "partial answer".into())
        );
        assert_eq!(backend.count(|c| matches!(c, Call::Send { .. })), 0);
    }

    #[tokio::test]
    async fn failed_stream_falls_back_to_one_direct_reply() {
        let (store, backend, _) = setup(true);
        let chat = store.new_chat(None).await.unwrap();
        backend.push_stream(StreamScript::Fail {
            events: vec![StreamEvent::Chunk("half an ans".into())],
            error: "connection reset".into(),
        });
        backend.push_reply(Ok("full answer"));

        store.send_message("question", Some(&chat.id)).await.unwrap();

        assert_eq!(
            contents(&store, &chat.id),
            vec![
                (Role::User, "question".into()),
                (Role::Assistant, "full answer".into()),
            ]
        );
        assert_eq!(backend.count(|c| matches!(c, Call::Stream { .. })), 1);
        assert_eq!(backend.count(|c| matches!(c, Call::Send { .. })), 1);
    }

    #[tokio::test]
    async fn error_event_and_early_end_both_fall_back() {
        let (store, backend, _) = setup(true);
        let chat = store.new_chat(None).await.unwrap();
        backend.push_stream(StreamScript::Events(vec![StreamEvent::Error(
            "model overloaded".into(),
        )]));
        backend.push_stream(StreamScript::Events(vec![StreamEvent::Chunk("cut".into())]));

        store.send_message("one", Some(&chat.id)).await.unwrap();
        store.send_message("two", Some(&chat.id)).await.unwrap();

        assert_eq!(backend.count(|c| matches!(c, Call::Send { .. })), 2);
        let assistant: Vec<String> = store
            .messages(&chat.id)
            .into_iter()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content)
            .collect();
        assert_eq!(assistant, vec!["ok".to_string(), "ok".to_string()]);
    }

    #[tokio::test]
    async fn failed_fallback_surfaces_error_and_clears_streaming() {
        let (store, backend, _) = setup(true);
        let chat = store.new_chat(None).await.unwrap();
        backend.push_stream(StreamScript::Fail {
            events: Vec::new(),
            error: "reset".into(),
        });
        backend.push_reply(Err("service unavailable"));

        let result = store.send_message("hello", Some(&chat.id)).await;

        assert!(matches!(
            result,
            Err(StoreError::Backend(BackendError::Api { status: 503, .. }))
        ));
        assert!(!store.is_streaming());
        assert_eq!(
            contents(&store, &chat.id),
            vec![(Role::User, "hello".into())]
        );
    }

    #[tokio::test]
    async fn blank_send_while_streaming_requests_stop() {
        let (store, backend, _) = setup(true);
        let chat = store.new_chat(None).await.unwrap();
        let gate = Arc::new(Notify::new());
        backend.push_stream(StreamScript::Gated {
            gate: gate.clone(),
            chunks: vec!["late".into()],
        });

        let sending = {
            let store = store.clone();
            let chat_id = chat.id.clone();
            tokio::spawn(async move { store.send_message("long task", Some(&chat_id)).await })
        };
        assert!(eventually(|| store.is_chat_streaming(&chat.id)).await);

        let stopped = store.send_message("", Some(&chat.id)).await.unwrap();
        assert_eq!(stopped, chat.id);
        assert!(backend.calls().contains(&Call::Stop(chat.id.clone())));

        gate.notify_one();
        sending.await.unwrap().unwrap();
        assert!(!store.is_streaming());
        assert!(matches!(
            store.send_message("", Some(&chat.id)).await,
            Err(StoreError::EmptyMessage)
        ));
    }

    #[tokio::test]
    async fn sends_to_one_chat_run_one_at_a_time() {
        let (store, backend, _) = setup(true);
        let chat = store.new_chat(None).await.unwrap();
        let gate = Arc::new(Notify::new());
        backend.push_stream(StreamScript::Gated {
            gate: gate.clone(),
            chunks: vec!["first reply".into()],
        });
        backend.push_stream(StreamScript::reply(&["second reply"]));

        let spawn_send = |content: &'static str| {
            let store = store.clone();
            let chat_id = chat.id.clone();
            tokio::spawn(async move { store.send_message(content, Some(&chat_id)).await })
        };

        let first = spawn_send("first");
        assert!(eventually(|| store.is_chat_streaming(&chat.id)).await);
        let second = spawn_send("second");

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.count(|c| matches!(c, Call::Stream { .. })), 1);
        assert_eq!(store.messages(&chat.id).len(), 2);

        gate.notify_one();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(
            contents(&store, &chat.id),
            vec![
                (Role::User, "first".into()),
                (Role::Assistant, "first reply".into()),
                (Role::User, "second".into()),
                (Role::Assistant, "second reply".into()),
            ]
        );
    }

    #[tokio::test]
    async fn default_title_is_replaced_after_first_message() {
        let (store, _, persistence) = setup(false);
        let chat = store.new_chat(None).await.unwrap();
        assert!(chat.has_default_title());

        store
            .send_message("# Plan the **team offsite** agenda", Some(&chat.id))
            .await
            .unwrap();
        assert_eq!(
            store.chat(&chat.id).unwrap().title,
            "Plan the team offsite agenda"
        );

        let mut saved = false;
        for _ in 0..100 {
            let remote = persistence.list_chats(USER_ID).await.unwrap();
            if remote.iter().any(|c| c.title == "Plan the team offsite agenda") {
                saved = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(saved);

        store.send_message("and the budget", Some(&chat.id)).await.unwrap();
        assert_eq!(
            store.chat(&chat.id).unwrap().title,
            "Plan the team offsite agenda"
        );
    }

    #[tokio::test]
    async fn reacting_twice_with_same_type_clears_it() {
        let (store, _, persistence) = setup(false);
        let chat_id = store.send_message("hi", None).await.unwrap();
        let reply = store.messages(&chat_id)[1].clone();

        let first = store
            .react_to_message(&reply.id, ReactionType::ThumbsUp)
            .await
            .unwrap();
        assert!(matches!(first, Some(ReactionChange::Added(_))));
        assert_eq!(store.messages(&chat_id)[1].reactions.len(), 1);

        let second = store
            .react_to_message(&reply.id, ReactionType::ThumbsUp)
            .await
            .unwrap();
        assert!(matches!(second, Some(ReactionChange::Removed(_))));
        assert!(store.messages(&chat_id)[1].reactions.is_empty());
        assert!(
            persistence
                .list_reactions(&[reply.id.clone()])
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn reacting_with_another_type_replaces_it() {
        let (store, _, persistence) = setup(false);
        let chat_id = store.send_message("hi", None).await.unwrap();
        let reply = store.messages(&chat_id)[1].clone();

        store
            .react_to_message(&reply.id, ReactionType::ThumbsUp)
            .await
            .unwrap();
        let change = store
            .react_to_message(&reply.id, ReactionType::ThumbsDown)
            .await
            .unwrap();
        assert!(matches!(
            change,
            Some(ReactionChange::Updated(Reaction {
                kind: ReactionType::ThumbsDown,
                ..
            }))
        ));

        let stored = persistence.list_reactions(&[reply.id.clone()]).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].kind, ReactionType::ThumbsDown);
        let local = &store.messages(&chat_id)[1];
        assert_eq!(
            local.reaction_by(USER_ID).map(|r| r.kind),
            Some(ReactionType::ThumbsDown)
        );
    }

    #[tokio::test]
    async fn reacting_without_session_does_nothing() {
        let (store, _, persistence) = setup(false);
        persistence.set_session(None);
        let change = store
            .react_to_message("m1", ReactionType::Flag)
            .await
            .unwrap();
        assert_eq!(change, None);
        assert!(store.load_chats().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_and_select_chat_restore_history() {
        let (store, _, persistence) = setup(true);
        let older = persistence
            .insert_chat(&Chat::new("Older", Some(USER_ID.into())))
            .await
            .unwrap();
        let newer = persistence
            .insert_chat(&Chat::new("Newer", Some(USER_ID.into())))
            .await
            .unwrap();
        let mut gone = Chat::new("Gone", Some(USER_ID.into()));
        gone.status = ChatStatus::Deleted;
        persistence.insert_chat(&gone).await.unwrap();
        persistence
            .insert_chat(&Chat::new("Someone else", Some("u2".into())))
            .await
            .unwrap();

        let question = persistence
            .insert_message(&Message::user(&older.id, "question"))
            .await
            .unwrap();
        let mut hidden = Message::assistant(&older.id, "retracted");
        hidden.deleted = true;
        persistence.insert_message(&hidden).await.unwrap();
        let answer = persistence
            .insert_message(&Message::assistant(&older.id, "answer"))
            .await
            .unwrap();
        persistence
            .insert_reaction(&Reaction::new(&answer.id, USER_ID, ReactionType::ThumbsUp))
            .await
            .unwrap();

        let chats = store.load_chats().await.unwrap();
        let ids: Vec<&str> = chats.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![newer.id.as_str(), older.id.as_str()]);

        let messages = store.select_chat(&older.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, question.id);
        assert_eq!(messages[1].reactions.len(), 1);
        assert_eq!(store.current_chat_id().as_deref(), Some(older.id.as_str()));

        assert!(matches!(
            store.select_chat("nope").await,
            Err(StoreError::ChatNotFound(_))
        ));
    }

    #[tokio::test]
    async fn chat_lifecycle_updates_local_and_remote() {
        let (store, _, persistence) = setup(false);
        let chat = store.new_chat(None).await.unwrap();

        let renamed = store.rename_chat(&chat.id, "Trip ideas").await.unwrap();
        assert_eq!(renamed.title, "Trip ideas");
        let bookmarked = store.toggle_bookmark(&chat.id).await.unwrap();
        assert!(bookmarked.bookmarked);
        let archived = store
            .set_chat_status(&chat.id, ChatStatus::Archived)
            .await
            .unwrap();
        assert_eq!(archived.status, ChatStatus::Archived);

        let remote = persistence.list_chats(USER_ID).await.unwrap();
        assert_eq!(remote[0].title, "Trip ideas");
        assert!(remote[0].bookmarked);

        store.delete_chat(&chat.id, false).await.unwrap();
        assert!(store.chats().is_empty());
        assert_eq!(store.current_chat_id(), None);
        let remote = persistence.list_chats(USER_ID).await.unwrap();
        assert_eq!(remote[0].status, ChatStatus::Deleted);

        let other = store.new_chat(Some("Scratch")).await.unwrap();
        store.delete_chat(&other.id, true).await.unwrap();
        assert_eq!(persistence.list_chats(USER_ID).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_messages() {
        let (store, _, persistence) = setup(false);
        let chat_id = store.send_message("hi", None).await.unwrap();
        let messages = store.messages(&chat_id);

        // The local user row never reached storage under its own id.
        store.delete_message(&messages[0].id).await.unwrap();
        store.delete_message(&messages[1].id).await.unwrap();
        assert!(store.messages(&chat_id).is_empty());

        let stored = persistence.list_messages(&chat_id).await.unwrap();
        let reply = stored.iter().find(|m| m.id == messages[1].id).unwrap();
        assert!(reply.deleted);

        assert!(matches!(
            store.delete_message(&messages[1].id).await,
            Err(StoreError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn staged_attachments_ride_along_with_next_message() {
        let (store, _, _) = setup(false);
        let report = store.stage_attachment("report.pdf", "application/pdf", 2048, "local:1");
        let draft = store.stage_attachment("draft.txt", "text/plain", 12, "local:2");
        assert!(store.remove_pending_attachment(&draft.id));
        assert!(!store.remove_pending_attachment(&draft.id));

        let confirmed = store.confirm_attachments().await.unwrap();
        assert_eq!(confirmed.len(), 1);
        assert!(confirmed[0].confirmed);
        assert_eq!(confirmed[0].id, report.id);
        assert_ne!(confirmed[0].reference, "local:1");

        let chat_id = store.send_message("see attached", None).await.unwrap();
        assert!(store.pending_attachments().is_empty());
        let sent = &store.messages(&chat_id)[0];
        assert_eq!(sent.attachments.len(), 1);
        assert_eq!(sent.attachments[0].name, "report.pdf");
    }

    #[tokio::test]
    async fn realtime_changes_merge_without_duplicates() {
        let (store, _, persistence) = setup(false);
        let chat = store.new_chat(None).await.unwrap();
        let watch = store.watch_messages().await.unwrap();

        store.send_message("hello", Some(&chat.id)).await.unwrap();
        let settled = eventually(|| {
            let messages = store.messages(&chat.id);
            messages.len() == 2 && store.read().unconfirmed.is_empty()
        })
        .await;
        assert!(settled, "user echo should be adopted, not duplicated");

        let pushed = persistence
            .insert_message(&Message::assistant(&chat.id, "reminder: standup at 10"))
            .await
            .unwrap();
        assert!(eventually(|| store.messages(&chat.id).len() == 3).await);

        persistence
            .update_message(&pushed.id, &MessagePatch::content("reminder: standup at 11"))
            .await
            .unwrap();
        assert!(
            eventually(|| store
                .messages(&chat.id)
                .iter()
                .any(|m| m.content == "reminder: standup at 11"))
            .await
        );

        persistence
            .update_message(&pushed.id, &MessagePatch::soft_delete())
            .await
            .unwrap();
        assert!(eventually(|| store.messages(&chat.id).len() == 2).await);

        watch.unsubscribe();
        tokio::task::yield_now().await;
        persistence
            .insert_message(&Message::assistant(&chat.id, "after unsubscribe"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.messages(&chat.id).len(), 2);
    }

    #[tokio::test]
    async fn delete_carrying_only_an_id_removes_the_message() {
        let (store, _, _) = setup(false);
        let chat = store.new_chat(None).await.unwrap();
        store.send_message("tidy up", Some(&chat.id)).await.unwrap();
        let reply = store.messages(&chat.id)[1].clone();

        store.apply_change(&ChangeEvent {
            table: Table::Messages,
            kind: ChangeKind::Delete,
            record: serde_json::json!({ "id": reply.id }),
        });
        store.apply_change(&ChangeEvent {
            table: Table::Messages,
            kind: ChangeKind::Delete,
            record: serde_json::json!({ "id": "never-loaded" }),
        });

        assert_eq!(
            contents(&store, &chat.id),
            vec![(Role::User, "tidy up".into())]
        );
    }
}
