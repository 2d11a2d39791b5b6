use super::{AiBackend, BackendError, StreamEvent};
use crate::{
    models::{Chat, Message},
    persistence::Persistence,
    store::STREAM_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Wraps a backend and writes what it creates into `persistence`.
///
/// A real server stores chats and messages in the shared database. When the
/// client runs against local tables instead, this puts the same rows there so
/// renames, bookmarks and deletes find them.
pub struct RecordingBackend {
    inner: Arc<dyn AiBackend>,
    persistence: Arc<dyn Persistence>,
    user_id: String,
}

impl RecordingBackend {
    pub fn new(
        inner: Arc<dyn AiBackend>,
        persistence: Arc<dyn Persistence>,
        user_id: &str,
    ) -> Self {
        Self {
            inner,
            persistence,
            user_id: user_id.to_string(),
        }
    }

    fn user_message(&self, chat_id: &str, content: &str) -> Message {
        let mut message = Message::user(chat_id, content);
        message.user_id = Some(self.user_id.clone());
        message
    }

    async fn record(&self, message: &Message) {
        if let Err(e) = self.persistence.insert_message(message).await {
            warn!("Failed to record message {}: {}", message.id, e);
        }
    }
}

#[async_trait]
impl AiBackend for RecordingBackend {
    async fn create_chat(&self, title: &str) -> Result<Chat, BackendError> {
        let mut chat = self.inner.create_chat(title).await?;
        chat.user_id.get_or_insert_with(|| self.user_id.clone());
        match self.persistence.insert_chat(&chat).await {
            Ok(stored) => Ok(stored),
            Err(e) => {
                warn!("Failed to record chat {}: {}", chat.id, e);
                Ok(chat)
            }
        }
    }

    async fn send_message(&self, chat_id: &str, content: &str) -> Result<Message, BackendError> {
        let user = self.user_message(chat_id, content);
        let reply = self.inner.send_message(chat_id, content).await?;
        self.record(&user).await;
        self.record(&reply).await;
        Ok(reply)
    }

    async fn send_message_stream(
        &self,
        chat_id: &str,
        content: &str,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), BackendError> {
        let user = self.user_message(chat_id, content);
        let user = &user;
        let (inner_tx, mut inner_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        let forward = async move {
            while let Some(event) = inner_rx.recv().await {
                match &event {
                    StreamEvent::Command(message) => self.record(message).await,
                    StreamEvent::Complete(reply) => {
                        self.record(user).await;
                        if let Some(reply) = reply {
                            self.record(reply).await;
                        }
                    }
                    StreamEvent::Chunk(_) | StreamEvent::Error(_) => {}
                }
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        };
        let (result, ()) = tokio::join!(
            self.inner.send_message_stream(chat_id, content, inner_tx),
            forward
        );
        result
    }

    async fn stop_stream(&self, chat_id: &str) -> Result<(), BackendError> {
        self.inner.stop_stream(chat_id).await
    }
}
