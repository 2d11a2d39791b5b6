use crate::models::{Chat, Message};
use async_trait::async_trait;
use tokio::sync::mpsc;

mod http;
mod recording;
pub mod sse;

pub use http::HttpBackend;
pub use recording::RecordingBackend;

/// One decoded event of a streamed assistant response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text to append to the in-flight reply.
    Chunk(String),
    /// Result of a server-side command, shown as its own message.
    Command(Message),
    /// The stored reply. `None` when the server did not echo the row.
    Complete(Option<Message>),
    Error(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Stream error: {0}")]
    Stream(String),
}

/// The AI side of a conversation.
#[async_trait]
pub trait AiBackend: Send + Sync {
    async fn create_chat(&self, title: &str) -> Result<Chat, BackendError>;

    /// Sends `content` and waits for the complete assistant reply.
    async fn send_message(&self, chat_id: &str, content: &str) -> Result<Message, BackendError>;

    /// Sends `content` and forwards the reply as it is produced. Returns once
    /// the stream ends or `tx` is closed.
    async fn send_message_stream(
        &self,
        chat_id: &str,
        content: &str,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), BackendError>;

    /// Asks the server to stop generating for `chat_id`. Best effort.
    async fn stop_stream(&self, chat_id: &str) -> Result<(), BackendError>;
}
