use crate::{
    backend::{AiBackend, BackendError, StreamEvent},
    models::{Chat, Message, Session},
    persistence::{MemoryPersistence, Persistence},
};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{Notify, mpsc};

pub const USER_ID: &str = "u1";

pub fn session() -> Session {
    Session {
        user_id: USER_ID.to_string(),
        email: Some("ada@example.com".to_string()),
        access_token: "token".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateChat(String),
    Send { chat_id: String, content: String },
    Stream { chat_id: String, content: String },
    Stop(String),
}

pub enum StreamScript {
    /// Command notices, then chunks, then a stored completion row.
    Reply {
        commands: Vec<String>,
        chunks: Vec<String>,
    },
    /// Raw events, sent as is.
    Events(Vec<StreamEvent>),
    /// Events followed by a transport failure.
    Fail {
        events: Vec<StreamEvent>,
        error: String,
    },
    /// Waits for the gate before replying with `chunks`.
    Gated { gate: Arc<Notify>, chunks: Vec<String> },
}

impl StreamScript {
    pub fn reply(chunks: &[&str]) -> Self {
        Self::Reply {
            commands: Vec::new(),
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Backend double that records calls, stores what a real server would, and
/// replays queued scripts.
pub struct ScriptedBackend {
    persistence: Arc<MemoryPersistence>,
    streams: Mutex<VecDeque<StreamScript>>,
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedBackend {
    pub fn new(persistence: Arc<MemoryPersistence>) -> Arc<Self> {
        Arc::new(Self {
            persistence,
            streams: Mutex::new(VecDeque::new()),
            replies: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn push_stream(&self, script: StreamScript) {
        self.streams.lock().unwrap().push_back(script);
    }

    pub fn push_reply(&self, reply: Result<&str, &str>) {
        self.replies
            .lock()
            .unwrap()
            .push_back(reply.map(String::from).map_err(String::from));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| matches(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn store_user_message(&self, chat_id: &str, content: &str) {
        let mut message = Message::user(chat_id, content);
        message.user_id = Some(USER_ID.to_string());
        let _ = self.persistence.insert_message(&message).await;
    }

    async fn store_reply(&self, chat_id: &str, content: &str) -> Message {
        let message = Message::assistant(chat_id, content);
        let _ = self.persistence.insert_message(&message).await;
        message
    }
}

#[async_trait]
impl AiBackend for ScriptedBackend {
    async fn create_chat(&self, title: &str) -> Result<Chat, BackendError> {
        self.record(Call::CreateChat(title.to_string()));
        // Lets concurrent callers interleave as they would over the network.
        tokio::task::yield_now().await;
        let chat = Chat::new(title, Some(USER_ID.to_string()));
        self.persistence
            .insert_chat(&chat)
            .await
            .map_err(|e| BackendError::Stream(e.to_string()))
    }

    async fn send_message(&self, chat_id: &str, content: &str) -> Result<Message, BackendError> {
        self.record(Call::Send {
            chat_id: chat_id.to_string(),
            content: content.to_string(),
        });
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("ok".to_string()));
        match reply {
            Ok(text) => {
                self.store_user_message(chat_id, content).await;
                Ok(self.store_reply(chat_id, &text).await)
            }
            Err(message) => Err(BackendError::Api {
                status: 503,
                message,
            }),
        }
    }

    async fn send_message_stream(
        &self,
        chat_id: &str,
        content: &str,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), BackendError> {
        self.record(Call::Stream {
            chat_id: chat_id.to_string(),
            content: content.to_string(),
        });
        let script = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| StreamScript::reply(&["ok"]));

        let (commands, chunks) = match script {
            StreamScript::Reply { commands, chunks } => (commands, chunks),
            StreamScript::Gated { gate, chunks } => {
                gate.notified().await;
                (Vec::new(), chunks)
            }
            StreamScript::Events(events) => {
                for event in events {
                    let _ = tx.send(event).await;
                }
                return Ok(());
            }
            StreamScript::Fail { events, error } => {
                for event in events {
                    let _ = tx.send(event).await;
                }
                return Err(BackendError::Stream(error));
            }
        };

        for command in commands {
            let notice = Message::assistant(chat_id, &command);
            let _ = tx.send(StreamEvent::Command(notice)).await;
        }
        for chunk in &chunks {
            let _ = tx.send(StreamEvent::Chunk(chunk.clone())).await;
        }
        self.store_user_message(chat_id, content).await;
        let stored = self.store_reply(chat_id, &chunks.concat()).await;
        let _ = tx.send(StreamEvent::Complete(Some(stored))).await;
        Ok(())
    }

    async fn stop_stream(&self, chat_id: &str) -> Result<(), BackendError> {
        self.record(Call::Stop(chat_id.to_string()));
        Ok(())
    }
}

/// Polls `check` until it holds or a second passes.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
