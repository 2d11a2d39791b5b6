use super::{AiBackend, BackendError, StreamEvent, sse::SseDecoder};
use crate::models::{Chat, Message};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    access_token: Option<String>,
}

#[derive(Serialize)]
struct CreateChatRequest<'a> {
    title: &'a str,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    content: &'a str,
    role: &'static str,
}

impl HttpBackend {
    pub fn new(base_url: &str, access_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
        }
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let req = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Content-Type", "application/json");
        match &self.access_token {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }

    async fn check(resp: Response) -> Result<Response, BackendError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let message = resp.text().await.unwrap_or_default();
        Err(BackendError::Api { status, message })
    }
}

#[async_trait]
impl AiBackend for HttpBackend {
    async fn create_chat(&self, title: &str) -> Result<Chat, BackendError> {
        let resp = self
            .post("/api/chats/")
            .json(&CreateChatRequest { title })
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        resp.json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }

    async fn send_message(&self, chat_id: &str, content: &str) -> Result<Message, BackendError> {
        let resp = self
            .post(&format!("/api/messages/chat/{}", chat_id))
            .json(&SendMessageRequest {
                content,
                role: "user",
            })
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        resp.json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }

    async fn send_message_stream(
        &self,
        chat_id: &str,
        content: &str,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), BackendError> {
        let resp = self
            .post(&format!("/api/messages/chat/{}/stream", chat_id))
            .header("Accept", "text/event-stream")
            .json(&SendMessageRequest {
                content,
                role: "user",
            })
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        let mut decoder = SseDecoder::new(chat_id);
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for event in decoder.push(&chunk) {
                if tx.send(event).await.is_err() {
                    debug!("Stream receiver for chat {} went away", chat_id);
                    return Ok(());
                }
            }
        }

        for event in decoder.finish() {
            if tx.send(event).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn stop_stream(&self, chat_id: &str) -> Result<(), BackendError> {
        let resp = self
            .post(&format!("/api/messages/chat/{}/stop", chat_id))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}
