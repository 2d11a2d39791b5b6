use super::{
    ChangeEvent, Persistence, PersistenceError, PollCursor, SUBSCRIPTION_CAPACITY, Subscription,
    Table,
};
use crate::models::{
    Attachment, Chat, ChatPatch, Message, MessagePatch, NewTask, Profile, Reaction, ReactionType,
    Session, Task, TaskPatch,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{collections::HashSet, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RestPersistence {
    client: Client,
    base_url: String,
    anon_key: String,
    access_token: Option<String>,
    poll_interval: Duration,
}

#[derive(Deserialize)]
struct AuthUser {
    id: String,
    email: Option<String>,
}

#[derive(Serialize)]
struct ReactionKindPatch {
    #[serde(rename = "type")]
    kind: ReactionType,
}

impl RestPersistence {
    pub fn new(
        base_url: &str,
        anon_key: &str,
        access_token: Option<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            access_token,
            poll_interval,
        }
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.as_str())
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.anon_key);
        req.header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", bearer))
    }

    async fn check(resp: Response) -> Result<Response, PersistenceError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let message = resp.text().await.unwrap_or_default();
        if status == 401 {
            return Err(PersistenceError::Unauthenticated);
        }
        Err(PersistenceError::Api { status, message })
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: Table,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, PersistenceError> {
        self.select_columns(table, "*", query).await
    }

    async fn select_columns<T: DeserializeOwned>(
        &self,
        table: Table,
        columns: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, PersistenceError> {
        let req = self
            .client
            .get(self.table_url(table))
            .query(&[("select", columns)])
            .query(query);
        let resp = Self::check(self.authorize(req).send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn insert<B, T>(&self, table: Table, body: &B) -> Result<T, PersistenceError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let req = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(body);
        let resp = Self::check(self.authorize(req).send().await?).await?;
        let rows: Vec<T> = resp.json().await?;
        rows.into_iter().next().ok_or_else(|| {
            PersistenceError::Parse(format!("{} insert returned no rows", table.as_str()))
        })
    }

    async fn update<B, T>(&self, table: Table, id: &str, body: &B) -> Result<T, PersistenceError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let req = self
            .client
            .patch(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .json(body);
        let resp = Self::check(self.authorize(req).send().await?).await?;
        let rows: Vec<T> = resp.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| PersistenceError::NotFound(format!("{} {}", table.as_str(), id)))
    }

    async fn delete(&self, table: Table, query: &[(&str, String)]) -> Result<(), PersistenceError> {
        let req = self.client.delete(self.table_url(table)).query(query);
        Self::check(self.authorize(req).send().await?).await?;
        Ok(())
    }

    /// Ids plus change stamps of every row, enough to seed a cursor.
    async fn stamps(&self, table: Table) -> Result<Vec<serde_json::Value>, PersistenceError> {
        let columns = format!("id,{}", table.stamp_columns().join(","));
        self.select_columns(table, &columns, &[]).await
    }

    async fn live_ids(&self, table: Table) -> Result<HashSet<String>, PersistenceError> {
        #[derive(Deserialize)]
        struct Id {
            id: String,
        }
        let rows: Vec<Id> = self.select_columns(table, "id", &[]).await?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    /// One poll: full rows changed since the cursor, then the id sweep.
    async fn poll(
        &self,
        table: Table,
        cursor: &mut PollCursor,
    ) -> Result<Vec<ChangeEvent>, PersistenceError> {
        let filter: Vec<(&str, String)> = cursor.filter().into_iter().collect();
        let rows: Vec<serde_json::Value> = self.select(table, &filter).await?;
        let live = self.live_ids(table).await?;
        let mut events = cursor.changed(rows);
        events.extend(cursor.removed(&live));
        Ok(events)
    }
}

#[async_trait]
impl Persistence for RestPersistence {
    async fn session(&self) -> Result<Option<Session>, PersistenceError> {
        let Some(token) = self.access_token.clone() else {
            return Ok(None);
        };

        let resp = self
            .client
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await?;

        let user: AuthUser = match Self::check(resp).await {
            Ok(resp) => resp.json().await?,
            Err(PersistenceError::Unauthenticated) => {
                debug!("Access token rejected by auth endpoint");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        Ok(Some(Session {
            user_id: user.id,
            email: user.email,
            access_token: token,
        }))
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, PersistenceError> {
        let rows: Vec<Profile> = self
            .select(Table::Profiles, &[("id", format!("eq.{}", user_id))])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn list_chats(&self, user_id: &str) -> Result<Vec<Chat>, PersistenceError> {
        self.select(
            Table::Chats,
            &[
                ("user_id", format!("eq.{}", user_id)),
                ("order", "updated_at.desc".to_string()),
            ],
        )
        .await
    }

    async fn insert_chat(&self, chat: &Chat) -> Result<Chat, PersistenceError> {
        self.insert(Table::Chats, chat).await
    }

    async fn update_chat(
        &self,
        chat_id: &str,
        patch: &ChatPatch,
    ) -> Result<Chat, PersistenceError> {
        self.update(Table::Chats, chat_id, patch).await
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<(), PersistenceError> {
        self.delete(Table::Messages, &[("chat_id", format!("eq.{}", chat_id))])
            .await?;
        self.delete(Table::Chats, &[("id", format!("eq.{}", chat_id))])
            .await
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, PersistenceError> {
        self.select(
            Table::Messages,
            &[
                ("chat_id", format!("eq.{}", chat_id)),
                ("order", "created_at.asc".to_string()),
            ],
        )
        .await
    }

    async fn insert_message(&self, message: &Message) -> Result<Message, PersistenceError> {
        self.insert(Table::Messages, message).await
    }

    async fn update_message(
        &self,
        message_id: &str,
        patch: &MessagePatch,
    ) -> Result<Message, PersistenceError> {
        self.update(Table::Messages, message_id, patch).await
    }

    async fn list_reactions(
        &self,
        message_ids: &[String],
    ) -> Result<Vec<Reaction>, PersistenceError> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.select(
            Table::Reactions,
            &[("message_id", format!("in.({})", message_ids.join(",")))],
        )
        .await
    }

    async fn find_reaction(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> Result<Option<Reaction>, PersistenceError> {
        let rows: Vec<Reaction> = self
            .select(
                Table::Reactions,
                &[
                    ("message_id", format!("eq.{}", message_id)),
                    ("user_id", format!("eq.{}", user_id)),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_reaction(&self, reaction: &Reaction) -> Result<Reaction, PersistenceError> {
        self.insert(Table::Reactions, reaction).await
    }

    async fn update_reaction(
        &self,
        reaction_id: &str,
        kind: ReactionType,
    ) -> Result<Reaction, PersistenceError> {
        self.update(Table::Reactions, reaction_id, &ReactionKindPatch { kind })
            .await
    }

    async fn delete_reaction(&self, reaction_id: &str) -> Result<(), PersistenceError> {
        self.delete(Table::Reactions, &[("id", format!("eq.{}", reaction_id))])
            .await
    }

    async fn upload_attachment(
        &self,
        attachment: &Attachment,
    ) -> Result<Attachment, PersistenceError> {
        let mut record = attachment.clone();
        record.confirmed = true;
        self.insert(Table::Attachments, &record).await
    }

    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>, PersistenceError> {
        self.select(
            Table::Tasks,
            &[
                ("user_id", format!("eq.{}", user_id)),
                ("order", "created_at.desc".to_string()),
            ],
        )
        .await
    }

    async fn insert_task(&self, task: &NewTask) -> Result<Task, PersistenceError> {
        self.insert(Table::Tasks, task).await
    }

    async fn update_task(
        &self,
        task_id: &str,
        patch: &TaskPatch,
    ) -> Result<Task, PersistenceError> {
        self.update(Table::Tasks, task_id, patch).await
    }

    /// Polls the table for rows stamped since the last poll and sweeps ids
    /// for deletions.
    async fn subscribe(&self, table: Table) -> Result<Subscription, PersistenceError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let poller = self.clone();
        let mut cursor = PollCursor::new(table);
        cursor.seed(poller.stamps(table).await?);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.poll_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let events = match poller.poll(table, &mut cursor).await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("Polling {} failed: {}", table.as_str(), e);
                        continue;
                    }
                };
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Subscription::new(rx, handle.abort_handle()))
    }
}
