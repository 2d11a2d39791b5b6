//! Message-passing front door to the [`ChatStore`].
//!
//! The UI sends [`ChatCommand`]s over an mpsc channel and awaits the oneshot
//! reply. Each command runs on its own task, so a `Stop` issued during a
//! long send is not queued behind it.

use crate::{
    models::{Chat, Message, ReactionType},
    store::{ChatStore, ReactionChange, StoreError},
};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::debug;

pub type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

#[derive(Debug)]
pub enum ChatCommand {
    Send {
        content: String,
        chat_id: Option<String>,
        reply: Reply<String>,
    },
    Stop {
        chat_id: String,
        reply: Reply<()>,
    },
    NewChat {
        title: Option<String>,
        reply: Reply<Chat>,
    },
    SelectChat {
        chat_id: String,
        reply: Reply<Vec<Message>>,
    },
    React {
        message_id: String,
        kind: ReactionType,
        reply: Reply<Option<ReactionChange>>,
    },
}

impl ChatCommand {
    fn name(&self) -> &'static str {
        match self {
            ChatCommand::Send { .. } => "send",
            ChatCommand::Stop { .. } => "stop",
            ChatCommand::NewChat { .. } => "new_chat",
            ChatCommand::SelectChat { .. } => "select_chat",
            ChatCommand::React { .. } => "react",
        }
    }
}

async fn execute(store: &ChatStore, command: ChatCommand) {
    // A dropped receiver means the caller stopped waiting.
    match command {
        ChatCommand::Send {
            content,
            chat_id,
            reply,
        } => {
            let _ = reply.send(store.send_message(&content, chat_id.as_deref()).await);
        }
        ChatCommand::Stop { chat_id, reply } => {
            let _ = reply.send(store.stop_streaming(&chat_id).await);
        }
        ChatCommand::NewChat { title, reply } => {
            let _ = reply.send(store.new_chat(title.as_deref()).await);
        }
        ChatCommand::SelectChat { chat_id, reply } => {
            let _ = reply.send(store.select_chat(&chat_id).await);
        }
        ChatCommand::React {
            message_id,
            kind,
            reply,
        } => {
            let _ = reply.send(store.react_to_message(&message_id, kind).await);
        }
    }
}

pub fn spawn_dispatcher(
    store: Arc<ChatStore>,
    mut rx: mpsc::Receiver<ChatCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            debug!("Dispatching {} command", command.name());
            let store = store.clone();
            tokio::spawn(async move { execute(&store, command).await });
        }
        debug!("Command channel closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        persistence::MemoryPersistence,
        store::StoreOptions,
        testing::{Call, ScriptedBackend, StreamScript, eventually, session},
    };
    use tokio::sync::Notify;

    #[tokio::test]
    async fn stop_is_not_blocked_by_a_running_send() {
        let persistence = Arc::new(MemoryPersistence::with_session(session()));
        let backend = ScriptedBackend::new(persistence.clone());
        let store = ChatStore::new(persistence, backend.clone(), StoreOptions::default());
        let (tx, rx) = mpsc::channel(8);
        let dispatcher = spawn_dispatcher(store.clone(), rx);

        let (reply, created) = oneshot::channel();
        tx.send(ChatCommand::NewChat {
            title: Some("Long job".into()),
            reply,
        })
        .await
        .unwrap();
        let chat = created.await.unwrap().unwrap();

        let gate = Arc::new(Notify::new());
        backend.push_stream(StreamScript::Gated {
            gate: gate.clone(),
            chunks: vec!["finished".into()],
        });
        let (reply, sent) = oneshot::channel();
        tx.send(ChatCommand::Send {
            content: "run the job".into(),
            chat_id: Some(chat.id.clone()),
            reply,
        })
        .await
        .unwrap();
        assert!(eventually(|| store.is_chat_streaming(&chat.id)).await);

        let (reply, stopped) = oneshot::channel();
        tx.send(ChatCommand::Stop {
            chat_id: chat.id.clone(),
            reply,
        })
        .await
        .unwrap();
        stopped.await.unwrap().unwrap();
        assert!(backend.calls().contains(&Call::Stop(chat.id.clone())));

        gate.notify_one();
        assert_eq!(sent.await.unwrap().unwrap(), chat.id);

        drop(tx);
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn errors_travel_back_on_the_reply() {
        let persistence = Arc::new(MemoryPersistence::new());
        let backend = ScriptedBackend::new(persistence.clone());
        let store = ChatStore::new(persistence, backend, StoreOptions::default());
        let (tx, rx) = mpsc::channel(8);
        spawn_dispatcher(store, rx);

        let (reply, selected) = oneshot::channel();
        tx.send(ChatCommand::SelectChat {
            chat_id: "missing".into(),
            reply,
        })
        .await
        .unwrap();
        assert!(matches!(
            selected.await.unwrap(),
            Err(StoreError::ChatNotFound(_))
        ));

        let (reply, reacted) = oneshot::channel();
        tx.send(ChatCommand::React {
            message_id: "m1".into(),
            kind: ReactionType::ThumbsUp,
            reply,
        })
        .await
        .unwrap();
        assert_eq!(reacted.await.unwrap().unwrap(), None);
    }
}
