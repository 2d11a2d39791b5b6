use anyhow::Result;
use archyx_chat::{
    backend::{AiBackend, HttpBackend, RecordingBackend},
    commands::{ChatCommand, spawn_dispatcher},
    config::Config,
    models::{Chat, Message, Profile, ProfileRole, ReactionType, Role, Session},
    persistence::{MemoryPersistence, Persistence, RestPersistence},
    store::{ChatStore, ReactionChange, StoreError, StoreEvent, StoreOptions},
    tasks::TaskBoard,
};
use std::{collections::HashMap, io::Write, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{broadcast, mpsc, oneshot},
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const OFFLINE_USER: &str = "local";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            config.log_filter(std::env::var("RUST_LOG").ok()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let http = Arc::new(HttpBackend::new(
        &config.backend_url,
        config.access_token.clone(),
    ));
    let (persistence, backend): (Arc<dyn Persistence>, Arc<dyn AiBackend>) =
        if config.is_offline() {
            info!("No persistence url configured, running offline");
            let local = Arc::new(MemoryPersistence::with_session(Session {
                user_id: OFFLINE_USER.to_string(),
                email: None,
                access_token: String::new(),
            }));
            local.add_profile(Profile {
                id: OFFLINE_USER.to_string(),
                email: None,
                display_name: Some("Local user".to_string()),
                role: ProfileRole::User,
                created_at: None,
            });
            let backend = RecordingBackend::new(http, local.clone(), OFFLINE_USER);
            (local as Arc<dyn Persistence>, Arc::new(backend) as Arc<dyn AiBackend>)
        } else {
            let rest = RestPersistence::new(
                &config.persistence_url,
                &config.anon_key,
                config.access_token.clone(),
                config.poll_interval,
            );
            (Arc::new(rest) as Arc<dyn Persistence>, http as Arc<dyn AiBackend>)
        };

    let store = ChatStore::new(
        persistence.clone(),
        backend,
        StoreOptions {
            streaming: config.streaming,
        },
    );
    let board = TaskBoard::new(persistence.clone());

    if let Err(e) = store.load_chats().await {
        warn!("Failed to load chats: {}", e);
    }
    match persistence.session().await {
        Ok(Some(session)) => {
            match persistence.get_profile(&session.user_id).await {
                Ok(Some(profile)) => info!("Signed in as {}", profile.label()),
                Ok(None) => info!("Signed in as {}", session.user_id),
                Err(e) => warn!("Failed to load profile: {}", e),
            }
            if let Err(e) = board.load(&session.user_id).await {
                warn!("Failed to load tasks: {}", e);
            }
        }
        Ok(None) => warn!("No active session, chats and tasks will not load"),
        Err(e) => warn!("Failed to read session: {}", e),
    }

    let message_watch = store.watch_messages().await?;
    let task_watch = board.watch().await?;

    let printer = tokio::spawn(print_events(store.subscribe()));
    let (tx, rx) = mpsc::channel(32);
    let dispatcher = spawn_dispatcher(store.clone(), rx);
    let input = tokio::spawn(repl(store.clone(), board.clone(), tx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = input => {}
    }

    message_watch.unsubscribe();
    task_watch.unsubscribe();
    printer.abort();
    dispatcher.abort();
    info!("Shutdown complete");

    Ok(())
}

async fn repl(store: Arc<ChatStore>, board: Arc<TaskBoard>, tx: mpsc::Sender<ChatCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        match command {
            "/quit" => break,
            "/chats" => {
                let current = store.current_chat_id();
                for chat in store.chats() {
                    let marker = if current.as_deref() == Some(chat.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!("{} {}  {}", marker, chat.id, chat.title);
                }
            }
            "/tasks" => {
                for task in board.tasks() {
                    let status = format!("{:?}", task.status);
                    let command = task.command.as_deref().unwrap_or(&task.command_id);
                    println!("{}  {:<10} {}", task.id, status, command);
                }
            }
            "/cancel" => match board.cancel_task(rest).await {
                Ok(task) => println!("Cancelled {}", task.id),
                Err(e) => println!("Error: {}", e),
            },
            "/new" => {
                let title = (!rest.is_empty()).then(|| rest.to_string());
                request(
                    &tx,
                    |reply| ChatCommand::NewChat { title, reply },
                    |chat: Chat| println!("Started chat {} ({})", chat.id, chat.title),
                );
            }
            "/open" => {
                let chat_id = rest.to_string();
                request(
                    &tx,
                    |reply| ChatCommand::SelectChat { chat_id, reply },
                    |messages: Vec<Message>| {
                        for message in messages {
                            println!("{}: {}", label(message.role), message.content);
                        }
                    },
                );
            }
            "/stop" => match store.current_chat_id() {
                Some(chat_id) if store.is_chat_streaming(&chat_id) => {
                    request(&tx, |reply| ChatCommand::Stop { chat_id, reply }, |_: ()| {})
                }
                _ => println!("Nothing is streaming"),
            },
            "/react" => {
                let mut parts = rest.split_whitespace();
                let (Some(message_id), Some(kind)) = (parts.next(), parts.next()) else {
                    println!("Usage: /react <message_id> <thumbs_up|thumbs_down|flag>");
                    continue;
                };
                let kind: ReactionType = match kind.parse() {
                    Ok(kind) => kind,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                let message_id = message_id.to_string();
                request(
                    &tx,
                    |reply| ChatCommand::React {
                        message_id,
                        kind,
                        reply,
                    },
                    |change: Option<ReactionChange>| println!("{:?}", change),
                );
            }
            _ => {
                let content = line.to_string();
                request(
                    &tx,
                    |reply| ChatCommand::Send {
                        content,
                        chat_id: None,
                        reply,
                    },
                    |_: String| {},
                );
            }
        }
    }
}

/// Sends a command and reports its outcome without blocking the prompt.
fn request<T, F>(
    tx: &mpsc::Sender<ChatCommand>,
    build: impl FnOnce(oneshot::Sender<Result<T, StoreError>>) -> ChatCommand,
    on_ok: F,
) where
    T: Send + 'static,
    F: FnOnce(T) + Send + 'static,
{
    let (reply, response) = oneshot::channel();
    let command = build(reply);
    let tx = tx.clone();
    tokio::spawn(async move {
        if tx.send(command).await.is_err() {
            error!("Command dispatcher is gone");
            return;
        }
        match response.await {
            Ok(Ok(value)) => on_ok(value),
            Ok(Err(e)) => println!("Error: {}", e),
            Err(_) => error!("Command dropped without a reply"),
        }
    });
}

fn label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::Function => "function",
    }
}

async fn print_events(mut events: broadcast::Receiver<StoreEvent>) {
    // Characters already printed per streaming message.
    let mut printed: HashMap<String, usize> = HashMap::new();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Display lagged by {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            StoreEvent::MessageAppended { message, .. } if message.role != Role::User => {
                if message.content.is_empty() {
                    printed.insert(message.id.clone(), 0);
                    print!("{}: ", label(message.role));
                } else {
                    println!("{}: {}", label(message.role), message.content);
                }
            }
            StoreEvent::MessageUpdated { message, .. } => {
                if let Some(count) = printed.get_mut(&message.id) {
                    let delta: String = message.content.chars().skip(*count).collect();
                    *count += delta.chars().count();
                    print!("{}", delta);
                }
            }
            StoreEvent::MessageReplaced {
                old_id, message, ..
            } => {
                if let Some(count) = printed.remove(&old_id) {
                    let rest: String = message.content.chars().skip(count).collect();
                    println!("{}", rest);
                }
            }
            StoreEvent::MessageRemoved { message_id, .. } => {
                if printed.remove(&message_id).is_some() {
                    println!(" [interrupted]");
                }
            }
            StoreEvent::ChatUpdated(chat) => info!("Chat {} is now \"{}\"", chat.id, chat.title),
            _ => {}
        }
        let _ = std::io::stdout().flush();
    }
}
