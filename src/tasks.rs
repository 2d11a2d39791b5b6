use crate::{
    models::{NewTask, Task, TaskPatch},
    persistence::{ChangeEvent, ChangeKind, Persistence, PersistenceError, Table, Unsubscribe},
};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(String),
    #[error("Task {id} is already {status}")]
    InvalidTransition { id: String, status: String },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Background tasks of the signed-in user, newest first.
pub struct TaskBoard {
    persistence: Arc<dyn Persistence>,
    tasks: RwLock<Vec<Task>>,
    changed: watch::Sender<usize>,
}

impl TaskBoard {
    pub fn new(persistence: Arc<dyn Persistence>) -> Arc<Self> {
        let (changed, _) = watch::channel(0);
        Arc::new(Self {
            persistence,
            tasks: RwLock::new(Vec::new()),
            changed,
        })
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Receiver that ticks with the task count whenever the list changes.
    pub fn changes(&self) -> watch::Receiver<usize> {
        self.changed.subscribe()
    }

    fn update(&self, f: impl FnOnce(&mut Vec<Task>)) {
        let count = {
            let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut tasks);
            tasks.sort_by_key(|t| std::cmp::Reverse(t.created_at));
            tasks.len()
        };
        self.changed.send_replace(count);
    }

    fn upsert(&self, task: Task) {
        self.update(|tasks| match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(slot) => *slot = task,
            None => tasks.push(task),
        });
    }

    pub async fn load(&self, user_id: &str) -> Result<Vec<Task>, TaskError> {
        let tasks = self.persistence.list_tasks(user_id).await.map_err(|e| {
            error!("Failed to load tasks: {}", e);
            e
        })?;
        self.update(|current| *current = tasks);
        Ok(self.tasks())
    }

    pub async fn create_task(
        &self,
        command: &str,
        parameters: HashMap<String, Value>,
        chat_id: Option<String>,
        priority: u8,
    ) -> Result<Task, TaskError> {
        let session = self
            .persistence
            .session()
            .await?
            .ok_or(PersistenceError::Unauthenticated)?;

        let new_task = NewTask::new(&session.user_id, command, parameters, chat_id, priority);
        let task = self.persistence.insert_task(&new_task).await.map_err(|e| {
            error!("Failed to create task {}: {}", command, e);
            e
        })?;
        info!("Queued task {} ({})", task.id, task.command_id);

        self.upsert(task.clone());
        Ok(task)
    }

    /// Cancels a pending or running task. Finished tasks stay as they are.
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task, TaskError> {
        let current = self
            .tasks()
            .into_iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;

        if current.status.is_terminal() {
            return Err(TaskError::InvalidTransition {
                id: task_id.to_string(),
                status: format!("{:?}", current.status).to_lowercase(),
            });
        }

        let task = self
            .persistence
            .update_task(task_id, &TaskPatch::cancel("Cancelled by user"))
            .await
            .map_err(|e| match e {
                PersistenceError::NotFound(_) => TaskError::NotFound(task_id.to_string()),
                e => {
                    error!("Failed to cancel task {}: {}", task_id, e);
                    TaskError::Persistence(e)
                }
            })?;

        self.upsert(task.clone());
        Ok(task)
    }

    pub async fn watch(self: &Arc<Self>) -> Result<Unsubscribe, TaskError> {
        let subscription = self.persistence.subscribe(Table::Tasks).await?;
        let (mut rx, unsubscribe) = subscription.into_parts();
        let board = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(board) = board.upgrade() else {
                    break;
                };
                board.apply_change(&event);
            }
        });

        Ok(unsubscribe.also(handle.abort_handle()))
    }

    fn apply_change(&self, event: &ChangeEvent) {
        match event.kind {
            ChangeKind::Delete => {
                if let Some(id) = event.record_id() {
                    let id = id.to_string();
                    self.update(|tasks| tasks.retain(|t| t.id != id));
                }
            }
            ChangeKind::Insert | ChangeKind::Update => match event.decode::<Task>() {
                Ok(task) => self.upsert(task),
                Err(e) => warn!("Ignoring undecodable task change: {}", e),
            },
        }
    }
}
