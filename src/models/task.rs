use super::timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Kind of work a task command asks for. Stored in the `type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Organize,
    Search,
    Cleanup,
    FolderOperation,
    Backup,
    Analysis,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Organize => "organize",
            TaskKind::Search => "search",
            TaskKind::Cleanup => "cleanup",
            TaskKind::FolderOperation => "folder_operation",
            TaskKind::Backup => "backup",
            TaskKind::Analysis => "analysis",
        }
    }

    /// Classifies a command and pulls its arguments into `parameters`.
    /// Anything unrecognised is an analysis.
    pub fn parse_command(
        command: &str,
        parameters: &mut HashMap<String, serde_json::Value>,
    ) -> TaskKind {
        let command = command.trim().to_lowercase();
        let mut words = command.split_whitespace();
        let head = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();
        let joined = || serde_json::Value::from(args.join(" "));

        if head.starts_with("/organize") {
            if !args.is_empty() {
                parameters.insert("path".into(), joined());
            }
            TaskKind::Organize
        } else if head.starts_with("/search") {
            if !args.is_empty() {
                parameters.insert("query".into(), joined());
            }
            TaskKind::Search
        } else if head.starts_with("/cleanup") {
            if !args.is_empty() {
                parameters.insert("options".into(), args.clone().into());
            }
            TaskKind::Cleanup
        } else if head.starts_with("/folder") {
            if let Some((_, rest)) = command.split_once(':')
                && let Some(name) = rest.split_whitespace().next()
            {
                parameters.insert("folder_name".into(), name.into());
            }
            if !args.is_empty() {
                let action = match args.last() {
                    Some(&last) if last == "create" || last == "navigate" => last,
                    _ => "create",
                };
                parameters.insert("action".into(), action.into());
            }
            TaskKind::FolderOperation
        } else if command.contains("backup") {
            TaskKind::Backup
        } else {
            TaskKind::Analysis
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    /// Older rows name this column `type`.
    #[serde(alias = "type")]
    pub command_id: String,
    /// The command text as typed.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default, deserialize_with = "super::null_as_default")]
    pub parameters: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, deserialize_with = "super::null_as_default")]
    pub progress: u8,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default, deserialize_with = "super::null_as_default")]
    pub logs: Vec<String>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default, deserialize_with = "super::null_as_default")]
    pub retry_count: u32,
}

fn default_priority() -> u8 {
    5
}

/// Insert payload for a new task row. Uses the table's column names, so the
/// kind goes out as `type` next to the raw `command`.
#[derive(Debug, Clone, Serialize)]
pub struct NewTask {
    pub id: String,
    pub user_id: String,
    pub chat_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub command: String,
    pub parameters: HashMap<String, serde_json::Value>,
    pub status: TaskStatus,
    pub progress: u8,
    pub priority: u8,
    pub retry_count: u32,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl NewTask {
    pub fn new(
        user_id: &str,
        command: &str,
        mut parameters: HashMap<String, serde_json::Value>,
        chat_id: Option<String>,
        priority: u8,
    ) -> Self {
        let now = Utc::now();
        let kind = TaskKind::parse_command(command, &mut parameters);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            chat_id,
            kind,
            command: command.to_string(),
            parameters,
            status: TaskStatus::Pending,
            progress: 0,
            priority: priority.clamp(1, 10),
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn into_task(self) -> Task {
        Task {
            id: self.id,
            user_id: Some(self.user_id),
            chat_id: self.chat_id,
            command_id: self.kind.as_str().to_string(),
            command: Some(self.command),
            parameters: self.parameters,
            status: self.status,
            progress: self.progress,
            result: None,
            error_message: None,
            logs: Vec::new(),
            created_at: self.created_at,
            started_at: None,
            completed_at: None,
            updated_at: Some(self.updated_at),
            priority: self.priority,
            retry_count: self.retry_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl TaskPatch {
    pub fn cancel(reason: &str) -> Self {
        let now = Utc::now();
        Self {
            status: Some(TaskStatus::Cancelled),
            error_message: Some(reason.to_string()),
            completed_at: Some(now),
            updated_at: now,
        }
    }
}

impl Task {
    pub fn apply(&mut self, patch: &TaskPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(message) = &patch.error_message {
            self.error_message = Some(message.clone());
        }
        if patch.completed_at.is_some() {
            self.completed_at = patch.completed_at;
        }
        self.updated_at = Some(patch.updated_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_type_column_maps_to_command_id() {
        let row = serde_json::json!({
            "id": "t1",
            "type": "organize",
            "status": "running",
            "progress": 40,
            "created_at": "2025-05-01T00:00:00+00:00"
        });
        let task: Task = serde_json::from_value(row).unwrap();
        assert_eq!(task.command_id, "organize");
        assert_eq!(task.priority, 5);
        assert!(!task.status.is_terminal());
    }

    #[test]
    fn null_logs_and_parameters_read_as_empty() {
        let row = serde_json::json!({
            "id": "t2",
            "user_id": "u1",
            "type": "organize",
            "command": "/organize ~/Downloads",
            "parameters": null,
            "logs": null,
            "progress": null,
            "created_at": "2025-05-01T00:00:00.000001"
        });
        let task: Task = serde_json::from_value(row).unwrap();
        assert!(task.logs.is_empty());
        assert!(task.parameters.is_empty());
        assert_eq!(task.progress, 0);
        assert_eq!(task.command.as_deref(), Some("/organize ~/Downloads"));
    }

    #[test]
    fn insert_payload_uses_type_and_command_columns() {
        let task = NewTask::new("u1", "/organize ~/Downloads", HashMap::new(), None, 5);
        let value = serde_json::to_value(&task).unwrap();
        let row = value.as_object().unwrap();

        assert_eq!(row["type"], "organize");
        assert_eq!(row["command"], "/organize ~/Downloads");
        assert_eq!(row["parameters"]["path"], "~/downloads");
        assert!(!row.contains_key("command_id"));
        assert!(!row.contains_key("kind"));
        assert_eq!(task.into_task().command_id, "organize");
    }

    #[test]
    fn commands_map_to_task_kinds() {
        let mut parameters = HashMap::new();
        assert_eq!(
            TaskKind::parse_command("/search quarterly report", &mut parameters),
            TaskKind::Search
        );
        assert_eq!(parameters["query"], "quarterly report");

        let mut parameters = HashMap::new();
        assert_eq!(
            TaskKind::parse_command("/folder:projects navigate", &mut parameters),
            TaskKind::FolderOperation
        );
        assert_eq!(parameters["folder_name"], "projects");
        assert_eq!(parameters["action"], "navigate");

        let mut parameters = HashMap::new();
        assert_eq!(
            TaskKind::parse_command("nightly backup", &mut parameters),
            TaskKind::Backup
        );
        assert_eq!(
            TaskKind::parse_command("tell me a joke", &mut parameters),
            TaskKind::Analysis
        );
        assert!(parameters.is_empty());
    }

    #[test]
    fn priority_is_clamped() {
        let task = NewTask::new("u1", "search", HashMap::new(), None, 42);
        assert_eq!(task.priority, 10);
    }
}
