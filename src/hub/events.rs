//! Event payloads streamed to subscribers.
//!
//! These are the wire shapes the transport layer serializes; they carry
//! display-ready data, not persistence rows.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{FlowStatus, Task, TaskStatus, TaskType};

/// A task snapshot, broadcast on creation and on status changes.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub id: i64,
    pub message: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub args: String,
    pub results: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for TaskEvent {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            message: task.message.clone(),
            task_type: task.task_type,
            status: task.status,
            args: task.args.clone(),
            results: task.results.clone(),
            created_at: task.created_at,
        }
    }
}

/// Sandbox terminal state attached to flow updates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TerminalInfo {
    pub container_name: String,
    pub connected: bool,
}

/// A flow snapshot, broadcast whenever name, status, or sandbox state moves.
#[derive(Debug, Clone, Serialize)]
pub struct FlowEvent {
    pub id: i64,
    pub name: String,
    pub status: FlowStatus,
    pub terminal: TerminalInfo,
}

/// One rendered terminal line.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub id: i64,
    pub text: String,
}

/// Browser state after a `browser` task: the fetched URL and where the
/// screenshot can be retrieved. The file exists at that relative path by
/// the time the event is broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct BrowserEvent {
    pub url: String,
    pub screenshot_url: String,
}
