//! Persistent entities: flows, tasks, terminal logs, container records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user session from first prompt to `done` or explicit close.
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub id: i64,
    /// Display name; filled in by the planner's summary on the first input.
    pub name: String,
    pub status: FlowStatus,
    /// Provider tag used by the factory (e.g. "openai", "ollama").
    pub model_provider: String,
    pub model: String,
    /// Record id of the flow's sandbox container, once spawned.
    pub container_id: Option<i64>,
    /// Sandbox image chosen by the planner for this flow.
    pub container_image: String,
    pub created_at: DateTime<Utc>,
}

/// Flow status transitions are monotonic: `in_progress` then `finished`,
/// set only by the dispatcher on `done` or by shutdown cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    InProgress,
    Finished,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Finished => "finished",
        }
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FlowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "finished" => Ok(Self::Finished),
            other => Err(format!("invalid flow status '{other}'")),
        }
    }
}

/// One step of a flow: a tool invocation proposed by the planner, or a user
/// turn (`input` / `ask`). Ordering within a flow is by id; the task with
/// the greatest id is the current one.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: i64,
    pub flow_id: i64,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Human-visible text for the step.
    pub message: String,
    /// Tool-specific arguments, opaque JSON.
    pub args: String,
    /// Command/tool output; truncated by the planner before prompting.
    pub results: String,
    /// Pairs a model-emitted tool call with its result turn.
    pub tool_call_id: String,
    pub created_at: DateTime<Utc>,
}

/// The closed set of tool calls the planner may produce, plus the two user
/// turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Input,
    Ask,
    Terminal,
    Code,
    Browser,
    Done,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Ask => "ask",
            Self::Terminal => "terminal",
            Self::Code => "code",
            Self::Browser => "browser",
            Self::Done => "done",
        }
    }

    pub const ALL: [TaskType; 6] = [
        Self::Input,
        Self::Ask,
        Self::Terminal,
        Self::Code,
        Self::Browser,
        Self::Done,
    ];
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(Self::Input),
            "ask" => Ok(Self::Ask),
            "terminal" => Ok(Self::Terminal),
            "code" => Ok(Self::Code),
            "browser" => Ok(Self::Browser),
            "done" => Ok(Self::Done),
            other => Err(format!("invalid task type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    InProgress,
    Finished,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            other => Err(format!("invalid task status '{other}'")),
        }
    }
}

/// Fields for creating a task. Ids and timestamps are gateway-issued.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub flow_id: i64,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub message: String,
    pub args: String,
    pub tool_call_id: String,
}

/// An append-only terminal event.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalLog {
    pub id: i64,
    pub flow_id: i64,
    pub log_type: LogType,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Input,
    Output,
    System,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for LogType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(Self::Input),
            "output" => Ok(Self::Output),
            "system" => Ok(Self::System),
            other => Err(format!("invalid log type '{other}'")),
        }
    }
}

/// Metadata shadow of a runtime container. Each flow's record reaches
/// `running` before any terminal/code task executes on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRecord {
    pub id: i64,
    pub name: String,
    pub image: String,
    /// Runtime identifier assigned by the container engine.
    pub local_id: String,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Starting,
    Running,
    Stopped,
    Failed,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid container status '{other}'")),
        }
    }
}
