//! The closed tool catalog offered to the model, and the argument shapes
//! the handlers deserialize.

use serde::Deserialize;
use serde_json::json;

use crate::llm::client::{ToolDefinition, ToolFunction};

/// Declared tool schemas for tool-call-capable providers. JSON-mode
/// providers receive the same catalog inline in the system prompt.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        function(
            "terminal",
            "Run a shell command inside the sandbox container and return its output.",
            json!({
                "type": "object",
                "properties": {
                    "input": {
                        "type": "string",
                        "description": "The shell command to run."
                    }
                },
                "required": ["input"]
            }),
        ),
        function(
            "code",
            "Read a file from the sandbox or write a file into it.",
            json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["read_file", "update_file"],
                        "description": "Whether to read or write the file."
                    },
                    "path": {
                        "type": "string",
                        "description": "File path inside the sandbox working directory."
                    },
                    "content": {
                        "type": "string",
                        "description": "Full file content; required for update_file."
                    }
                },
                "required": ["action", "path"]
            }),
        ),
        function(
            "browser",
            "Fetch a web page: 'read' returns its visible text, 'url' returns its outgoing links.",
            json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "The http(s) URL to open."
                    },
                    "action": {
                        "type": "string",
                        "enum": ["read", "url"],
                        "description": "What to extract from the page."
                    }
                },
                "required": ["url", "action"]
            }),
        ),
        function(
            "ask",
            "Ask the user a question and wait for their reply.",
            json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "The question shown to the user."
                    }
                },
                "required": ["message"]
            }),
        ),
        function(
            "done",
            "Mark the objective as completed. Use only when nothing is left to do.",
            json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "A short completion summary shown to the user."
                    }
                },
                "required": ["message"]
            }),
        ),
    ]
}

fn function(
    name: &'static str,
    description: &'static str,
    parameters: serde_json::Value,
) -> ToolDefinition {
    ToolDefinition {
        kind: "function",
        function: ToolFunction {
            name,
            description,
            parameters,
        },
    }
}

/// Arguments of a `terminal` task.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalArgs {
    pub input: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeAction {
    ReadFile,
    UpdateFile,
}

/// Arguments of a `code` task.
#[derive(Debug, Clone, Deserialize)]
pub struct CodeArgs {
    pub action: CodeAction,
    pub path: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserAction {
    Read,
    Url,
}

/// Arguments of a `browser` task.
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserArgs {
    pub url: String,
    pub action: BrowserAction,
}
