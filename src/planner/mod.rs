//! The planner: turns a flow's task history into the next tool call.
//!
//! The dispatcher hands the full ordered history to the flow's provider;
//! the provider delegates here for prompt assembly, result truncation, the
//! LLM call, and response parsing. The two dialects (native tool calls vs
//! a JSON reply) differ only in how the catalog is presented and how the
//! response is decoded; nothing in here branches on provider identity.
//!
//! Planner failures never propagate to the dispatcher: providers convert
//! them into a synthetic `ask` task whose message surfaces the problem.

pub mod catalog;

use thiserror::Error;

use crate::db::{Task, TaskType};
use crate::error::LlmError;
use crate::llm::client::{
    ChatClient, ChatMessage, ChatRequest, ChatResponse, ResponseFormat,
};
use crate::llm::{NextTaskOptions, ProposedTask};

/// Budget of result characters per task when prompting.
pub const MAX_RESULT_CHARS: usize = 4000;
/// Middle-of-history tasks are compressed to this budget once the history
/// outgrows [`COMPRESS_THRESHOLD`].
pub const MIDDLE_RESULT_CHARS: usize = MAX_RESULT_CHARS / 4;
/// Histories longer than this keep full budgets only at the edges.
const COMPRESS_THRESHOLD: usize = 6;
/// How many tasks at each end of the history keep the full budget.
const HISTORY_EDGE_KEEP: usize = 3;
/// Prefix marking a tail-preserving cut.
pub const TRUNCATION_MARKER: &str = "… [truncated] ";
/// Hard ceiling on assembled prompt size, in characters.
const MAX_PROMPT_CHARS: usize = 60_000;

/// Word budget for flow display names.
pub const SUMMARY_WORD_COUNT: usize = 10;

pub const NEXT_TASK_ERROR_MSG: &str = "There was an error getting the next task";
pub const HISTORY_TOO_LONG_MSG: &str =
    "The conversation history is too long. Please start a new task.";
pub const LOCAL_MODEL_ERROR_MSG: &str =
    "There was an error connecting to the local model. Is it running?";

/// How the provider receives the tool catalog and returns its choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolDialect {
    /// Native tool calling; the response carries structured tool calls.
    ToolCalls,
    /// The model replies with a JSON object `{tool, tool_input, message}`.
    Json,
}

/// Sampling parameters per request.
#[derive(Debug, Clone, Copy)]
pub struct Sampling {
    pub temperature: f32,
    pub top_p: f32,
}

/// Low-variance sampling for hosted models.
pub const HOSTED_SAMPLING: Sampling = Sampling {
    temperature: 0.0,
    top_p: 0.2,
};

/// Slightly warmer sampling for local models.
pub const LOCAL_SAMPLING: Sampling = Sampling {
    temperature: 0.1,
    top_p: 0.9,
};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("assembled prompt exceeds the size limit")]
    HistoryTooLong,

    #[error(transparent)]
    Provider(#[from] LlmError),

    #[error("could not parse model reply: {0}")]
    Parse(String),
}

/// The synthetic task every failure path degrades to.
pub fn fallback_ask(message: &str) -> ProposedTask {
    ProposedTask {
        task_type: TaskType::Ask,
        message: message.to_string(),
        args: "{}".to_string(),
        tool_call_id: None,
    }
}

/// Ask the model for a short human name for the flow.
pub async fn summarize(
    client: &ChatClient,
    model: &str,
    text: &str,
    word_count: usize,
    sampling: Sampling,
) -> Result<String, LlmError> {
    let messages = vec![
        ChatMessage::system(
            "You name engineering sessions. Reply with the name only: no quotes, \
             no trailing punctuation.",
        ),
        ChatMessage::user(format!(
            "Summarize the following request in at most {word_count} words:\n\n{text}"
        )),
    ];
    let response = client
        .chat(&ChatRequest {
            model: model.to_string(),
            messages,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            tools: None,
            response_format: None,
        })
        .await?;
    Ok(clean_single_line(&extract_text(client, response)?))
}

/// Ask the model which container image fits the objective.
pub async fn docker_image_name(
    client: &ChatClient,
    model: &str,
    text: &str,
    sampling: Sampling,
) -> Result<String, LlmError> {
    let messages = vec![
        ChatMessage::system(
            "You pick Docker images. Reply with a single image reference and \
             nothing else, for example: python:3.12",
        ),
        ChatMessage::user(format!(
            "Which Docker image is best suited for working on this request?\n\n{text}"
        )),
    ];
    let response = client
        .chat(&ChatRequest {
            model: model.to_string(),
            messages,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            tools: None,
            response_format: None,
        })
        .await?;
    Ok(clean_single_line(&extract_text(client, response)?))
}

/// Run the full next-task pipeline: truncate, assemble, call, parse.
pub async fn generate_next_task(
    client: &ChatClient,
    model: &str,
    opts: &NextTaskOptions,
    dialect: ToolDialect,
    sampling: Sampling,
) -> Result<ProposedTask, PlanError> {
    let tasks = truncate_history(&opts.tasks);
    let messages = build_messages(&tasks, &opts.image, dialect)?;

    let request = ChatRequest {
        model: model.to_string(),
        messages,
        temperature: sampling.temperature,
        top_p: sampling.top_p,
        tools: match dialect {
            ToolDialect::ToolCalls => Some(catalog::tool_definitions()),
            ToolDialect::Json => None,
        },
        response_format: match dialect {
            ToolDialect::ToolCalls => None,
            ToolDialect::Json => Some(ResponseFormat::json_object()),
        },
    };

    let response = client.chat(&request).await?;
    match dialect {
        ToolDialect::ToolCalls => parse_tool_call_reply(response),
        ToolDialect::Json => parse_json_reply(response),
    }
}

/// Character budget for the task at `index` in a history of `total` tasks.
pub fn result_budget(index: usize, total: usize) -> usize {
    if total > COMPRESS_THRESHOLD
        && index >= HISTORY_EDGE_KEEP
        && index < total - HISTORY_EDGE_KEEP
    {
        MIDDLE_RESULT_CHARS
    } else {
        MAX_RESULT_CHARS
    }
}

/// Cap a result to `budget` characters, keeping the tail (the most recent
/// bytes are the most relevant). Output length, marker included, never
/// exceeds the budget, which makes the operation idempotent.
pub fn truncate_result(result: &str, budget: usize) -> String {
    let total = result.chars().count();
    if total <= budget {
        return result.to_string();
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    if budget <= marker_len {
        let skip = total - budget;
        return result.chars().skip(skip).collect();
    }

    let keep = budget - marker_len;
    let tail: String = result.chars().skip(total - keep).collect();
    format!("{TRUNCATION_MARKER}{tail}")
}

/// Apply per-position budgets across a history.
fn truncate_history(tasks: &[Task]) -> Vec<Task> {
    let total = tasks.len();
    tasks
        .iter()
        .enumerate()
        .map(|(index, task)| {
            let mut task = task.clone();
            task.results = truncate_result(&task.results, result_budget(index, total));
            task
        })
        .collect()
}

fn system_prompt(image: &str, dialect: ToolDialect) -> String {
    let mut prompt = format!(
        "You are an autonomous software engineer. You operate a sandbox \
         container running the image {image}, with a shell, a filesystem \
         rooted at /app, and a headless browser at your disposal. Work in \
         small verifiable steps: run one tool, look at its output, then \
         decide the next step. Ask the user only when you are blocked, and \
         call done only when the objective is complete."
    );
    if dialect == ToolDialect::Json {
        prompt.push_str("\n\n");
        prompt.push_str(&tool_placeholder());
    }
    prompt
}

/// Inline catalog description for JSON-mode providers.
fn tool_placeholder() -> String {
    let tools = serde_json::to_string_pretty(&catalog::tool_definitions())
        .expect("tool catalog serializes");
    format!(
        "You have access to the following tools:\n\n{tools}\n\n\
         To use a tool, respond with a JSON object with the following structure:\n\
         {{\n  \"tool\": <name of the called tool>,\n  \"tool_input\": <parameters for the tool matching the above JSON schema>,\n  \"message\": <a message that will be displayed to the user>\n}}\n\n\
         Always use a tool. Always reply with valid JSON. Always include a message."
    )
}

/// Reconstruct the task history as chat messages.
fn build_messages(
    tasks: &[Task],
    image: &str,
    dialect: ToolDialect,
) -> Result<Vec<ChatMessage>, PlanError> {
    let mut messages = vec![ChatMessage::system(system_prompt(image, dialect))];

    for task in tasks {
        match task.task_type {
            TaskType::Input => messages.push(ChatMessage::user(task.message.clone())),
            TaskType::Ask => messages.push(ChatMessage::assistant(task.message.clone())),
            TaskType::Terminal | TaskType::Code | TaskType::Browser | TaskType::Done => {
                match dialect {
                    ToolDialect::ToolCalls => {
                        // A synthetic id keeps the pairing valid for tasks
                        // created before the model emitted one.
                        let call_id = if task.tool_call_id.is_empty() {
                            format!("call_{}", task.id)
                        } else {
                            task.tool_call_id.clone()
                        };
                        let content = (!task.message.is_empty()).then(|| task.message.clone());
                        messages.push(ChatMessage::assistant_tool_call(
                            content,
                            call_id.clone(),
                            task.task_type.as_str(),
                            task.args.clone(),
                        ));
                        let results = if task.results.is_empty() {
                            "(no output)".to_string()
                        } else {
                            task.results.clone()
                        };
                        messages.push(ChatMessage::tool_result(call_id, results));
                    }
                    ToolDialect::Json => {
                        let call = serde_json::json!({
                            "tool": task.task_type.as_str(),
                            "tool_input": serde_json::from_str::<serde_json::Value>(&task.args)
                                .unwrap_or(serde_json::Value::Null),
                            "message": task.message,
                        });
                        messages.push(ChatMessage::assistant(call.to_string()));
                        if !task.results.is_empty() {
                            messages
                                .push(ChatMessage::user(format!("Tool output:\n{}", task.results)));
                        }
                    }
                }
            }
        }
    }

    let total_chars: usize = messages
        .iter()
        .filter_map(|m| m.content.as_deref())
        .map(|c| c.chars().count())
        .sum();
    if total_chars > MAX_PROMPT_CHARS {
        return Err(PlanError::HistoryTooLong);
    }

    Ok(messages)
}

fn parse_tool_call_reply(response: ChatResponse) -> Result<ProposedTask, PlanError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| PlanError::Parse("response carried no choices".to_string()))?;

    let content = choice.message.content.unwrap_or_default();

    let Some(call) = choice
        .message
        .tool_calls
        .and_then(|calls| calls.into_iter().next())
    else {
        // A plain text reply is the model talking to the user.
        return Ok(ProposedTask {
            task_type: TaskType::Ask,
            message: content,
            args: "{}".to_string(),
            tool_call_id: None,
        });
    };

    let task_type = parse_tool_name(&call.function.name)?;
    let args: serde_json::Value = serde_json::from_str(&call.function.arguments)
        .map_err(|e| PlanError::Parse(format!("tool arguments are not valid JSON: {e}")))?;

    let message = if !content.is_empty() {
        content
    } else {
        args.get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string()
    };

    Ok(ProposedTask {
        task_type,
        message,
        args: args.to_string(),
        tool_call_id: Some(call.id),
    })
}

/// Reply shape demanded of JSON-mode providers.
#[derive(Debug, serde::Deserialize)]
struct JsonCall {
    tool: String,
    #[serde(default)]
    tool_input: serde_json::Value,
    #[serde(default)]
    message: String,
}

fn parse_json_reply(response: ChatResponse) -> Result<ProposedTask, PlanError> {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| PlanError::Parse("response carried no content".to_string()))?;

    let stripped = strip_code_fence(&content);
    let call: JsonCall = serde_json::from_str(stripped)
        .map_err(|e| PlanError::Parse(format!("reply is not the expected JSON object: {e}")))?;

    let task_type = parse_tool_name(&call.tool)?;
    let args = match call.tool_input {
        serde_json::Value::Null => "{}".to_string(),
        other => other.to_string(),
    };

    Ok(ProposedTask {
        task_type,
        message: call.message,
        args,
        tool_call_id: None,
    })
}

fn parse_tool_name(name: &str) -> Result<TaskType, PlanError> {
    let task_type: TaskType = name
        .parse()
        .map_err(|_| PlanError::Parse(format!("unknown tool '{name}'")))?;
    if task_type == TaskType::Input {
        return Err(PlanError::Parse("model may not emit input tasks".to_string()));
    }
    Ok(task_type)
}

/// Local models like to wrap JSON replies in Markdown fences.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    inner.trim()
}

fn extract_text(client: &ChatClient, response: ChatResponse) -> Result<String, LlmError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: client.provider().to_string(),
            reason: "response carried no text content".to_string(),
        })
}

fn clean_single_line(text: &str) -> String {
    text.trim()
        .trim_matches(['"', '\'', '`'])
        .trim_end_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::db::TaskStatus;

    fn task(id: i64, task_type: TaskType, message: &str, results: &str) -> Task {
        Task {
            id,
            flow_id: 1,
            task_type,
            status: TaskStatus::Finished,
            message: message.to_string(),
            args: "{}".to_string(),
            results: results.to_string(),
            tool_call_id: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn short_results_pass_through_untouched() {
        assert_eq!(truncate_result("hello", MAX_RESULT_CHARS), "hello");
        assert_eq!(truncate_result("", MAX_RESULT_CHARS), "");
    }

    #[test]
    fn truncation_keeps_tail_within_budget() {
        let long: String = "x".repeat(10_000) + "TAIL";
        let truncated = truncate_result(&long, MAX_RESULT_CHARS);
        assert_eq!(truncated.chars().count(), MAX_RESULT_CHARS);
        assert!(truncated.starts_with(TRUNCATION_MARKER));
        assert!(truncated.ends_with("TAIL"));
    }

    #[test]
    fn truncation_is_idempotent() {
        let long = "line\n".repeat(5_000);
        let once = truncate_result(&long, MAX_RESULT_CHARS);
        let twice = truncate_result(&once, MAX_RESULT_CHARS);
        assert_eq!(once, twice);
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        let long = "ü".repeat(9_000);
        let truncated = truncate_result(&long, MAX_RESULT_CHARS);
        assert_eq!(truncated.chars().count(), MAX_RESULT_CHARS);
    }

    #[test]
    fn short_histories_keep_full_budgets() {
        for index in 0..6 {
            assert_eq!(result_budget(index, 6), MAX_RESULT_CHARS);
        }
    }

    #[test]
    fn long_histories_compress_the_middle() {
        let total = 10;
        for index in 0..3 {
            assert_eq!(result_budget(index, total), MAX_RESULT_CHARS, "head {index}");
        }
        for index in 3..7 {
            assert_eq!(
                result_budget(index, total),
                MIDDLE_RESULT_CHARS,
                "middle {index}"
            );
        }
        for index in 7..10 {
            assert_eq!(result_budget(index, total), MAX_RESULT_CHARS, "tail {index}");
        }
    }

    #[test]
    fn history_reconstruction_pairs_tool_calls() {
        let mut terminal = task(2, TaskType::Terminal, "Listing files", "a.txt\nb.txt");
        terminal.args = r#"{"input":"ls"}"#.to_string();
        terminal.tool_call_id = "call_abc".to_string();

        let tasks = vec![task(1, TaskType::Input, "List the files", ""), terminal];
        let messages = build_messages(&tasks, "debian:latest", ToolDialect::ToolCalls).unwrap();

        // system, user, assistant tool-call, tool result
        assert_eq!(messages.len(), 4);
        assert!(messages[0].content.as_ref().unwrap().contains("debian:latest"));
        assert_eq!(messages[1].content.as_deref(), Some("List the files"));

        let call = &messages[2].tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id, "call_abc");
        assert_eq!(call.function.name, "terminal");

        assert_eq!(messages[3].tool_call_id.as_deref(), Some("call_abc"));
        assert_eq!(messages[3].content.as_deref(), Some("a.txt\nb.txt"));
    }

    #[test]
    fn json_dialect_inlines_catalog_and_results() {
        let mut terminal = task(2, TaskType::Terminal, "Listing files", "a.txt");
        terminal.args = r#"{"input":"ls"}"#.to_string();

        let tasks = vec![task(1, TaskType::Input, "List the files", ""), terminal];
        let messages = build_messages(&tasks, "debian:latest", ToolDialect::Json).unwrap();

        assert!(messages[0].content.as_ref().unwrap().contains("tool_input"));
        assert!(messages[2].content.as_ref().unwrap().contains("\"tool\":\"terminal\""));
        assert!(messages[3].content.as_ref().unwrap().contains("Tool output:"));
    }

    #[test]
    fn oversized_history_is_rejected() {
        let tasks: Vec<Task> = (0..20)
            .map(|i| task(i, TaskType::Input, &"m".repeat(4_000), ""))
            .collect();
        let err = build_messages(&tasks, "debian:latest", ToolDialect::ToolCalls).unwrap_err();
        assert!(matches!(err, PlanError::HistoryTooLong));
    }

    fn json_response(content: &str) -> ChatResponse {
        serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"content": content}}]
        }))
        .unwrap()
    }

    #[test]
    fn json_reply_parses_into_task() {
        let response = json_response(
            r#"{"tool": "terminal", "tool_input": {"input": "ls"}, "message": "Listing files"}"#,
        );
        let proposed = parse_json_reply(response).unwrap();
        assert_eq!(proposed.task_type, TaskType::Terminal);
        assert_eq!(proposed.message, "Listing files");
        assert!(proposed.args.contains("\"input\""));
        assert!(proposed.tool_call_id.is_none());
    }

    #[test]
    fn json_reply_tolerates_code_fences() {
        let response = json_response(
            "```json\n{\"tool\": \"done\", \"tool_input\": {}, \"message\": \"All set\"}\n```",
        );
        let proposed = parse_json_reply(response).unwrap();
        assert_eq!(proposed.task_type, TaskType::Done);
        assert_eq!(proposed.message, "All set");
    }

    #[test]
    fn malformed_json_reply_is_a_parse_error() {
        let response = json_response("I think we should run ls first.");
        assert!(matches!(
            parse_json_reply(response),
            Err(PlanError::Parse(_))
        ));
    }

    #[test]
    fn unknown_tool_is_a_parse_error() {
        let response = json_response(r#"{"tool": "teleport", "tool_input": {}, "message": "x"}"#);
        assert!(matches!(
            parse_json_reply(response),
            Err(PlanError::Parse(_))
        ));

        let response = json_response(r#"{"tool": "input", "tool_input": {}, "message": "x"}"#);
        assert!(matches!(
            parse_json_reply(response),
            Err(PlanError::Parse(_))
        ));
    }

    #[test]
    fn tool_call_reply_parses_into_task() {
        let response: ChatResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {
                "content": "Running the script",
                "tool_calls": [{
                    "id": "call_42",
                    "type": "function",
                    "function": {"name": "terminal", "arguments": "{\"input\": \"python hello.py\"}"}
                }]
            }}]
        }))
        .unwrap();

        let proposed = parse_tool_call_reply(response).unwrap();
        assert_eq!(proposed.task_type, TaskType::Terminal);
        assert_eq!(proposed.message, "Running the script");
        assert_eq!(proposed.tool_call_id.as_deref(), Some("call_42"));
    }

    #[test]
    fn text_only_tool_reply_becomes_ask() {
        let response = json_response("Which version of Python do you want?");
        let proposed = parse_tool_call_reply(response).unwrap();
        assert_eq!(proposed.task_type, TaskType::Ask);
        assert_eq!(proposed.message, "Which version of Python do you want?");
    }

    #[test]
    fn fallback_ask_shape() {
        let proposed = fallback_ask(NEXT_TASK_ERROR_MSG);
        assert_eq!(proposed.task_type, TaskType::Ask);
        assert_eq!(proposed.message, NEXT_TASK_ERROR_MSG);
        assert_eq!(proposed.args, "{}");
    }
}
