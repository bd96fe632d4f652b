//! LLM provider abstraction.
//!
//! One trait over several chat-completions backends. Whether a backend
//! reports native tool calling is the only capability the planner sees;
//! it is passed down as a dialect at request time, never branched on by
//! provider identity.

pub mod client;

mod compat;
mod ollama;
mod openai;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ProvidersConfig;
use crate::db::{Task, TaskType};
use crate::error::LlmError;

pub use client::ChatClient;
pub use compat::CompatProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

/// The provider tags a flow can be created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Ollama,
    LmStudio,
    LocalAi,
    OpenAiCompatible,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
            Self::LmStudio => "lmstudio",
            Self::LocalAi => "localai",
            Self::OpenAiCompatible => "openai-compatible",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            "lmstudio" | "lm_studio" | "lm-studio" => Ok(Self::LmStudio),
            "localai" | "local_ai" | "local-ai" => Ok(Self::LocalAi),
            "openai-compatible" | "openai_compatible" | "compatible" => Ok(Self::OpenAiCompatible),
            other => Err(format!(
                "invalid provider '{other}', expected one of: openai, ollama, lmstudio, \
                 localai, openai-compatible"
            )),
        }
    }
}

/// The planner's output: a task not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedTask {
    pub task_type: TaskType,
    pub message: String,
    /// Tool arguments, JSON-encoded.
    pub args: String,
    /// Model-emitted call id in tool-call mode.
    pub tool_call_id: Option<String>,
}

/// Input to [`Provider::next_task`].
#[derive(Debug, Clone)]
pub struct NextTaskOptions {
    /// Full ordered task history of the flow.
    pub tasks: Vec<Task>,
    /// The flow's sandbox image, named in the system prompt.
    pub image: String,
}

/// A concrete LLM backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// A short human name for the flow, at most `word_count` words.
    async fn summary(&self, text: &str, word_count: usize) -> Result<String, LlmError>;

    /// A container image reference appropriate for the objective. Callers
    /// pass the result through the safety filter before use.
    async fn docker_image_name(&self, text: &str) -> Result<String, LlmError>;

    /// Propose the next task. Infallible by contract: provider and parse
    /// failures degrade to a synthetic `ask` task.
    async fn next_task(&self, opts: NextTaskOptions) -> ProposedTask;
}

/// Build the provider for a flow from its stored tag.
pub fn create_provider(
    tag: &str,
    config: &ProvidersConfig,
) -> Result<Arc<dyn Provider>, LlmError> {
    let kind: ProviderKind = tag.parse().map_err(|_| LlmError::UnknownProvider {
        tag: tag.to_string(),
    })?;

    Ok(match kind {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(&config.openai)?),
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(&config.ollama)?),
        ProviderKind::LmStudio => Arc::new(CompatProvider::lm_studio(&config.lmstudio)?),
        ProviderKind::LocalAi => Arc::new(CompatProvider::local_ai(&config.localai)?),
        ProviderKind::OpenAiCompatible => {
            Arc::new(CompatProvider::openai_compatible(&config.compat)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TaskStatus;
    use crate::planner;
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn providers_config(base_url: &str) -> ProvidersConfig {
        ProvidersConfig {
            openai: crate::config::OpenAiConfig {
                api_key: Some(secrecy::SecretString::from("sk-test".to_string())),
                model: "gpt-4o".to_string(),
                server_url: base_url.to_string(),
            },
            ollama: crate::config::OllamaConfig {
                model: "llama3".to_string(),
                server_url: base_url.to_string(),
            },
            lmstudio: crate::config::CompatConfig {
                model: "local".to_string(),
                server_url: base_url.to_string(),
                api_key: None,
            },
            localai: crate::config::CompatConfig {
                model: "local".to_string(),
                server_url: base_url.to_string(),
                api_key: None,
            },
            compat: crate::config::CompatConfig {
                model: "served".to_string(),
                server_url: base_url.to_string(),
                api_key: None,
            },
        }
    }

    fn input_task() -> Task {
        Task {
            id: 1,
            flow_id: 1,
            task_type: TaskType::Input,
            status: TaskStatus::Finished,
            message: "List the files".to_string(),
            args: "{}".to_string(),
            results: String::new(),
            tool_call_id: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn provider_tags_round_trip() {
        for kind in [
            ProviderKind::OpenAi,
            ProviderKind::Ollama,
            ProviderKind::LmStudio,
            ProviderKind::LocalAi,
            ProviderKind::OpenAiCompatible,
        ] {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
        }
        assert!("claude".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn unknown_tag_is_reported() {
        let config = providers_config("http://localhost:9");
        let result = create_provider("nonsense", &config);
        assert!(matches!(result, Err(LlmError::UnknownProvider { .. })));
    }

    #[tokio::test]
    async fn openai_next_task_parses_tool_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {
                    "content": "Listing the files",
                    "tool_calls": [{
                        "id": "call_7",
                        "type": "function",
                        "function": {"name": "terminal", "arguments": "{\"input\": \"ls\"}"}
                    }]
                }}]
            })))
            .mount(&server)
            .await;

        let config = providers_config(&server.uri());
        let provider = create_provider("openai", &config).unwrap();

        let proposed = provider
            .next_task(NextTaskOptions {
                tasks: vec![input_task()],
                image: "debian:latest".to_string(),
            })
            .await;

        assert_eq!(proposed.task_type, TaskType::Terminal);
        assert_eq!(proposed.message, "Listing the files");
        assert_eq!(proposed.tool_call_id.as_deref(), Some("call_7"));
    }

    #[tokio::test]
    async fn ollama_next_task_parses_json_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {
                    "content": "{\"tool\": \"terminal\", \"tool_input\": {\"input\": \"ls\"}, \"message\": \"Listing\"}"
                }}]
            })))
            .mount(&server)
            .await;

        let config = providers_config(&server.uri());
        let provider = create_provider("ollama", &config).unwrap();

        let proposed = provider
            .next_task(NextTaskOptions {
                tasks: vec![input_task()],
                image: "debian:latest".to_string(),
            })
            .await;

        assert_eq!(proposed.task_type, TaskType::Terminal);
        assert_eq!(proposed.message, "Listing");
        assert!(proposed.tool_call_id.is_none());
    }

    #[tokio::test]
    async fn provider_failure_degrades_to_ask() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let config = providers_config(&server.uri());
        let provider = create_provider("openai", &config).unwrap();

        let proposed = provider
            .next_task(NextTaskOptions {
                tasks: vec![input_task()],
                image: "debian:latest".to_string(),
            })
            .await;

        assert_eq!(proposed.task_type, TaskType::Ask);
        assert_eq!(proposed.message, planner::NEXT_TASK_ERROR_MSG);
    }

    #[tokio::test]
    async fn local_provider_failure_names_the_local_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .mount(&server)
            .await;

        let config = providers_config(&server.uri());
        let provider = create_provider("lmstudio", &config).unwrap();

        let proposed = provider
            .next_task(NextTaskOptions {
                tasks: vec![input_task()],
                image: "debian:latest".to_string(),
            })
            .await;

        assert_eq!(proposed.task_type, TaskType::Ask);
        assert_eq!(proposed.message, planner::LOCAL_MODEL_ERROR_MSG);
    }

    #[tokio::test]
    async fn malformed_tool_reply_degrades_to_ask() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "teleport", "arguments": "{}"}
                    }]
                }}]
            })))
            .mount(&server)
            .await;

        let config = providers_config(&server.uri());
        let provider = create_provider("openai", &config).unwrap();

        let proposed = provider
            .next_task(NextTaskOptions {
                tasks: vec![input_task()],
                image: "debian:latest".to_string(),
            })
            .await;

        assert_eq!(proposed.task_type, TaskType::Ask);
        assert_eq!(proposed.message, planner::NEXT_TASK_ERROR_MSG);
    }

    #[tokio::test]
    async fn summary_returns_cleaned_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "\"Hello world in Python.\""}}]
            })))
            .mount(&server)
            .await;

        let config = providers_config(&server.uri());
        let provider = create_provider("openai", &config).unwrap();

        let summary = provider
            .summary("Write hello world in Python and run it", 10)
            .await
            .unwrap();
        assert_eq!(summary, "Hello world in Python");
    }
}
