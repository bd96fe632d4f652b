//! Ollama backend, through its OpenAI-compatible `/v1` endpoint.
//!
//! Ollama models reply as free text, so the planner runs in JSON dialect:
//! the catalog is inlined in the system prompt and the response is parsed
//! as a `{tool, tool_input, message}` object.

use async_trait::async_trait;

use crate::config::OllamaConfig;
use crate::error::LlmError;
use crate::llm::client::ChatClient;
use crate::llm::{NextTaskOptions, Provider, ProposedTask, ProviderKind};
use crate::planner::{self, HOSTED_SAMPLING, PlanError, ToolDialect};

pub struct OllamaProvider {
    client: ChatClient,
    model: String,
}

impl OllamaProvider {
    pub fn new(config: &OllamaConfig) -> Result<Self, LlmError> {
        let client = ChatClient::new("ollama", &config.server_url, None)?;
        Ok(Self {
            client,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn summary(&self, text: &str, word_count: usize) -> Result<String, LlmError> {
        planner::summarize(&self.client, &self.model, text, word_count, HOSTED_SAMPLING).await
    }

    async fn docker_image_name(&self, text: &str) -> Result<String, LlmError> {
        planner::docker_image_name(&self.client, &self.model, text, HOSTED_SAMPLING).await
    }

    async fn next_task(&self, opts: NextTaskOptions) -> ProposedTask {
        tracing::debug!(model = %self.model, "getting next task from ollama");

        match planner::generate_next_task(
            &self.client,
            &self.model,
            &opts,
            ToolDialect::Json,
            HOSTED_SAMPLING,
        )
        .await
        {
            Ok(task) => task,
            Err(PlanError::HistoryTooLong) => {
                tracing::error!("prompt assembly failed: history too long");
                planner::fallback_ask(planner::HISTORY_TOO_LONG_MSG)
            }
            Err(e) => {
                tracing::error!(provider = "ollama", error = %e, "failed to generate next task");
                planner::fallback_ask(planner::NEXT_TASK_ERROR_MSG)
            }
        }
    }
}
