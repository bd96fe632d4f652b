//! Hosted OpenAI backend. Tool-call dialect, low-variance sampling.

use async_trait::async_trait;

use crate::config::OpenAiConfig;
use crate::error::LlmError;
use crate::llm::client::ChatClient;
use crate::llm::{NextTaskOptions, Provider, ProposedTask, ProviderKind};
use crate::planner::{self, HOSTED_SAMPLING, PlanError, ToolDialect};

pub struct OpenAiProvider {
    client: ChatClient,
    model: String,
}

impl OpenAiProvider {
    pub fn new(config: &OpenAiConfig) -> Result<Self, LlmError> {
        let client = ChatClient::new("openai", &config.server_url, config.api_key.clone())?;
        Ok(Self {
            client,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn summary(&self, text: &str, word_count: usize) -> Result<String, LlmError> {
        planner::summarize(&self.client, &self.model, text, word_count, HOSTED_SAMPLING).await
    }

    async fn docker_image_name(&self, text: &str) -> Result<String, LlmError> {
        planner::docker_image_name(&self.client, &self.model, text, HOSTED_SAMPLING).await
    }

    async fn next_task(&self, opts: NextTaskOptions) -> ProposedTask {
        tracing::debug!(model = %self.model, "getting next task from openai");

        match planner::generate_next_task(
            &self.client,
            &self.model,
            &opts,
            ToolDialect::ToolCalls,
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
                tracing::error!(provider = "openai", error = %e, "failed to generate next task");
                planner::fallback_ask(planner::NEXT_TASK_ERROR_MSG)
            }
        }
    }
}
