//! OpenAI-compatible local servers: LM Studio, LocalAI, and any generic
//! endpoint (vLLM, llama.cpp server, text-generation-webui, ...).
//!
//! One implementation covers all three; they differ only in the tag they
//! report and whether the server handles native tool calls. The generic
//! endpoint stays on the JSON dialect for maximum compatibility.

use async_trait::async_trait;

use crate::config::CompatConfig;
use crate::error::LlmError;
use crate::llm::client::ChatClient;
use crate::llm::{NextTaskOptions, Provider, ProposedTask, ProviderKind};
use crate::planner::{self, LOCAL_SAMPLING, PlanError, ToolDialect};

pub struct CompatProvider {
    kind: ProviderKind,
    client: ChatClient,
    model: String,
    dialect: ToolDialect,
}

impl CompatProvider {
    pub fn lm_studio(config: &CompatConfig) -> Result<Self, LlmError> {
        Self::new(ProviderKind::LmStudio, "lmstudio", config, ToolDialect::ToolCalls)
    }

    pub fn local_ai(config: &CompatConfig) -> Result<Self, LlmError> {
        Self::new(ProviderKind::LocalAi, "localai", config, ToolDialect::ToolCalls)
    }

    pub fn openai_compatible(config: &CompatConfig) -> Result<Self, LlmError> {
        Self::new(
            ProviderKind::OpenAiCompatible,
            "openai-compatible",
            config,
            ToolDialect::Json,
        )
    }

    fn new(
        kind: ProviderKind,
        tag: &'static str,
        config: &CompatConfig,
        dialect: ToolDialect,
    ) -> Result<Self, LlmError> {
        let client = ChatClient::new(tag, &config.server_url, config.api_key.clone())?;
        Ok(Self {
            kind,
            client,
            model: config.model.clone(),
            dialect,
        })
    }
}

#[async_trait]
impl Provider for CompatProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn summary(&self, text: &str, word_count: usize) -> Result<String, LlmError> {
        planner::summarize(&self.client, &self.model, text, word_count, LOCAL_SAMPLING).await
    }

    async fn docker_image_name(&self, text: &str) -> Result<String, LlmError> {
        planner::docker_image_name(&self.client, &self.model, text, LOCAL_SAMPLING).await
    }

    async fn next_task(&self, opts: NextTaskOptions) -> ProposedTask {
        tracing::debug!(
            model = %self.model,
            provider = %self.kind,
            tool_calls = matches!(self.dialect, ToolDialect::ToolCalls),
            "getting next task from local model"
        );

        match planner::generate_next_task(
            &self.client,
            &self.model,
            &opts,
            self.dialect,
            LOCAL_SAMPLING,
        )
        .await
        {
            Ok(task) => task,
            Err(PlanError::HistoryTooLong) => {
                tracing::error!("prompt assembly failed: history too long");
                planner::fallback_ask(planner::HISTORY_TOO_LONG_MSG)
            }
            Err(e) => {
                tracing::error!(provider = %self.kind, model = %self.model, error = %e,
                    "failed to generate next task");
                planner::fallback_ask(planner::LOCAL_MODEL_ERROR_MSG)
            }
        }
    }
}
