//! The engine facade handed to the transport layer.
//!
//! The transport (HTTP, subscriptions, whatever hosts the engine) drives
//! flows exclusively through this type: create a flow, submit user input,
//! read state, subscribe on the hub, shut down. Everything else is
//! internal wiring.

use std::sync::Arc;
use std::time::Duration;

use crate::browser::BrowserService;
use crate::db::{Flow, NewTask, Storage, Task, TaskStatus, TaskType, TerminalLog};
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::hub::Hub;
use crate::llm::ProviderKind;
use crate::sandbox::SandboxManager;

/// Bound on total shutdown work.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Engine {
    store: Arc<dyn Storage>,
    hub: Arc<Hub>,
    sandbox: Arc<SandboxManager>,
    #[allow(dead_code)]
    browser: Arc<BrowserService>,
    dispatcher: Arc<Dispatcher>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Storage>,
        hub: Arc<Hub>,
        sandbox: Arc<SandboxManager>,
        browser: Arc<BrowserService>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            store,
            hub,
            sandbox,
            browser,
            dispatcher,
        }
    }

    /// Subscription surface for the transport layer.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Create a flow bound to a provider tag and model, and start its
    /// worker.
    pub async fn create_flow(&self, provider: &str, model: &str) -> Result<Flow, Error> {
        // Reject unknown tags here, before a worker dies on them.
        let _: ProviderKind = provider
            .parse()
            .map_err(|e: String| Error::InvalidInput(e))?;

        let flow = self.store.create_flow(provider, model).await?;
        self.dispatcher.add_queue(flow.id).await;
        tracing::info!(flow_id = flow.id, provider, model, "flow created");
        Ok(flow)
    }

    /// Turn a user message into an `input` task and enqueue it.
    pub async fn submit_input(&self, flow_id: i64, message: &str) -> Result<Task, Error> {
        let flow = self.store.read_flow(flow_id).await?;
        if flow.status == crate::db::FlowStatus::Finished {
            return Err(Error::InvalidInput(format!(
                "flow {flow_id} is already finished"
            )));
        }

        // Re-register after restart; queues do not survive the process.
        self.dispatcher.add_queue(flow_id).await;

        let task = self
            .store
            .create_task(NewTask {
                flow_id,
                task_type: TaskType::Input,
                status: TaskStatus::InProgress,
                message: message.to_string(),
                args: "{}".to_string(),
                tool_call_id: String::new(),
            })
            .await?;

        self.dispatcher.add_command(flow_id, task.clone()).await;
        Ok(task)
    }

    pub async fn flows(&self) -> Result<Vec<Flow>, Error> {
        Ok(self.store.read_all_flows().await?)
    }

    pub async fn flow(&self, flow_id: i64) -> Result<Flow, Error> {
        Ok(self.store.read_flow(flow_id).await?)
    }

    pub async fn tasks(&self, flow_id: i64) -> Result<Vec<Task>, Error> {
        Ok(self.store.read_tasks_by_flow(flow_id).await?)
    }

    pub async fn terminal_logs(&self, flow_id: i64) -> Result<Vec<TerminalLog>, Error> {
        Ok(self.store.logs_by_flow(flow_id).await?)
    }

    /// Graceful shutdown: stop every worker, then reclaim sandboxes and
    /// finish in-progress flows. Idempotent.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        self.sandbox.cleanup().await;
    }
}
