//! Per-flow task dispatch.
//!
//! Each flow owns a buffered FIFO queue and a single worker, so tasks
//! within a flow execute strictly in order while flows run concurrently.
//! The worker drives the loop end to end: broadcast the task, run its
//! handler, advance its status, and (for tool tasks) ask the planner for
//! the next step and enqueue it, until an `ask` or `done` stops the chain.
//!
//! A panicking handler is recovered: the task is marked `error`, the
//! worker keeps draining its queue, and the process survives.

pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{RwLock, mpsc, watch};

use crate::browser::BrowserService;
use crate::config::ProvidersConfig;
use crate::db::{NewTask, Storage, Task, TaskStatus};
use crate::error::Error;
use crate::hub::{Hub, TaskEvent};
use crate::llm::{self, NextTaskOptions, Provider};
use crate::sandbox::SandboxManager;

pub use handlers::{CODE_ROOT, needs_next};

/// Capacity of each flow's task queue. A full queue indicates a runaway
/// planner or a stuck worker; further tasks are dropped with a warning.
pub const QUEUE_BUFFER_SIZE: usize = 1000;

/// Everything handlers and workers need, shared across flows.
#[derive(Clone)]
pub struct Deps {
    pub store: Arc<dyn Storage>,
    pub hub: Arc<Hub>,
    pub sandbox: Arc<SandboxManager>,
    pub browser: Arc<BrowserService>,
    pub providers: ProvidersConfig,
    pub allow_any_image: bool,
    /// Base URL under which screenshots are served to subscribers.
    pub base_url: String,
}

struct FlowQueue {
    queue: mpsc::Sender<Task>,
    stop: watch::Sender<bool>,
}

/// Queue table plus the worker loops it feeds.
pub struct Dispatcher {
    queues: RwLock<HashMap<i64, FlowQueue>>,
    deps: Deps,
}

impl Dispatcher {
    pub fn new(deps: Deps) -> Arc<Self> {
        Arc::new(Self {
            queues: RwLock::new(HashMap::new()),
            deps,
        })
    }

    /// Idempotently create the queue pair for a flow and start its worker.
    pub async fn add_queue(self: &Arc<Self>, flow_id: i64) {
        let mut queues = self.queues.write().await;
        if queues.contains_key(&flow_id) {
            return;
        }

        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_BUFFER_SIZE);
        let (stop_tx, stop_rx) = watch::channel(false);
        queues.insert(
            flow_id,
            FlowQueue {
                queue: queue_tx,
                stop: stop_tx,
            },
        );

        let dispatcher = Arc::clone(self);
        tokio::spawn(dispatcher.run_worker(flow_id, queue_rx, stop_rx));
    }

    pub async fn has_queue(&self, flow_id: i64) -> bool {
        self.queues.read().await.contains_key(&flow_id)
    }

    /// Non-blocking enqueue. Dropped with a warning when the queue is full.
    pub async fn add_command(&self, flow_id: i64, task: Task) {
        let sender = {
            let queues = self.queues.read().await;
            queues.get(&flow_id).map(|fq| fq.queue.clone())
        };

        let Some(sender) = sender else {
            tracing::debug!(flow_id, task_id = task.id, "no queue for flow, task dropped");
            return;
        };

        match sender.try_send(task) {
            Ok(()) => tracing::debug!(flow_id, "command added to queue"),
            Err(mpsc::error::TrySendError::Full(task)) => {
                tracing::warn!(flow_id, task_id = task.id, "queue full, command dropped");
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                tracing::debug!(flow_id, task_id = task.id, "queue closed, command dropped");
            }
        }
    }

    /// Signal the worker to stop and delete the queue pair.
    pub async fn clean_queue(&self, flow_id: i64) {
        let removed = self.queues.write().await.remove(&flow_id);
        if let Some(flow_queue) = removed {
            let _ = flow_queue.stop.send(true);
            tracing::debug!(flow_id, "queue cleaned");
        }
    }

    /// Stop every flow's worker. In-flight tasks finish up to their
    /// deadlines; queued tasks are abandoned.
    pub async fn shutdown(&self) {
        let flow_ids: Vec<i64> = self.queues.read().await.keys().copied().collect();
        for flow_id in flow_ids {
            self.clean_queue(flow_id).await;
        }
    }

    async fn run_worker(
        self: Arc<Self>,
        flow_id: i64,
        mut queue_rx: mpsc::Receiver<Task>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        tracing::info!(flow_id, "starting task processor");

        // Resolve the provider once per worker.
        let provider = match self.resolve_provider(flow_id).await {
            Ok(provider) => provider,
            Err(e) => {
                tracing::error!(flow_id, error = %e, "failed to initialize provider");
                self.clean_queue(flow_id).await;
                return;
            }
        };

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    let stopped = changed.is_err() || *stop_rx.borrow();
                    if stopped {
                        tracing::info!(flow_id, "stopping task processor");
                        return;
                    }
                }
                task = queue_rx.recv() => {
                    match task {
                        Some(task) => self.process_task(flow_id, task, &provider).await,
                        None => {
                            tracing::debug!(flow_id, "queue closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn resolve_provider(&self, flow_id: i64) -> Result<Arc<dyn Provider>, Error> {
        let flow = self.deps.store.read_flow(flow_id).await?;
        let provider = llm::create_provider(&flow.model_provider, &self.deps.providers)?;
        tracing::info!(
            flow_id,
            provider = %provider.kind(),
            model = %flow.model,
            "provider initialized"
        );
        Ok(provider)
    }

    async fn process_task(&self, flow_id: i64, task: Task, provider: &Arc<dyn Provider>) {
        let start = Instant::now();
        tracing::debug!(task_id = task.id, task_type = %task.task_type, "processing task");

        self.deps
            .hub
            .broadcast_task_added(flow_id, TaskEvent::from(&task));

        // The handler runs in its own task so a panic is contained: the
        // task is marked `error` and the worker keeps going.
        let handler_deps = self.deps.clone();
        let handler_provider = Arc::clone(provider);
        let handler_task = task.clone();
        let joined = tokio::spawn(async move {
            handlers::handle(&handler_deps, &handler_provider, &handler_task).await
        })
        .await;

        let result = match joined {
            Ok(result) => result,
            Err(join_error) => {
                if join_error.is_panic() {
                    tracing::error!(task_id = task.id, "task handler panicked");
                    Err(Error::Internal("task handler panicked".to_string()))
                } else {
                    Err(Error::Internal("task handler was cancelled".to_string()))
                }
            }
        };

        match result {
            Ok(()) => {
                self.advance_task(&task, TaskStatus::Finished).await;
                tracing::debug!(
                    task_id = task.id,
                    task_type = %task.task_type,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "task completed"
                );

                if needs_next(task.task_type) {
                    match self.plan_next_task(flow_id, provider).await {
                        Ok(next) => self.add_command(flow_id, next).await,
                        Err(e) => {
                            tracing::error!(flow_id, error = %e, "failed to get next task");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    task_id = task.id,
                    task_type = %task.task_type,
                    error = %e,
                    "failed to process task"
                );
                self.advance_task(&task, TaskStatus::Error).await;
            }
        }
    }

    /// Update a task's status and broadcast the new snapshot. Failures are
    /// logged; the worker never dies over a status write.
    async fn advance_task(&self, task: &Task, status: TaskStatus) {
        match self.deps.store.update_task_status(task.id, status).await {
            Ok(updated) => {
                self.deps
                    .hub
                    .broadcast_task_updated(task.flow_id, TaskEvent::from(&updated));
            }
            Err(e) => {
                tracing::error!(task_id = task.id, error = %e, "failed to update task status");
            }
        }
    }

    /// Ask the planner for the flow's next task and persist it. The
    /// model-emitted tool-call id is stamped onto the previous tail task
    /// so later prompts can pair the call with its result turn.
    async fn plan_next_task(
        &self,
        flow_id: i64,
        provider: &Arc<dyn Provider>,
    ) -> Result<Task, Error> {
        let flow = self.deps.store.read_flow(flow_id).await?;
        let tasks = self.deps.store.read_tasks_by_flow(flow_id).await?;
        let tail_task_id = tasks.last().map(|t| t.id);

        let proposed = provider
            .next_task(NextTaskOptions {
                tasks,
                image: flow.container_image.clone(),
            })
            .await;

        if let Some(ref call_id) = proposed.tool_call_id
            && let Some(tail_id) = tail_task_id
        {
            self.deps
                .store
                .update_task_tool_call_id(tail_id, call_id)
                .await?;
        }

        let task = self
            .deps
            .store
            .create_task(NewTask {
                flow_id,
                task_type: proposed.task_type,
                status: TaskStatus::InProgress,
                message: proposed.message,
                args: proposed.args,
                tool_call_id: proposed.tool_call_id.unwrap_or_default(),
            })
            .await?;

        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BrowserConfig, CompatConfig, OllamaConfig, OpenAiConfig, ProvidersConfig,
    };
    use crate::db::memory::MemStore;
    use crate::db::{FlowStatus, LogType, TaskType};
    use crate::error::LlmError;
    use crate::llm::{ProposedTask, ProviderKind};
    use crate::planner;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Provider stub that always proposes the same task.
    struct StaticProvider {
        proposed: ProposedTask,
    }

    impl StaticProvider {
        fn asking(message: &str) -> Self {
            Self {
                proposed: planner::fallback_ask(message),
            }
        }
    }

    #[async_trait]
    impl crate::llm::Provider for StaticProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        async fn summary(&self, _text: &str, _n: usize) -> Result<String, LlmError> {
            Ok("Test flow".to_string())
        }

        async fn docker_image_name(&self, _text: &str) -> Result<String, LlmError> {
            Ok("debian:latest".to_string())
        }

        async fn next_task(&self, _opts: NextTaskOptions) -> ProposedTask {
            self.proposed.clone()
        }
    }

    fn providers_config() -> ProvidersConfig {
        ProvidersConfig {
            openai: OpenAiConfig {
                api_key: None,
                model: "gpt-4o".to_string(),
                server_url: "http://localhost:9".to_string(),
            },
            ollama: OllamaConfig {
                model: String::new(),
                server_url: "http://localhost:9".to_string(),
            },
            lmstudio: CompatConfig {
                model: String::new(),
                server_url: "http://localhost:9".to_string(),
                api_key: None,
            },
            localai: CompatConfig {
                model: String::new(),
                server_url: "http://localhost:9".to_string(),
                api_key: None,
            },
            compat: CompatConfig {
                model: String::new(),
                server_url: "http://localhost:9".to_string(),
                api_key: None,
            },
        }
    }

    fn test_deps() -> Deps {
        let store: Arc<dyn Storage> = Arc::new(MemStore::new());
        let hub = Arc::new(Hub::new());
        // The Docker client is lazy; these tests never reach the engine.
        let docker = crate::sandbox::connect_docker().expect("lazy docker client");
        let sandbox = Arc::new(SandboxManager::new(
            docker,
            Arc::clone(&store),
            Arc::clone(&hub),
        ));
        Deps {
            store,
            hub,
            sandbox,
            browser: Arc::new(BrowserService::new(BrowserConfig::default())),
            providers: providers_config(),
            allow_any_image: false,
            base_url: "http://localhost:8080".to_string(),
        }
    }

    async fn seeded_flow(deps: &Deps) -> i64 {
        let flow = deps.store.create_flow("openai", "gpt-4o").await.unwrap();
        flow.id
    }

    async fn enqueue_task(
        deps: &Deps,
        dispatcher: &Arc<Dispatcher>,
        flow_id: i64,
        task_type: TaskType,
        message: &str,
        args: &str,
    ) -> Task {
        let task = deps
            .store
            .create_task(NewTask {
                flow_id,
                task_type,
                status: TaskStatus::InProgress,
                message: message.to_string(),
                args: args.to_string(),
                tool_call_id: String::new(),
            })
            .await
            .unwrap();
        dispatcher.add_command(flow_id, task.clone()).await;
        task
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn needs_next_table_matches_contract() {
        assert!(needs_next(TaskType::Input));
        assert!(needs_next(TaskType::Terminal));
        assert!(needs_next(TaskType::Code));
        assert!(needs_next(TaskType::Browser));
        assert!(!needs_next(TaskType::Ask));
        assert!(!needs_next(TaskType::Done));
    }

    #[tokio::test]
    async fn add_queue_is_idempotent_and_clean_removes() {
        let deps = test_deps();
        let dispatcher = Dispatcher::new(deps.clone());
        let flow_id = seeded_flow(&deps).await;

        dispatcher.add_queue(flow_id).await;
        dispatcher.add_queue(flow_id).await;
        assert!(dispatcher.has_queue(flow_id).await);
        assert_eq!(dispatcher.queues.read().await.len(), 1);

        dispatcher.clean_queue(flow_id).await;
        assert!(!dispatcher.has_queue(flow_id).await);

        // Enqueueing after cleanup is a quiet no-op.
        let task = deps
            .store
            .create_task(NewTask {
                flow_id,
                task_type: TaskType::Ask,
                status: TaskStatus::InProgress,
                message: String::new(),
                args: "{}".to_string(),
                tool_call_id: String::new(),
            })
            .await
            .unwrap();
        dispatcher.add_command(flow_id, task).await;
    }

    #[tokio::test]
    async fn done_task_finishes_flow_and_task() {
        let deps = test_deps();
        let dispatcher = Dispatcher::new(deps.clone());
        let flow_id = seeded_flow(&deps).await;
        dispatcher.add_queue(flow_id).await;

        let task = enqueue_task(&deps, &dispatcher, flow_id, TaskType::Done, "All set", "{}").await;

        let store = Arc::clone(&deps.store);
        wait_for(|| {
            let store = Arc::clone(&store);
            async move {
                store.read_flow(1).await.unwrap().status == FlowStatus::Finished
            }
        })
        .await;

        let tasks = deps.store.read_tasks_by_flow(flow_id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, task.id);
        assert_eq!(tasks[0].status, TaskStatus::Finished);
    }

    #[tokio::test]
    async fn ask_task_stops_the_chain() {
        let deps = test_deps();
        let dispatcher = Dispatcher::new(deps.clone());
        let flow_id = seeded_flow(&deps).await;
        dispatcher.add_queue(flow_id).await;

        enqueue_task(&deps, &dispatcher, flow_id, TaskType::Ask, "Which one?", "{}").await;

        let store = Arc::clone(&deps.store);
        wait_for(|| {
            let store = Arc::clone(&store);
            async move {
                let tasks = store.read_tasks_by_flow(1).await.unwrap();
                tasks.first().is_some_and(|t| t.status == TaskStatus::Finished)
            }
        })
        .await;

        // No follow-up was planned.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let tasks = deps.store.read_tasks_by_flow(flow_id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(deps.store.read_flow(flow_id).await.unwrap().status, FlowStatus::InProgress);
    }

    #[tokio::test]
    async fn blocked_url_marks_task_error_and_worker_continues() {
        let deps = test_deps();
        let dispatcher = Dispatcher::new(deps.clone());
        let flow_id = seeded_flow(&deps).await;
        dispatcher.add_queue(flow_id).await;

        let bad = enqueue_task(
            &deps,
            &dispatcher,
            flow_id,
            TaskType::Browser,
            "Fetching metadata",
            r#"{"url": "http://169.254.169.254/latest", "action": "read"}"#,
        )
        .await;
        let follow_up =
            enqueue_task(&deps, &dispatcher, flow_id, TaskType::Done, "Wrapping up", "{}").await;

        let store = Arc::clone(&deps.store);
        wait_for(|| {
            let store = Arc::clone(&store);
            async move {
                store.read_flow(1).await.unwrap().status == FlowStatus::Finished
            }
        })
        .await;

        let tasks = deps.store.read_tasks_by_flow(flow_id).await.unwrap();
        let bad_task = tasks.iter().find(|t| t.id == bad.id).unwrap();
        assert_eq!(bad_task.status, TaskStatus::Error);
        let done_task = tasks.iter().find(|t| t.id == follow_up.id).unwrap();
        assert_eq!(done_task.status, TaskStatus::Finished);
    }

    #[tokio::test]
    async fn planner_failure_surfaces_as_ask_and_flow_stays_open() {
        let deps = test_deps();
        // No queue registered: process_task is driven directly so the
        // planned ask stays untouched for inspection.
        let dispatcher = Dispatcher::new(deps.clone());
        let flow_id = seeded_flow(&deps).await;

        // A second input is a no-op handler with needs-next, so the static
        // provider's fallback ask is planned as the next task.
        deps.store
            .create_task(NewTask {
                flow_id,
                task_type: TaskType::Input,
                status: TaskStatus::Finished,
                message: "first".to_string(),
                args: "{}".to_string(),
                tool_call_id: String::new(),
            })
            .await
            .unwrap();
        let provider: Arc<dyn Provider> =
            Arc::new(StaticProvider::asking(planner::NEXT_TASK_ERROR_MSG));

        let second = deps
            .store
            .create_task(NewTask {
                flow_id,
                task_type: TaskType::Input,
                status: TaskStatus::InProgress,
                message: "again".to_string(),
                args: "{}".to_string(),
                tool_call_id: String::new(),
            })
            .await
            .unwrap();

        dispatcher.process_task(flow_id, second, &provider).await;

        let tasks = deps.store.read_tasks_by_flow(flow_id).await.unwrap();
        let ask = tasks.last().unwrap();
        assert_eq!(ask.task_type, TaskType::Ask);
        assert_eq!(ask.message, planner::NEXT_TASK_ERROR_MSG);
        assert_eq!(ask.status, TaskStatus::InProgress);
        assert_eq!(
            deps.store.read_flow(flow_id).await.unwrap().status,
            FlowStatus::InProgress
        );
    }

    #[tokio::test]
    async fn tasks_process_in_fifo_order() {
        let deps = test_deps();
        let dispatcher = Dispatcher::new(deps.clone());
        let flow_id = seeded_flow(&deps).await;

        let (mut added_rx, _sub) = deps.hub.task_added.subscribe(flow_id);
        dispatcher.add_queue(flow_id).await;

        let mut expected = Vec::new();
        for i in 0..5 {
            let task = enqueue_task(
                &deps,
                &dispatcher,
                flow_id,
                TaskType::Ask,
                &format!("question {i}"),
                "{}",
            )
            .await;
            expected.push(task.id);
        }

        for expected_id in expected {
            let event = added_rx.recv().await.unwrap();
            assert_eq!(event.id, expected_id);
        }
    }

    #[tokio::test]
    async fn second_input_logs_nothing_and_spawns_nothing() {
        let deps = test_deps();
        let dispatcher = Dispatcher::new(deps.clone());
        let flow_id = seeded_flow(&deps).await;

        deps.store
            .create_task(NewTask {
                flow_id,
                task_type: TaskType::Input,
                status: TaskStatus::Finished,
                message: "first".to_string(),
                args: "{}".to_string(),
                tool_call_id: String::new(),
            })
            .await
            .unwrap();
        let second = deps
            .store
            .create_task(NewTask {
                flow_id,
                task_type: TaskType::Input,
                status: TaskStatus::InProgress,
                message: "second".to_string(),
                args: "{}".to_string(),
                tool_call_id: String::new(),
            })
            .await
            .unwrap();

        let provider: Arc<dyn Provider> = Arc::new(StaticProvider::asking("next?"));
        dispatcher.process_task(flow_id, second, &provider).await;

        // No system logs were written and no container records exist.
        let logs = deps.store.logs_by_flow(flow_id).await.unwrap();
        assert!(logs.iter().all(|l| l.log_type != LogType::System));
        assert!(deps.store.running_containers().await.unwrap().is_empty());
    }
}
