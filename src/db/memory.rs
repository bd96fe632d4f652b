//! In-memory [`Storage`] implementation for tests.
//!
//! Ids are issued from a single counter so task ordering matches the
//! production gateway. No deadlines: operations are infallible except for
//! missing rows.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    ContainerRecord, ContainerStatus, Flow, FlowStatus, LogType, NewTask, Storage, Task,
    TaskStatus, TaskType, TerminalLog,
};
use crate::error::StoreError;

#[derive(Default)]
struct Inner {
    next_id: i64,
    flows: HashMap<i64, Flow>,
    tasks: Vec<Task>,
    logs: Vec<TerminalLog>,
    containers: HashMap<i64, ContainerRecord>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Test double for the persistence gateway.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemStore {
    async fn create_flow(&self, provider: &str, model: &str) -> Result<Flow, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        let flow = Flow {
            id,
            name: String::new(),
            status: FlowStatus::InProgress,
            model_provider: provider.to_string(),
            model: model.to_string(),
            container_id: None,
            container_image: String::new(),
            created_at: Utc::now(),
        };
        inner.flows.insert(id, flow.clone());
        Ok(flow)
    }

    async fn read_flow(&self, id: i64) -> Result<Flow, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .flows
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { entity: "flow", id })
    }

    async fn read_all_flows(&self) -> Result<Vec<Flow>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut flows: Vec<_> = inner.flows.values().cloned().collect();
        flows.sort_by_key(|f| f.id);
        Ok(flows)
    }

    async fn update_flow_status(&self, id: i64, status: FlowStatus) -> Result<Flow, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let flow = inner
            .flows
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "flow", id })?;
        flow.status = status;
        Ok(flow.clone())
    }

    async fn update_flow_name(&self, id: i64, name: &str) -> Result<Flow, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let flow = inner
            .flows
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "flow", id })?;
        flow.name = name.to_string();
        Ok(flow.clone())
    }

    async fn update_flow_container(
        &self,
        id: i64,
        container_id: i64,
        image: &str,
    ) -> Result<Flow, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let flow = inner
            .flows
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "flow", id })?;
        flow.container_id = Some(container_id);
        flow.container_image = image.to_string();
        Ok(flow.clone())
    }

    async fn create_task(&self, task: NewTask) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        let task = Task {
            id,
            flow_id: task.flow_id,
            task_type: task.task_type,
            status: task.status,
            message: task.message,
            args: task.args,
            results: String::new(),
            tool_call_id: task.tool_call_id,
            created_at: Utc::now(),
        };
        inner.tasks.push(task.clone());
        Ok(task)
    }

    async fn read_tasks_by_flow(&self, flow_id: i64) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tasks
            .iter()
            .filter(|t| t.flow_id == flow_id)
            .cloned()
            .collect())
    }

    async fn update_task_status(&self, id: i64, status: TaskStatus) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StoreError::NotFound { entity: "task", id })?;
        task.status = status;
        Ok(task.clone())
    }

    async fn update_task_results(&self, id: i64, results: &str) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StoreError::NotFound { entity: "task", id })?;
        task.results = results.to_string();
        Ok(task.clone())
    }

    async fn update_task_tool_call_id(
        &self,
        id: i64,
        tool_call_id: &str,
    ) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StoreError::NotFound { entity: "task", id })?;
        task.tool_call_id = tool_call_id.to_string();
        Ok(task.clone())
    }

    async fn create_log(
        &self,
        flow_id: i64,
        log_type: LogType,
        message: &str,
    ) -> Result<TerminalLog, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        let log = TerminalLog {
            id,
            flow_id,
            log_type,
            message: message.to_string(),
            created_at: Utc::now(),
        };
        inner.logs.push(log.clone());
        Ok(log)
    }

    async fn logs_by_flow(&self, flow_id: i64) -> Result<Vec<TerminalLog>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .logs
            .iter()
            .filter(|l| l.flow_id == flow_id)
            .cloned()
            .collect())
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
    ) -> Result<ContainerRecord, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        let record = ContainerRecord {
            id,
            name: name.to_string(),
            image: image.to_string(),
            local_id: String::new(),
            status: ContainerStatus::Starting,
            created_at: Utc::now(),
        };
        inner.containers.insert(id, record.clone());
        Ok(record)
    }

    async fn update_container_status(
        &self,
        id: i64,
        status: ContainerStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.containers.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "container",
            id,
        })?;
        record.status = status;
        Ok(())
    }

    async fn update_container_local_id(&self, id: i64, local_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.containers.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "container",
            id,
        })?;
        record.local_id = local_id.to_string();
        Ok(())
    }

    async fn running_containers(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<_> = inner
            .containers
            .values()
            .filter(|c| c.status == ContainerStatus::Running)
            .cloned()
            .collect();
        records.sort_by_key(|c| c.id);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_monotonic_across_entities() {
        let store = MemStore::new();
        let flow = store.create_flow("openai", "gpt-4o").await.unwrap();
        let task = store
            .create_task(NewTask {
                flow_id: flow.id,
                task_type: TaskType::Input,
                status: TaskStatus::InProgress,
                message: "hello".to_string(),
                args: "{}".to_string(),
                tool_call_id: String::new(),
            })
            .await
            .unwrap();
        let log = store
            .create_log(flow.id, LogType::System, "ready")
            .await
            .unwrap();

        assert!(flow.id < task.id);
        assert!(task.id < log.id);
    }

    #[tokio::test]
    async fn cleanup_state_updates_are_idempotent() {
        let store = MemStore::new();
        let flow = store.create_flow("openai", "gpt-4o").await.unwrap();
        let record = store.create_container("term", "debian:latest").await.unwrap();
        store
            .update_container_status(record.id, ContainerStatus::Running)
            .await
            .unwrap();

        // First cleanup pass.
        store
            .update_container_status(record.id, ContainerStatus::Stopped)
            .await
            .unwrap();
        store
            .update_flow_status(flow.id, FlowStatus::Finished)
            .await
            .unwrap();

        // Second pass produces the same state.
        store
            .update_container_status(record.id, ContainerStatus::Stopped)
            .await
            .unwrap();
        let flow = store
            .update_flow_status(flow.id, FlowStatus::Finished)
            .await
            .unwrap();

        assert_eq!(flow.status, FlowStatus::Finished);
        assert!(store.running_containers().await.unwrap().is_empty());
    }
}
