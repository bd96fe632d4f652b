//! Persistence gateway: typed CRUD over flows, tasks, terminal logs, and
//! container records.
//!
//! The gateway is the only component that touches the database. Every call
//! carries a 30 s deadline; writes serialize through a single-writer lock
//! while reads go straight to the pool. Errors surface to callers; the
//! gateway never retries.

pub mod models;

#[cfg(test)]
pub mod memory;

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::{NoTls, Row};

use crate::config::DatabaseConfig;
use crate::error::StoreError;

pub use models::{
    ContainerRecord, ContainerStatus, Flow, FlowStatus, LogType, NewTask, Task, TaskStatus,
    TaskType, TerminalLog,
};

/// Deadline attached to every database operation.
pub const DB_TIMEOUT: Duration = Duration::from_secs(30);

/// The operations the core needs from any transactional store with
/// single-writer semantics.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_flow(&self, provider: &str, model: &str) -> Result<Flow, StoreError>;
    async fn read_flow(&self, id: i64) -> Result<Flow, StoreError>;
    async fn read_all_flows(&self) -> Result<Vec<Flow>, StoreError>;
    async fn update_flow_status(&self, id: i64, status: FlowStatus) -> Result<Flow, StoreError>;
    async fn update_flow_name(&self, id: i64, name: &str) -> Result<Flow, StoreError>;
    async fn update_flow_container(
        &self,
        id: i64,
        container_id: i64,
        image: &str,
    ) -> Result<Flow, StoreError>;

    async fn create_task(&self, task: NewTask) -> Result<Task, StoreError>;
    /// Tasks for a flow, ordered by id ascending.
    async fn read_tasks_by_flow(&self, flow_id: i64) -> Result<Vec<Task>, StoreError>;
    async fn update_task_status(&self, id: i64, status: TaskStatus) -> Result<Task, StoreError>;
    async fn update_task_results(&self, id: i64, results: &str) -> Result<Task, StoreError>;
    async fn update_task_tool_call_id(
        &self,
        id: i64,
        tool_call_id: &str,
    ) -> Result<Task, StoreError>;

    async fn create_log(
        &self,
        flow_id: i64,
        log_type: LogType,
        message: &str,
    ) -> Result<TerminalLog, StoreError>;
    async fn logs_by_flow(&self, flow_id: i64) -> Result<Vec<TerminalLog>, StoreError>;

    async fn create_container(&self, name: &str, image: &str)
    -> Result<ContainerRecord, StoreError>;
    async fn update_container_status(
        &self,
        id: i64,
        status: ContainerStatus,
    ) -> Result<(), StoreError>;
    async fn update_container_local_id(&self, id: i64, local_id: &str) -> Result<(), StoreError>;
    async fn running_containers(&self) -> Result<Vec<ContainerRecord>, StoreError>;
}

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS flows (
    id              BIGSERIAL PRIMARY KEY,
    name            TEXT NOT NULL DEFAULT '',
    status          TEXT NOT NULL DEFAULT 'in_progress',
    model_provider  TEXT NOT NULL DEFAULT '',
    model           TEXT NOT NULL DEFAULT '',
    container_id    BIGINT,
    container_image TEXT NOT NULL DEFAULT '',
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS tasks (
    id           BIGSERIAL PRIMARY KEY,
    flow_id      BIGINT NOT NULL REFERENCES flows (id),
    type         TEXT NOT NULL,
    status       TEXT NOT NULL,
    message      TEXT NOT NULL DEFAULT '',
    args         TEXT NOT NULL DEFAULT '{}',
    results      TEXT NOT NULL DEFAULT '',
    tool_call_id TEXT NOT NULL DEFAULT '',
    created_at   TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS tasks_flow_id_idx ON tasks (flow_id, id);

CREATE TABLE IF NOT EXISTS terminal_logs (
    id         BIGSERIAL PRIMARY KEY,
    flow_id    BIGINT NOT NULL REFERENCES flows (id),
    type       TEXT NOT NULL,
    message    TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS terminal_logs_flow_id_idx ON terminal_logs (flow_id, id);

CREATE TABLE IF NOT EXISTS containers (
    id         BIGSERIAL PRIMARY KEY,
    name       TEXT NOT NULL,
    image      TEXT NOT NULL,
    local_id   TEXT NOT NULL DEFAULT '',
    status     TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// Postgres-backed [`Storage`] implementation.
pub struct Store {
    pool: Pool,
    /// One active writer at a time; readers are unbounded.
    write_lock: tokio::sync::Mutex<()>,
}

impl Store {
    /// Connect to the database and verify the connection. Failure here is
    /// fatal to the process.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pg_config =
            tokio_postgres::Config::from_str(&config.url).map_err(|e| StoreError::Pool {
                reason: format!("invalid DATABASE_URL: {e}"),
            })?;

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(8)
            .build()
            .map_err(|e| StoreError::Pool {
                reason: e.to_string(),
            })?;

        let store = Self {
            pool,
            write_lock: tokio::sync::Mutex::new(()),
        };

        // Verify connectivity up front rather than on the first flow.
        let client = store.client("connect").await?;
        deadline("connect", client.simple_query("SELECT 1")).await?;

        Ok(store)
    }

    /// Apply the embedded schema. Idempotent.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let client = self.client("run_migrations").await?;
        deadline("run_migrations", client.batch_execute(MIGRATIONS)).await?;
        tracing::info!("database migrations applied");
        Ok(())
    }

    async fn client(&self, op: &'static str) -> Result<deadpool_postgres::Object, StoreError> {
        match tokio::time::timeout(DB_TIMEOUT, self.pool.get()).await {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(e)) => Err(StoreError::Pool {
                reason: e.to_string(),
            }),
            Err(_) => Err(StoreError::Timeout {
                op,
                timeout: DB_TIMEOUT,
            }),
        }
    }
}

/// Wrap a database future with the gateway deadline.
async fn deadline<T, F>(op: &'static str, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, tokio_postgres::Error>>,
{
    match tokio::time::timeout(DB_TIMEOUT, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(StoreError::Query { op, source }),
        Err(_) => Err(StoreError::Timeout {
            op,
            timeout: DB_TIMEOUT,
        }),
    }
}

fn parse_field<T: FromStr<Err = String>>(
    op: &'static str,
    raw: &str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|reason| StoreError::Decode { op, reason })
}

fn row_to_flow(op: &'static str, row: &Row) -> Result<Flow, StoreError> {
    Ok(Flow {
        id: row.get("id"),
        name: row.get("name"),
        status: parse_field(op, row.get::<_, &str>("status"))?,
        model_provider: row.get("model_provider"),
        model: row.get("model"),
        container_id: row.get("container_id"),
        container_image: row.get("container_image"),
        created_at: row.get("created_at"),
    })
}

fn row_to_task(op: &'static str, row: &Row) -> Result<Task, StoreError> {
    Ok(Task {
        id: row.get("id"),
        flow_id: row.get("flow_id"),
        task_type: parse_field(op, row.get::<_, &str>("type"))?,
        status: parse_field(op, row.get::<_, &str>("status"))?,
        message: row.get("message"),
        args: row.get("args"),
        results: row.get("results"),
        tool_call_id: row.get("tool_call_id"),
        created_at: row.get("created_at"),
    })
}

fn row_to_log(op: &'static str, row: &Row) -> Result<TerminalLog, StoreError> {
    Ok(TerminalLog {
        id: row.get("id"),
        flow_id: row.get("flow_id"),
        log_type: parse_field(op, row.get::<_, &str>("type"))?,
        message: row.get("message"),
        created_at: row.get("created_at"),
    })
}

fn row_to_container(op: &'static str, row: &Row) -> Result<ContainerRecord, StoreError> {
    Ok(ContainerRecord {
        id: row.get("id"),
        name: row.get("name"),
        image: row.get("image"),
        local_id: row.get("local_id"),
        status: parse_field(op, row.get::<_, &str>("status"))?,
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl Storage for Store {
    async fn create_flow(&self, provider: &str, model: &str) -> Result<Flow, StoreError> {
        const OP: &str = "create_flow";
        let _writer = self.write_lock.lock().await;
        let client = self.client(OP).await?;
        let row = deadline(
            OP,
            client.query_one(
                "INSERT INTO flows (model_provider, model) VALUES ($1, $2) RETURNING *",
                &[&provider, &model],
            ),
        )
        .await?;
        row_to_flow(OP, &row)
    }

    async fn read_flow(&self, id: i64) -> Result<Flow, StoreError> {
        const OP: &str = "read_flow";
        let client = self.client(OP).await?;
        let row = deadline(OP, client.query_opt("SELECT * FROM flows WHERE id = $1", &[&id]))
            .await?
            .ok_or(StoreError::NotFound { entity: "flow", id })?;
        row_to_flow(OP, &row)
    }

    async fn read_all_flows(&self) -> Result<Vec<Flow>, StoreError> {
        const OP: &str = "read_all_flows";
        let client = self.client(OP).await?;
        let rows = deadline(OP, client.query("SELECT * FROM flows ORDER BY id", &[])).await?;
        rows.iter().map(|row| row_to_flow(OP, row)).collect()
    }

    async fn update_flow_status(&self, id: i64, status: FlowStatus) -> Result<Flow, StoreError> {
        const OP: &str = "update_flow_status";
        let _writer = self.write_lock.lock().await;
        let client = self.client(OP).await?;
        let row = deadline(
            OP,
            client.query_opt(
                "UPDATE flows SET status = $2 WHERE id = $1 RETURNING *",
                &[&id, &status.as_str()],
            ),
        )
        .await?
        .ok_or(StoreError::NotFound { entity: "flow", id })?;
        row_to_flow(OP, &row)
    }

    async fn update_flow_name(&self, id: i64, name: &str) -> Result<Flow, StoreError> {
        const OP: &str = "update_flow_name";
        let _writer = self.write_lock.lock().await;
        let client = self.client(OP).await?;
        let row = deadline(
            OP,
            client.query_opt(
                "UPDATE flows SET name = $2 WHERE id = $1 RETURNING *",
                &[&id, &name],
            ),
        )
        .await?
        .ok_or(StoreError::NotFound { entity: "flow", id })?;
        row_to_flow(OP, &row)
    }

    async fn update_flow_container(
        &self,
        id: i64,
        container_id: i64,
        image: &str,
    ) -> Result<Flow, StoreError> {
        const OP: &str = "update_flow_container";
        let _writer = self.write_lock.lock().await;
        let client = self.client(OP).await?;
        let row = deadline(
            OP,
            client.query_opt(
                "UPDATE flows SET container_id = $2, container_image = $3 \
                 WHERE id = $1 RETURNING *",
                &[&id, &container_id, &image],
            ),
        )
        .await?
        .ok_or(StoreError::NotFound { entity: "flow", id })?;
        row_to_flow(OP, &row)
    }

    async fn create_task(&self, task: NewTask) -> Result<Task, StoreError> {
        const OP: &str = "create_task";
        let _writer = self.write_lock.lock().await;
        let client = self.client(OP).await?;
        let row = deadline(
            OP,
            client.query_one(
                "INSERT INTO tasks (flow_id, type, status, message, args, tool_call_id) \
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
                &[
                    &task.flow_id,
                    &task.task_type.as_str(),
                    &task.status.as_str(),
                    &task.message,
                    &task.args,
                    &task.tool_call_id,
                ],
            ),
        )
        .await?;
        row_to_task(OP, &row)
    }

    async fn read_tasks_by_flow(&self, flow_id: i64) -> Result<Vec<Task>, StoreError> {
        const OP: &str = "read_tasks_by_flow";
        let client = self.client(OP).await?;
        let rows = deadline(
            OP,
            client.query(
                "SELECT * FROM tasks WHERE flow_id = $1 ORDER BY id",
                &[&flow_id],
            ),
        )
        .await?;
        rows.iter().map(|row| row_to_task(OP, row)).collect()
    }

    async fn update_task_status(&self, id: i64, status: TaskStatus) -> Result<Task, StoreError> {
        const OP: &str = "update_task_status";
        let _writer = self.write_lock.lock().await;
        let client = self.client(OP).await?;
        let row = deadline(
            OP,
            client.query_opt(
                "UPDATE tasks SET status = $2 WHERE id = $1 RETURNING *",
                &[&id, &status.as_str()],
            ),
        )
        .await?
        .ok_or(StoreError::NotFound { entity: "task", id })?;
        row_to_task(OP, &row)
    }

    async fn update_task_results(&self, id: i64, results: &str) -> Result<Task, StoreError> {
        const OP: &str = "update_task_results";
        let _writer = self.write_lock.lock().await;
        let client = self.client(OP).await?;
        let row = deadline(
            OP,
            client.query_opt(
                "UPDATE tasks SET results = $2 WHERE id = $1 RETURNING *",
                &[&id, &results],
            ),
        )
        .await?
        .ok_or(StoreError::NotFound { entity: "task", id })?;
        row_to_task(OP, &row)
    }

    async fn update_task_tool_call_id(
        &self,
        id: i64,
        tool_call_id: &str,
    ) -> Result<Task, StoreError> {
        const OP: &str = "update_task_tool_call_id";
        let _writer = self.write_lock.lock().await;
        let client = self.client(OP).await?;
        let row = deadline(
            OP,
            client.query_opt(
                "UPDATE tasks SET tool_call_id = $2 WHERE id = $1 RETURNING *",
                &[&id, &tool_call_id],
            ),
        )
        .await?
        .ok_or(StoreError::NotFound { entity: "task", id })?;
        row_to_task(OP, &row)
    }

    async fn create_log(
        &self,
        flow_id: i64,
        log_type: LogType,
        message: &str,
    ) -> Result<TerminalLog, StoreError> {
        const OP: &str = "create_log";
        let _writer = self.write_lock.lock().await;
        let client = self.client(OP).await?;
        let row = deadline(
            OP,
            client.query_one(
                "INSERT INTO terminal_logs (flow_id, type, message) \
                 VALUES ($1, $2, $3) RETURNING *",
                &[&flow_id, &log_type.as_str(), &message],
            ),
        )
        .await?;
        row_to_log(OP, &row)
    }

    async fn logs_by_flow(&self, flow_id: i64) -> Result<Vec<TerminalLog>, StoreError> {
        const OP: &str = "logs_by_flow";
        let client = self.client(OP).await?;
        let rows = deadline(
            OP,
            client.query(
                "SELECT * FROM terminal_logs WHERE flow_id = $1 ORDER BY id",
                &[&flow_id],
            ),
        )
        .await?;
        rows.iter().map(|row| row_to_log(OP, row)).collect()
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
    ) -> Result<ContainerRecord, StoreError> {
        const OP: &str = "create_container";
        let _writer = self.write_lock.lock().await;
        let client = self.client(OP).await?;
        let row = deadline(
            OP,
            client.query_one(
                "INSERT INTO containers (name, image, status) \
                 VALUES ($1, $2, $3) RETURNING *",
                &[&name, &image, &ContainerStatus::Starting.as_str()],
            ),
        )
        .await?;
        row_to_container(OP, &row)
    }

    async fn update_container_status(
        &self,
        id: i64,
        status: ContainerStatus,
    ) -> Result<(), StoreError> {
        const OP: &str = "update_container_status";
        let _writer = self.write_lock.lock().await;
        let client = self.client(OP).await?;
        let updated = deadline(
            OP,
            client.execute(
                "UPDATE containers SET status = $2 WHERE id = $1",
                &[&id, &status.as_str()],
            ),
        )
        .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "container",
                id,
            });
        }
        Ok(())
    }

    async fn update_container_local_id(&self, id: i64, local_id: &str) -> Result<(), StoreError> {
        const OP: &str = "update_container_local_id";
        let _writer = self.write_lock.lock().await;
        let client = self.client(OP).await?;
        let updated = deadline(
            OP,
            client.execute(
                "UPDATE containers SET local_id = $2 WHERE id = $1",
                &[&id, &local_id],
            ),
        )
        .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "container",
                id,
            });
        }
        Ok(())
    }

    async fn running_containers(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        const OP: &str = "running_containers";
        let client = self.client(OP).await?;
        let rows = deadline(
            OP,
            client.query(
                "SELECT * FROM containers WHERE status = $1 ORDER BY id",
                &[&ContainerStatus::Running.as_str()],
            ),
        )
        .await?;
        rows.iter().map(|row| row_to_container(OP, row)).collect()
    }
}
