//! The effect of each task type.
//!
//! Handlers run inside a flow's worker and report errors back to it; the
//! worker owns status transitions and broadcasts. Validation happens here,
//! before any external effect: `code` paths and `browser` URLs go through
//! the safety filter, `terminal` commands do not (the sandbox is their
//! boundary).

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::db::{LogType, Task, TaskType};
use crate::error::Error;
use crate::hub::{BrowserEvent, FlowEvent, TerminalInfo};
use crate::llm::Provider;
use crate::planner;
use crate::planner::catalog::{BrowserAction, BrowserArgs, CodeAction, CodeArgs, TerminalArgs};
use crate::safety;
use crate::sandbox::{DEFAULT_IMAGE, SpawnSpec, terminal_name};

use super::Deps;

/// Root directory `code` tasks may touch inside the sandbox.
pub const CODE_ROOT: &str = "/app";

/// Whether the dispatcher asks the planner for a follow-up task after the
/// handler succeeds. `ask` awaits the user; `done` is terminal.
pub fn needs_next(task_type: TaskType) -> bool {
    match task_type {
        TaskType::Input | TaskType::Terminal | TaskType::Code | TaskType::Browser => true,
        TaskType::Ask | TaskType::Done => false,
    }
}

/// Dispatch a task to its handler.
pub(super) async fn handle(
    deps: &Deps,
    provider: &Arc<dyn Provider>,
    task: &Task,
) -> Result<(), Error> {
    match task.task_type {
        TaskType::Input => handle_input(deps, provider, task).await,
        TaskType::Ask => Ok(()), // the worker advances the task; nothing else to do
        TaskType::Terminal => handle_terminal(deps, task).await,
        TaskType::Code => handle_code(deps, task).await,
        TaskType::Browser => handle_browser(deps, task).await,
        TaskType::Done => handle_done(deps, task).await,
    }
}

fn parse_args<T: DeserializeOwned>(task: &Task) -> Result<T, Error> {
    serde_json::from_str(&task.args)
        .map_err(|e| Error::InvalidInput(format!("failed to parse task args: {e}")))
}

/// First input of a flow: derive a name and an image, provision the
/// sandbox, and narrate the progress. Later inputs only extend the
/// history the planner sees.
async fn handle_input(
    deps: &Deps,
    provider: &Arc<dyn Provider>,
    task: &Task,
) -> Result<(), Error> {
    let flow_id = task.flow_id;
    let tasks = deps.store.read_tasks_by_flow(flow_id).await?;
    if tasks.len() != 1 {
        return Ok(());
    }

    let summary = provider
        .summary(&task.message, planner::SUMMARY_WORD_COUNT)
        .await?;

    let proposed_image = provider.docker_image_name(&task.message).await?;
    let image = match safety::validate_docker_image(&proposed_image, deps.allow_any_image) {
        Ok(()) => proposed_image,
        Err(e) => {
            tracing::warn!(flow_id, image = %proposed_image, error = %e,
                "proposed image rejected, using default");
            deps.sandbox
                .append_terminal_log(
                    flow_id,
                    LogType::System,
                    &format!("Image {proposed_image} is not allowed, using {DEFAULT_IMAGE} instead."),
                )
                .await
                .map_err(Error::Store)?;
            DEFAULT_IMAGE.to_string()
        }
    };

    let flow = deps.store.update_flow_name(flow_id, &summary).await?;
    deps.hub.broadcast_flow_updated(
        flow_id,
        FlowEvent {
            id: flow_id,
            name: summary.clone(),
            status: flow.status,
            terminal: TerminalInfo {
                container_name: image.clone(),
                connected: false,
            },
        },
    );

    deps.sandbox
        .append_terminal_log(
            flow_id,
            LogType::System,
            &format!("Initializing the docker image {image}..."),
        )
        .await
        .map_err(Error::Store)?;

    let record_id = deps
        .sandbox
        .spawn(
            &terminal_name(flow_id),
            SpawnSpec {
                image: image.clone(),
                cmd: vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()],
                port: None,
            },
        )
        .await?;

    deps.hub.broadcast_flow_updated(
        flow_id,
        FlowEvent {
            id: flow_id,
            name: summary,
            status: flow.status,
            terminal: TerminalInfo {
                container_name: image.clone(),
                connected: true,
            },
        },
    );

    deps.store
        .update_flow_container(flow_id, record_id, &image)
        .await?;

    deps.sandbox
        .append_terminal_log(
            flow_id,
            LogType::System,
            "Container initialized. Ready to execute commands.",
        )
        .await
        .map_err(Error::Store)?;

    Ok(())
}

async fn handle_terminal(deps: &Deps, task: &Task) -> Result<(), Error> {
    let args: TerminalArgs = parse_args(task)?;
    let results = deps.sandbox.exec(task.flow_id, &args.input).await?;
    deps.store.update_task_results(task.id, &results).await?;
    Ok(())
}

async fn handle_code(deps: &Deps, task: &Task) -> Result<(), Error> {
    let args: CodeArgs = parse_args(task)?;
    safety::validate_path(&args.path, CODE_ROOT)?;

    let results = match args.action {
        CodeAction::ReadFile => {
            // Quoted path to keep the shell from interpreting it.
            let command = format!("cat '{}'", args.path);
            deps.sandbox.exec(task.flow_id, &command).await?
        }
        CodeAction::UpdateFile => {
            deps.sandbox
                .write_file(task.flow_id, &args.path, &args.content)
                .await?;
            "File updated".to_string()
        }
    };

    deps.store.update_task_results(task.id, &results).await?;
    Ok(())
}

async fn handle_browser(deps: &Deps, task: &Task) -> Result<(), Error> {
    let args: BrowserArgs = parse_args(task)?;
    safety::validate_url(&args.url)?;

    let (content, screenshot) = match args.action {
        BrowserAction::Read => deps.browser.content(&args.url).await?,
        BrowserAction::Url => deps.browser.urls(&args.url).await?,
    };

    tracing::debug!(url = %args.url, action = ?args.action, screenshot, "browser action completed");

    deps.store.update_task_results(task.id, &content).await?;

    deps.hub.broadcast_browser_updated(
        task.flow_id,
        BrowserEvent {
            url: args.url,
            screenshot_url: format!("{}/browser/{screenshot}", deps.base_url),
        },
    );

    Ok(())
}

async fn handle_done(deps: &Deps, task: &Task) -> Result<(), Error> {
    let flow = deps
        .store
        .update_flow_status(task.flow_id, crate::db::FlowStatus::Finished)
        .await?;

    deps.hub.broadcast_flow_updated(
        task.flow_id,
        FlowEvent {
            id: flow.id,
            name: flow.name,
            status: flow.status,
            terminal: TerminalInfo::default(),
        },
    );

    Ok(())
}
