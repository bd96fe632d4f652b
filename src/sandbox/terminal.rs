//! Command execution and file streaming inside a flow's sandbox.
//!
//! Every exec writes one `input` log (the command) and one `output` log
//! (the captured text); file writes log the content and a confirmation.
//! Logs are sanitized, persisted, and broadcast in one step.

use bollard::container::UploadToContainerOptions;
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures::StreamExt;

use crate::db::{LogType, TerminalLog};
use crate::error::{SandboxError, StoreError};
use crate::hub::LogEvent;
use crate::safety;

use super::SandboxManager;

/// Substituted when a command produces no output, so the model never sees
/// an empty tool result.
pub const EMPTY_OUTPUT_SENTINEL: &str = "Command executed successfully";

const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_BLUE: &str = "\x1b[34m";
const ANSI_RESET: &str = "\x1b[0m";

/// Name of a flow's sandbox container.
pub fn terminal_name(flow_id: i64) -> String {
    format!("skiff-terminal-{flow_id}")
}

/// Name of the shared browser container.
pub fn browser_name() -> &'static str {
    "skiff-browser"
}

/// Frame a command the way the terminal renders user input.
pub fn format_terminal_input(text: &str) -> String {
    format!("$ {ANSI_YELLOW}{text}{ANSI_RESET}\r\n")
}

/// Frame an engine status line.
pub fn format_terminal_system(text: &str) -> String {
    format!("{ANSI_BLUE}{text}{ANSI_RESET}\r\n")
}

/// Package `content` as a single-entry tar archive named after the
/// destination's basename, ready to stream into the destination directory.
fn build_file_archive(path: &str, content: &str) -> Result<Vec<u8>, std::io::Error> {
    let filename = std::path::Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());

    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o600);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, filename, content.as_bytes())?;
    builder.into_inner()
}

impl SandboxManager {
    /// Persist a terminal log and broadcast it, rendered for the subscriber
    /// stream. The message is redacted before it leaves the process.
    pub async fn append_terminal_log(
        &self,
        flow_id: i64,
        log_type: LogType,
        message: &str,
    ) -> Result<TerminalLog, StoreError> {
        let sanitized = safety::sanitize_log_message(message);
        let log = self.store().create_log(flow_id, log_type, &sanitized).await?;

        let text = match log_type {
            LogType::Input => format_terminal_input(&sanitized),
            LogType::System => format_terminal_system(&sanitized),
            LogType::Output => sanitized,
        };
        self.hub()
            .broadcast_terminal_log(flow_id, LogEvent { id: log.id, text });

        Ok(log)
    }

    /// Run `sh -c <command>` in the flow's sandbox and return the merged
    /// output. The full output is collected in memory; nothing streams to
    /// the caller.
    pub async fn exec(&self, flow_id: i64, command: &str) -> Result<String, SandboxError> {
        let container = self.ensure_flow_container(flow_id).await?;

        self.append_terminal_log(flow_id, LogType::Input, command)
            .await?;

        let exec = self
            .docker()
            .create_exec(
                &container,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-c", command]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|source| SandboxError::Runtime {
                op: "create_exec",
                container_id: container.clone(),
                source,
            })?;

        let mut collected = Vec::new();
        match self
            .docker()
            .start_exec(&exec.id, None)
            .await
            .map_err(|source| SandboxError::Runtime {
                op: "start_exec",
                container_id: container.clone(),
                source,
            })? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    let chunk = chunk.map_err(|source| SandboxError::Runtime {
                        op: "read_exec_output",
                        container_id: container.clone(),
                        source,
                    })?;
                    collected.extend_from_slice(&chunk.into_bytes());
                }
            }
            StartExecResults::Detached => {}
        }

        // Wait for the exec process to settle before reporting.
        self.docker()
            .inspect_exec(&exec.id)
            .await
            .map_err(|source| SandboxError::Runtime {
                op: "inspect_exec",
                container_id: container.clone(),
                source,
            })?;

        let output = String::from_utf8_lossy(&collected).into_owned();

        self.append_terminal_log(flow_id, LogType::Output, &output)
            .await?;

        if output.is_empty() {
            Ok(EMPTY_OUTPUT_SENTINEL.to_string())
        } else {
            Ok(output)
        }
    }

    /// Write `content` to `path` inside the flow's sandbox by streaming a
    /// single-entry tar archive into the destination directory.
    pub async fn write_file(
        &self,
        flow_id: i64,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let container = self.ensure_flow_container(flow_id).await?;

        self.append_terminal_log(flow_id, LogType::Input, content)
            .await?;

        let archive = build_file_archive(path, content).map_err(|source| SandboxError::Archive {
            path: path.to_string(),
            source,
        })?;

        let directory = std::path::Path::new(path)
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());

        self.docker()
            .upload_to_container(
                &container,
                Some(UploadToContainerOptions {
                    path: directory,
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|source| SandboxError::Runtime {
                op: "upload_to_container",
                container_id: container.clone(),
                source,
            })?;

        self.append_terminal_log(flow_id, LogType::Output, &format!("Wrote to {path}"))
            .await?;

        Ok(())
    }

    /// Resolve the flow's container name and require it to be running.
    async fn ensure_flow_container(&self, flow_id: i64) -> Result<String, SandboxError> {
        let name = terminal_name(flow_id);
        if !self.is_running(&name).await? {
            return Err(SandboxError::NotRunning { flow_id });
        }
        Ok(name)
    }
}
