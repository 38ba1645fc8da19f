//! Execution Orchestrator - the three operations exposed to the transport
//!
//! - `execute`: validate, then run in the foreground or as a background task.
//!   A foreground run that outlives its timeout is not killed; it is handed
//!   to the registry and a finishing worker keeps tracking it.
//! - `poll_output`: current output (optionally line-filtered) and status.
//! - `terminate`: kill the process tree and remove the record.

use crate::executor::tree::{self, ProcessTreeController};
use crate::executor::{
    platform_controller, CommandValidator, LocalLauncher, ProcessExit, ValidationResult,
};
use crate::output::OutputBuffer;
use crate::registry::{BackgroundTaskRegistry, TerminationClaim};
use crate::state::TaskStatus;
use crate::task::{Task, TaskId, TaskResources, TaskSnapshot, Terminal, ABNORMAL_EXIT_CODE};
use chrono::{DateTime, Utc};
use forgeshell_foundation::{Error, ExecConfig, Result, ShellType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Extra wait on top of the drain timeout for the finishing worker
const FINISH_GRACE: Duration = Duration::from_secs(1);

// ============================================================================
// Requests / outcomes
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub command: String,

    /// Wait budget in milliseconds (foreground only)
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub run_in_background: bool,

    #[serde(default)]
    pub description: Option<String>,
}

impl ExecuteRequest {
    pub fn foreground(command: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            command: command.into(),
            timeout_ms: Some(timeout_ms),
            ..Default::default()
        }
    }

    pub fn background(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            run_in_background: true,
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOutcome {
    pub output: String,
    pub exit_code: i32,
    pub killed: bool,
    /// Present only for background and escalated runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOutcome {
    pub task_id: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateOutcome {
    pub message: String,
    pub task_id: String,
    /// State the task was in when its record was removed
    pub status: TaskStatus,
    /// Teardown problems; they do not change the outcome
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub snapshot: TaskSnapshot,
}

// ============================================================================
// ExecutionOrchestrator
// ============================================================================

pub struct ExecutionOrchestrator {
    config: ExecConfig,
    validator: Option<CommandValidator>,
    launcher: LocalLauncher,
    registry: Arc<BackgroundTaskRegistry>,
}

impl ExecutionOrchestrator {
    /// Build with the configured (or detected) shell and the platform tree controller
    pub fn new(config: ExecConfig) -> Result<Self> {
        config.validate()?;
        let shell = config.resolve_shell();
        Ok(Self::with_parts(config, shell, platform_controller()))
    }

    pub fn with_parts(
        config: ExecConfig,
        shell: ShellType,
        controller: Arc<dyn ProcessTreeController>,
    ) -> Self {
        info!(
            "Execution core ready: shell={}, tree control={}, capacity={}",
            shell,
            controller.name(),
            config.max_background_tasks
        );
        Self {
            validator: config.validation.then(|| CommandValidator::for_shell(shell)),
            launcher: LocalLauncher::new(shell, controller, config.drain_timeout()),
            registry: Arc::new(BackgroundTaskRegistry::new(config.max_background_tasks)),
            config,
        }
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BackgroundTaskRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------------
    // Boundary validation
    // ------------------------------------------------------------------------

    fn validate_command(&self, command: &str) -> Result<()> {
        if command.trim().is_empty() {
            return Err(Error::Validation("command is required".into()));
        }

        let length = command.chars().count();
        if length > self.config.max_command_length {
            return Err(Error::Validation(format!(
                "command too long (max {} characters), got: {}",
                self.config.max_command_length, length
            )));
        }

        if let Some(validator) = &self.validator {
            if let ValidationResult::Rejected(violation) = validator.validate(command) {
                return Err(Error::Validation(violation.to_string()));
            }
        }
        Ok(())
    }

    fn validate_timeout(&self, timeout_ms: u64) -> Result<Duration> {
        let (min, max) = (self.config.min_timeout_ms, self.config.max_timeout_ms);
        if !(min..=max).contains(&timeout_ms) {
            return Err(Error::Validation(format!(
                "timeout must be between {} and {} milliseconds, got: {}",
                min, max, timeout_ms
            )));
        }
        Ok(Duration::from_millis(timeout_ms))
    }

    fn parse_task_id(&self, raw: &str) -> Result<TaskId> {
        if raw.is_empty() {
            return Err(Error::Validation("task id is required".into()));
        }

        let length = raw.chars().count();
        if length > self.config.max_task_id_length {
            return Err(Error::Validation(format!(
                "task id too long (max {} characters), got: {}",
                self.config.max_task_id_length, length
            )));
        }

        TaskId::parse(raw).ok_or_else(|| Error::task_not_found(raw))
    }

    // ------------------------------------------------------------------------
    // Execute
    // ------------------------------------------------------------------------

    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteOutcome> {
        self.validate_command(&request.command)?;
        let timeout =
            self.validate_timeout(request.timeout_ms.unwrap_or(self.config.default_timeout_ms))?;

        if request.run_in_background {
            self.start_background(request).await
        } else {
            self.run_foreground(request, timeout).await
        }
    }

    async fn start_background(&self, request: ExecuteRequest) -> Result<ExecuteOutcome> {
        let buffer = OutputBuffer::create()?;
        let id = TaskId::new();
        let task = Task::running(
            id,
            request.command.clone(),
            request.description.clone(),
            Arc::clone(&buffer),
        );

        if let Err(e) = self.registry.create(task).await {
            discard_buffer(&buffer).await;
            return Err(e);
        }

        let process = match self.launcher.launch(&request.command, Arc::clone(&buffer)) {
            Ok(process) => process,
            Err(e) => {
                warn!("Background task {} failed to start: {}", id, e);
                self.registry.remove(id).await;
                discard_buffer(&buffer).await;
                return Err(e);
            }
        };

        let (finished_tx, finished_rx) = watch::channel(false);
        let resources = TaskResources {
            pid: process.pid,
            cancel: process.cancel.clone(),
            tree: process.tree.clone(),
            finished: finished_rx,
        };

        tokio::spawn(finish_task(
            Arc::clone(&self.registry),
            id,
            buffer,
            process.exit,
            finished_tx,
        ));

        match self.registry.attach(id, resources.clone()).await {
            Ok(true) => {}
            // Claimed by a termination request before the process was attached
            Ok(false) | Err(Error::NotFound(_)) => {
                debug!("Task {} was terminated during launch", id);
                tree::terminate(
                    self.launcher.controller().as_ref(),
                    resources.tree.as_deref(),
                    resources.pid,
                    &resources.cancel,
                )
                .await;
            }
            // Already finished
            Err(e) => debug!("Attach skipped for {}: {}", id, e),
        }

        Ok(ExecuteOutcome {
            output: format!("Background task started with ID: {}", id),
            exit_code: 0,
            killed: false,
            task_id: Some(id.to_string()),
        })
    }

    async fn run_foreground(
        &self,
        request: ExecuteRequest,
        timeout: Duration,
    ) -> Result<ExecuteOutcome> {
        let label = request.description.as_deref().unwrap_or(&request.command);
        let buffer = OutputBuffer::create()?;
        let start_time = Utc::now();

        let mut process = match self.launcher.launch(&request.command, Arc::clone(&buffer)) {
            Ok(process) => process,
            Err(e) => {
                discard_buffer(&buffer).await;
                return Err(e);
            }
        };

        let exit = match tokio::time::timeout(timeout, &mut process.exit).await {
            Ok(exit) => exit,
            Err(_) => {
                info!("Command exceeded {:?}, escalating: {}", timeout, label);
                let id = TaskId::new();
                let (finished_tx, finished_rx) = watch::channel(false);
                let task = Task::running(
                    id,
                    request.command.clone(),
                    request.description.clone(),
                    Arc::clone(&buffer),
                )
                .with_start_time(start_time)
                .with_resources(TaskResources {
                    pid: process.pid,
                    cancel: process.cancel.clone(),
                    tree: process.tree.clone(),
                    finished: finished_rx,
                });

                self.registry.insert_escalated(task).await;
                let partial = buffer.read_all().await.unwrap_or_default();
                tokio::spawn(finish_task(
                    Arc::clone(&self.registry),
                    id,
                    buffer,
                    process.exit,
                    finished_tx,
                ));

                return Ok(ExecuteOutcome {
                    output: escalation_message(timeout, id, &partial),
                    exit_code: 0,
                    killed: false,
                    task_id: Some(id.to_string()),
                });
            }
        };

        let output = buffer.read_all().await;
        discard_buffer(&buffer).await;

        let exit = exit.map_err(|_| Error::Internal("process supervisor stopped".into()))?;
        if let Some(error) = exit.wait_error {
            return Err(Error::Runtime(format!("Failed to wait for process: {}", error)));
        }
        let output =
            output.map_err(|e| Error::Runtime(format!("Failed to read output file: {}", e)))?;

        debug!("Foreground command finished (exit {:?}): {}", exit.code, label);
        Ok(ExecuteOutcome {
            output,
            exit_code: exit.code.unwrap_or(ABNORMAL_EXIT_CODE),
            killed: exit.was_killed(),
            task_id: None,
        })
    }

    // ------------------------------------------------------------------------
    // PollOutput
    // ------------------------------------------------------------------------

    pub async fn poll_output(&self, task_id: &str, filter: Option<&str>) -> Result<PollOutcome> {
        let id = self.parse_task_id(task_id)?;
        let filter = compile_filter(filter)?;

        let mut snapshot = self.registry.snapshot(id).await?;
        if let Some(buffer) = snapshot.buffer.take() {
            match buffer.read_all().await {
                Ok(text) => snapshot.output = text,
                Err(e) => {
                    // 읽는 사이에 종료되어 buffer가 삭제됨
                    debug!("Buffer for {} unavailable ({}), re-reading record", id, e);
                    snapshot = self.registry.snapshot(id).await?;
                }
            }
        }

        let output = match &filter {
            Some(re) => filter_lines(&snapshot.output, re),
            None => snapshot.output,
        };

        Ok(PollOutcome {
            task_id: id.to_string(),
            command: snapshot.command,
            description: snapshot.description,
            status: snapshot.status,
            output,
            exit_code: snapshot.exit_code,
            error_message: snapshot.error_message,
            start_time: snapshot.start_time,
            finished_at: snapshot.finished_at,
        })
    }

    // ------------------------------------------------------------------------
    // Terminate
    // ------------------------------------------------------------------------

    pub async fn terminate(&self, task_id: &str) -> Result<TerminateOutcome> {
        let id = self.parse_task_id(task_id)?;
        let mut warnings = Vec::new();

        let snapshot = match self.registry.claim_termination(id).await? {
            TerminationClaim::Finished(snapshot) => {
                info!("Task {} had already finished ({}), record removed", id, snapshot.status);
                snapshot
            }
            TerminationClaim::Running { snapshot, resources } => {
                if let Some(resources) = resources {
                    let report = tree::terminate(
                        self.launcher.controller().as_ref(),
                        resources.tree.as_deref(),
                        resources.pid,
                        &resources.cancel,
                    )
                    .await;
                    info!("Terminated task {} via {:?}", id, report.tier);
                    warnings.extend(report.warnings);

                    let mut finished = resources.finished.clone();
                    let wait = self.config.drain_timeout() + FINISH_GRACE;
                    if tokio::time::timeout(wait, finished.wait_for(|done| *done))
                        .await
                        .is_err()
                    {
                        warnings.push(format!("task did not finish within {:?}", wait));
                    }
                }

                match self.registry.remove(id).await {
                    Some(last) if last.status.is_terminal() => last,
                    Some(last) => force_killed(last).await,
                    None => force_killed(snapshot).await,
                }
            }
        };

        for warning in &warnings {
            warn!("Teardown of {}: {}", id, warning);
        }

        Ok(TerminateOutcome {
            message: format!("Background task {} killed successfully", id),
            task_id: id.to_string(),
            status: snapshot.status,
            warnings,
            snapshot,
        })
    }

    /// Terminate every running task (server shutdown)
    pub async fn shutdown(&self) {
        let running = self.registry.running_ids().await;
        if running.is_empty() {
            return;
        }

        info!("Terminating {} running task(s)", running.len());
        for id in running {
            if let Err(e) = self.terminate(&id.to_string()).await {
                debug!("Shutdown skip {}: {}", id, e);
            }
        }
    }
}

// ============================================================================
// Finishing worker
// ============================================================================

/// Waits for the process, then performs the task's terminal transition
async fn finish_task(
    registry: Arc<BackgroundTaskRegistry>,
    id: TaskId,
    buffer: Arc<OutputBuffer>,
    exit: oneshot::Receiver<ProcessExit>,
    finished: watch::Sender<bool>,
) {
    let terminal = match exit.await {
        Ok(exit) => classify_exit(&exit, buffer.read_all().await),
        Err(_) => Terminal::failed(
            ABNORMAL_EXIT_CODE,
            "Process supervisor stopped unexpectedly",
            buffer.read_all().await.unwrap_or_default(),
        ),
    };

    match registry.finalize_terminal(id, terminal).await {
        Ok(status) => debug!("Task {} finalized as {}", id, status),
        Err(Error::NotFound(_)) => debug!("Task {} was removed before it finished", id),
        Err(e) => warn!("Could not finalize {}: {}", id, e),
    }

    if let Err(e) = buffer.remove().await {
        warn!("Failed to delete output buffer for {}: {}", id, e);
    }
    let _ = finished.send(true);
}

fn classify_exit(exit: &ProcessExit, output: Result<String>) -> Terminal {
    let output = match output {
        Ok(output) => output,
        Err(e) => {
            warn!("Failed to read output file: {}", e);
            return Terminal::failed(
                ABNORMAL_EXIT_CODE,
                "Failed to read output file",
                String::new(),
            );
        }
    };

    if exit.cancelled {
        return Terminal::killed("Task was cancelled by user", output);
    }
    if let Some(error) = &exit.wait_error {
        return Terminal::failed(
            ABNORMAL_EXIT_CODE,
            format!("Failed to wait for process: {}", error),
            output,
        );
    }

    match exit.code {
        Some(0) => Terminal::completed(output),
        Some(code) => Terminal::failed(code, format!("exit status {}", code), output),
        None => Terminal::failed(
            ABNORMAL_EXIT_CODE,
            match exit.signal {
                Some(signal) => format!("terminated by signal {}", signal),
                None => "terminated abnormally".to_string(),
            },
            output,
        ),
    }
}

/// Killed snapshot for a record the finishing worker never finalized
async fn force_killed(mut snapshot: TaskSnapshot) -> TaskSnapshot {
    if let Some(buffer) = snapshot.buffer.take() {
        match buffer.read_all().await {
            Ok(output) => snapshot.output = output,
            Err(e) => debug!("No output left for {}: {}", snapshot.id, e),
        }
        discard_buffer(&buffer).await;
    }

    snapshot.status = TaskStatus::Killed;
    snapshot.exit_code = Some(ABNORMAL_EXIT_CODE);
    snapshot.error_message = Some("Task was killed by user request".into());
    snapshot.finished_at = Some(Utc::now());
    snapshot
}

async fn discard_buffer(buffer: &OutputBuffer) {
    if let Err(e) = buffer.remove().await {
        warn!("Failed to delete output buffer {}: {}", buffer.path().display(), e);
    }
}

fn escalation_message(timeout: Duration, id: TaskId, partial: &str) -> String {
    let mut message = format!(
        "Command exceeded timeout ({}ms), automatically converted to background task.\n\
         Task ID: {}\n\
         Use 'poll_output' with this ID to check progress, or 'terminate' to stop it.",
        timeout.as_millis(),
        id
    );
    if !partial.is_empty() {
        message.push_str("\n\nOutput so far:\n");
        message.push_str(partial);
    }
    message
}

fn compile_filter(filter: Option<&str>) -> Result<Option<Regex>> {
    match filter.filter(|f| !f.is_empty()) {
        None => Ok(None),
        Some(pattern) => Regex::new(pattern).map(Some).map_err(|e| {
            Error::Validation(format!("invalid regex filter pattern '{}': {}", pattern, e))
        }),
    }
}

fn filter_lines(output: &str, re: &Regex) -> String {
    output
        .lines()
        .filter(|line| re.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// Tests
// ============================================================================
