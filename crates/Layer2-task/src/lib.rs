//! # forgeshell-task
//!
//! Command execution core for ForgeShell.
//!
//! ## Features
//!
//! - Destructive-command gate that tolerates quoted text
//! - Foreground execution that escalates to a background task on timeout
//! - Background task registry with a one-way state machine
//! - Output capture into per-task temp files, pollable while running
//! - **Process tree termination** (process groups on Unix, Job Objects on Windows)

pub mod executor;
pub mod orchestrator;
pub mod output;
pub mod registry;
pub mod state;
pub mod task;

// Executors
pub use executor::{
    platform_controller, CommandValidator, LocalLauncher, ProcessExit, ProcessTreeController,
    RuleCategory, ShellDialect, TerminationReport, TerminationTier, TreeHandle, ValidationResult,
    Violation,
};

// Orchestration
pub use orchestrator::{
    ExecuteOutcome, ExecuteRequest, ExecutionOrchestrator, PollOutcome, TerminateOutcome,
};

// Task system
pub use output::{OutputBuffer, StreamKind};
pub use registry::{BackgroundTaskRegistry, TerminationClaim};
pub use state::TaskStatus;
pub use task::{Task, TaskId, TaskResources, TaskSnapshot, Terminal, ABNORMAL_EXIT_CODE};
