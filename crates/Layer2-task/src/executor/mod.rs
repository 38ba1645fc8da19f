//! Executors - command validation, process launch, and process-tree control

pub mod command_validator;
pub mod local;
pub mod tree;

pub use command_validator::{
    CommandValidator, RuleCategory, ShellDialect, ValidationResult, Violation,
};
pub use local::{LocalLauncher, ProcessExit, RunningProcess};
pub use tree::{
    platform_controller, terminate, ProcessTreeController, TerminationReport, TerminationTier,
    TreeHandle,
};
