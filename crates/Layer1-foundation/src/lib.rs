//! # forgeshell-foundation
//!
//! Foundation layer for ForgeShell:
//! - Error: 중앙 에러 타입
//! - Config: 실행 제한 (타임아웃, 길이, 백그라운드 용량) + 설정 파일 로더
//! - Shell: 명령 실행 쉘 선택

pub mod config;
pub mod error;
pub mod shell;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{ConfigLoader, ExecConfig, ExecSettings, CONFIG_DIR_NAME};

// ============================================================================
// Shell
// ============================================================================
pub use shell::ShellType;
