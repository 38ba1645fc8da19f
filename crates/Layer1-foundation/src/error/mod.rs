//! Error types for ForgeShell
//!
//! 전송 계층은 `kind()`로 분류하고 `Display`를 그대로 메시지로 씁니다.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// ForgeShell 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    // --- 요청 거부 ---
    /// 잘못된 입력 또는 보안 게이트에 의해 거부된 명령
    #[error("{0}")]
    Validation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // --- 실행 ---
    #[error("{0}")]
    Capacity(String),

    #[error("{0}")]
    NotFound(String),

    /// 프로세스 시작 실패
    #[error("Failed to start command: {0}")]
    Launch(String),

    /// 실행 중 출력 캡처/읽기 실패
    #[error("Runtime failure: {0}")]
    Runtime(String),

    #[error("Task error: {0}")]
    Task(String),

    // --- 변환 ---
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 실행 코어는 자동 재시도를 하지 않음
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// 호출자의 요청 때문에 생긴 에러
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self.kind(),
            "validation" | "capacity" | "not_found" | "launch"
        )
    }

    /// 에러 종류 (전송 계층에서 사용하는 안정적인 이름)
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Validation(_) | Error::InvalidInput(_) => "validation",
            Error::Capacity(_) => "capacity",
            Error::NotFound(_) => "not_found",
            Error::Launch(_) => "launch",
            Error::Runtime(_) => "runtime",
            Error::Task(_) => "task",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Internal(_) => "internal",
        }
    }

    /// 백그라운드 task를 찾지 못함
    pub fn task_not_found(id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("background task not found: {}", id))
    }
}
