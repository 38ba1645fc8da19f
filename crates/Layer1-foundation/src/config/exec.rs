//! Execution limits

use crate::shell::ShellType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 실행 코어 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecConfig {
    /// 요청에 타임아웃이 없을 때 사용하는 값 (ms)
    pub default_timeout_ms: u64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,

    /// 명령어 최대 길이 (문자 수)
    pub max_command_length: usize,

    /// task id 최대 길이
    pub max_task_id_length: usize,

    /// 동시에 등록될 수 있는 백그라운드 task 수
    pub max_background_tasks: usize,

    /// 종료 시 출력 drain 대기 상한 (ms)
    pub drain_timeout_ms: u64,

    /// 실행 쉘 (None이면 자동 감지)
    pub shell: Option<ShellType>,

    /// 명령어 보안 검증 활성화
    pub validation: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            min_timeout_ms: 1_000,
            max_timeout_ms: 600_000,
            max_command_length: 10_000,
            max_task_id_length: 100,
            max_background_tasks: 50,
            drain_timeout_ms: 5_000,
            shell: None,
            validation: true,
        }
    }
}

impl ExecConfig {
    /// 제한값 일관성 검사
    pub fn validate(&self) -> Result<()> {
        if self.min_timeout_ms == 0 {
            return Err(Error::Config("minTimeoutMs must be positive".into()));
        }
        if self.min_timeout_ms > self.max_timeout_ms {
            return Err(Error::Config(format!(
                "minTimeoutMs ({}) exceeds maxTimeoutMs ({})",
                self.min_timeout_ms, self.max_timeout_ms
            )));
        }
        if !(self.min_timeout_ms..=self.max_timeout_ms).contains(&self.default_timeout_ms) {
            return Err(Error::Config(format!(
                "defaultTimeoutMs ({}) outside {}..={}",
                self.default_timeout_ms, self.min_timeout_ms, self.max_timeout_ms
            )));
        }
        if self.max_command_length == 0 || self.max_task_id_length == 0 {
            return Err(Error::Config("length limits must be positive".into()));
        }
        if self.max_background_tasks == 0 {
            return Err(Error::Config("maxBackgroundTasks must be positive".into()));
        }
        Ok(())
    }

    /// 설정 파일 한 계층을 덮어쓰기
    pub fn apply(&mut self, settings: ExecSettings) {
        if let Some(v) = settings.default_timeout_ms {
            self.default_timeout_ms = v;
        }
        if let Some(v) = settings.min_timeout_ms {
            self.min_timeout_ms = v;
        }
        if let Some(v) = settings.max_timeout_ms {
            self.max_timeout_ms = v;
        }
        if let Some(v) = settings.max_command_length {
            self.max_command_length = v;
        }
        if let Some(v) = settings.max_task_id_length {
            self.max_task_id_length = v;
        }
        if let Some(v) = settings.max_background_tasks {
            self.max_background_tasks = v;
        }
        if let Some(v) = settings.drain_timeout_ms {
            self.drain_timeout_ms = v;
        }
        if settings.shell.is_some() {
            self.shell = settings.shell;
        }
        if let Some(v) = settings.validation {
            self.validation = v;
        }
    }

    /// 설정된 쉘, 없으면 감지
    pub fn resolve_shell(&self) -> ShellType {
        self.shell.unwrap_or_else(ShellType::detect)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// settings.json 한 계층 (모든 필드 선택)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecSettings {
    pub default_timeout_ms: Option<u64>,
    pub min_timeout_ms: Option<u64>,
    pub max_timeout_ms: Option<u64>,
    pub max_command_length: Option<usize>,
    pub max_task_id_length: Option<usize>,
    pub max_background_tasks: Option<usize>,
    pub drain_timeout_ms: Option<u64>,
    pub shell: Option<ShellType>,
    pub validation: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ExecConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_background_tasks, 50);
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let config = ExecConfig {
            min_timeout_ms: 5_000,
            max_timeout_ms: 1_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_apply_overrides_only_present_fields() {
        let mut config = ExecConfig::default();
        config.apply(ExecSettings {
            max_background_tasks: Some(3),
            shell: Some(ShellType::Sh),
            ..Default::default()
        });
        assert_eq!(config.max_background_tasks, 3);
        assert_eq!(config.shell, Some(ShellType::Sh));
        assert_eq!(config.max_timeout_ms, 600_000);
    }
}
