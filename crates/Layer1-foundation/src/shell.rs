//! Shell selection - 명령 실행에 사용할 쉘
//!
//! 서버 시작 시 한 번 결정됩니다. Windows에서는 PowerShell 7(`pwsh`)을
//! 우선 사용하고 없으면 Windows PowerShell로, 그 외에는 `bash` → `sh` 순서.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// PowerShell 출력 인코딩을 UTF-8로 고정하는 접두어
const POWERSHELL_UTF8_PREFIX: &str =
    "[Console]::OutputEncoding = [System.Text.Encoding]::UTF8; ";

/// 쉘 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellType {
    /// Bash
    Bash,
    /// POSIX sh
    Sh,
    /// PowerShell 7+
    Pwsh,
    /// Windows PowerShell 5.x
    #[serde(alias = "windowspowershell")]
    PowerShell,
}

impl ShellType {
    /// 현재 OS에서 탐색할 후보 (우선순위 순)
    pub fn candidates_for_os() -> &'static [ShellType] {
        #[cfg(target_os = "windows")]
        {
            &[ShellType::Pwsh, ShellType::PowerShell]
        }
        #[cfg(not(target_os = "windows"))]
        {
            &[ShellType::Bash, ShellType::Sh]
        }
    }

    /// PATH에서 사용 가능한 첫 번째 쉘을 선택
    ///
    /// 아무것도 찾지 못하면 OS 기본값을 그대로 사용 (실행 시 Launch 에러로 드러남).
    pub fn detect() -> Self {
        for candidate in Self::candidates_for_os() {
            if let Some(path) = candidate.locate() {
                debug!("Using shell {} at {}", candidate, path.display());
                return *candidate;
            }
        }
        Self::fallback_for_os()
    }

    fn fallback_for_os() -> Self {
        #[cfg(target_os = "windows")]
        {
            Self::PowerShell
        }
        #[cfg(not(target_os = "windows"))]
        {
            Self::Sh
        }
    }

    /// PATH 상의 실행 파일 위치
    pub fn locate(&self) -> Option<PathBuf> {
        which::which(self.executable()).ok()
    }

    /// 실행 파일 이름
    pub fn executable(&self) -> &'static str {
        match self {
            ShellType::Bash => "bash",
            ShellType::Sh => "sh",
            ShellType::Pwsh => "pwsh",
            ShellType::PowerShell => "powershell",
        }
    }

    /// 명령어 실행 인자
    pub fn exec_args(&self) -> &'static [&'static str] {
        match self {
            ShellType::Bash | ShellType::Sh => &["-c"],
            ShellType::Pwsh | ShellType::PowerShell => {
                &["-NoProfile", "-NonInteractive", "-Command"]
            }
        }
    }

    /// PowerShell 계열 여부 (검증기의 인용 규칙 선택에 사용)
    pub fn is_powershell(&self) -> bool {
        matches!(self, ShellType::Pwsh | ShellType::PowerShell)
    }

    /// 쉘에 넘길 최종 명령 문자열
    pub fn wrap_command(&self, command: &str) -> String {
        if self.is_powershell() {
            format!("{}{}", POWERSHELL_UTF8_PREFIX, command)
        } else {
            command.to_string()
        }
    }

    /// 문자열에서 파싱
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "bash" => Some(Self::Bash),
            "sh" => Some(Self::Sh),
            "pwsh" => Some(Self::Pwsh),
            "powershell" | "powershell.exe" => Some(Self::PowerShell),
            _ => None,
        }
    }
}

impl Default for ShellType {
    fn default() -> Self {
        Self::detect()
    }
}

impl std::fmt::Display for ShellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.executable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(ShellType::parse("PWSH"), Some(ShellType::Pwsh));
        assert_eq!(ShellType::parse("powershell.exe"), Some(ShellType::PowerShell));
        assert_eq!(ShellType::parse("fish"), None);
    }

    #[test]
    fn test_powershell_wrapping() {
        let wrapped = ShellType::Pwsh.wrap_command("Get-Date");
        assert!(wrapped.starts_with("[Console]::OutputEncoding"));
        assert!(wrapped.ends_with("Get-Date"));
        assert_eq!(ShellType::Bash.wrap_command("date"), "date");
    }

    #[test]
    fn test_exec_args() {
        assert_eq!(ShellType::Sh.exec_args(), &["-c"]);
        assert_eq!(ShellType::Pwsh.exec_args().last(), Some(&"-Command"));
    }

    #[cfg(unix)]
    #[test]
    fn test_detect_finds_posix_shell() {
        let shell = ShellType::detect();
        assert!(!shell.is_powershell());
    }
}
