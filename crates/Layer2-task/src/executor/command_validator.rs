//! Command Validator - 파괴적인 명령어 차단
//!
//! 명령어를 소문자로 바꾼 뒤 미리 컴파일된 규칙과 매칭합니다.
//! 매치 시작 위치가 따옴표 문자열, PowerShell here-string, POSIX heredoc
//! 본문 안에 있으면 무시합니다 (`echo "shutdown -s"`는 허용).
//! 큰따옴표 안의 `$(...)`, 백틱 치환은 실행되므로 리터럴이 아닙니다.
//!
//! 종료 계열 규칙은 명령 위치에서만 매치합니다 (`man shutdown`은 허용).
//! 명령 연결 연산자(`;`, `|`, `&`, 줄바꿈, 백틱, `$(`) 바로 뒤의 삭제/포맷/종료
//! 명령은 첫 토큰이 아니어도 차단합니다.
//!
//! ```rust,ignore
//! let validator = CommandValidator::new(ShellDialect::Posix);
//! match validator.validate("shutdown -h now") {
//!     ValidationResult::Allowed => { /* execute */ }
//!     ValidationResult::Rejected(v) => { /* v.reason */ }
//! }
//! ```

use forgeshell_foundation::ShellType;
use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;
use tracing::warn;

// ============================================================================
// 결과 타입
// ============================================================================

/// 위반 규칙 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleCategory {
    DiskFormat,
    RecursiveDelete,
    Shutdown,
    ProtectedHive,
    EncodedExecution,
    RemotePayload,
    UserManagement,
    ForkBomb,
    /// 연결 연산자 뒤의 파괴적 명령
    ChainedDestructive,
}

/// 위반 내용
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub category: RuleCategory,
    pub reason: &'static str,
    /// 소문자 명령어 기준 매치 시작 위치 (byte)
    pub offset: usize,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "command rejected for security reasons: {}", self.reason)
    }
}

/// 검증 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Allowed,
    Rejected(Violation),
}

impl ValidationResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ValidationResult::Allowed)
    }
}

// ============================================================================
// 쉘 인용 규칙
// ============================================================================

/// 문자열 리터럴 판정에 쓰는 쉘 문법
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellDialect {
    /// 백틱 escape, `@"..."@` / `@'...'@` here-string
    PowerShell,
    /// 백슬래시 escape, `<<EOF` heredoc
    Posix,
}

impl ShellDialect {
    pub fn for_shell(shell: ShellType) -> Self {
        if shell.is_powershell() {
            Self::PowerShell
        } else {
            Self::Posix
        }
    }

    fn escape(&self) -> u8 {
        match self {
            ShellDialect::PowerShell => b'`',
            ShellDialect::Posix => b'\\',
        }
    }
}

// ============================================================================
// 규칙
// ============================================================================

struct Rule {
    category: RuleCategory,
    pattern: Regex,
    reason: &'static str,
}

struct RuleSet {
    rules: Vec<Rule>,
    chained: Option<Regex>,
}

static RULES: OnceLock<RuleSet> = OnceLock::new();

fn rules() -> &'static RuleSet {
    RULES.get_or_init(RuleSet::compile)
}

/// 명령 위치(텍스트 시작 또는 구분자 바로 뒤, 앞의 `sudo` 허용)의 명령 이름
macro_rules! at_command {
    ($name:literal) => {
        concat!(r"(?:^|[;&|\n(`{])\s*(?:sudo\s+(?:-[a-z-]+\s+)*)?", $name)
    };
}

/// (분류, 패턴, 사유). 모두 소문자 텍스트 기준.
const RULE_SOURCES: &[(RuleCategory, &str, &str)] = &[
    // 디스크 포맷
    (
        RuleCategory::DiskFormat,
        r"\bformat(?:\.com)?\s+[a-z]:",
        "disk formatting",
    ),
    (
        RuleCategory::DiskFormat,
        r"\b(?:format-volume|clear-disk|initialize-disk)\b",
        "disk formatting",
    ),
    (RuleCategory::DiskFormat, r"\b(?:fdisk|diskpart)\b", "disk partitioning"),
    (RuleCategory::DiskFormat, r"\bmkfs(?:\.[a-z0-9]+)?\b", "filesystem creation"),
    (
        RuleCategory::DiskFormat,
        r"\bdd\b[^|;&\n]*\bof=/dev/(?:sd|hd|vd|xvd|nvme|disk|mmcblk)",
        "raw disk overwrite",
    ),
    // 강제 재귀 삭제 (플래그 묶음/분리/긴 이름, 순서 무관)
    (
        RuleCategory::RecursiveDelete,
        r"\b(?:del|erase)\b[^|;&\n]*\s/[fs]\b",
        "forced recursive deletion",
    ),
    (
        RuleCategory::RecursiveDelete,
        r"\b(?:rmdir|rd)\b[^|;&\n]*\s/s\b",
        "forced recursive deletion",
    ),
    (
        RuleCategory::RecursiveDelete,
        r"\brm\b[^|;&\n]*\s-[a-z]*(?:r[a-z]*f|f[a-z]*r)[a-z]*\b",
        "forced recursive deletion",
    ),
    (
        RuleCategory::RecursiveDelete,
        r"\brm\b[^|;&\n]*\s(?:-[a-z]*r[a-z]*|--recursive)\b[^|;&\n]*\s(?:-[a-z]*f[a-z]*|--force)\b",
        "forced recursive deletion",
    ),
    (
        RuleCategory::RecursiveDelete,
        r"\brm\b[^|;&\n]*\s(?:-[a-z]*f[a-z]*|--force)\b[^|;&\n]*\s(?:-[a-z]*r[a-z]*|--recursive)\b",
        "forced recursive deletion",
    ),
    (
        RuleCategory::RecursiveDelete,
        r"\bremove-item\b[^|;\n]*\s-recurse\b[^|;\n]*\s-force\b",
        "forced recursive deletion",
    ),
    (
        RuleCategory::RecursiveDelete,
        r"\bremove-item\b[^|;\n]*\s-force\b[^|;\n]*\s-recurse\b",
        "forced recursive deletion",
    ),
    // 시스템 종료/재시작
    (
        RuleCategory::Shutdown,
        at_command!(r"(?:shutdown|reboot|poweroff|halt)\b"),
        "system shutdown",
    ),
    (
        RuleCategory::Shutdown,
        at_command!(r"(?:restart|stop)-computer\b"),
        "system shutdown",
    ),
    (RuleCategory::Shutdown, at_command!(r"init\s+[06]\b"), "system shutdown"),
    // 보호된 레지스트리/시스템 설정
    (
        RuleCategory::ProtectedHive,
        r"\breg(?:\.exe)?\s+delete\s+(?:hklm|hkey_local_machine)\b",
        "protected registry deletion",
    ),
    (
        RuleCategory::ProtectedHive,
        r"\bremove-item\b[^|;\n]*\b(?:hklm|hkey_local_machine):",
        "protected registry deletion",
    ),
    (
        RuleCategory::ProtectedHive,
        r"\b(?:del|erase|rd|rmdir|rm|remove-item)\b[^|;&\n]*[a-z]:\\windows\\system32",
        "system directory deletion",
    ),
    (
        RuleCategory::ProtectedHive,
        concat!(
            r"\brm\s+(?:-[a-z-]+\s+)*-[a-z]*r[a-z]*\s+(?:-[a-z-]+\s+)*",
            r"/(?:\*|etc|boot|bin|sbin|usr|lib|var)?(?:[\s/]|$)"
        ),
        "system directory deletion",
    ),
    // 난독화/인코딩된 실행
    (
        RuleCategory::EncodedExecution,
        r"\b(?:powershell|pwsh)(?:\.exe)?\b[^|;\n]*\s-(?:e|ec|enc|encodedcommand)\s",
        "encoded command execution",
    ),
    (
        RuleCategory::EncodedExecution,
        r"\b(?:iex|invoke-expression)\b[^\n]*\b(?:downloadstring|frombase64string)\b",
        "obfuscated command execution",
    ),
    (
        RuleCategory::EncodedExecution,
        r"\bbase64\s+(?:-d|--decode)\b[^\n]*\|\s*(?:ba|z|da)?sh\b",
        "obfuscated command execution",
    ),
    // 원격 페이로드 다운로드 후 실행
    (
        RuleCategory::RemotePayload,
        r"\b(?:curl|wget)\b[^|\n]*\|\s*(?:sudo\s+)?(?:ba|z|da)?sh\b",
        "remote payload execution",
    ),
    (
        RuleCategory::RemotePayload,
        concat!(
            r"\b(?:iwr|irm|invoke-webrequest|invoke-restmethod)\b",
            r"[^|\n]*\|\s*(?:iex|invoke-expression)\b"
        ),
        "remote payload execution",
    ),
    (
        RuleCategory::RemotePayload,
        r"\bdownloadstring\b[^\n]*\|\s*(?:iex|invoke-expression)\b",
        "remote payload execution",
    ),
    (
        RuleCategory::RemotePayload,
        r"\bcertutil(?:\.exe)?\b[^\n]*-urlcache\b[^\n]*https?://",
        "remote payload download",
    ),
    (
        RuleCategory::RemotePayload,
        r"\bbitsadmin(?:\.exe)?\b[^\n]*/transfer\b[^\n]*https?://",
        "remote payload download",
    ),
    // 계정 조작
    (
        RuleCategory::UserManagement,
        r"\bnet\s+user\b[^\n]*\s/add\b",
        "user account creation",
    ),
    (
        RuleCategory::UserManagement,
        r"\bnet\s+localgroup\s+administrators\b[^\n]*\s/add\b",
        "administrator group change",
    ),
    // Fork bomb
    (
        RuleCategory::ForkBomb,
        r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        "fork bomb",
    ),
];

/// 연결 연산자(줄바꿈 포함) 바로 뒤의 삭제/포맷/종료 명령
const CHAINED_SOURCE: &str = concat!(
    r"(?:;|\||&|`|\$\(|\n)\s*",
    r"(?:rm|del|erase|rmdir|rd|remove-item|format|shutdown|mkfs(?:\.[a-z0-9]+)?)",
    r"(?:\.exe)?(?:\s|$)"
);

impl RuleSet {
    fn compile() -> Self {
        let rules = RULE_SOURCES
            .iter()
            .filter_map(|(category, source, reason)| match Regex::new(source) {
                Ok(pattern) => Some(Rule {
                    category: *category,
                    pattern,
                    reason: *reason,
                }),
                Err(e) => {
                    warn!("Skipping invalid validator rule {:?}: {}", source, e);
                    None
                }
            })
            .collect();

        let chained = match Regex::new(CHAINED_SOURCE) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("Skipping chained-command rule: {}", e);
                None
            }
        };

        Self { rules, chained }
    }
}

// ============================================================================
// CommandValidator
// ============================================================================

/// 파괴적 명령어 검증기
///
/// 상태가 없고 규칙 집합은 전역 불변이므로 여러 task에서 동시에 호출해도 됩니다.
#[derive(Debug, Clone, Copy)]
pub struct CommandValidator {
    dialect: ShellDialect,
}

impl CommandValidator {
    pub fn new(dialect: ShellDialect) -> Self {
        Self { dialect }
    }

    pub fn for_shell(shell: ShellType) -> Self {
        Self::new(ShellDialect::for_shell(shell))
    }

    pub fn dialect(&self) -> ShellDialect {
        self.dialect
    }

    /// 명령어 검증. 첫 번째로 위반된 규칙을 반환합니다.
    pub fn validate(&self, command: &str) -> ValidationResult {
        // ASCII 소문자 변환은 byte offset을 유지
        let lower = command.to_ascii_lowercase();
        let spans = self.literal_spans(&lower);
        let quoted = |offset: usize| spans.iter().any(|span| span.contains(&offset));

        let set = rules();
        for rule in &set.rules {
            if let Some(m) = rule.pattern.find_iter(&lower).find(|m| !quoted(m.start())) {
                return self.reject(command, rule.category, rule.reason, m.start());
            }
        }

        if let Some(chained) = &set.chained {
            if let Some(m) = chained.find_iter(&lower).find(|m| !quoted(m.start())) {
                return self.reject(
                    command,
                    RuleCategory::ChainedDestructive,
                    "destructive command after chaining operator",
                    m.start(),
                );
            }
        }

        ValidationResult::Allowed
    }

    fn reject(
        &self,
        command: &str,
        category: RuleCategory,
        reason: &'static str,
        offset: usize,
    ) -> ValidationResult {
        warn!("Blocked command ({:?}): {}", category, command);
        ValidationResult::Rejected(Violation {
            category,
            reason,
            offset,
        })
    }

    /// 리터럴 구간 (따옴표 문자열, here-string, heredoc 본문)
    ///
    /// 구분자는 모두 ASCII라 UTF-8 continuation byte와 겹치지 않으므로 byte 단위로 스캔합니다.
    pub(crate) fn literal_spans(&self, text: &str) -> Vec<Range<usize>> {
        let bytes = text.as_bytes();
        let escape = self.dialect.escape();
        let mut spans = Vec::new();
        let mut pending_heredocs: Vec<Heredoc> = Vec::new();
        let mut i = 0;

        while i < bytes.len() {
            let b = bytes[i];

            if b == escape {
                i += 2;
                continue;
            }

            match (self.dialect, b) {
                (ShellDialect::PowerShell, b'@')
                    if matches!(bytes.get(i + 1), Some(b'"' | b'\'')) =>
                {
                    let end = here_string_end(bytes, i + 2, bytes[i + 1]);
                    spans.push(i..end);
                    i = end;
                }
                (ShellDialect::Posix, b'<') if bytes.get(i + 1) == Some(&b'<') => {
                    match parse_heredoc_marker(text, i + 2) {
                        Some((heredoc, next)) => {
                            pending_heredocs.push(heredoc);
                            i = next;
                        }
                        None => i += 2,
                    }
                }
                (ShellDialect::Posix, b'\n') if !pending_heredocs.is_empty() => {
                    // 본문을 여는 줄바꿈도 리터럴에 포함 (구분자로 취급하지 않음)
                    let mut span_start = i;
                    let mut cursor = i + 1;
                    for heredoc in pending_heredocs.drain(..) {
                        let (body_end, resume) = heredoc_body_end(text, cursor, &heredoc);
                        spans.push(span_start..body_end);
                        span_start = resume;
                        cursor = resume + 1;
                    }
                    i = span_start;
                }
                (_, b'"') => {
                    i = self.double_quoted(text, i, &mut spans);
                }
                (_, b'\'') => {
                    let end = self.quoted_end(bytes, i);
                    spans.push(i..end);
                    i = end;
                }
                _ => i += 1,
            }
        }

        spans
    }

    /// 따옴표 문자열 끝 (닫는 따옴표 다음 위치, 닫히지 않으면 텍스트 끝)
    fn quoted_end(&self, bytes: &[u8], open: usize) -> usize {
        let quote = bytes[open];
        let escape = self.dialect.escape();
        let mut j = open + 1;

        while j < bytes.len() {
            let c = bytes[j];
            if quote == b'"' && c == escape {
                j += 2;
                continue;
            }
            if c == quote {
                // PowerShell 작은따옴표 안의 '' 는 리터럴 따옴표
                if self.dialect == ShellDialect::PowerShell
                    && quote == b'\''
                    && bytes.get(j + 1) == Some(&b'\'')
                {
                    j += 2;
                    continue;
                }
                return j + 1;
            }
            j += 1;
        }

        bytes.len()
    }

    /// 큰따옴표 문자열
    ///
    /// `$(...)` (POSIX는 `` `...` ``도) 치환은 따옴표 안에서도 실행되므로 리터럴에서
    /// 제외하고, 치환 내부는 다시 스캔합니다. 닫는 따옴표 다음 위치를 반환합니다.
    fn double_quoted(
        &self,
        text: &str,
        open: usize,
        spans: &mut Vec<Range<usize>>,
    ) -> usize {
        let bytes = text.as_bytes();
        let escape = self.dialect.escape();
        let mut literal_start = open;
        let mut j = open + 1;

        while j < bytes.len() {
            let (body_start, close) = match bytes[j] {
                c if c == escape => {
                    j += 2;
                    continue;
                }
                b'"' => {
                    spans.push(literal_start..j + 1);
                    return j + 1;
                }
                b'$' if bytes.get(j + 1) == Some(&b'(') => (j + 2, b')'),
                b'`' if self.dialect == ShellDialect::Posix => (j + 1, b'`'),
                _ => {
                    j += 1;
                    continue;
                }
            };

            spans.push(literal_start..j);
            let (body_end, resume) = substitution_end(bytes, body_start, close, escape);
            spans.extend(
                self.literal_spans(&text[body_start..body_end])
                    .into_iter()
                    .map(|span| span.start + body_start..span.end + body_start),
            );
            literal_start = resume;
            j = resume;
        }

        spans.push(literal_start..bytes.len());
        bytes.len()
    }
}

impl Default for CommandValidator {
    fn default() -> Self {
        Self::for_shell(ShellType::detect())
    }
}

/// 치환 본문 끝과 닫는 문자 다음 위치. 닫히지 않으면 둘 다 텍스트 끝.
///
/// `$(`는 괄호 깊이를 세고 안쪽 따옴표 문자열은 건너뜁니다.
fn substitution_end(bytes: &[u8], from: usize, close: u8, escape: u8) -> (usize, usize) {
    let mut depth = 0usize;
    let mut j = from;

    while j < bytes.len() {
        match bytes[j] {
            c if c == escape => {
                j += 2;
                continue;
            }
            quote @ (b'"' | b'\'') if close == b')' => {
                j = skip_quoted(bytes, j, quote, escape);
                continue;
            }
            b'(' if close == b')' => depth += 1,
            c if c == close => {
                if depth == 0 {
                    return (j, j + 1);
                }
                depth -= 1;
            }
            _ => {}
        }
        j += 1;
    }

    (bytes.len(), bytes.len())
}

fn skip_quoted(bytes: &[u8], open: usize, quote: u8, escape: u8) -> usize {
    let mut j = open + 1;
    while j < bytes.len() {
        match bytes[j] {
            c if c == escape && quote == b'"' => j += 2,
            c if c == quote => return j + 1,
            _ => j += 1,
        }
    }
    bytes.len()
}

// ============================================================================
// here-string / heredoc 스캔
// ============================================================================

/// `"@` 또는 `'@`가 줄 시작(앞 공백 허용)에 나오는 곳까지
fn here_string_end(bytes: &[u8], from: usize, quote: u8) -> usize {
    let mut j = from;
    while j + 1 < bytes.len() {
        if bytes[j] == quote && bytes[j + 1] == b'@' && at_line_start(bytes, j) {
            return j + 2;
        }
        j += 1;
    }
    bytes.len()
}

fn at_line_start(bytes: &[u8], pos: usize) -> bool {
    bytes[..pos]
        .iter()
        .rev()
        .find(|b| !matches!(b, b' ' | b'\t'))
        .map_or(true, |b| *b == b'\n')
}

struct Heredoc {
    delimiter: String,
    /// `<<-` 는 종료 줄의 앞 탭 허용
    strip_tabs: bool,
}

/// `<<` 다음의 `[-~]? ['"]?WORD['"]?`를 파싱. `<<<` (here-string)은 제외.
fn parse_heredoc_marker(text: &str, from: usize) -> Option<(Heredoc, usize)> {
    let rest = &text[from..];
    if rest.starts_with('<') {
        return None;
    }

    let strip_tabs = rest.starts_with('-');
    let rest_trimmed = rest.trim_start_matches(['-', '~']).trim_start_matches([' ', '\t']);
    let quote = rest_trimmed.chars().next().filter(|c| *c == '\'' || *c == '"');
    let word_start = &rest_trimmed[quote.map_or(0, |_| 1)..];
    let word_len = word_start
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(word_start.len());
    if word_len == 0 {
        return None;
    }

    let mut consumed = rest.len() - word_start.len() + word_len;
    if let Some(q) = quote {
        if word_start[word_len..].starts_with(q) {
            consumed += 1;
        }
    }

    Some((
        Heredoc {
            delimiter: word_start[..word_len].to_string(),
            strip_tabs,
        },
        from + consumed,
    ))
}

/// (본문 끝, 종료 줄 다음 위치)
fn heredoc_body_end(text: &str, body_start: usize, heredoc: &Heredoc) -> (usize, usize) {
    let mut line_start = body_start;
    while line_start < text.len() {
        let line_end = text[line_start..]
            .find('\n')
            .map_or(text.len(), |n| line_start + n);
        let mut line = text[line_start..line_end].trim_end_matches('\r');
        if heredoc.strip_tabs {
            line = line.trim_start_matches('\t');
        }
        if line == heredoc.delimiter {
            return (line_start, line_end);
        }
        line_start = line_end + 1;
    }
    (text.len(), text.len())
}

// ============================================================================
// Tests
// ============================================================================
