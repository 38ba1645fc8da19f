//! Unix: 프로세스 그룹 기반 트리 종료
//!
//! 명령은 `process_group(0)`으로 자기 그룹의 리더가 되고, 종료 시
//! `killpg(SIGKILL)`으로 그룹 전체를 죽입니다. 그룹을 벗어난 자손은
//! `/proc`의 ppid를 따라가는 fallback이 처리합니다.

use super::ProcessTreeController;
use async_trait::async_trait;
use forgeshell_foundation::{Error, Result};
use std::collections::HashMap;
use tokio::process::{Child, Command};
use tracing::debug;

/// 프로세스 그룹 id
#[derive(Debug)]
pub struct TreeHandle {
    pgid: libc::pid_t,
}

impl TreeHandle {
    pub fn pgid(&self) -> i32 {
        self.pgid
    }
}

pub struct UnixTreeController;

impl UnixTreeController {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UnixTreeController {
    fn default() -> Self {
        Self::new()
    }
}

/// SIGKILL 전송. 이미 없는 프로세스(ESRCH)는 성공으로 취급.
fn send_kill(result: libc::c_int, target: &str) -> Result<()> {
    if result == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!("{} already gone", target);
        return Ok(());
    }
    Err(Error::Task(format!("Failed to kill {}: {}", target, err)))
}

#[async_trait]
impl ProcessTreeController for UnixTreeController {
    fn name(&self) -> &'static str {
        "process-group"
    }

    fn prepare(&self, cmd: &mut Command) {
        cmd.process_group(0);
    }

    fn attach(&self, child: &Child) -> Option<TreeHandle> {
        let pid = child.id()?;
        Some(TreeHandle {
            pgid: pid as libc::pid_t,
        })
    }

    fn terminate_tree(&self, handle: &TreeHandle) -> Result<()> {
        // SAFETY: killpg에는 포인터 인자가 없음
        let result = unsafe { libc::killpg(handle.pgid, libc::SIGKILL) };
        send_kill(result, &format!("process group {}", handle.pgid))
    }

    async fn kill_tree_by_pid(&self, pid: u32) -> Result<()> {
        let targets = tokio::task::spawn_blocking(move || descendants_deepest_first(pid))
            .await
            .map_err(|e| Error::Internal(format!("process scan panicked: {}", e)))??;

        for target in targets {
            // SAFETY: kill에는 포인터 인자가 없음
            let result = unsafe { libc::kill(target as libc::pid_t, libc::SIGKILL) };
            send_kill(result, &format!("pid {}", target))?;
        }
        Ok(())
    }

    fn kill_pid(&self, pid: u32) -> Result<()> {
        // SAFETY: kill에는 포인터 인자가 없음
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        send_kill(result, &format!("pid {}", pid))
    }
}

/// root와 모든 자손 (자손 먼저, root 마지막)
fn descendants_deepest_first(root: u32) -> Result<Vec<u32>> {
    let children = process_children()?;
    let mut ordered = Vec::new();
    let mut stack = vec![(root, false)];

    while let Some((pid, expanded)) = stack.pop() {
        if expanded {
            ordered.push(pid);
            continue;
        }
        stack.push((pid, true));
        if let Some(kids) = children.get(&pid) {
            stack.extend(kids.iter().map(|kid| (*kid, false)));
        }
    }

    Ok(ordered)
}

/// ppid → 자식 pid 목록. `/proc`이 없으면 빈 맵 (root만 종료).
fn process_children() -> Result<HashMap<u32, Vec<u32>>> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(children),
        Err(e) => return Err(Error::Io(e)),
    };

    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // 스캔 도중 종료된 프로세스는 건너뜀
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some(ppid) = parse_ppid(&stat) {
            children.entry(ppid).or_default().push(pid);
        }
    }

    Ok(children)
}

/// `pid (comm) state ppid ...` 에서 ppid. comm에 공백/괄호가 있을 수 있어 마지막 ')' 기준.
fn parse_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ppid() {
        assert_eq!(parse_ppid("1234 (sh) S 1 1234 1234 0 -1"), Some(1));
        assert_eq!(parse_ppid("99 (my (odd) proc) R 42 99 99"), Some(42));
        assert_eq!(parse_ppid("garbage"), None);
    }

    #[test]
    fn test_descendants_include_root_last() {
        let pid = std::process::id();
        let ordered = descendants_deepest_first(pid).unwrap();
        assert_eq!(ordered.last(), Some(&pid));
    }

    #[test]
    fn test_kill_missing_pid_is_ok() {
        // pid_max 위의 값은 존재할 수 없음
        let controller = UnixTreeController::new();
        assert!(controller.kill_pid(4_194_305).is_ok());
    }
}
