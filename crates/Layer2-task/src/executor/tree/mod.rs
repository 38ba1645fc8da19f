//! Process tree control
//!
//! 쉘 명령은 자식 프로세스를 계속 만들기 때문에 직접 띄운 프로세스만 죽이면
//! 고아가 남습니다. 플랫폼마다 하나의 `ProcessTreeController` 구현이 있고,
//! 시작 시 `platform_controller()`로 한 번 선택합니다.
//!
//! ## 종료 순서
//! 1. tree handle (Unix 프로세스 그룹 / Windows Job Object) 전체 종료
//! 2. 실패하거나 handle이 없으면: cancel token 취소 → pid 기준 재귀 종료 → 단일 kill

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::{TreeHandle, UnixTreeController};
#[cfg(windows)]
pub use windows::{TreeHandle, WindowsTreeController};

use async_trait::async_trait;
use forgeshell_foundation::Result;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 프로세스 트리 전체를 하나의 단위로 시작/종료하는 플랫폼 기능
#[async_trait]
pub trait ProcessTreeController: Send + Sync {
    fn name(&self) -> &'static str;

    /// spawn 전에 Command 설정 (예: 새 프로세스 그룹)
    fn prepare(&self, cmd: &mut Command);

    /// spawn 직후 tree handle 생성. 실패하면 None (pid 기반 종료만 사용).
    fn attach(&self, child: &Child) -> Option<TreeHandle>;

    /// Primary: handle에 속한 모든 프로세스 종료
    fn terminate_tree(&self, handle: &TreeHandle) -> Result<()>;

    /// Fallback: pid와 알려진 자손 재귀 종료
    async fn kill_tree_by_pid(&self, pid: u32) -> Result<()>;

    /// 최후 수단: 단일 프로세스 종료
    fn kill_pid(&self, pid: u32) -> Result<()>;
}

/// 현재 플랫폼의 controller
pub fn platform_controller() -> Arc<dyn ProcessTreeController> {
    #[cfg(unix)]
    {
        Arc::new(UnixTreeController::new())
    }
    #[cfg(windows)]
    {
        Arc::new(WindowsTreeController::new())
    }
}

/// 실제로 적용된 종료 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationTier {
    /// tree handle로 전체 종료
    Tree,
    /// pid 기준 재귀 종료
    PidTree,
    /// 단일 프로세스 kill
    SingleProcess,
    /// OS 호출은 모두 실패, cancel token만 전달됨
    CancelOnly,
}

/// 종료 결과. 경고는 호출자에게 실패로 보고되지 않습니다.
#[derive(Debug, Clone)]
pub struct TerminationReport {
    pub tier: TerminationTier,
    pub warnings: Vec<String>,
}

/// 2단계 트리 종료
///
/// 어떤 경로든 마지막에 cancel token을 취소해 완료를 기다리는 쪽을 깨웁니다.
pub async fn terminate(
    controller: &dyn ProcessTreeController,
    tree: Option<&TreeHandle>,
    pid: Option<u32>,
    cancel: &CancellationToken,
) -> TerminationReport {
    let mut warnings = Vec::new();

    if let Some(handle) = tree {
        match controller.terminate_tree(handle) {
            Ok(()) => {
                cancel.cancel();
                debug!("{}: terminated process tree", controller.name());
                return TerminationReport {
                    tier: TerminationTier::Tree,
                    warnings,
                };
            }
            Err(e) => {
                warn!("{}: tree termination failed: {}", controller.name(), e);
                warnings.push(format!("tree termination failed: {}", e));
            }
        }
    }

    cancel.cancel();

    let Some(pid) = pid else {
        return TerminationReport {
            tier: TerminationTier::CancelOnly,
            warnings,
        };
    };

    match controller.kill_tree_by_pid(pid).await {
        Ok(()) => {
            info!("{}: killed process tree of pid {}", controller.name(), pid);
            return TerminationReport {
                tier: TerminationTier::PidTree,
                warnings,
            };
        }
        Err(e) => {
            warn!("{}: recursive kill of pid {} failed: {}", controller.name(), pid, e);
            warnings.push(format!("recursive kill failed: {}", e));
        }
    }

    match controller.kill_pid(pid) {
        Ok(()) => TerminationReport {
            tier: TerminationTier::SingleProcess,
            warnings,
        },
        Err(e) => {
            warn!("{}: kill of pid {} failed: {}", controller.name(), pid, e);
            warnings.push(format!("process kill failed: {}", e));
            TerminationReport {
                tier: TerminationTier::CancelOnly,
                warnings,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeshell_foundation::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 호출 순서를 기록하는 가짜 controller
    #[derive(Default)]
    struct ScriptedController {
        tree_ok: bool,
        pid_tree_ok: bool,
        single_ok: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProcessTreeController for ScriptedController {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn prepare(&self, _cmd: &mut Command) {}

        fn attach(&self, _child: &Child) -> Option<TreeHandle> {
            None
        }

        fn terminate_tree(&self, _handle: &TreeHandle) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.tree_ok {
                Ok(())
            } else {
                Err(Error::Task("tree".into()))
            }
        }

        async fn kill_tree_by_pid(&self, _pid: u32) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.pid_tree_ok {
                Ok(())
            } else {
                Err(Error::Task("pid tree".into()))
            }
        }

        fn kill_pid(&self, _pid: u32) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.single_ok {
                Ok(())
            } else {
                Err(Error::Task("single".into()))
            }
        }
    }

    #[tokio::test]
    async fn test_fallback_without_handle_cancels_first() {
        let controller = ScriptedController {
            pid_tree_ok: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();

        let report = terminate(&controller, None, Some(42), &cancel).await;
        assert_eq!(report.tier, TerminationTier::PidTree);
        assert!(cancel.is_cancelled());
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_falls_through_to_single_kill() {
        let controller = ScriptedController {
            single_ok: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();

        let report = terminate(&controller, None, Some(42), &cancel).await;
        assert_eq!(report.tier, TerminationTier::SingleProcess);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(controller.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_all_failures_still_cancel() {
        let controller = ScriptedController::default();
        let cancel = CancellationToken::new();

        let report = terminate(&controller, None, Some(7), &cancel).await;
        assert_eq!(report.tier, TerminationTier::CancelOnly);
        assert_eq!(report.warnings.len(), 2);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_no_pid_only_cancels() {
        let controller = ScriptedController::default();
        let cancel = CancellationToken::new();

        let report = terminate(&controller, None, None, &cancel).await;
        assert_eq!(report.tier, TerminationTier::CancelOnly);
        assert_eq!(controller.calls.load(Ordering::SeqCst), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_group_kill_takes_descendants() {
        use std::process::Stdio;
        use std::time::Duration;

        let controller = platform_controller();
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("sleep 30 & sleep 30 & wait")
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        controller.prepare(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id();
        let handle = controller.attach(&child);
        assert!(handle.is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let cancel = CancellationToken::new();
        let report = terminate(controller.as_ref(), handle.as_ref(), pid, &cancel).await;
        assert_eq!(report.tier, TerminationTier::Tree);

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
