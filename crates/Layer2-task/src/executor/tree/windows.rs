//! Windows: Job Object 기반 트리 종료
//!
//! spawn 직후 프로세스를 `JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE` Job에 넣고,
//! 종료 시 `TerminateJobObject`로 Job 안의 모든 프로세스를 한 번에 끝냅니다.
//! fallback은 `taskkill /F /T /PID`, 최후에는 `TerminateProcess`.

use super::ProcessTreeController;
use async_trait::async_trait;
use forgeshell_foundation::{Error, Result};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    SetInformationJobObject, TerminateJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};
use windows::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

/// Job Object handle. drop 시 닫히며 남은 프로세스도 함께 종료됩니다.
#[derive(Debug)]
pub struct TreeHandle {
    job: HANDLE,
}

// SAFETY: HANDLE은 커널 객체 참조이며 어느 스레드에서 사용해도 됨
unsafe impl Send for TreeHandle {}
unsafe impl Sync for TreeHandle {}

impl Drop for TreeHandle {
    fn drop(&mut self) {
        // SAFETY: job은 CreateJobObjectW로 얻은 유효한 handle이고 여기서 한 번만 닫힘
        unsafe {
            let _ = CloseHandle(self.job);
        }
    }
}

impl TreeHandle {
    fn create() -> Result<Self> {
        // SAFETY: info는 올바른 크기의 zeroed 구조체이며 호출 동안 살아 있음
        unsafe {
            let job = CreateJobObjectW(None, None)
                .map_err(|e| Error::Task(format!("Failed to create Job Object: {}", e)))?;
            let handle = Self { job };

            let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = std::mem::zeroed();
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            SetInformationJobObject(
                handle.job,
                JobObjectExtendedLimitInformation,
                &info as *const _ as *const std::ffi::c_void,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
            .map_err(|e| Error::Task(format!("Failed to configure Job Object: {}", e)))?;

            Ok(handle)
        }
    }
}

pub struct WindowsTreeController;

impl WindowsTreeController {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WindowsTreeController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessTreeController for WindowsTreeController {
    fn name(&self) -> &'static str {
        "job-object"
    }

    fn prepare(&self, _cmd: &mut Command) {}

    fn attach(&self, child: &Child) -> Option<TreeHandle> {
        let raw = child.raw_handle()?;
        let handle = match TreeHandle::create() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };

        // SAFETY: raw는 child가 살아 있는 동안 유효한 프로세스 handle
        let assigned = unsafe { AssignProcessToJobObject(handle.job, HANDLE(raw)) };
        match assigned {
            Ok(()) => Some(handle),
            Err(e) => {
                warn!("Failed to assign process to Job Object: {}", e);
                None
            }
        }
    }

    fn terminate_tree(&self, handle: &TreeHandle) -> Result<()> {
        // SAFETY: handle.job은 drop 전까지 유효
        unsafe { TerminateJobObject(handle.job, 1) }
            .map_err(|e| Error::Task(format!("Failed to terminate Job Object: {}", e)))
    }

    async fn kill_tree_by_pid(&self, pid: u32) -> Result<()> {
        let output = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            debug!("taskkill /T succeeded for pid {}", pid);
            Ok(())
        } else {
            Err(Error::Task(format!(
                "taskkill failed for pid {}: {}",
                pid,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    fn kill_pid(&self, pid: u32) -> Result<()> {
        // SAFETY: OpenProcess로 얻은 handle은 여기서만 쓰고 닫음
        unsafe {
            let process = OpenProcess(PROCESS_TERMINATE, false, pid)
                .map_err(|e| Error::Task(format!("Failed to open pid {}: {}", pid, e)))?;
            let result = TerminateProcess(process, 1);
            let _ = CloseHandle(process);
            result.map_err(|e| Error::Task(format!("Failed to terminate pid {}: {}", pid, e)))
        }
    }
}
