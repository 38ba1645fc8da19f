//! Output streaming - 실행 중인 task의 stdout/stderr를 임시 파일에 기록
//!
//! 각 task는 자신만의 `OutputBuffer`를 가집니다. 두 drain worker가 한 줄씩
//! append하고, 쓰기는 buffer 단위 lock으로 직렬화됩니다 (registry lock과 무관).
//! poll은 writer와 동기화 없이 파일을 그대로 읽습니다.

use forgeshell_foundation::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const BUFFER_PREFIX: &str = "forgeshell_output_";

/// 출력 스트림 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn prefix(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "",
            StreamKind::Stderr => "[stderr] ",
        }
    }
}

/// append-only 출력 버퍼 (임시 파일)
#[derive(Debug)]
pub struct OutputBuffer {
    path: PathBuf,
    /// None이면 봉인됨 (더 이상 쓰기 없음)
    writer: Mutex<Option<File>>,
}

impl OutputBuffer {
    /// 시스템 임시 디렉토리에 새 버퍼 생성
    pub fn create() -> Result<Arc<Self>> {
        Self::create_in(&std::env::temp_dir())
    }

    pub fn create_in(dir: &Path) -> Result<Arc<Self>> {
        let file = tempfile::Builder::new()
            .prefix(BUFFER_PREFIX)
            .suffix(".txt")
            .tempfile_in(dir)?;
        let (file, path) = file
            .keep()
            .map_err(|e| Error::Runtime(format!("Failed to create output file: {}", e)))?;

        debug!("Created output buffer {}", path.display());
        Ok(Arc::new(Self {
            path,
            writer: Mutex::new(Some(File::from_std(file))),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 한 줄 추가 (개행 포함)
    pub async fn append_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(file) = writer.as_mut() else {
            return Ok(());
        };

        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }

    /// 쓰기 종료. 이후 append는 무시됩니다.
    pub async fn seal(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(mut file) = writer.take() {
            if let Err(e) = file.flush().await {
                warn!("Failed to flush output buffer {}: {}", self.path.display(), e);
            }
        }
    }

    /// 현재까지의 내용 전체
    pub async fn read_all(&self) -> Result<String> {
        let bytes = tokio::fs::read(&self.path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// 봉인 후 파일 삭제. 이미 없으면 성공으로 취급.
    pub async fn remove(&self) -> Result<()> {
        self.seal().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// 스트림을 줄 단위로 읽어 buffer에 기록하는 worker
///
/// 잘못된 UTF-8은 손실 변환합니다. 쓰기 실패 시 로그만 남기고 계속 drain합니다
/// (파이프가 막혀 프로세스가 멈추지 않도록).
pub fn spawn_drain<R>(reader: R, buffer: Arc<OutputBuffer>, kind: StreamKind) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut raw = Vec::new();
        let mut write_failed = false;

        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&raw);
                    let line = text.trim_end_matches(['\n', '\r']);
                    let line = format!("{}{}", kind.prefix(), line);
                    if let Err(e) = buffer.append_line(&line).await {
                        if !write_failed {
                            warn!(
                                "Failed to write {:?} to {}: {}",
                                kind,
                                buffer.path().display(),
                                e
                            );
                            write_failed = true;
                        }
                    }
                }
                Err(e) => {
                    debug!("{:?} drain ended: {}", kind, e);
                    break;
                }
            }
        }
    })
}
