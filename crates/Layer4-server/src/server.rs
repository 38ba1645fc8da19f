//! Stdio serve loop
//!
//! 요청마다 별도 tokio task에서 처리하고, 응답은 단일 writer task가 순서대로 씁니다.
//! 입력이 끝나면 진행 중인 요청을 마무리한 뒤 남은 백그라운드 task를 모두 종료합니다.

use crate::protocol::{dispatch, parse_line, Response};
use forgeshell_task::ExecutionOrchestrator;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const RESPONSE_QUEUE: usize = 64;

pub async fn serve<R, W>(
    orchestrator: Arc<ExecutionOrchestrator>,
    input: R,
    output: W,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Response>(RESPONSE_QUEUE);
    let writer = tokio::spawn(write_responses(output, rx));

    let mut lines = BufReader::new(input).lines();
    let mut inflight = JoinSet::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        match parse_line(&line) {
            Ok(request) => {
                let orchestrator = Arc::clone(&orchestrator);
                let tx = tx.clone();
                inflight.spawn(async move {
                    let response = dispatch(&orchestrator, request).await;
                    if tx.send(response).await.is_err() {
                        debug!("Response writer closed, dropping response");
                    }
                });
            }
            Err(response) => {
                warn!("Rejected malformed request line");
                if tx.send(response).await.is_err() {
                    break;
                }
            }
        }

        // 완료된 요청 정리
        while let Some(joined) = inflight.try_join_next() {
            if let Err(e) = joined {
                error!("Request handler panicked: {}", e);
            }
        }
    }

    info!("Input closed, waiting for {} in-flight request(s)", inflight.len());
    while let Some(joined) = inflight.join_next().await {
        if let Err(e) = joined {
            error!("Request handler panicked: {}", e);
        }
    }

    orchestrator.shutdown().await;

    drop(tx);
    match writer.await {
        Ok(result) => result,
        Err(e) => {
            error!("Response writer panicked: {}", e);
            Ok(())
        }
    }
}

async fn write_responses<W>(mut output: W, mut rx: mpsc::Receiver<Response>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        output.write_all(response.to_line().as_bytes()).await?;
        output.flush().await?;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use forgeshell_foundation::{ExecConfig, ShellType};
    use forgeshell_task::platform_controller;
    use serde_json::Value;

    fn orchestrator() -> Arc<ExecutionOrchestrator> {
        Arc::new(ExecutionOrchestrator::with_parts(
            ExecConfig::default(),
            ShellType::Sh,
            platform_controller(),
        ))
    }

    async fn run(orchestrator: Arc<ExecutionOrchestrator>, input: &str) -> Vec<Value> {
        let (client, server_out) = tokio::io::duplex(64 * 1024);
        serve(orchestrator, input.as_bytes(), server_out).await.unwrap();

        let mut lines = BufReader::new(client).lines();
        let mut responses = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            responses.push(serde_json::from_str(&line).unwrap());
        }
        responses
    }

    #[tokio::test]
    async fn test_one_response_per_request() {
        let input = concat!(
            r#"{"id":1,"op":"execute","params":{"command":"echo one","timeout":5000}}"#,
            "\n\n",
            "garbage\n",
            r#"{"id":3,"op":"terminate","params":{"taskId":"nope"}}"#,
            "\n",
        );
        let responses = run(orchestrator(), input).await;
        assert_eq!(responses.len(), 3);

        let by_id = |id: Value| responses.iter().find(|r| r["id"] == id).cloned();
        let first = by_id(Value::from(1)).unwrap();
        assert_eq!(first["ok"], true);
        assert!(first["result"]["output"].as_str().unwrap().contains("one"));

        let third = by_id(Value::from(3)).unwrap();
        assert_eq!(third["ok"], false);

        let garbage = by_id(Value::Null).unwrap();
        assert_eq!(garbage["error"]["kind"], "json");
    }

    #[tokio::test]
    async fn test_eof_terminates_background_tasks() {
        let orchestrator = orchestrator();
        let input = concat!(
            r#"{"id":1,"op":"execute","params":{"command":"sleep 30","runInBackground":true}}"#,
            "\n",
        );
        let responses = run(Arc::clone(&orchestrator), input).await;

        assert_eq!(responses[0]["ok"], true);
        assert!(responses[0]["result"]["taskId"].as_str().unwrap().starts_with("bash_"));
        assert!(orchestrator.registry().is_empty().await);
    }
}
