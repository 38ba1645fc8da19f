//! 바이너리 통합 테스트 - stdio로 실제 forgeshell 프로세스와 대화
//!
//! `cargo test -p forgeshell-server --test stdio_test -- --nocapture`

#![cfg(unix)]

use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

struct Client {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Client {
    fn spawn(args: &[&str]) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_forgeshell"))
            .args(["--shell", "sh"])
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("failed to start forgeshell");
        let stdin = child.stdin.take();
        let stdout = BufReader::new(child.stdout.take().unwrap()).lines();
        Self { child, stdin, stdout }
    }

    async fn call(&mut self, request: Value) -> Value {
        let mut line = request.to_string();
        line.push('\n');
        let stdin = self.stdin.as_mut().unwrap();
        stdin.write_all(line.as_bytes()).await.unwrap();
        stdin.flush().await.unwrap();

        let line = tokio::time::timeout(Duration::from_secs(15), self.stdout.next_line())
            .await
            .expect("no response")
            .unwrap()
            .expect("server closed stdout");
        serde_json::from_str(&line).unwrap()
    }
}

#[tokio::test]
async fn test_bad_config_path_exits_with_error() {
    let mut client = Client::spawn(&["--config", "/nonexistent/forgeshell.json"]);
    drop(client.stdin.take());
    let status = client.child.wait().await.unwrap();
    assert!(!status.success());
}

#[tokio::test]
async fn test_background_lifecycle_over_stdio() {
    let mut client = Client::spawn(&[]);

    let started = client
        .call(json!({
            "id": 1,
            "op": "execute",
            "params": {
                "command": "echo ready; sleep 30",
                "runInBackground": true,
                "description": "nap",
            }
        }))
        .await;
    assert_eq!(started["id"], 1);
    assert_eq!(started["ok"], true);
    let task_id = started["result"]["taskId"].as_str().unwrap().to_string();

    let poll = client
        .call(json!({"id": 2, "op": "poll_output", "params": {"taskId": task_id}}))
        .await;
    assert_eq!(poll["ok"], true);
    assert_eq!(poll["result"]["status"], "running");
    assert_eq!(poll["result"]["description"], "nap");

    let killed = client
        .call(json!({"id": 3, "op": "terminate", "params": {"taskId": task_id}}))
        .await;
    assert_eq!(killed["ok"], true);
    assert!(killed["result"]["message"]
        .as_str()
        .unwrap()
        .contains("killed successfully"));

    let gone = client
        .call(json!({"id": 4, "op": "poll_output", "params": {"taskId": task_id}}))
        .await;
    assert_eq!(gone["ok"], false);
    assert_eq!(gone["error"]["kind"], "not_found");

    drop(client.stdin.take());
    let status = tokio::time::timeout(Duration::from_secs(10), client.child.wait())
        .await
        .expect("server did not exit on EOF")
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_validation_errors_over_stdio() {
    let mut client = Client::spawn(&[]);

    let response = client
        .call(json!({"id": "t", "op": "execute", "params": {"command": "echo hi", "timeout": 10}}))
        .await;
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["kind"], "validation");
    assert!(response["error"]["message"]
        .as_str()
        .unwrap()
        .contains("timeout must be between"));

    let response = client
        .call(json!({"id": "r", "op": "execute", "params": {"command": "Format C:"}}))
        .await;
    assert_eq!(response["error"]["kind"], "validation");
}
