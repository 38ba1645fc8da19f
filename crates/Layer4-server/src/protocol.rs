//! Wire protocol - one JSON request per line in, one JSON response per line out
//!
//! ```text
//! → {"id":1,"op":"execute","params":{"command":"echo hi","timeout":5000}}
//! ← {"id":1,"ok":true,"result":{"output":"hi\n","exitCode":0,"killed":false}}
//! → {"id":2,"op":"poll_output","params":{"taskId":"bash_…"}}
//! ← {"id":2,"ok":false,"error":{"kind":"not_found","message":"…"}}
//! ```

use forgeshell_foundation::Error;
use forgeshell_task::{ExecuteRequest, ExecutionOrchestrator};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Execute,
    PollOutput,
    Terminate,
}

#[derive(Debug, Deserialize)]
pub struct Request {
    /// Echoed back untouched
    #[serde(default)]
    pub id: Value,
    pub op: Op,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollParams {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminateParams {
    #[serde(default)]
    task_id: String,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: &Error) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                kind: error.kind().to_string(),
                message: error.to_string(),
            }),
        }
    }

    /// Serialized form, newline terminated
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"id":null,"ok":false,"error":{{"kind":"internal","message":"{}"}}}}"#,
                e
            )
        });
        line.push('\n');
        line
    }
}

/// Parse one input line
///
/// A malformed line still gets a response; the id is recovered when the
/// line is valid JSON.
pub fn parse_line(line: &str) -> std::result::Result<Request, Response> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| Response::failure(Value::Null, &Error::Json(e)))?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);

    serde_json::from_value(value).map_err(|e| {
        Response::failure(id, &Error::InvalidInput(format!("malformed request: {}", e)))
    })
}

fn params<T: DeserializeOwned>(op: Op, params: Value) -> forgeshell_foundation::Result<T> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params)
        .map_err(|e| Error::InvalidInput(format!("invalid params for {:?}: {}", op, e)))
}

// ============================================================================
// Dispatch
// ============================================================================

/// Run one request against the orchestrator
pub async fn dispatch(orchestrator: &ExecutionOrchestrator, request: Request) -> Response {
    let Request { id, op, params: raw } = request;
    debug!("Dispatching {:?} (id {})", op, id);

    let result = match op {
        Op::Execute => match params::<ExecuteRequest>(op, raw) {
            Ok(req) => orchestrator.execute(req).await.and_then(to_value),
            Err(e) => Err(e),
        },
        Op::PollOutput => match params::<PollParams>(op, raw) {
            Ok(p) => orchestrator
                .poll_output(&p.task_id, p.filter.as_deref())
                .await
                .and_then(to_value),
            Err(e) => Err(e),
        },
        Op::Terminate => match params::<TerminateParams>(op, raw) {
            Ok(p) => orchestrator.terminate(&p.task_id).await.and_then(to_value),
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(value) => Response::success(id, value),
        Err(e) => {
            if e.is_user_facing() {
                debug!("{:?} rejected: {}", op, e);
            } else {
                warn!("{:?} failed: {}", op, e);
            }
            Response::failure(id, &e)
        }
    }
}

fn to_value<T: Serialize>(outcome: T) -> forgeshell_foundation::Result<Value> {
    Ok(serde_json::to_value(outcome)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgeshell_foundation::{ExecConfig, ShellType};
    use forgeshell_task::platform_controller;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn orchestrator() -> ExecutionOrchestrator {
        ExecutionOrchestrator::with_parts(
            ExecConfig::default(),
            ShellType::Sh,
            platform_controller(),
        )
    }

    #[test]
    fn test_parse_request() {
        let request =
            parse_line(r#"{"id":7,"op":"poll_output","params":{"taskId":"bash_x"}}"#).unwrap();
        assert_eq!(request.id, json!(7));
        assert_eq!(request.op, Op::PollOutput);
        assert_eq!(request.params["taskId"], "bash_x");
    }

    #[test]
    fn test_parse_invalid_json() {
        let response = parse_line("{not json").unwrap_err();
        assert_eq!(response.id, Value::Null);
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().kind, "json");
    }

    #[test]
    fn test_parse_unknown_op_keeps_id() {
        let response = parse_line(r#"{"id":"a","op":"explode"}"#).unwrap_err();
        assert_eq!(response.id, json!("a"));
        assert_eq!(response.error.unwrap().kind, "validation");
    }

    #[test]
    fn test_response_line_shape() {
        let line = Response::success(json!(1), json!({"x": 1})).to_line();
        assert!(line.ends_with('\n'));
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value, json!({"id": 1, "ok": true, "result": {"x": 1}}));

        let line = Response::failure(json!(2), &Error::task_not_found("bash_y")).to_line();
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["kind"], "not_found");
        assert!(value.get("result").is_none());
    }

    #[tokio::test]
    async fn test_missing_command_is_validation_error() {
        let request = parse_line(r#"{"id":1,"op":"execute","params":{"command":""}}"#).unwrap();
        let response = dispatch(&orchestrator(), request).await;
        let error = response.error.unwrap();
        assert_eq!(error.kind, "validation");
        assert_eq!(error.message, "command is required");
    }

    #[tokio::test]
    async fn test_missing_task_id_is_validation_error() {
        let request = parse_line(r#"{"id":1,"op":"terminate"}"#).unwrap();
        let response = dispatch(&orchestrator(), request).await;
        assert_eq!(response.error.unwrap().kind, "validation");
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let line = json!({
            "id": 1,
            "op": "poll_output",
            "params": {"taskId": "bash_00000000-0000-4000-8000-000000000000"},
        })
        .to_string();
        let request = parse_line(&line).unwrap();
        let response = dispatch(&orchestrator(), request).await;
        assert_eq!(response.error.unwrap().kind, "not_found");
    }

    #[tokio::test]
    async fn test_rejected_command() {
        let request =
            parse_line(r#"{"id":1,"op":"execute","params":{"command":"RM -RF /"}}"#).unwrap();
        let response = dispatch(&orchestrator(), request).await;
        let error = response.error.unwrap();
        assert_eq!(error.kind, "validation");
        assert!(error.message.contains("security reasons"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_result_shape() {
        let request = parse_line(
            r#"{"id":"e","op":"execute","params":{"command":"echo hi","timeout":5000}}"#,
        )
        .unwrap();
        let response = dispatch(&orchestrator(), request).await;
        assert!(response.ok);
        let result = response.result.unwrap();
        assert_eq!(result["exitCode"], 0);
        assert_eq!(result["killed"], false);
        assert!(result["output"].as_str().unwrap().contains("hi"));
        assert!(result.get("taskId").is_none());
    }
}
