//! Line-oriented wire formats spoken by worker subprocesses.

use maestro_core::{AgentSpec, MaestroResult};
use serde::{Deserialize, Serialize};

/// How requests and replies are framed on a worker's stdio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// One JSON object per line: `{"id","prompt","system_prompt","model"}`
    /// answered by `{"id","result","is_error"}`.
    #[default]
    JsonLines,
    /// JSON-RPC 2.0 `tools/call` requests, MCP style.
    JsonRpc,
}

/// A single prompt sent to an agent worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCall {
    /// User-facing prompt text.
    pub prompt: String,
    /// System prompt, if the agent has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Model override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AgentCall {
    /// A call with only a prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// A call carrying the model and system prompt of `spec`.
    pub fn for_spec(prompt: impl Into<String>, spec: &AgentSpec) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: spec.system_prompt.clone(),
            model: spec.model.clone(),
        }
    }

    /// Builder: set the system prompt.
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// A decoded reply from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
    /// Request id this reply answers.
    pub id: u64,
    /// Output text, or the error message when `is_error` is set.
    #[serde(default)]
    pub result: String,
    /// Whether the backend reported a failure.
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Serialize)]
struct LineRequest<'a> {
    id: u64,
    #[serde(flatten)]
    call: &'a AgentCall,
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Build a request.
    pub fn new(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    id: Option<u64>,
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Tool name a JSON-RPC worker exposes for prompting.
pub const PROMPT_TOOL: &str = "prompt";

/// Serialize `call` as a single request line (no trailing newline).
pub fn encode_request(wire: WireFormat, id: u64, call: &AgentCall) -> MaestroResult<String> {
    let line = match wire {
        WireFormat::JsonLines => serde_json::to_string(&LineRequest { id, call })?,
        WireFormat::JsonRpc => {
            let params = serde_json::json!({
                "name": PROMPT_TOOL,
                "arguments": call,
            });
            serde_json::to_string(&JsonRpcRequest::new(id, "tools/call", Some(params)))?
        }
    };
    Ok(line)
}

/// Decode one line of worker output. Returns `None` for lines that are not
/// replies (logs, notifications).
pub fn decode_reply(wire: WireFormat, line: &str) -> Option<WorkerReply> {
    match wire {
        WireFormat::JsonLines => serde_json::from_str(line).ok(),
        WireFormat::JsonRpc => {
            let resp: JsonRpcResponse = serde_json::from_str(line).ok()?;
            let id = resp.id?;
            if let Some(err) = resp.error {
                return Some(WorkerReply {
                    id,
                    result: format!("{}: {}", err.code, err.message),
                    is_error: true,
                });
            }
            let result = resp.result.unwrap_or(serde_json::Value::Null);
            let is_error = result
                .get("isError")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let text = match result.get("content").and_then(|c| c.as_array()) {
                Some(blocks) => blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n"),
                None => result.to_string(),
            };
            Some(WorkerReply {
                id,
                result: text,
                is_error,
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines_request_shape() {
        let call = AgentCall::new("hi").with_system_prompt("be brief");
        let line = encode_request(WireFormat::JsonLines, 7, &call).unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["prompt"], "hi");
        assert_eq!(v["system_prompt"], "be brief");
        assert!(v.get("model").is_none());
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_json_rpc_request_shape() {
        let line = encode_request(WireFormat::JsonRpc, 3, &AgentCall::new("x")).unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["method"], "tools/call");
        assert_eq!(v["params"]["name"], PROMPT_TOOL);
        assert_eq!(v["params"]["arguments"]["prompt"], "x");
    }

    #[test]
    fn test_decode_json_lines() {
        let r = decode_reply(WireFormat::JsonLines, r#"{"id":1,"result":"ok","is_error":false}"#)
            .unwrap();
        assert_eq!(r.result, "ok");
        assert!(decode_reply(WireFormat::JsonLines, "loading model...").is_none());
    }

    #[test]
    fn test_decode_json_rpc_content_and_errors() {
        let ok = decode_reply(
            WireFormat::JsonRpc,
            r#"{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}}"#,
        )
        .unwrap();
        assert_eq!(ok.result, "a\nb");
        assert!(!ok.is_error);

        let err = decode_reply(
            WireFormat::JsonRpc,
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"no such tool"}}"#,
        )
        .unwrap();
        assert!(err.is_error);
        assert!(err.result.contains("no such tool"));

        // notifications carry no id
        assert!(decode_reply(
            WireFormat::JsonRpc,
            r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#
        )
        .is_none());
    }
}
