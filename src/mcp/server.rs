// MCP stdio server
// Line-delimited JSON-RPC over stdin/stdout: initialize, tools/list,
// tools/call, ping. Logging goes to stderr so the protocol stream stays
// clean. Tool failures are payloads (`success: false`), not transport
// errors; transport errors are reserved for malformed JSON-RPC.

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::agents::Conductor;
use crate::mcp::tools::{definitions, ToolContext};
use crate::mcp::types::{
    rpc_errors, MCPRequest, MCPResponse, RequestId, JSONRPC_VERSION, PROTOCOL_VERSION,
};

pub struct MCPServer {
    context: ToolContext,
}

impl MCPServer {
    pub fn new(conductor: Arc<Conductor>) -> Self {
        Self {
            context: ToolContext::new(conductor),
        }
    }

    /// Serve requests from stdin until EOF.
    pub async fn run_stdio(&self) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let mut lines = stdin.lines();

        info!("MCP server listening on stdio");
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = self.handle_line(&line).await {
                let serialized = serde_json::to_string(&response)?;
                stdout.write_all(serialized.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }
        info!("stdin closed, MCP server exiting");
        Ok(())
    }

    /// Handle one raw line. Notifications produce no response.
    pub async fn handle_line(&self, line: &str) -> Option<MCPResponse> {
        let request: MCPRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "unparseable request");
                return Some(MCPResponse::failure(
                    RequestId::Number(0),
                    rpc_errors::PARSE_ERROR,
                    format!("invalid JSON-RPC: {e}"),
                ));
            }
        };

        let id = request.id.clone();
        let result = self.handle_request(&request).await;
        let id = id?; // notification: no response even on error
        Some(match result {
            Ok(value) => MCPResponse::success(id, value),
            Err((code, message)) => MCPResponse::failure(id, code, message),
        })
    }

    async fn handle_request(&self, request: &MCPRequest) -> Result<Value, (i32, String)> {
        debug!(method = %request.method, "rpc request");
        match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": { "listChanged": false }
                },
                "serverInfo": {
                    "name": "codegraph",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
            "notifications/initialized" => Ok(Value::Null),
            "ping" => Ok(json!({ "status": "ok" })),
            "tools/list" => Ok(json!({ "tools": definitions() })),
            "tools/call" => {
                let name = request
                    .params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or((rpc_errors::INVALID_PARAMS, "missing tool name".to_string()))?;
                let default_args = json!({});
                let arguments = request.params.get("arguments").unwrap_or(&default_args);
                let payload = self.context.call(name, arguments).await;
                Ok(json!({
                    "content": [{
                        "type": "text",
                        "text": serde_json::to_string(&payload)
                            .unwrap_or_else(|_| "{\"success\":false}".to_string()),
                    }],
                    "isError": payload.get("success") == Some(&Value::Bool(false)),
                }))
            }
            other => Err((
                rpc_errors::METHOD_NOT_FOUND,
                format!("unknown method '{other}'"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::io::Write;
    use std::path::Path;

    async fn server(data_dir: &Path) -> MCPServer {
        let config = ServerConfig {
            data_dir: data_dir.to_path_buf(),
            ..ServerConfig::default()
        };
        let conductor = Arc::new(Conductor::build(config).unwrap());
        conductor.start().await.unwrap();
        MCPServer::new(conductor)
    }

    #[tokio::test]
    async fn initialize_and_list_tools() -> Result<()> {
        let data = tempfile::tempdir()?;
        let server = server(data.path()).await;

        let init = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#)
            .await
            .expect("response");
        let result = init.result.expect("result");
        assert_eq!(result["serverInfo"]["name"], "codegraph");

        let list = server
            .handle_line(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await
            .expect("response");
        let tools = list.result.expect("result")["tools"]
            .as_array()
            .expect("array")
            .len();
        assert_eq!(tools, 13);
        Ok(())
    }

    #[tokio::test]
    async fn notifications_get_no_response() -> Result<()> {
        let data = tempfile::tempdir()?;
        let server = server(data.path()).await;
        let response = server
            .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        assert!(response.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_method_is_rpc_error() -> Result<()> {
        let data = tempfile::tempdir()?;
        let server = server(data.path()).await;
        let response = server
            .handle_line(r#"{"jsonrpc":"2.0","id":3,"method":"bogus"}"#)
            .await
            .expect("response");
        assert_eq!(response.error.expect("error").code, -32601);
        Ok(())
    }

    #[tokio::test]
    async fn tool_call_round_trip() -> Result<()> {
        let workspace = tempfile::tempdir()?;
        let data = tempfile::tempdir()?;
        let mut file = std::fs::File::create(workspace.path().join("lib.py"))?;
        file.write_all(b"def add(a, b):\n    return a + b\n")?;
        drop(file);

        let server = server(data.path()).await;
        let request = json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "tools/call",
            "params": {
                "name": "index",
                "arguments": { "directory": workspace.path().display().to_string() },
            },
        });
        let response = server
            .handle_line(&serde_json::to_string(&request)?)
            .await
            .expect("response");
        let result = response.result.expect("result");
        assert_eq!(result["isError"], false);

        let payload: Value =
            serde_json::from_str(result["content"][0]["text"].as_str().expect("text"))?;
        assert_eq!(payload["success"], true);
        assert_eq!(payload["files_indexed"], 1);
        assert_eq!(payload["entities"], 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_tool_call_is_payload_not_transport_error() -> Result<()> {
        let data = tempfile::tempdir()?;
        let server = server(data.path()).await;
        let request = json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "tools/call",
            "params": {
                "name": "list_file_entities",
                "arguments": { "filePath": "/absent.py" },
            },
        });
        let response = server
            .handle_line(&serde_json::to_string(&request)?)
            .await
            .expect("response");
        let result = response.result.expect("result, not an rpc error");
        assert_eq!(result["isError"], true);

        let payload: Value =
            serde_json::from_str(result["content"][0]["text"].as_str().expect("text"))?;
        assert_eq!(payload["success"], false);
        assert_eq!(payload["error"]["code"], "FILE_NOT_FOUND");
        Ok(())
    }
}
