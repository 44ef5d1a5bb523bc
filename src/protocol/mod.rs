//! Runner 线协议编解码
//!
//! 每行一个 JSON 对象，`type` 字段区分五类消息（另有 mcp-invoke-request 变体）。
//! 未知 type 记日志后忽略；非法 JSON 记协议错误日志，会话继续。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 一条线协议消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunnerMessage {
    /// Runner 侧日志，转发至宿主 tracing
    Log {
        level: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exception: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// 宿主 → Runner：执行一段脚本
    ExecRequest { id: String, code: String },
    /// Runner → 宿主：执行结果；result 与 error 至多一个，均缺省表示 null 结果
    ExecResult {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Runner → 宿主：调用 Operator 方法
    InvokeRequest {
        id: String,
        target: String,
        method: String,
        #[serde(
            default,
            rename = "handleId",
            skip_serializing_if = "Option::is_none"
        )]
        handle_id: Option<String>,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Runner → 宿主：调用外部工具
    McpInvokeRequest {
        id: String,
        server: String,
        tool: String,
        #[serde(default)]
        arguments: Map<String, Value>,
    },
    /// 宿主 → Runner：调用结果
    InvokeResult {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RunnerMessage {
    /// 序列化为单行 JSON（不含换行符）
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 成功的调用结果
    pub fn invoke_ok(id: impl Into<String>, result: Value) -> Self {
        RunnerMessage::InvokeResult {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// 失败的调用结果
    pub fn invoke_err(id: impl Into<String>, error: impl Into<String>) -> Self {
        RunnerMessage::InvokeResult {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }
}

/// 解析一行协议文本；非法 JSON 或未知 type 记日志并返回 None，调用方继续会话
pub fn parse_line(line: &str) -> Option<RunnerMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, raw = %trimmed, "protocol error: malformed frame");
            return None;
        }
    };
    match serde_json::from_value::<RunnerMessage>(value.clone()) {
        Ok(message) => Some(message),
        Err(e) => {
            let kind = value
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("<missing>");
            tracing::warn!(%kind, error = %e, "ignoring unrecognized runner message");
            None
        }
    }
}

/// 把 Runner 的 log 帧按级别重放进宿主 tracing
pub fn emit_runner_log(level: &str, message: &str, exception: Option<&str>, source: Option<&str>) {
    let source = source.unwrap_or("runner");
    let exception = exception.unwrap_or("");
    match level.to_lowercase().as_str() {
        "trace" => tracing::trace!(%source, %exception, "{message}"),
        "debug" => tracing::debug!(%source, %exception, "{message}"),
        "warn" | "warning" => tracing::warn!(%source, %exception, "{message}"),
        "error" | "fatal" => tracing::error!(%source, %exception, "{message}"),
        _ => tracing::info!(%source, %exception, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exec_request_round_trip() {
        let msg = RunnerMessage::ExecRequest {
            id: "abc".to_string(),
            code: "return 1;".to_string(),
        };
        let line = msg.encode().unwrap();
        assert!(line.contains(r#""type":"exec-request""#));
        assert_eq!(parse_line(&line), Some(msg));
    }

    #[test]
    fn test_exec_result_absent_fields_mean_null() {
        let parsed = parse_line(r#"{"type":"exec-result","id":"x"}"#).unwrap();
        match parsed {
            RunnerMessage::ExecResult { id, result, error } => {
                assert_eq!(id, "x");
                assert!(result.is_none());
                assert!(error.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_invoke_request_handle_id_field_name() {
        let parsed = parse_line(
            r#"{"type":"invoke-request","id":"1","target":"SimpleOperator","method":"AddNumbersAsync","handleId":"h1","args":[{"A":2,"B":3}]}"#,
        )
        .unwrap();
        match parsed {
            RunnerMessage::InvokeRequest {
                target,
                method,
                handle_id,
                args,
                ..
            } => {
                assert_eq!(target, "SimpleOperator");
                assert_eq!(method, "AddNumbersAsync");
                assert_eq!(handle_id.as_deref(), Some("h1"));
                assert_eq!(args, vec![json!({"A": 2, "B": 3})]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_mcp_invoke_round_trip() {
        let msg = RunnerMessage::McpInvokeRequest {
            id: "9".to_string(),
            server: "files".to_string(),
            tool: "read".to_string(),
            arguments: json!({"path": "/tmp/a"}).as_object().unwrap().clone(),
        };
        let line = msg.encode().unwrap();
        assert!(line.contains(r#""type":"mcp-invoke-request""#));
        assert_eq!(parse_line(&line), Some(msg));
    }

    #[test]
    fn test_unknown_discriminator_ignored() {
        assert_eq!(parse_line(r#"{"type":"heartbeat","id":"1"}"#), None);
    }

    #[test]
    fn test_malformed_json_ignored() {
        assert_eq!(parse_line("{not json"), None);
        assert_eq!(parse_line(""), None);
    }
}
