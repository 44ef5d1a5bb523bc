//! 外部工具服务：注册表与调用器
//!
//! 每个工具服务实现 ToolClient（list_tools / invoke），按名注册；调用带超时，
//! 参数名原样透传，结果为 JSON。每次调用输出结构化审计日志。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time::timeout;

use crate::invoke::InvokeError;
use crate::observability::Metrics;

/// 工具描述：名称、说明与 JSON schema（供代理生成消费）
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub schema: Value,
}

/// 工具服务客户端 trait
#[async_trait]
pub trait ToolClient: Send + Sync {
    fn name(&self) -> &str;

    /// 列出工具目录；目录可能在会话启动后才就绪
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, String>;

    /// 以命名参数调用工具
    async fn invoke(&self, tool: &str, arguments: Map<String, Value>) -> Result<Value, String>;
}

/// 工具服务注册表：按服务名存储 Arc<dyn ToolClient>
#[derive(Default)]
pub struct ToolServerRegistry {
    servers: HashMap<String, Arc<dyn ToolClient>>,
}

impl ToolServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: Arc<dyn ToolClient>) {
        self.servers.insert(client.name().to_string(), client);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolClient>> {
        self.servers.get(name).cloned()
    }

    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// 工具调用器：对每次调用施加超时并统一转 InvokeError
pub struct ToolInvoker {
    registry: Arc<ToolServerRegistry>,
    timeout: Duration,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ToolServerRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn registry(&self) -> &Arc<ToolServerRegistry> {
        &self.registry
    }

    /// 执行一次 mcp-invoke-request
    pub async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, InvokeError> {
        let client = self
            .registry
            .get(server)
            .ok_or_else(|| InvokeError::UnknownServer(server.to_string()))?;

        let start = Instant::now();
        let result = timeout(self.timeout, client.invoke(tool, arguments)).await;

        let (ok, outcome) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        Metrics::global().invoke.record_tool_call(ok);
        let audit = serde_json::json!({
            "event": "tool_audit",
            "server": server,
            "tool": tool,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(InvokeError::Tool {
                server: server.to_string(),
                tool: tool.to_string(),
                message,
            }),
            Err(_) => Err(InvokeError::ToolTimeout {
                server: server.to_string(),
                tool: tool.to_string(),
            }),
        }
    }
}
