//! 调用管线：Runner 回调宿主的两条路径
//!
//! invoke-request 走 OperatorInvoker（方法缓存 + Handle 表），
//! mcp-invoke-request 走 ToolInvoker（工具服务注册表）；参数与结果统一经 JSON 编解码。

pub mod marshal;
pub mod operator;
pub mod registry;
pub mod scheduler;
pub mod tools;

use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

pub use marshal::{coerce_arguments, coerce_value, JsonKind, ParamKind};
pub use operator::OperatorInvoker;
pub use registry::{
    GenericDefinition, HandlePolicy, HandleTable, InvokeContext, MethodCache, MethodEntry,
    MethodHandler, ModelDescriptor, Operator, OperatorCatalog, OperatorDescriptor,
    ParamDescriptor, ReturnKind,
};
pub use scheduler::{AffinityScheduler, InvocationScheduler, PassThroughScheduler};
pub use tools::{ToolClient, ToolDescriptor, ToolInvoker, ToolServerRegistry};

/// 释放 Handle 的保留方法名（代理侧析构时发出）
pub const RELEASE_METHOD: &str = "__release";

/// 调用错误；在协议边界转为 invoke-result 的 error 字符串
#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("Unknown operator type: {0}")]
    UnknownType(String),

    #[error("Method not found: {type_name}.{method} with {arity} argument(s)")]
    MethodNotFound {
        type_name: String,
        method: String,
        arity: usize,
    },

    #[error("Instance method {type_name}.{method} requires a handle")]
    MissingHandle { type_name: String, method: String },

    #[error("Unknown handle: {0}")]
    UnknownHandle(String),

    #[error("Argument error: {0}")]
    Argument(String),

    #[error("Unknown tool server: {0}")]
    UnknownServer(String),

    #[error("Tool {server}/{tool} failed: {message}")]
    Tool {
        server: String,
        tool: String,
        message: String,
    },

    #[error("Tool {server}/{tool} timed out")]
    ToolTimeout { server: String, tool: String },

    /// 宿主方法内部错误，原文透传（含策略拒绝的 "Cannot…" 文本）
    #[error("{0}")]
    Handler(String),
}

/// 调用管线：按消息类别路由到两个调用器
pub struct InvocationPipeline {
    operators: OperatorInvoker,
    tools: ToolInvoker,
    handles: Arc<HandleTable>,
}

impl InvocationPipeline {
    pub fn new(operators: OperatorInvoker, tools: ToolInvoker, handles: Arc<HandleTable>) -> Self {
        Self {
            operators,
            tools,
            handles,
        }
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    /// Operator 方法调用；`__release` 保留名直接释放 Handle
    pub async fn invoke_operator(
        &self,
        target: &str,
        method: &str,
        handle: Option<&str>,
        args: Vec<Value>,
    ) -> Result<Value, InvokeError> {
        if method == RELEASE_METHOD {
            if let Some(handle) = handle {
                self.handles.release(handle);
            }
            return Ok(Value::Null);
        }
        self.operators.invoke(target, method, handle, args).await
    }

    /// 外部工具调用
    pub async fn invoke_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, InvokeError> {
        self.tools.invoke(server, tool, arguments).await
    }
}
