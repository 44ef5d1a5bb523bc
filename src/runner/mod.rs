//! Runner 层：脚本执行的三种隔离方式
//!
//! ProtocolRunner 经传输层（子进程 stdio / 容器 / 远程流）与外部 Runner 对话；
//! InProcessRunner 直接调用宿主提供的求值器，无传输层。

pub mod client;
pub mod dispatcher;
pub mod inprocess;
pub mod remote;
pub mod stdio;
pub mod transport;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use client::ProtocolRunner;
pub use dispatcher::ExecutionDispatcher;
pub use inprocess::{InProcessRunner, ScriptEvaluator};
pub use remote::RemoteTransport;
pub use stdio::StdioTransport;
pub use transport::{Transport, TransportError, TransportEvent};

/// Runner 执行错误
#[derive(Error, Debug, Clone)]
pub enum RunnerError {
    /// Runner 报告的脚本错误（exec-result.error 或进程内求值错误），原文保留
    #[error("{0}")]
    Script(String),

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<TransportError> for RunnerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed(reason) => RunnerError::TransportClosed(reason),
            other => RunnerError::Transport(other.to_string()),
        }
    }
}

/// 脚本 Runner 抽象：执行一段完整脚本文本（prelude + 用户脚本），返回 JSON 结果
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn execute(&self, code: &str, cancel: CancellationToken) -> Result<Value, RunnerError>;

    /// 释放底层资源（停传输层、杀子进程）；进程内实现为空操作
    async fn shutdown(&self);
}
