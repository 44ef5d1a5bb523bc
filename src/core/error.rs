//! 编排错误分类
//!
//! 与修复循环配合：Validation / Runner 类错误在预算内本地恢复，
//! Config / Build / Transport 类错误始终上抛；"Cannot" 前缀视为策略拒绝，不重试。

use thiserror::Error;

/// 编排过程中可能出现的错误（配置、构建、校验、执行、传输、取消等）
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Build error: {0}")]
    Build(String),

    /// 代理面尚未构建完成（构建失败后所有执行入口返回此错误）
    #[error("Proxies not initialized")]
    ProxiesNotInitialized,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Runner error: {0}")]
    Runner(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Cancelled")]
    Cancelled,
}

/// 策略拒绝判定：以 "Cannot" 开头的错误文本原样透出给用户，不进入重试
///
/// 英文前缀匹配沿袭自线协议约定；如需更稳妥可改为带类型标记的通道。
pub fn is_policy_refusal(message: &str) -> bool {
    message.trim_start().starts_with("Cannot")
}
