//! 传输层抽象
//!
//! 双向换行分隔 JSON：send 发一行，对端的行与关闭事件经构造时注入的 mpsc 通道投递。
//! start 幂等并由生命周期互斥锁串行化；closed 之后 send 失败，直到 start 再次成功。

use async_trait::async_trait;
use thiserror::Error;

/// 传输层事件：收到一行 / 连接关闭（携带原因）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Line(String),
    Closed(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport closed: {0}")]
    Closed(String),

    #[error("transport not started")]
    NotStarted,

    #[error("transport I/O error: {0}")]
    Io(String),

    #[error("transport configuration error: {0}")]
    Config(String),
}

/// 传输层 trait：三种实现共享同一线格式，只是启动方式不同
#[async_trait]
pub trait Transport: Send + Sync {
    /// 建立连接 / 拉起子进程并开始投递事件；幂等
    async fn start(&self) -> Result<(), TransportError>;

    /// 关闭连接并释放资源
    async fn stop(&self);

    /// 发送一行（不含换行符）
    async fn send(&self, line: &str) -> Result<(), TransportError>;
}
