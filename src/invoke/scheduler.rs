//! 调用调度器：单线程亲和的逃生舱
//!
//! 两个实现：PassThrough 就地 await；Affinity 把调用排队到捕获的专用线程
//! （UI 宿主场景），但检测到重入（已在该线程上）时就地执行以避免死锁。

use std::cell::Cell;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::invoke::InvokeError;

/// 一次已绑定好上下文与实参的调用
pub type InvocationFuture = BoxFuture<'static, Result<Value, InvokeError>>;

/// 调度器能力：决定调用在哪个执行上下文上运行
#[async_trait]
pub trait InvocationScheduler: Send + Sync {
    async fn run(&self, invocation: InvocationFuture) -> Result<Value, InvokeError>;
}

/// 直通调度器：在当前工作线程上就地执行
#[derive(Debug, Default)]
pub struct PassThroughScheduler;

#[async_trait]
impl InvocationScheduler for PassThroughScheduler {
    async fn run(&self, invocation: InvocationFuture) -> Result<Value, InvokeError> {
        invocation.await
    }
}

thread_local! {
    static ON_AFFINITY_THREAD: Cell<bool> = const { Cell::new(false) };
}

struct AffinityJob {
    invocation: InvocationFuture,
    reply: oneshot::Sender<Result<Value, InvokeError>>,
}

/// 亲和调度器：所有调用串行排队到一个专用线程
pub struct AffinityScheduler {
    tx: mpsc::UnboundedSender<AffinityJob>,
}

impl AffinityScheduler {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AffinityJob>();
        std::thread::Builder::new()
            .name("mantis-affinity".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to build affinity runtime");
                        return;
                    }
                };
                ON_AFFINITY_THREAD.with(|flag| flag.set(true));
                runtime.block_on(async move {
                    while let Some(job) = rx.recv().await {
                        let result = job.invocation.await;
                        let _ = job.reply.send(result);
                    }
                });
            })
            .ok();
        Self { tx }
    }

    /// 当前线程是否就是亲和线程
    pub fn on_affinity_thread() -> bool {
        ON_AFFINITY_THREAD.with(|flag| flag.get())
    }
}

impl Default for AffinityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InvocationScheduler for AffinityScheduler {
    async fn run(&self, invocation: InvocationFuture) -> Result<Value, InvokeError> {
        // 重入：已在亲和线程上，入队会死锁，就地执行
        if Self::on_affinity_thread() {
            return invocation.await;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(AffinityJob {
                invocation,
                reply: reply_tx,
            })
            .map_err(|_| InvokeError::Handler("invocation scheduler stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| InvokeError::Handler("invocation scheduler dropped reply".to_string()))?
    }
}
