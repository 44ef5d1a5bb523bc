//! 执行分发器：请求 ID → 待完成槽位的关联表
//!
//! dispatch 分配新 ID、登记 oneshot 槽位、发出 exec-request 并等待匹配的 exec-result；
//! 取消先摘除槽位再失败；传输层关闭时批量失败全部在途槽位；迟到的结果找不到槽位即丢弃。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::observability::{generate_request_id, Metrics};
use crate::protocol::RunnerMessage;
use crate::runner::{RunnerError, TransportError};

type Slot = oneshot::Sender<Result<Value, RunnerError>>;

/// 关联表；生命周期与传输层一致
#[derive(Default)]
pub struct ExecutionDispatcher {
    pending: Mutex<HashMap<String, Slot>>,
}

impl ExecutionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发送一段脚本并等待其结果
    pub async fn dispatch<F, Fut>(
        &self,
        code: &str,
        send: F,
        cancel: CancellationToken,
    ) -> Result<Value, RunnerError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let id = generate_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock")
            .insert(id.clone(), tx);

        let line = match (RunnerMessage::ExecRequest {
            id: id.clone(),
            code: code.to_string(),
        })
        .encode()
        {
            Ok(line) => line,
            Err(e) => {
                self.remove(&id);
                return Err(RunnerError::Transport(e.to_string()));
            }
        };

        if let Err(e) = send(line).await {
            self.remove(&id);
            return Err(e.into());
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                self.remove(&id);
                Err(RunnerError::Cancelled)
            }
            completed = rx => match completed {
                Ok(outcome) => outcome,
                // 槽位未完成即被丢弃：分发器随传输层一起消亡
                Err(_) => Err(RunnerError::TransportClosed("dispatcher dropped".to_string())),
            },
        };
        Metrics::global().exec.record_execution(result.is_ok());
        result
    }

    /// 完成一个槽位；error 字符串非空则以 Runner 错误失败
    pub fn complete(&self, id: &str, result: Option<Value>, error: Option<String>) {
        let slot = self.pending.lock().expect("pending lock").remove(id);
        match slot {
            Some(tx) => {
                let outcome = match error {
                    Some(message) => Err(RunnerError::Script(message)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
            None => {
                tracing::debug!(%id, "discarding exec-result for unknown or cancelled id");
            }
        }
    }

    /// 传输层关闭：全部在途槽位以同一错误失败，每个恰好一次
    pub fn fail_all(&self, error: RunnerError) {
        let drained: Vec<Slot> = {
            let mut pending = self.pending.lock().expect("pending lock");
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// 在途槽位数
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }

    fn remove(&self, id: &str) {
        self.pending.lock().expect("pending lock").remove(id);
    }
}
