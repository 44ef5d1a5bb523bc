//! 进程内 Runner
//!
//! 不内置脚本语言解析器：求值器由宿主提供，直接拿调用管线回调 Operator 与工具。
//! 无传输层，取消即中止等待（已产生的宿主副作用不回滚）。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::invoke::InvocationPipeline;
use crate::runner::{RunnerError, ScriptRunner};

/// 宿主脚本求值器：接收完整脚本文本（prelude + 用户脚本）
#[async_trait]
pub trait ScriptEvaluator: Send + Sync {
    async fn eval(
        &self,
        code: &str,
        pipeline: Arc<InvocationPipeline>,
    ) -> Result<Value, String>;
}

/// 进程内 Runner：求值器 + 调用管线
pub struct InProcessRunner {
    evaluator: Arc<dyn ScriptEvaluator>,
    pipeline: Arc<InvocationPipeline>,
}

impl InProcessRunner {
    pub fn new(evaluator: Arc<dyn ScriptEvaluator>, pipeline: Arc<InvocationPipeline>) -> Self {
        Self {
            evaluator,
            pipeline,
        }
    }
}

#[async_trait]
impl ScriptRunner for InProcessRunner {
    async fn execute(&self, code: &str, cancel: CancellationToken) -> Result<Value, RunnerError> {
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(RunnerError::Cancelled),
            evaluated = self.evaluator.eval(code, self.pipeline.clone()) => {
                evaluated.map_err(RunnerError::Script)
            }
        };
        crate::observability::Metrics::global()
            .exec
            .record_execution(result.is_ok());
        result
    }

    async fn shutdown(&self) {}
}
