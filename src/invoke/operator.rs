//! Operator 调用器
//!
//! 解析 `(类型, 方法, 元数)` → 方法缓存条目；泛型定义按实参类别实例化；实参经编解码
//! 规整后，经调度器执行处理器。每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::invoke::{
    coerce_arguments, HandleTable, InvokeContext, InvokeError, InvocationScheduler, MethodCache,
};
use crate::observability::Metrics;

/// Operator 调用器：方法缓存 + Handle 表 + 调度器
pub struct OperatorInvoker {
    cache: Arc<MethodCache>,
    handles: Arc<HandleTable>,
    scheduler: Arc<dyn InvocationScheduler>,
}

impl OperatorInvoker {
    pub fn new(
        cache: Arc<MethodCache>,
        handles: Arc<HandleTable>,
        scheduler: Arc<dyn InvocationScheduler>,
    ) -> Self {
        Self {
            cache,
            handles,
            scheduler,
        }
    }

    pub fn cache(&self) -> &Arc<MethodCache> {
        &self.cache
    }

    /// 执行一次 invoke-request
    pub async fn invoke(
        &self,
        target: &str,
        method: &str,
        handle: Option<&str>,
        args: Vec<Value>,
    ) -> Result<Value, InvokeError> {
        let start = Instant::now();
        let result = self.invoke_inner(target, method, handle, args).await;
        let success = result.is_ok();
        Metrics::global().invoke.record_operator_call(success);

        let audit = serde_json::json!({
            "event": "invoke_audit",
            "target": target,
            "method": method,
            "handle": handle,
            "ok": success,
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "operator");
        result
    }

    async fn invoke_inner(
        &self,
        target: &str,
        method: &str,
        handle: Option<&str>,
        args: Vec<Value>,
    ) -> Result<Value, InvokeError> {
        if !self.cache.has_type(target) {
            return Err(InvokeError::UnknownType(target.to_string()));
        }
        let entry = self
            .cache
            .lookup(target, method, args.len())
            .ok_or_else(|| InvokeError::MethodNotFound {
                type_name: target.to_string(),
                method: method.to_string(),
                arity: args.len(),
            })?;

        let handler = entry.resolve_handler(&args)?;
        let coerced = coerce_arguments(&entry.params, args)?;

        let receiver = if entry.is_static {
            None
        } else {
            let handle = handle.ok_or_else(|| InvokeError::MissingHandle {
                type_name: target.to_string(),
                method: method.to_string(),
            })?;
            Some(
                self.handles
                    .resolve(handle)
                    .ok_or_else(|| InvokeError::UnknownHandle(handle.to_string()))?,
            )
        };

        let context = InvokeContext {
            receiver,
            handles: self.handles.clone(),
        };
        let invocation = handler(context, coerced);
        self.scheduler.run(invocation).await
    }
}
