//! 可观测性
//!
//! 提供 tracing 初始化与全局指标：
//! - LLM 调用次数/延迟/错误率
//! - 脚本执行次数与修复轮数
//! - Operator / 工具调用计数

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

/// 初始化日志：默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}

/// 生成新的请求 ID（128-bit 随机 hex）
pub fn generate_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// 全局指标收集器
#[derive(Debug, Default)]
pub struct Metrics {
    /// LLM 相关指标
    pub llm: LlmMetrics,
    /// 脚本执行相关指标
    pub exec: ExecMetrics,
    /// 调用管线相关指标
    pub invoke: InvokeMetrics,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取全局指标实例
    pub fn global() -> &'static Metrics {
        static INSTANCE: std::sync::OnceLock<Metrics> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(Metrics::new)
    }

    /// 导出为 JSON 格式
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "llm": {
                "total_calls": self.llm.total_calls.load(Ordering::Relaxed),
                "failed_calls": self.llm.failed_calls.load(Ordering::Relaxed),
                "total_latency_ms": self.llm.total_latency_ms.load(Ordering::Relaxed),
                "average_latency_ms": self.llm.average_latency_ms(),
            },
            "exec": {
                "total_executions": self.exec.total_executions.load(Ordering::Relaxed),
                "failed_executions": self.exec.failed_executions.load(Ordering::Relaxed),
                "repair_attempts": self.exec.repair_attempts.load(Ordering::Relaxed),
            },
            "invoke": {
                "operator_calls": self.invoke.operator_calls.load(Ordering::Relaxed),
                "tool_calls": self.invoke.tool_calls.load(Ordering::Relaxed),
                "failed_calls": self.invoke.failed_calls.load(Ordering::Relaxed),
            },
        })
    }
}

/// LLM 相关指标
#[derive(Debug, Default)]
pub struct LlmMetrics {
    pub total_calls: AtomicU64,
    pub failed_calls: AtomicU64,
    pub total_latency_ms: AtomicU64,
}

impl LlmMetrics {
    pub fn record_call(&self, success: bool, latency: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn average_latency_ms(&self) -> f64 {
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        let count = self.total_calls.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }
}

/// 脚本执行相关指标
#[derive(Debug, Default)]
pub struct ExecMetrics {
    pub total_executions: AtomicU64,
    pub failed_executions: AtomicU64,
    /// 修复循环中的重试次数（不含首次生成）
    pub repair_attempts: AtomicU64,
}

impl ExecMetrics {
    pub fn record_execution(&self, success: bool) {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_executions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_repair_attempt(&self) {
        self.repair_attempts.fetch_add(1, Ordering::Relaxed);
    }
}

/// 调用管线相关指标
#[derive(Debug, Default)]
pub struct InvokeMetrics {
    pub operator_calls: AtomicU64,
    pub tool_calls: AtomicU64,
    pub failed_calls: AtomicU64,
}

impl InvokeMetrics {
    pub fn record_operator_call(&self, success: bool) {
        self.operator_calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_tool_call(&self, success: bool) {
        self.tool_calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_record() {
        let metrics = Metrics::new();
        metrics.llm.record_call(true, Duration::from_millis(10));
        metrics.llm.record_call(false, Duration::from_millis(30));
        metrics.exec.record_execution(true);
        metrics.invoke.record_operator_call(false);

        assert_eq!(metrics.llm.total_calls.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.llm.failed_calls.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.llm.average_latency_ms(), 20.0);
        assert_eq!(metrics.exec.total_executions.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.invoke.failed_calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_request_id_is_hex() {
        let id = generate_request_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
