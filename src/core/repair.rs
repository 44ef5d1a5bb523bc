//! 修复循环：生成 → 校验 → 执行 → 失败回灌
//!
//! 预算为重试次数，脚本智能体总调用次数 = 预算 + 1。校验拒绝与 Runner 错误作为
//! 纠错提示回灌线程后重试；传输关闭对本回合终结；"Cannot" 前缀的策略拒绝原样透出，不重试。

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentThread, Message, ScriptAgent};
use crate::core::{is_policy_refusal, OrchestratorError};
use crate::invoke::HandleTable;
use crate::observability::Metrics;
use crate::proxy::ProxyBundle;
use crate::runner::{RunnerError, ScriptRunner};
use crate::validator::ScriptValidator;

/// 所有尝试失败且无具体错误文本时的兜底文案
pub const TASK_FAILED_MESSAGE: &str = "Task could not be executed.";

/// 修复循环的输入
pub struct RepairContext<'a> {
    pub task: &'a str,
    /// 重试预算（不含首次生成）
    pub max_fix_attempts: usize,
    pub bundle: &'a ProxyBundle,
    pub script_agent: &'a ScriptAgent,
    pub runner: &'a dyn ScriptRunner,
    pub validator: &'a dyn ScriptValidator,
    pub handles: &'a HandleTable,
    pub thread: &'a mut AgentThread,
    pub cancel: CancellationToken,
}

/// 修复循环的结果
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub success: bool,
    pub raw_result: Option<Value>,
    pub script: Option<String>,
    /// 脚本智能体被调用的次数
    pub attempts: usize,
    /// 失败时的用户可见错误文本
    pub error: Option<String>,
}

impl RepairOutcome {
    fn failed(error: String, script: Option<String>, attempts: usize) -> Self {
        Self {
            success: false,
            raw_result: None,
            script,
            attempts,
            error: Some(error),
        }
    }
}

/// 驱动脚本智能体直到成功或预算耗尽
pub async fn repair_loop(cx: RepairContext<'_>) -> Result<RepairOutcome, OrchestratorError> {
    let signatures = cx.bundle.signatures_text.clone();
    let prelude_usings = cx.bundle.prelude_usings();

    // 线程中尚无该任务时补一条 User 回合（Reception 改写任务的场景）
    if cx.thread.last_user_content() != Some(cx.task) {
        cx.thread.push(Message::user(cx.task));
    }

    let mut attempts = 0usize;
    let mut last_error: Option<String> = None;
    let mut last_script: Option<String> = None;

    while attempts <= cx.max_fix_attempts {
        attempts += 1;
        if attempts > 1 {
            Metrics::global().exec.record_repair_attempt();
        }

        let script = tokio::select! {
            _ = cx.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            generated = cx.script_agent.generate(cx.thread, &signatures, &prelude_usings) => generated?,
        };
        last_script = Some(script.clone());

        let error = if let Some(rejection) = cx.validator.validate(&script) {
            tracing::warn!(attempt = attempts, "Validation failed: {rejection}");
            rejection
        } else {
            let full_script = cx.bundle.compose_script(cx.handles, &script);
            match cx.runner.execute(&full_script, cx.cancel.child_token()).await {
                Ok(value) => {
                    tracing::debug!(attempt = attempts, "script executed");
                    return Ok(RepairOutcome {
                        success: true,
                        raw_result: Some(value),
                        script: Some(script),
                        attempts,
                        error: None,
                    });
                }
                Err(RunnerError::Cancelled) => return Err(OrchestratorError::Cancelled),
                Err(err @ (RunnerError::TransportClosed(_) | RunnerError::Transport(_))) => {
                    // 传输层没了，重试无意义：记录并返回
                    tracing::error!("Execution aborted: {err}");
                    return Ok(RepairOutcome::failed(err.to_string(), Some(script), attempts));
                }
                Err(RunnerError::Script(message)) => {
                    tracing::error!(attempt = attempts, "Execution error: {message}");
                    message
                }
            }
        };

        if is_policy_refusal(&error) {
            return Ok(RepairOutcome::failed(error, Some(script), attempts));
        }

        last_error = Some(error.clone());
        if attempts > cx.max_fix_attempts {
            break;
        }
        cx.thread.push(Message::assistant(script));
        cx.thread.push(Message::user(format!(
            "Regenerate the script to accomplish the task, correcting the previous failure: {error}"
        )));
    }

    Ok(RepairOutcome::failed(
        last_error.unwrap_or_else(|| TASK_FAILED_MESSAGE.to_string()),
        last_script,
        attempts,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::{
        HandleTable, InvocationPipeline, MethodCache, OperatorInvoker, PassThroughScheduler,
        ToolInvoker, ToolServerRegistry,
    };
    use crate::llm::ScriptedLlmClient;
    use crate::proxy::ProxyBundle;
    use crate::runner::{InProcessRunner, ScriptEvaluator};
    use crate::validator::KeywordValidator;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    /// 求值器：`fail` 触发运行错误，`refuse` 触发策略拒绝，数字脚本返回该数字
    struct TailEvaluator;

    #[async_trait]
    impl ScriptEvaluator for TailEvaluator {
        async fn eval(
            &self,
            code: &str,
            _pipeline: Arc<InvocationPipeline>,
        ) -> Result<Value, String> {
            let tail = code.lines().last().unwrap_or_default();
            if tail.contains("fail") {
                Err("runtime exploded".to_string())
            } else if tail.contains("refuse") {
                Err("Cannot touch that device".to_string())
            } else if tail.contains("return 2;") {
                Ok(json!(2))
            } else {
                Ok(json!(7))
            }
        }
    }

    fn pipeline(handles: Arc<HandleTable>) -> Arc<InvocationPipeline> {
        let operators = OperatorInvoker::new(
            Arc::new(MethodCache::new()),
            handles.clone(),
            Arc::new(PassThroughScheduler),
        );
        let tools = ToolInvoker::new(Arc::new(ToolServerRegistry::new()), 5);
        Arc::new(InvocationPipeline::new(operators, tools, handles))
    }

    fn bundle() -> ProxyBundle {
        ProxyBundle {
            runtime_text: "ProxyRuntime.Host = Host;".to_string(),
            signatures_text: "int Nothing();".to_string(),
            cache: Arc::new(MethodCache::new()),
        }
    }

    async fn run(
        replies: &[&str],
        max_fix_attempts: usize,
    ) -> (Result<RepairOutcome, OrchestratorError>, Arc<ScriptedLlmClient>) {
        let llm = Arc::new(ScriptedLlmClient::new(replies.iter().copied()));
        let agent = ScriptAgent::new(llm.clone(), "write a script");
        let handles = Arc::new(HandleTable::new());
        let runner = InProcessRunner::new(Arc::new(TailEvaluator), pipeline(handles.clone()));
        let validator = KeywordValidator::new(&["BAD".to_string()]);
        let bundle = bundle();
        let mut thread = AgentThread::new();
        let outcome = repair_loop(RepairContext {
            task: "the task",
            max_fix_attempts,
            bundle: &bundle,
            script_agent: &agent,
            runner: &runner,
            validator: &validator,
            handles: &handles,
            thread: &mut thread,
            cancel: CancellationToken::new(),
        })
        .await;
        (outcome, llm)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let (outcome, llm) = run(&["return 7;"], 2).await;
        let outcome = outcome.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.raw_result, Some(json!(7)));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_validator_rejection_then_repair() {
        let (outcome, llm) = run(&["BAD return 1;", "return 2;"], 2).await;
        let outcome = outcome.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.raw_result, Some(json!(2)));
        assert_eq!(outcome.attempts, 2);
        assert_eq!(llm.call_count(), 2);
        // 第二次调用的提示里带着校验错误
        let second_call = llm.call_messages(1);
        let corrective = &second_call[second_call.len() - 1];
        assert!(corrective.content.contains("correcting the previous failure"));
        assert!(corrective.content.contains("forbidden keyword"));
    }

    #[tokio::test]
    async fn test_runtime_error_then_repair() {
        let (outcome, _) = run(&["fail();", "return 2;"], 2).await;
        let outcome = outcome.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.raw_result, Some(json!(2)));
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let (outcome, llm) = run(&["fail();", "fail();", "fail();"], 2).await;
        let outcome = outcome.unwrap();
        assert!(!outcome.success);
        // 预算 2 → 最多 3 次调用
        assert_eq!(outcome.attempts, 3);
        assert_eq!(llm.call_count(), 3);
        assert_eq!(outcome.error.as_deref(), Some("runtime exploded"));
    }

    #[tokio::test]
    async fn test_policy_refusal_short_circuits() {
        let (outcome, llm) = run(&["refuse();", "return 2;"], 5).await;
        let outcome = outcome.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(llm.call_count(), 1);
        assert_eq!(outcome.error.as_deref(), Some("Cannot touch that device"));
    }

    #[tokio::test]
    async fn test_zero_budget_single_attempt() {
        let (outcome, llm) = run(&["fail();"], 0).await;
        let outcome = outcome.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(llm.call_count(), 1);
    }
}
