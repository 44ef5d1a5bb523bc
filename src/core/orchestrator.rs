//! 编排器门面
//!
//! 持有三个智能体、传输生命周期与整体状态机。代理束在启动时异步构建、首个请求前
//! 惰性等待；每个回合下放到后台任务执行，流式输出经无界通道交付单个读者。
//!
//! 回合状态机：
//! Reception 判定 answer 则直接回复；判定 script 则进入修复循环，成功后按配置
//! 走 Explainer、原样返回或完成提示，失败则透出最后的错误文本。

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agents::{
    AgentThread, ExplainerAgent, Message, ReceptionAgent, RouteDecision, ScriptAgent,
};
use crate::config::ExecutionMode;
use crate::core::context::{OrchestrationResult, TurnContext, TurnRoute};
use crate::core::repair::{repair_loop, RepairContext, TASK_FAILED_MESSAGE};
use crate::core::{OrchestratorError, SessionSupervisor};
use crate::invoke::{
    HandleTable, InvocationPipeline, InvocationScheduler, OperatorInvoker, ToolInvoker,
    ToolServerRegistry,
};
use crate::proxy::ProxyBundle;
use crate::runner::{
    InProcessRunner, ProtocolRunner, RemoteTransport, RunnerError, ScriptEvaluator, ScriptRunner,
    StdioTransport,
};
use crate::validator::ScriptValidator;

/// 空结果时发给用户的完成提示
pub const TASK_COMPLETED_MESSAGE: &str = "Task completed.";

/// 流式回合的事件
#[derive(Debug)]
pub enum StreamEvent {
    /// 增量文本
    Token(String),
    /// 回合结束（终态）
    Completed(OrchestrationResult),
    /// 回合失败（终态）
    Failed(String),
    /// 被取消（终态），此后无更多事件
    Cancelled,
}

/// Runner 构造参数（来自配置 + 构建器注入的求值器）
pub(crate) struct RunnerSettings {
    pub mode: ExecutionMode,
    pub executable_path: Option<std::path::PathBuf>,
    pub container_image: String,
    pub use_remote: bool,
    pub remote_base_url: Option<String>,
    pub evaluator: Option<Arc<dyn ScriptEvaluator>>,
}

pub(crate) struct ProxyState {
    pub task: Mutex<Option<JoinHandle<Result<ProxyBundle, OrchestratorError>>>>,
    /// None 表示构建失败；之后所有执行入口返回 ProxiesNotInitialized
    pub bundle: OnceCell<Option<Arc<ProxyBundle>>>,
}

pub(crate) struct OrchestratorInner {
    pub max_fix_attempts: usize,
    pub skip_reception: bool,
    pub skip_explainer: bool,
    pub reception: ReceptionAgent,
    pub script_agent: ScriptAgent,
    pub explainer: ExplainerAgent,
    pub validator: Arc<dyn ScriptValidator>,
    pub handles: Arc<HandleTable>,
    pub tool_registry: Arc<ToolServerRegistry>,
    pub scheduler: Arc<dyn InvocationScheduler>,
    pub tool_timeout_secs: u64,
    pub runner_settings: RunnerSettings,
    pub proxy: ProxyState,
    pub pipeline: OnceCell<Arc<InvocationPipeline>>,
    pub runner: RwLock<Option<Arc<dyn ScriptRunner>>>,
    pub supervisor: SessionSupervisor,
}

impl OrchestratorInner {
    /// 等待代理束构建完成；恰好等待一次，失败后恒返回 ProxiesNotInitialized
    pub(crate) async fn ensure_bundle(&self) -> Result<Arc<ProxyBundle>, OrchestratorError> {
        let bundle = self
            .proxy
            .bundle
            .get_or_init(|| async {
                let task = self.proxy.task.lock().await.take();
                match task {
                    Some(handle) => match handle.await {
                        Ok(Ok(bundle)) => Some(Arc::new(bundle)),
                        Ok(Err(e)) => {
                            tracing::error!(error = %e, "proxy build failed");
                            None
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "proxy build task failed");
                            None
                        }
                    },
                    None => None,
                }
            })
            .await;
        bundle
            .clone()
            .ok_or(OrchestratorError::ProxiesNotInitialized)
    }

    async fn ensure_pipeline(&self) -> Result<Arc<InvocationPipeline>, OrchestratorError> {
        let bundle = self.ensure_bundle().await?;
        let pipeline = self
            .pipeline
            .get_or_init(|| async {
                let operators = OperatorInvoker::new(
                    bundle.cache.clone(),
                    self.handles.clone(),
                    self.scheduler.clone(),
                );
                let tools = ToolInvoker::new(self.tool_registry.clone(), self.tool_timeout_secs);
                Arc::new(InvocationPipeline::new(operators, tools, self.handles.clone()))
            })
            .await;
        Ok(pipeline.clone())
    }

    /// 惰性构造并启动 Runner；恰好一次
    async fn ensure_runner(&self) -> Result<Arc<dyn ScriptRunner>, OrchestratorError> {
        if let Some(runner) = self.runner.read().await.as_ref() {
            return Ok(runner.clone());
        }
        let pipeline = self.ensure_pipeline().await?;
        let mut slot = self.runner.write().await;
        if let Some(runner) = slot.as_ref() {
            return Ok(runner.clone());
        }
        let runner = build_runner(&self.runner_settings, pipeline)?;
        *slot = Some(runner.clone());
        Ok(runner)
    }
}

fn build_runner(
    settings: &RunnerSettings,
    pipeline: Arc<InvocationPipeline>,
) -> Result<Arc<dyn ScriptRunner>, OrchestratorError> {
    if settings.use_remote {
        let url = settings.remote_base_url.clone().ok_or_else(|| {
            OrchestratorError::Config("remote runner enabled without a base URL".to_string())
        })?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(RemoteTransport::new(url, events_tx));
        return Ok(Arc::new(ProtocolRunner::new(transport, events_rx, pipeline)));
    }
    match settings.mode {
        ExecutionMode::InProcess => {
            let evaluator = settings.evaluator.clone().ok_or_else(|| {
                OrchestratorError::Config(
                    "in-process mode requires a script evaluator".to_string(),
                )
            })?;
            Ok(Arc::new(InProcessRunner::new(evaluator, pipeline)))
        }
        ExecutionMode::ExternalProcess => {
            let path = settings.executable_path.clone().ok_or_else(|| {
                OrchestratorError::Config(
                    "external process mode requires a runner executable path".to_string(),
                )
            })?;
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let transport = Arc::new(StdioTransport::child_process(
                path.display().to_string(),
                Vec::new(),
                events_tx,
            ));
            Ok(Arc::new(ProtocolRunner::new(transport, events_rx, pipeline)))
        }
        ExecutionMode::Container => {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let transport = Arc::new(StdioTransport::container(
                settings.container_image.clone(),
                events_tx,
            ));
            Ok(Arc::new(ProtocolRunner::new(transport, events_rx, pipeline)))
        }
    }
}

fn map_runner_err(err: RunnerError) -> OrchestratorError {
    match err {
        RunnerError::Script(message) => OrchestratorError::Runner(message),
        RunnerError::TransportClosed(reason) | RunnerError::Transport(reason) => {
            OrchestratorError::TransportClosed(reason)
        }
        RunnerError::Cancelled => OrchestratorError::Cancelled,
    }
}

/// 原始 JSON 结果的用户可见形态：null 为空串，字符串取内值，其余 JSON 序列化
fn render_raw(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 编排器门面
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub(crate) fn from_inner(inner: Arc<OrchestratorInner>) -> Self {
        Self { inner }
    }

    /// 单条用户消息 → 回复文本
    pub async fn send(&self, user_message: &str) -> Result<String, OrchestratorError> {
        self.send_messages(
            vec![Message::user(user_message)],
            self.inner.supervisor.child_token(),
        )
        .await
    }

    /// 消息列表 → 回复文本
    pub async fn send_messages(
        &self,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> Result<String, OrchestratorError> {
        Ok(self.execute_turn(messages, cancel).await?.response)
    }

    /// 消息列表 → 完整编排结果
    pub async fn execute_turn(
        &self,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> Result<OrchestrationResult, OrchestratorError> {
        let inner = self.inner.clone();
        let thread = AgentThread::from_messages(messages);
        // 整个回合下放到后台任务，调用方（如 UI 事件环）不被阻塞
        let handle = tokio::spawn(run_turn(inner, thread, cancel));
        handle
            .await
            .map_err(|e| OrchestratorError::Runner(format!("turn task failed: {e}")))?
    }

    /// 流式回合：Token 陆续到达，最后恰好一个终态事件
    pub fn stream(
        &self,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = self.inner.clone();
        let thread = AgentThread::from_messages(messages);
        tokio::spawn(async move {
            let event = match stream_turn(inner, thread, cancel, tx.clone()).await {
                Ok(result) => StreamEvent::Completed(result),
                Err(OrchestratorError::Cancelled) => StreamEvent::Cancelled,
                Err(e) => StreamEvent::Failed(e.to_string()),
            };
            let _ = tx.send(event);
        });
        rx
    }

    /// 绕过全部智能体直接执行脚本；validate 为真时仍过校验器
    pub async fn execute_script_direct(
        &self,
        script: &str,
        validate: bool,
    ) -> Result<String, OrchestratorError> {
        let bundle = self.inner.ensure_bundle().await?;
        if validate {
            if let Some(rejection) = self.inner.validator.validate(script) {
                return Err(OrchestratorError::Validation(rejection));
            }
        }
        let runner = self.inner.ensure_runner().await?;
        let full_script = bundle.compose_script(&self.inner.handles, script);
        let value = runner
            .execute(&full_script, self.inner.supervisor.child_token())
            .await
            .map_err(map_runner_err)?;
        Ok(render_raw(&value))
    }

    /// 切换到远程 Runner：关停旧传输（在途执行随之失败）并立即连接新地址
    pub async fn enable_remote(&self, url: &str) -> Result<(), OrchestratorError> {
        let pipeline = self.inner.ensure_pipeline().await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(RemoteTransport::new(url, events_tx));
        let runner = Arc::new(ProtocolRunner::new(transport, events_rx, pipeline));
        runner.start().await.map_err(map_runner_err)?;

        let mut slot = self.inner.runner.write().await;
        if let Some(old) = slot.take() {
            old.shutdown().await;
        }
        *slot = Some(runner);
        tracing::info!(%url, "switched to remote runner");
        Ok(())
    }

    /// Handle 表（宿主注册子实例用）
    pub fn handles(&self) -> Arc<HandleTable> {
        self.inner.handles.clone()
    }

    /// 取消全部在途回合
    pub fn cancel(&self) {
        self.inner.supervisor.cancel();
    }

    /// 释放资源：取消在途回合并停掉传输层
    pub async fn shutdown(&self) {
        self.inner.supervisor.cancel();
        let runner = self.inner.runner.read().await.clone();
        if let Some(runner) = runner {
            runner.shutdown().await;
        }
    }
}

/// 非流式回合状态机
async fn run_turn(
    inner: Arc<OrchestratorInner>,
    thread: AgentThread,
    cancel: CancellationToken,
) -> Result<OrchestrationResult, OrchestratorError> {
    let bundle = inner.ensure_bundle().await?;
    let runner = inner.ensure_runner().await?;
    let mut context = TurnContext::new(thread, inner.skip_reception, inner.skip_explainer);

    let decision = if context.skip_reception {
        tracing::info!("Skipping ReceptionAgent; routing directly to ScriptAgent.");
        RouteDecision::Script {
            task: context.original_task.clone(),
        }
    } else {
        tokio::select! {
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            decision = inner.reception.route(&context.thread, &context.original_task) => decision?,
        }
    };

    match decision {
        RouteDecision::Answer(text) => {
            context.thread.push(Message::assistant(&text));
            Ok(OrchestrationResult::answer(text))
        }
        RouteDecision::Script { task } => {
            if task != context.original_task {
                context.consolidated_task = Some(task);
            }
            let task = context.effective_task().to_string();
            let outcome = repair_loop(RepairContext {
                task: &task,
                max_fix_attempts: inner.max_fix_attempts,
                bundle: &bundle,
                script_agent: &inner.script_agent,
                runner: runner.as_ref(),
                validator: inner.validator.as_ref(),
                handles: &inner.handles,
                thread: &mut context.thread,
                cancel: cancel.clone(),
            })
            .await?;

            if !outcome.success {
                let message = outcome
                    .error
                    .unwrap_or_else(|| TASK_FAILED_MESSAGE.to_string());
                context.thread.push(Message::assistant(&message));
                return Ok(OrchestrationResult {
                    success: false,
                    route: TurnRoute::Script,
                    response: message,
                    raw_result: None,
                    script: outcome.script,
                    attempts: outcome.attempts,
                });
            }

            let raw = outcome.raw_result.unwrap_or(Value::Null);
            let raw_text = render_raw(&raw);
            let response = if raw_text.is_empty() {
                TASK_COMPLETED_MESSAGE.to_string()
            } else if context.skip_explainer {
                raw_text.clone()
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                    explained = inner.explainer.explain(&task, &raw_text) => explained?,
                }
            };
            context.thread.push(Message::assistant(&response));
            Ok(OrchestrationResult {
                success: true,
                route: TurnRoute::Script,
                response,
                raw_result: Some(raw),
                script: outcome.script,
                attempts: outcome.attempts,
            })
        }
    }
}

/// 流式回合状态机：Token 经桥接通道转为 StreamEvent，终态事件由调用方发送
async fn stream_turn(
    inner: Arc<OrchestratorInner>,
    thread: AgentThread,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<StreamEvent>,
) -> Result<OrchestrationResult, OrchestratorError> {
    let bundle = inner.ensure_bundle().await?;
    let runner = inner.ensure_runner().await?;
    let mut context = TurnContext::new(thread, inner.skip_reception, inner.skip_explainer);

    // Token 桥：String → StreamEvent::Token；回合结束后等桥排空再发终态事件
    let (text_tx, mut text_rx) = mpsc::unbounded_channel::<String>();
    let forward_tx = tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(token) = text_rx.recv().await {
            if forward_tx.send(StreamEvent::Token(token)).is_err() {
                break;
            }
        }
    });

    let result = stream_turn_inner(&inner, &bundle, runner, &mut context, &cancel, &text_tx).await;

    drop(text_tx);
    let _ = forwarder.await;
    result
}

async fn stream_turn_inner(
    inner: &OrchestratorInner,
    bundle: &Arc<ProxyBundle>,
    runner: Arc<dyn ScriptRunner>,
    context: &mut TurnContext,
    cancel: &CancellationToken,
    text_tx: &mpsc::UnboundedSender<String>,
) -> Result<OrchestrationResult, OrchestratorError> {
    let decision = if context.skip_reception {
        tracing::info!("Skipping ReceptionAgent; routing directly to ScriptAgent.");
        RouteDecision::Script {
            task: context.original_task.clone(),
        }
    } else {
        tokio::select! {
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            decision = inner
                .reception
                .route_stream(&context.thread, &context.original_task, text_tx) => decision?,
        }
    };

    match decision {
        RouteDecision::Answer(text) => {
            // Token 已在路由过滤器判定后流出，这里只收尾
            context.thread.push(Message::assistant(&text));
            Ok(OrchestrationResult::answer(text))
        }
        RouteDecision::Script { task } => {
            if task != context.original_task {
                context.consolidated_task = Some(task);
            }
            let task = context.effective_task().to_string();
            let outcome = repair_loop(RepairContext {
                task: &task,
                max_fix_attempts: inner.max_fix_attempts,
                bundle,
                script_agent: &inner.script_agent,
                runner: runner.as_ref(),
                validator: inner.validator.as_ref(),
                handles: &inner.handles,
                thread: &mut context.thread,
                cancel: cancel.clone(),
            })
            .await?;

            if !outcome.success {
                let message = outcome
                    .error
                    .unwrap_or_else(|| TASK_FAILED_MESSAGE.to_string());
                let _ = text_tx.send(message.clone());
                context.thread.push(Message::assistant(&message));
                return Ok(OrchestrationResult {
                    success: false,
                    route: TurnRoute::Script,
                    response: message,
                    raw_result: None,
                    script: outcome.script,
                    attempts: outcome.attempts,
                });
            }

            let raw = outcome.raw_result.unwrap_or(Value::Null);
            let raw_text = render_raw(&raw);
            let response = if raw_text.is_empty() {
                let _ = text_tx.send(TASK_COMPLETED_MESSAGE.to_string());
                TASK_COMPLETED_MESSAGE.to_string()
            } else if context.skip_explainer {
                let _ = text_tx.send(raw_text.clone());
                raw_text.clone()
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                    explained = inner.explainer.explain_stream(&task, &raw_text, text_tx) => explained?,
                }
            };
            context.thread.push(Message::assistant(&response));
            Ok(OrchestrationResult {
                success: true,
                route: TurnRoute::Script,
                response,
                raw_result: Some(raw),
                script: outcome.script,
                attempts: outcome.attempts,
            })
        }
    }
}
