//! 协议 Runner：传输层 + 分发器 + 解复用循环
//!
//! 接收侧单一解复用器分类每帧：exec-result 完成分发器槽位；invoke-request /
//! mcp-invoke-request 派发到工作任务并发处理，运行中的脚本可并行回调宿主而不会
//! 与自己的结果死锁；log 帧重放进宿主 tracing；Closed 批量失败全部在途执行。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::invoke::InvocationPipeline;
use crate::protocol::{emit_runner_log, parse_line, RunnerMessage};
use crate::runner::{
    ExecutionDispatcher, RunnerError, ScriptRunner, Transport, TransportEvent,
};

/// 经传输层对话的脚本 Runner
pub struct ProtocolRunner {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<ExecutionDispatcher>,
    pipeline: Arc<InvocationPipeline>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    started: Mutex<bool>,
}

impl ProtocolRunner {
    /// events 为构造传输层时配对的接收端
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        pipeline: Arc<InvocationPipeline>,
    ) -> Self {
        Self {
            transport,
            dispatcher: Arc::new(ExecutionDispatcher::new()),
            pipeline,
            events: Mutex::new(Some(events)),
            started: Mutex::new(false),
        }
    }

    pub fn dispatcher(&self) -> &Arc<ExecutionDispatcher> {
        &self.dispatcher
    }

    /// 启动传输层与解复用循环；恰好一次
    pub async fn start(&self) -> Result<(), RunnerError> {
        let mut started = self.started.lock().await;
        if *started {
            return Ok(());
        }
        self.transport.start().await?;
        let events = self
            .events
            .lock()
            .await
            .take()
            .ok_or_else(|| RunnerError::Transport("runner already consumed".to_string()))?;
        tokio::spawn(demux_loop(
            events,
            self.transport.clone(),
            self.dispatcher.clone(),
            self.pipeline.clone(),
        ));
        *started = true;
        Ok(())
    }
}

#[async_trait]
impl ScriptRunner for ProtocolRunner {
    async fn execute(&self, code: &str, cancel: CancellationToken) -> Result<Value, RunnerError> {
        self.start().await?;
        let transport = self.transport.clone();
        self.dispatcher
            .dispatch(
                code,
                move |line| async move { transport.send(&line).await },
                cancel,
            )
            .await
    }

    async fn shutdown(&self) {
        self.transport.stop().await;
    }
}

/// 接收侧解复用循环：退出前保证在途执行以传输关闭失败
async fn demux_loop(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<ExecutionDispatcher>,
    pipeline: Arc<InvocationPipeline>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Line(line) => {
                if let Some(message) = parse_line(&line) {
                    handle_message(message, &transport, &dispatcher, &pipeline);
                }
            }
            TransportEvent::Closed(reason) => {
                tracing::warn!(%reason, "runner transport closed");
                dispatcher.fail_all(RunnerError::TransportClosed(reason));
                return;
            }
        }
    }
    dispatcher.fail_all(RunnerError::TransportClosed(
        "transport event channel dropped".to_string(),
    ));
}

fn handle_message(
    message: RunnerMessage,
    transport: &Arc<dyn Transport>,
    dispatcher: &Arc<ExecutionDispatcher>,
    pipeline: &Arc<InvocationPipeline>,
) {
    match message {
        RunnerMessage::Log {
            level,
            message,
            exception,
            source,
        } => {
            emit_runner_log(&level, &message, exception.as_deref(), source.as_deref());
        }
        RunnerMessage::ExecResult { id, result, error } => {
            dispatcher.complete(&id, result, error);
        }
        RunnerMessage::InvokeRequest {
            id,
            target,
            method,
            handle_id,
            args,
        } => {
            // 工作任务并发处理：脚本可在等待结果的同时继续发起回调
            let transport = transport.clone();
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                let outcome = pipeline
                    .invoke_operator(&target, &method, handle_id.as_deref(), args)
                    .await;
                send_invoke_result(&transport, &id, outcome.map_err(|e| e.to_string())).await;
            });
        }
        RunnerMessage::McpInvokeRequest {
            id,
            server,
            tool,
            arguments,
        } => {
            let transport = transport.clone();
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                let outcome = pipeline
                    .invoke_tool(&server, &tool, arguments)
                    .await;
                send_invoke_result(&transport, &id, outcome.map_err(|e| e.to_string())).await;
            });
        }
        RunnerMessage::ExecRequest { id, .. } | RunnerMessage::InvokeResult { id, .. } => {
            tracing::warn!(%id, "ignoring runner message with wrong direction");
        }
    }
}

async fn send_invoke_result(
    transport: &Arc<dyn Transport>,
    id: &str,
    outcome: Result<Value, String>,
) {
    let reply = match outcome {
        Ok(value) => RunnerMessage::invoke_ok(id, value),
        Err(error) => RunnerMessage::invoke_err(id, error),
    };
    match reply.encode() {
        Ok(line) => {
            if let Err(e) = transport.send(&line).await {
                tracing::warn!(%id, error = %e, "failed to send invoke-result");
            }
        }
        Err(e) => tracing::error!(%id, error = %e, "failed to encode invoke-result"),
    }
}
