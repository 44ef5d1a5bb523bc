//! Reception 路由智能体
//!
//! 把用户消息分类为 answer（直接回复）或 script（交给脚本智能体，任务可能被改写进
//! `<task>…</task>` 块）。流式场景下用 RouteFilter 缓冲，保证用户看不到路由标记。

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::agents::{AgentThread, Message};
use crate::core::OrchestratorError;
use crate::llm::LlmClient;

/// 路由结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// 直接把回复文本发给用户
    Answer(String),
    /// 走脚本路径；task 为改写后（或原始）的任务描述
    Script { task: String },
}

/// 解析 Reception 回复：
/// - 以 `script` 开头（不区分大小写）且含 `<task>` 块 → script，任务取块内文本
/// - 以 `script` 开头无块 / 恰好为 `script` / 全空白 → script，任务取原始输入
/// - 其余 → answer，取整段修剪后的回复
pub fn interpret_reply(reply: &str, original_task: &str) -> RouteDecision {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return RouteDecision::Script {
            task: original_task.to_string(),
        };
    }
    if trimmed.to_lowercase().starts_with("script") {
        if let Some(start) = reply.find("<task>") {
            if let Some(end) = reply.find("</task>") {
                if end > start {
                    let inner = &reply[start + "<task>".len()..end];
                    return RouteDecision::Script {
                        task: inner.trim().to_string(),
                    };
                }
            }
        }
        return RouteDecision::Script {
            task: original_task.to_string(),
        };
    }
    RouteDecision::Answer(trimmed.to_string())
}

/// 流式路由过滤器
///
/// 在能判定回复是否以 `script` 开头之前缓冲所有 Token，期间对外零输出；
/// 判定为 answer 后先冲刷缓冲再逐块透传，判定为 script 后吞掉全部输出。
#[derive(Debug, Default)]
pub struct RouteFilter {
    seen: String,
    /// None 未判定；Some(true) script；Some(false) answer
    decided: Option<bool>,
}

impl RouteFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一个 Token，返回此刻可以对外输出的文本块
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.seen.push_str(chunk);
        match self.decided {
            Some(false) => vec![chunk.to_string()],
            Some(true) => Vec::new(),
            None => {
                let lead = self.seen.trim_start().to_lowercase();
                if lead.is_empty() {
                    return Vec::new();
                }
                if lead.len() < "script".len() {
                    if "script".starts_with(lead.as_str()) {
                        // 仍可能是路由标记，继续缓冲
                        return Vec::new();
                    }
                    self.decided = Some(false);
                    return vec![self.seen.clone()];
                }
                if lead.starts_with("script") {
                    self.decided = Some(true);
                    Vec::new()
                } else {
                    self.decided = Some(false);
                    vec![self.seen.clone()]
                }
            }
        }
    }

    /// 是否已判定；Some(true) 表示 script 路径
    pub fn decision(&self) -> Option<bool> {
        self.decided
    }

    /// 流结束后给出最终路由（未判定的短回复在此落盘）
    pub fn finish(self, original_task: &str) -> RouteDecision {
        interpret_reply(&self.seen, original_task)
    }
}

/// Reception 智能体：持有 LLM 与路由指令
pub struct ReceptionAgent {
    llm: Arc<dyn LlmClient>,
    instructions: String,
}

impl ReceptionAgent {
    pub fn new(llm: Arc<dyn LlmClient>, instructions: impl Into<String>) -> Self {
        Self {
            llm,
            instructions: instructions.into(),
        }
    }

    fn build_messages(&self, thread: &AgentThread) -> Vec<Message> {
        let mut messages = vec![Message::system(&self.instructions)];
        messages.extend_from_slice(thread.messages());
        messages
    }

    /// 非流式路由
    pub async fn route(
        &self,
        thread: &AgentThread,
        original_task: &str,
    ) -> Result<RouteDecision, OrchestratorError> {
        let reply = self
            .llm
            .complete(&self.build_messages(thread))
            .await
            .map_err(OrchestratorError::Llm)?;
        let decision = interpret_reply(&reply, original_task);
        tracing::debug!(reply = %reply, ?decision, "reception routed");
        Ok(decision)
    }

    /// 流式路由：answer 路径的 Token 经 RouteFilter 过滤后写入 tx，script 路径零输出
    pub async fn route_stream(
        &self,
        thread: &AgentThread,
        original_task: &str,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Result<RouteDecision, OrchestratorError> {
        let mut stream = self
            .llm
            .complete_stream(&self.build_messages(thread))
            .await
            .map_err(OrchestratorError::Llm)?;

        let mut filter = RouteFilter::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(OrchestratorError::Llm)?;
            for piece in filter.push(&chunk) {
                // 接收端关闭（取消）时停止转发，剩余 Token 只用于路由判定
                let _ = tx.send(piece);
            }
        }
        Ok(filter.finish(original_task))
    }
}
