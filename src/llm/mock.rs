//! Mock LLM 客户端（用于测试，无需 API）
//!
//! ScriptedLlmClient 按入队顺序回放预设回复，complete_stream 逐字符吐出，
//! 便于测试路由缓冲与流式行为；EchoLlmClient 原样回显最后一条 User 消息。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::agents::{Message, Role};
use crate::llm::{LlmClient, TokenStream};

/// 脚本化客户端：每次调用弹出队首回复，并记录收到的消息列表供断言
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<String>>,
    /// 每次调用收到的完整消息列表
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(replies: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 追加一条预设回复
    pub fn enqueue(&self, reply: impl Into<String>) {
        self.replies
            .lock()
            .expect("replies lock")
            .push_back(reply.into());
    }

    /// 已发生的调用次数
    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    /// 第 n 次调用收到的消息列表
    pub fn call_messages(&self, n: usize) -> Vec<Message> {
        self.calls
            .lock()
            .expect("calls lock")
            .get(n)
            .cloned()
            .unwrap_or_default()
    }

    fn next_reply(&self, messages: &[Message]) -> Result<String, String> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(messages.to_vec());
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .ok_or_else(|| "ScriptedLlmClient: no replies left".to_string())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.next_reply(messages)
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String> {
        let content = self.next_reply(messages)?;
        // 逐字符吐出，模拟最细粒度的流式输出
        let chunks: Vec<Result<String, String>> =
            content.chars().map(|c| Ok(c.to_string())).collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// 回显客户端：原样返回最后一条 User 消息内容
#[derive(Debug, Default)]
pub struct EchoLlmClient;

#[async_trait]
impl LlmClient for EchoLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        Ok(messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default())
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String> {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }
}
