//! OpenAI 兼容 API 客户端
//!
//! 从 [llm] 配置段构造，可指向任意 OpenAI 兼容端点。complete 与 complete_stream
//! 共用 chat_request 组装请求（只差 stream 标志）；消息转换失败作为错误上抛，
//! 不在客户端内部 panic。流式路径逐 Token 转发 delta content。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::agents::{Message, Role};
use crate::config::LlmSection;
use crate::llm::{LlmClient, TokenStream};
use crate::observability::Metrics;

/// Token 使用统计（累计值）；total 在读取时由两个计数相加得出
#[derive(Debug, Default)]
pub struct TokenUsage {
    prompt: AtomicU64,
    completion: AtomicU64,
}

impl TokenUsage {
    pub fn record(&self, prompt: u64, completion: u64) {
        self.prompt.fetch_add(prompt, Ordering::Relaxed);
        self.completion.fetch_add(completion, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn snapshot(&self) -> (u64, u64, u64) {
        let prompt = self.prompt.load(Ordering::Relaxed);
        let completion = self.completion.load(Ordering::Relaxed);
        (prompt, completion, prompt + completion)
    }
}

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    usage: TokenUsage,
}

impl OpenAiClient {
    /// 从 [llm] 配置段构造；api_key 缺省时读 OPENAI_API_KEY 环境变量
    pub fn from_config(section: &LlmSection, api_key: Option<String>) -> Self {
        let api_key = api_key
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base_url) = &section.base_url {
            config = config.with_api_base(base_url);
        }
        Self {
            client: Client::with_config(config),
            model: section.model.clone(),
            usage: TokenUsage::default(),
        }
    }

    /// 统一的请求组装；消息转换失败直接上抛
    fn chat_request(
        &self,
        messages: &[Message],
        stream: bool,
    ) -> Result<CreateChatCompletionRequest, String> {
        let mut converted = Vec::with_capacity(messages.len());
        for message in messages {
            converted.push(to_chat_message(message)?);
        }
        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(converted)
            .stream(stream)
            .build()
            .map_err(|e| e.to_string())
    }
}

/// 线程消息 → API 消息
fn to_chat_message(message: &Message) -> Result<ChatCompletionRequestMessage, String> {
    let content = message.content.clone();
    let converted: ChatCompletionRequestMessage = match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()
            .map_err(|e| e.to_string())?
            .into(),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()
            .map_err(|e| e.to_string())?
            .into(),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()
            .map_err(|e| e.to_string())?
            .into(),
    };
    Ok(converted)
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.snapshot()
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let request = self.chat_request(messages, false)?;

        let start = Instant::now();
        let response = self.client.chat().create(request).await;
        Metrics::global()
            .llm
            .record_call(response.is_ok(), start.elapsed());
        let response = response.map_err(|e| e.to_string())?;

        if let Some(usage) = &response.usage {
            self.usage
                .record(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        // 取首条 choice；无 content 视为空回复，由上层的空回复回退处理
        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String> {
        let request = self.chat_request(messages, true)?;

        let start = Instant::now();
        let stream = self.client.chat().create_stream(request).await;
        Metrics::global()
            .llm
            .record_call(stream.is_ok(), start.elapsed());
        let stream = stream.map_err(|e| e.to_string())?;

        let mapped = stream.filter_map(|item| async move {
            match item {
                Ok(chunk) => chunk
                    .choices
                    .first()
                    .and_then(|c| c.delta.content.clone())
                    .filter(|s| !s.is_empty())
                    .map(Ok),
                Err(e) => Some(Err(e.to_string())),
            }
        });
        Ok(Box::pin(mapped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_maps_roles_and_stream_flag() {
        let client = OpenAiClient::from_config(&LlmSection::default(), Some("sk-test".into()));
        let messages = [
            Message::system("instructions"),
            Message::user("hello"),
            Message::assistant("hi"),
        ];
        let request = client.chat_request(&messages, true).unwrap();
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.stream, Some(true));
        assert_eq!(request.model, "gpt-4o-mini");

        let request = client.chat_request(&messages, false).unwrap();
        assert_eq!(request.stream, Some(false));
    }

    #[test]
    fn test_token_usage_snapshot() {
        let usage = TokenUsage::default();
        usage.record(10, 5);
        usage.record(1, 2);
        assert_eq!(usage.snapshot(), (11, 7, 18));
    }
}
