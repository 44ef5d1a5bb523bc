//! Explainer 智能体
//!
//! 把脚本的原始结果转成面向用户的说明。回复为空白时回退为原始结果并记一条 info；
//! 流式变体边转发 Token 边累积，供调用方把完整回复追加进线程。

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::agents::Message;
use crate::core::OrchestratorError;
use crate::llm::LlmClient;

/// Explainer 智能体
pub struct ExplainerAgent {
    llm: Arc<dyn LlmClient>,
    instructions: String,
}

impl ExplainerAgent {
    pub fn new(llm: Arc<dyn LlmClient>, instructions: impl Into<String>) -> Self {
        Self {
            llm,
            instructions: instructions.into(),
        }
    }

    /// 组装 `<task>…</task><result>…</result>` 提示
    pub fn build_prompt(task: &str, raw_result: &str) -> String {
        format!("<task>\n{task}\n</task>\n<result>\n{raw_result}\n</result>")
    }

    fn build_messages(&self, task: &str, raw_result: &str) -> Vec<Message> {
        vec![
            Message::system(&self.instructions),
            Message::user(Self::build_prompt(task, raw_result)),
        ]
    }

    /// 非流式解释；空白回复回退为 raw_result
    pub async fn explain(&self, task: &str, raw_result: &str) -> Result<String, OrchestratorError> {
        let reply = self
            .llm
            .complete(&self.build_messages(task, raw_result))
            .await
            .map_err(OrchestratorError::Llm)?;
        if reply.trim().is_empty() {
            tracing::info!("Explainer returned empty reply; falling back to raw result");
            return Ok(raw_result.to_string());
        }
        Ok(reply)
    }

    /// 流式解释：Token 边到边写入 tx，返回累积的完整回复；空白回复回退为 raw_result
    pub async fn explain_stream(
        &self,
        task: &str,
        raw_result: &str,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Result<String, OrchestratorError> {
        let mut stream = self
            .llm
            .complete_stream(&self.build_messages(task, raw_result))
            .await
            .map_err(OrchestratorError::Llm)?;

        let mut accumulated = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(OrchestratorError::Llm)?;
            accumulated.push_str(&chunk);
            let _ = tx.send(chunk);
        }

        if accumulated.trim().is_empty() {
            tracing::info!("Explainer returned empty reply; falling back to raw result");
            let _ = tx.send(raw_result.to_string());
            return Ok(raw_result.to_string());
        }
        Ok(accumulated)
    }
}
