//! 回合上下文与编排结果

use serde_json::Value;

use crate::agents::AgentThread;

/// 回合走过的路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRoute {
    /// Reception 直接回答
    Answer,
    /// 进入脚本路径
    Script,
}

/// 单个回合的编排上下文
pub struct TurnContext {
    /// 用户原始任务（线程中最近一条 User 消息）
    pub original_task: String,
    /// Reception 改写后的任务；None 表示沿用原始任务
    pub consolidated_task: Option<String>,
    pub skip_reception: bool,
    pub skip_explainer: bool,
    pub thread: AgentThread,
}

impl TurnContext {
    pub fn new(thread: AgentThread, skip_reception: bool, skip_explainer: bool) -> Self {
        let original_task = thread.last_user_content().unwrap_or_default().to_string();
        Self {
            original_task,
            consolidated_task: None,
            skip_reception,
            skip_explainer,
            thread,
        }
    }

    /// 修复循环使用的有效任务
    pub fn effective_task(&self) -> &str {
        self.consolidated_task
            .as_deref()
            .unwrap_or(&self.original_task)
    }
}

/// 一个回合的最终结果
#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    pub success: bool,
    pub route: TurnRoute,
    /// 发给用户的文本
    pub response: String,
    /// 脚本路径下的原始结果
    pub raw_result: Option<Value>,
    /// 最终采用（或最后尝试）的脚本
    pub script: Option<String>,
    /// 脚本智能体被调用的次数
    pub attempts: usize,
}

impl OrchestrationResult {
    pub fn answer(response: impl Into<String>) -> Self {
        Self {
            success: true,
            route: TurnRoute::Answer,
            response: response.into(),
            raw_result: None,
            script: None,
            attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::Message;

    #[test]
    fn test_effective_task_prefers_consolidated() {
        let mut thread = AgentThread::new();
        thread.push(Message::user("original"));
        let mut context = TurnContext::new(thread, false, false);
        assert_eq!(context.effective_task(), "original");
        context.consolidated_task = Some("rewritten".to_string());
        assert_eq!(context.effective_task(), "rewritten");
    }
}
