//! 智能体对话线程
//!
//! 一轮用户请求内由三个智能体共享的只追加消息列表；最近一条 User 消息即「有效任务」，
//! 除非 Reception 路由给出了改写后的任务。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 对话线程：只追加，线程内消息按时间顺序排列
#[derive(Clone, Debug, Default)]
pub struct AgentThread {
    messages: Vec<Message>,
}

impl AgentThread {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从既有消息列表创建（send(messages) / stream(messages) 入口）
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 最近一条 User 消息内容，作为默认的有效任务
    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_user_content() {
        let mut thread = AgentThread::new();
        thread.push(Message::system("sys"));
        thread.push(Message::user("first"));
        thread.push(Message::assistant("reply"));
        thread.push(Message::user("second"));
        assert_eq!(thread.last_user_content(), Some("second"));
    }
}
