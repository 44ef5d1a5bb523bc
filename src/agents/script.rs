//! Script 生成智能体
//!
//! 持有 LLM、指令与签名文本；generate 拼 system（指令 + Available functions）与对话线程，
//! 回复经 normalize_reply 规整：去围栏、去注释、去 prelude 已有的 using、压缩空行。

use std::collections::HashSet;
use std::sync::Arc;

use crate::agents::{AgentThread, Message};
use crate::core::OrchestratorError;
use crate::llm::LlmClient;

/// Script 智能体
pub struct ScriptAgent {
    llm: Arc<dyn LlmClient>,
    instructions: String,
}

impl ScriptAgent {
    pub fn new(llm: Arc<dyn LlmClient>, instructions: impl Into<String>) -> Self {
        Self {
            llm,
            instructions: instructions.into(),
        }
    }

    /// 生成一个候选脚本（已规整）；thread 应包含任务与此前的纠错回合
    pub async fn generate(
        &self,
        thread: &AgentThread,
        signatures: &str,
        prelude_usings: &HashSet<String>,
    ) -> Result<String, OrchestratorError> {
        let system = format!(
            "{}\n\nAvailable functions:\n{}",
            self.instructions, signatures
        );
        let mut messages = vec![Message::system(system)];
        messages.extend_from_slice(thread.messages());

        tracing::debug!(task = ?thread.last_user_content(), "script agent input");
        let reply = self
            .llm
            .complete(&messages)
            .await
            .map_err(OrchestratorError::Llm)?;
        tracing::debug!(reply = %reply, "script agent output");

        Ok(normalize_reply(&reply, prelude_usings))
    }
}

/// 规整智能体回复为可执行脚本体
pub fn normalize_reply(reply: &str, prelude_usings: &HashSet<String>) -> String {
    let without_fences = strip_code_fences(reply);
    let without_comments = strip_comments(&without_fences);

    let mut lines = Vec::new();
    let mut last_blank = false;
    for line in without_comments.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("using ") && prelude_usings.contains(trimmed) {
            continue;
        }
        let blank = trimmed.is_empty();
        if blank && last_blank {
            continue;
        }
        last_blank = blank;
        lines.push(line.trim_end());
    }
    lines.join("\n").trim().to_string()
}

/// 去掉 Markdown 代码围栏行（``` 或 ```lang），保留围栏内外的内容
fn strip_code_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 去掉行注释与块注释；跳过字符串字面量内部
fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;

    while let Some(c) = chars.next() {
        if in_line_comment {
            if c == '\n' {
                in_line_comment = false;
                out.push(c);
            }
            continue;
        }
        if in_block_comment {
            if c == '*' && chars.peek() == Some(&'/') {
                chars.next();
                in_block_comment = false;
            }
            continue;
        }
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                chars.next();
                in_line_comment = true;
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                in_block_comment = true;
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usings(lines: &[&str]) -> HashSet<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_strip_fences() {
        let reply = "```csharp\nreturn 1;\n```";
        assert_eq!(normalize_reply(reply, &HashSet::new()), "return 1;");
    }

    #[test]
    fn test_strip_line_and_block_comments() {
        let reply = "var x = 1; // inline\n/* block\nspanning */\nreturn x;";
        assert_eq!(
            normalize_reply(reply, &HashSet::new()),
            "var x = 1;\n\nreturn x;"
        );
    }

    #[test]
    fn test_comment_markers_inside_strings_survive() {
        let reply = r#"return Concatenate("http://a", "b /* c */");"#;
        assert_eq!(normalize_reply(reply, &HashSet::new()), reply);
    }

    #[test]
    fn test_duplicate_usings_dropped() {
        let prelude = usings(&["using System;"]);
        let reply = "using System;\nusing System.Text;\nreturn 1;";
        assert_eq!(
            normalize_reply(reply, &prelude),
            "using System.Text;\nreturn 1;"
        );
    }

    #[test]
    fn test_blank_lines_collapsed() {
        let reply = "var a = 1;\n\n\n\nreturn a;";
        assert_eq!(normalize_reply(reply, &HashSet::new()), "var a = 1;\n\nreturn a;");
    }
}
