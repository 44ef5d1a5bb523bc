//! 脚本校验：执行前的结构化检查
//!
//! 默认实现拒绝含禁用子串的脚本（反射、进程创建、环境退出等）；
//! 配置可追加关键字。每次执行尝试（含修复）前都会过一遍校验。

use std::collections::HashSet;

/// 内置禁用子串（即使配置为空也生效）
const BUILTIN_FORBIDDEN: &[&str] = &[
    "System.Reflection",
    "Process.Start",
    "Environment.Exit",
    "AppDomain",
    "DllImport",
    "Assembly.Load",
    "unsafe",
];

/// 校验器 trait：None 表示接受，Some(错误文本) 表示拒绝
pub trait ScriptValidator: Send + Sync {
    fn validate(&self, script: &str) -> Option<String>;
}

/// 关键字黑名单校验器；匹配不区分大小写
pub struct KeywordValidator {
    forbidden: HashSet<String>,
}

impl KeywordValidator {
    /// 内置黑名单 + 配置追加项
    pub fn new(extra_keywords: &[String]) -> Self {
        let mut forbidden: HashSet<String> = BUILTIN_FORBIDDEN
            .iter()
            .map(|s| s.to_lowercase())
            .collect();
        forbidden.extend(
            extra_keywords
                .iter()
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.to_lowercase()),
        );
        Self { forbidden }
    }
}

impl Default for KeywordValidator {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl ScriptValidator for KeywordValidator {
    fn validate(&self, script: &str) -> Option<String> {
        let lower = script.to_lowercase();
        for keyword in &self.forbidden {
            if lower.contains(keyword.as_str()) {
                return Some(format!("script contains forbidden keyword `{keyword}`"));
            }
        }
        None
    }
}

/// 全通过校验器（execute_script_direct 关闭校验时使用）
#[derive(Debug, Default)]
pub struct AcceptAllValidator;

impl ScriptValidator for AcceptAllValidator {
    fn validate(&self, _script: &str) -> Option<String> {
        None
    }
}
