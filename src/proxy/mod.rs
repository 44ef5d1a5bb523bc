//! 代理面：脚本时可见的宿主方法桩
//!
//! 每会话构建一次的不可变三元组：运行时代理文本（拼在用户脚本前）、签名文本
//! （给 Script 智能体看）、方法缓存（调用期查找）。

pub mod builder;

use std::collections::HashSet;
use std::sync::Arc;

use crate::invoke::{HandleTable, MethodCache};

pub use builder::ProxyBuilder;

/// 代理束
pub struct ProxyBundle {
    /// 运行时代理文本：宿主绑定桩开头，之后是 DTO 数据类与代理类
    pub runtime_text: String,
    /// 签名文本：同一组声明，无方法体，带人类可读描述
    pub signatures_text: String,
    /// 方法缓存（可能经 additional_method_filter 过滤）
    pub cache: Arc<MethodCache>,
}

impl std::fmt::Debug for ProxyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyBundle").finish_non_exhaustive()
    }
}

impl ProxyBundle {
    /// 运行时文本中的 using 行；用于丢弃脚本里的重复 import
    pub fn prelude_usings(&self) -> HashSet<String> {
        self.runtime_text
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with("using "))
            .map(str::to_string)
            .collect()
    }

    /// 拼出最终执行文本：代理文本 + 存活实例声明 + 空行 + 用户脚本
    ///
    /// 每个存活的非根实例声明一个变量，变量名为类型名首字母小写，
    /// 同类型多实例从第二个起加序号；根类型无参构造。
    pub fn compose_script(&self, handles: &HandleTable, user_script: &str) -> String {
        let mut text = String::with_capacity(self.runtime_text.len() + user_script.len() + 256);
        text.push_str(&self.runtime_text);
        text.push('\n');

        for type_name in handles.root_types() {
            text.push_str(&format!(
                "{type_name} {} = new {type_name}();\n",
                camel_case(&type_name)
            ));
        }

        let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for (handle, type_name) in handles.live_instances() {
            let n = counts.entry(type_name.clone()).or_insert(0);
            *n += 1;
            let variable = if *n == 1 {
                camel_case(&type_name)
            } else {
                format!("{}{}", camel_case(&type_name), n)
            };
            text.push_str(&format!(
                "{type_name} {variable} = new {type_name}(\"{handle}\");\n"
            ));
        }

        text.push('\n');
        text.push_str(user_script);
        text
    }
}

/// 类型名 → 变量名：首字母小写
pub(crate) fn camel_case(type_name: &str) -> String {
    let mut chars = type_name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
