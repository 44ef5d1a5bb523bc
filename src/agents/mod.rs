//! 三智能体流水线：Reception 路由 / Script 生成 / Explainer 解释
//!
//! 三者共享同一 AgentThread；Reception 决定 answer/script 路径，
//! Script 产出候选脚本交给修复循环，Explainer 把原始结果转成用户可读文本。

pub mod explainer;
pub mod prompts;
pub mod reception;
pub mod script;
pub mod thread;

pub use explainer::ExplainerAgent;
pub use reception::{ReceptionAgent, RouteDecision, RouteFilter};
pub use script::ScriptAgent;
pub use thread::{AgentThread, Message, Role};
