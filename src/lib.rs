//! Mantis - LLM 脚本编排引擎
//!
//! 让 LLM 通过「写短小的命令式脚本」完成用户任务：脚本在沙箱 Runner 中执行，
//! 通过 NDJSON 协议回调宿主 Operator 方法与外部工具，失败时进入修复循环。
//!
//! 模块划分：
//! - **agents**: 三智能体流水线（Reception 路由 / Script 生成 / Explainer 解释）与对话线程
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器门面、修复循环、错误分类、会话监管
//! - **invoke**: 调用管线（Operator 方法缓存 / Handle 表 / 工具服务注册表 / 参数编解码）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Scripted Mock）
//! - **observability**: 日志初始化与全局指标
//! - **protocol**: Runner 线协议编解码（五类消息 + mcp 变体）
//! - **proxy**: 代理面生成（运行时代理文本 / 签名文本 / 方法缓存）
//! - **runner**: 传输层（stdio / 容器 / 远程）、执行分发器、协议 Runner 与进程内 Runner
//! - **validator**: 脚本校验（默认关键字黑名单）

pub mod agents;
pub mod config;
pub mod core;
pub mod invoke;
pub mod llm;
pub mod observability;
pub mod protocol;
pub mod proxy;
pub mod runner;
pub mod validator;
