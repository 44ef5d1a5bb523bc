//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MANTIS__*` 覆盖（双下划线表示嵌套，
//! 如 `MANTIS__RUNNER__EXECUTION_MODE=container`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub validator: ValidatorSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub prompts: PromptsSection,
}

/// [app] 段：应用名
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：提供商与模型
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 提供商：openai 兼容端点或 mock
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// OpenAI 兼容 base_url（为空时用官方端点）
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_llm_provider() -> String {
    "openai".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            base_url: None,
        }
    }
}

/// [orchestrator] 段：修复预算与智能体开关
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// 修复重试预算；总生成次数 = 该值 + 1
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: usize,
    /// 跳过 Reception 路由，所有请求直接走脚本路径
    #[serde(default)]
    pub skip_reception: bool,
    /// 跳过 Explainer，原样返回脚本结果
    #[serde(default)]
    pub skip_explainer: bool,
}

fn default_max_fix_attempts() -> usize {
    2
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_fix_attempts: default_max_fix_attempts(),
            skip_reception: false,
            skip_explainer: false,
        }
    }
}

/// 脚本执行隔离模式
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub enum ExecutionMode {
    /// 进程内执行（无传输层）
    #[serde(rename = "in_process")]
    #[default]
    InProcess,
    /// 子进程 Runner（stdio NDJSON）
    #[serde(rename = "external_process")]
    ExternalProcess,
    /// 容器子进程 Runner（同一线协议，docker 启动器）
    #[serde(rename = "container")]
    Container,
}

/// [runner] 段：执行模式、子进程路径、容器镜像、远程 Runner
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSection {
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// 子进程模式下的 Runner 可执行文件路径
    #[serde(default)]
    pub executable_path: Option<PathBuf>,
    /// 容器模式下的镜像名（覆盖默认镜像）
    #[serde(default = "default_container_image")]
    pub container_image: String,
    /// 启用远程 Runner（长连接双向流）
    #[serde(default)]
    pub use_remote: bool,
    /// 远程 Runner 地址；use_remote 为真时必填
    #[serde(default)]
    pub remote_base_url: Option<String>,
}

fn default_container_image() -> String {
    "mantis-runner:latest".to_string()
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            executable_path: None,
            container_image: default_container_image(),
            use_remote: false,
            remote_base_url: None,
        }
    }
}

/// [validator] 段：脚本关键字黑名单（与内置黑名单合并）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ValidatorSection {
    #[serde(default)]
    pub forbidden_keywords: Vec<String>,
}

/// [tools] 段：外部工具调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_tool_timeout_secs")]
    pub invoke_timeout_secs: u64,
}

fn default_tool_timeout_secs() -> u64 {
    60
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            invoke_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// [prompts] 段：三个智能体的指令覆盖（为空时用内置模板）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PromptsSection {
    #[serde(default)]
    pub reception_instructions: Option<String>,
    #[serde(default)]
    pub script_instructions: Option<String>,
    #[serde(default)]
    pub explainer_instructions: Option<String>,
}

/// 从 config 目录加载配置，环境变量 MANTIS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MANTIS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MANTIS")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
