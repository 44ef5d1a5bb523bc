//! 编排器构建器
//!
//! 统一装配：配置校验、三个智能体（可分别指定 LLM）、Operator 目录与根实例、
//! 工具服务、校验器、调度器、方法过滤。build 时启动代理束的异步构建任务，
//! 其完成由首个回合惰性等待。

use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell, RwLock};

use crate::agents::{prompts, ExplainerAgent, ReceptionAgent, ScriptAgent};
use crate::config::{AppConfig, ExecutionMode};
use crate::core::orchestrator::{OrchestratorInner, ProxyState, RunnerSettings};
use crate::core::{Orchestrator, OrchestratorError, SessionSupervisor};
use crate::invoke::{
    HandleTable, InvocationScheduler, Operator, OperatorCatalog, PassThroughScheduler, ToolClient,
    ToolServerRegistry,
};
use crate::llm::LlmClient;
use crate::proxy::builder::MethodFilter;
use crate::proxy::ProxyBuilder;
use crate::runner::ScriptEvaluator;
use crate::validator::{KeywordValidator, ScriptValidator};

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    reception_llm: Option<Arc<dyn LlmClient>>,
    script_llm: Option<Arc<dyn LlmClient>>,
    explainer_llm: Option<Arc<dyn LlmClient>>,
    catalog: OperatorCatalog,
    root_instances: Vec<Arc<dyn Operator>>,
    tool_clients: Vec<Arc<dyn ToolClient>>,
    validator: Option<Arc<dyn ScriptValidator>>,
    evaluator: Option<Arc<dyn ScriptEvaluator>>,
    scheduler: Option<Arc<dyn InvocationScheduler>>,
    method_filter: Option<MethodFilter>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            reception_llm: None,
            script_llm: None,
            explainer_llm: None,
            catalog: OperatorCatalog::new(),
            root_instances: Vec::new(),
            tool_clients: Vec::new(),
            validator: None,
            evaluator: None,
            scheduler: None,
            method_filter: None,
        }
    }

    /// 三个智能体共用的 LLM 客户端
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_reception_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.reception_llm = Some(llm);
        self
    }

    pub fn with_script_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.script_llm = Some(llm);
        self
    }

    pub fn with_explainer_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.explainer_llm = Some(llm);
        self
    }

    /// Operator 目录（类型、方法、DTO 模型）
    pub fn with_catalog(mut self, catalog: OperatorCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// 注册一个根实例（哨兵 Handle 即类型名）
    pub fn with_root_instance(mut self, instance: Arc<dyn Operator>) -> Self {
        self.root_instances.push(instance);
        self
    }

    pub fn with_tool_client(mut self, client: Arc<dyn ToolClient>) -> Self {
        self.tool_clients.push(client);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn ScriptValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// 进程内模式的脚本求值器
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// 调用调度器；默认直通，UI 宿主可换亲和调度器
    pub fn with_scheduler(mut self, scheduler: Arc<dyn InvocationScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// 叠加在方法缓存上的过滤视图（additional_method_filter）
    pub fn with_method_filter(mut self, filter: MethodFilter) -> Self {
        self.method_filter = Some(filter);
        self
    }

    /// 装配编排器；须在 tokio 运行时内调用（此处启动代理束构建任务）
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let llm = self
            .llm
            .clone()
            .or_else(|| self.reception_llm.clone())
            .ok_or_else(|| OrchestratorError::Config("an LLM client is required".to_string()))?;

        let runner_cfg = &self.config.runner;
        if runner_cfg.use_remote && runner_cfg.remote_base_url.is_none() {
            return Err(OrchestratorError::Config(
                "remote runner enabled without a base URL".to_string(),
            ));
        }
        if !runner_cfg.use_remote {
            match runner_cfg.execution_mode {
                ExecutionMode::ExternalProcess if runner_cfg.executable_path.is_none() => {
                    return Err(OrchestratorError::Config(
                        "external process mode requires a runner executable path".to_string(),
                    ));
                }
                ExecutionMode::InProcess if self.evaluator.is_none() => {
                    return Err(OrchestratorError::Config(
                        "in-process mode requires a script evaluator".to_string(),
                    ));
                }
                _ => {}
            }
        }
        if self.catalog.is_empty() {
            return Err(OrchestratorError::Config(
                "no operators registered".to_string(),
            ));
        }

        let handles = Arc::new(HandleTable::new());
        for instance in self.root_instances {
            handles.register_root(instance);
        }

        let mut tool_registry = ToolServerRegistry::new();
        for client in self.tool_clients {
            tool_registry.register(client);
        }
        let tool_registry = Arc::new(tool_registry);

        let prompts_cfg = &self.config.prompts;
        let reception = ReceptionAgent::new(
            self.reception_llm.unwrap_or_else(|| llm.clone()),
            prompts_cfg
                .reception_instructions
                .clone()
                .unwrap_or_else(|| prompts::RECEPTION_INSTRUCTIONS.to_string()),
        );
        let script_agent = ScriptAgent::new(
            self.script_llm.unwrap_or_else(|| llm.clone()),
            prompts_cfg
                .script_instructions
                .clone()
                .unwrap_or_else(|| prompts::SCRIPT_INSTRUCTIONS.to_string()),
        );
        let explainer = ExplainerAgent::new(
            self.explainer_llm.unwrap_or_else(|| llm.clone()),
            prompts_cfg
                .explainer_instructions
                .clone()
                .unwrap_or_else(|| prompts::EXPLAINER_INSTRUCTIONS.to_string()),
        );

        let validator: Arc<dyn ScriptValidator> = self.validator.unwrap_or_else(|| {
            Arc::new(KeywordValidator::new(
                &self.config.validator.forbidden_keywords,
            ))
        });
        let scheduler: Arc<dyn InvocationScheduler> = self
            .scheduler
            .unwrap_or_else(|| Arc::new(PassThroughScheduler));

        // 代理束异步构建：完成由首个回合惰性等待
        let mut proxy_builder =
            ProxyBuilder::new(Arc::new(self.catalog), tool_registry.clone());
        if let Some(filter) = self.method_filter {
            proxy_builder = proxy_builder.with_method_filter(filter);
        }
        let build_task = tokio::spawn(async move { proxy_builder.build().await });

        let inner = OrchestratorInner {
            max_fix_attempts: self.config.orchestrator.max_fix_attempts,
            skip_reception: self.config.orchestrator.skip_reception,
            skip_explainer: self.config.orchestrator.skip_explainer,
            reception,
            script_agent,
            explainer,
            validator,
            handles,
            tool_registry,
            scheduler,
            tool_timeout_secs: self.config.tools.invoke_timeout_secs,
            runner_settings: RunnerSettings {
                mode: runner_cfg.execution_mode.clone(),
                executable_path: runner_cfg.executable_path.clone(),
                container_image: runner_cfg.container_image.clone(),
                use_remote: runner_cfg.use_remote,
                remote_base_url: runner_cfg.remote_base_url.clone(),
                evaluator: self.evaluator,
            },
            proxy: ProxyState {
                task: Mutex::new(Some(build_task)),
                bundle: OnceCell::new(),
            },
            pipeline: OnceCell::new(),
            runner: RwLock::new(None),
            supervisor: SessionSupervisor::new(),
        };
        Ok(Orchestrator::from_inner(Arc::new(inner)))
    }
}
