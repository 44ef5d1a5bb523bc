//! 核心编排层：错误分类、回合上下文、修复循环、会话监管与编排器门面

pub mod builder;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod repair;
pub mod session_supervisor;

pub use builder::OrchestratorBuilder;
pub use context::{OrchestrationResult, TurnContext, TurnRoute};
pub use error::{is_policy_refusal, OrchestratorError};
pub use orchestrator::{Orchestrator, StreamEvent};
pub use repair::{repair_loop, RepairContext, RepairOutcome};
pub use session_supervisor::SessionSupervisor;
