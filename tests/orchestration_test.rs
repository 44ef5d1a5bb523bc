//! 端到端编排测试
//!
//! 用脚本化 LLM 驱动三智能体流水线，进程内求值器把脚本文本映射为真实的
//! 调用管线回调（Handle 往返、DTO 编解码都走真实路径）。

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use mantis::agents::Message;
use mantis::config::AppConfig;
use mantis::core::{Orchestrator, OrchestratorBuilder, StreamEvent, TurnRoute};
use mantis::invoke::{
    HandlePolicy, InvocationPipeline, InvokeContext, InvokeError, MethodEntry, ModelDescriptor,
    Operator, OperatorCatalog, OperatorDescriptor, ParamDescriptor, ParamKind, ReturnKind,
};
use mantis::llm::{EchoLlmClient, LlmClient, ScriptedLlmClient, TokenStream};
use mantis::runner::ScriptEvaluator;

#[derive(Debug, Deserialize)]
struct TestModel {
    #[serde(rename = "A")]
    a: i64,
    #[serde(rename = "B")]
    b: i64,
}

struct TestRootOperator;

impl Operator for TestRootOperator {
    fn type_name(&self) -> &str {
        "TestRootOperator"
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

struct SimpleOperator;

impl Operator for SimpleOperator {
    fn type_name(&self) -> &str {
        "SimpleOperator"
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn test_catalog() -> OperatorCatalog {
    OperatorCatalog::new()
        .model(
            ModelDescriptor::new("TestModel")
                .field("A", "int")
                .field("B", "int"),
        )
        .operator(
            OperatorDescriptor::new("TestRootOperator", HandlePolicy::SelfRooted).method(
                MethodEntry::instance(
                    "TestRootOperator",
                    "GetSimpleOperator",
                    vec![],
                    ReturnKind::Operator("SimpleOperator".to_string()),
                    Arc::new(|cx: InvokeContext, _args| {
                        Box::pin(async move {
                            let handle = cx.handles.register(Arc::new(SimpleOperator));
                            Ok(json!(handle))
                        })
                    }),
                ),
            ),
        )
        .operator(
            OperatorDescriptor::new("SimpleOperator", HandlePolicy::HandleAssigned)
                .method(
                    MethodEntry::instance(
                        "SimpleOperator",
                        "AddNumbersAsync",
                        vec![ParamDescriptor::new(
                            "model",
                            ParamKind::Object("TestModel".to_string()),
                        )],
                        ReturnKind::Value("int".to_string()),
                        Arc::new(|_cx, args: Vec<Value>| {
                            Box::pin(async move {
                                let model: TestModel = serde_json::from_value(args[0].clone())
                                    .map_err(|e| InvokeError::Argument(e.to_string()))?;
                                Ok(json!(model.a + model.b))
                            })
                        }),
                    )
                    .asynchronous(),
                )
                .method(MethodEntry::instance(
                    "SimpleOperator",
                    "Concatenate",
                    vec![
                        ParamDescriptor::new("left", ParamKind::String),
                        ParamDescriptor::new("right", ParamKind::String),
                    ],
                    ReturnKind::Value("string".to_string()),
                    Arc::new(|_cx, args: Vec<Value>| {
                        Box::pin(async move {
                            let left = args[0].as_str().unwrap_or_default();
                            let right = args[1].as_str().unwrap_or_default();
                            Ok(json!(format!("{left}{right}")))
                        })
                    }),
                )),
        )
}

/// 把脚本文本映射为真实调用管线回调的求值器
struct ScenarioEvaluator {
    executions: AtomicUsize,
}

impl ScenarioEvaluator {
    fn new() -> Self {
        Self {
            executions: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ScriptEvaluator for ScenarioEvaluator {
    async fn eval(
        &self,
        code: &str,
        pipeline: Arc<InvocationPipeline>,
    ) -> Result<Value, String> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        // 用户脚本在拼接文本的最后一个非空行
        let script = code
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or_default();

        if script.contains("throw") {
            return Err("Exception: deliberate failure".to_string());
        }
        if script.contains("AddNumbers") {
            let captures = Regex::new(r"A\s*=\s*(\d+)\s*,\s*B\s*=\s*(\d+)")
                .unwrap()
                .captures(script)
                .ok_or("missing TestModel initializer")?;
            let model = json!({
                "A": captures[1].parse::<i64>().unwrap(),
                "B": captures[2].parse::<i64>().unwrap(),
            });
            // Handle 往返：根实例 → 子实例 Handle → 子实例方法
            let handle = pipeline
                .invoke_operator(
                    "TestRootOperator",
                    "GetSimpleOperator",
                    Some("TestRootOperator"),
                    vec![],
                )
                .await
                .map_err(|e| e.to_string())?;
            let handle = handle.as_str().ok_or("handle is not a string")?.to_string();
            return pipeline
                .invoke_operator("SimpleOperator", "AddNumbersAsync", Some(&handle), vec![model])
                .await
                .map_err(|e| e.to_string());
        }
        if script.contains("Concatenate") {
            let captures = Regex::new(r#"Concatenate\("([^"]*)"\s*,\s*"([^"]*)"\)"#)
                .unwrap()
                .captures(script)
                .ok_or("missing Concatenate arguments")?;
            let handle = pipeline
                .invoke_operator(
                    "TestRootOperator",
                    "GetSimpleOperator",
                    Some("TestRootOperator"),
                    vec![],
                )
                .await
                .map_err(|e| e.to_string())?;
            let handle = handle.as_str().ok_or("handle is not a string")?.to_string();
            return pipeline
                .invoke_operator(
                    "SimpleOperator",
                    "Concatenate",
                    Some(&handle),
                    vec![json!(&captures[1]), json!(&captures[2])],
                )
                .await
                .map_err(|e| e.to_string());
        }
        if let Some(captures) = Regex::new(r"return\s+(\d+);").unwrap().captures(script) {
            return Ok(json!(captures[1].parse::<i64>().unwrap()));
        }
        Ok(Value::Null)
    }
}

struct Scenario {
    orchestrator: Orchestrator,
    script_llm: Arc<ScriptedLlmClient>,
    evaluator: Arc<ScenarioEvaluator>,
}

fn build_scenario(
    reception_replies: &[&str],
    script_replies: &[&str],
    explainer: Arc<dyn LlmClient>,
    skip_reception: bool,
    skip_explainer: bool,
) -> Scenario {
    let mut config = AppConfig::default();
    config.orchestrator.max_fix_attempts = 2;
    config.orchestrator.skip_reception = skip_reception;
    config.orchestrator.skip_explainer = skip_explainer;
    config.validator.forbidden_keywords = vec!["BAD".to_string()];

    let reception_llm = Arc::new(ScriptedLlmClient::new(reception_replies.iter().copied()));
    let script_llm = Arc::new(ScriptedLlmClient::new(script_replies.iter().copied()));
    let evaluator = Arc::new(ScenarioEvaluator::new());

    let orchestrator = OrchestratorBuilder::new(config)
        .with_reception_llm(reception_llm)
        .with_script_llm(script_llm.clone())
        .with_explainer_llm(explainer)
        .with_catalog(test_catalog())
        .with_root_instance(Arc::new(TestRootOperator))
        .with_evaluator(evaluator.clone())
        .build()
        .expect("orchestrator should build");

    Scenario {
        orchestrator,
        script_llm,
        evaluator,
    }
}

#[tokio::test]
async fn test_add_numbers_end_to_end() {
    let scenario = build_scenario(
        &["script\n<task>\nsome task description\n</task>"],
        &["var s = testRootOperator.GetSimpleOperator(); return s.AddNumbers(new TestModel{A=2,B=3});"],
        Arc::new(EchoLlmClient),
        false,
        false,
    );

    let result = scenario
        .orchestrator
        .execute_turn(
            vec![Message::user("add two and three")],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.route, TurnRoute::Script);
    assert_eq!(result.raw_result, Some(json!(5)));
    assert_eq!(result.attempts, 1);
    // Echo Explainer 原样返回 <task>/<result> 提示
    assert_eq!(
        result.response,
        "<task>\nsome task description\n</task>\n<result>\n5\n</result>"
    );
}

#[tokio::test]
async fn test_concatenate_end_to_end() {
    let scenario = build_scenario(
        &["script\n<task>\nsome task description\n</task>"],
        &["var s = testRootOperator.GetSimpleOperator(); return s.Concatenate(\"hello\", \" world\");"],
        Arc::new(EchoLlmClient),
        false,
        false,
    );

    let result = scenario
        .orchestrator
        .execute_turn(
            vec![Message::user("concatenate the words")],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.raw_result, Some(json!("hello world")));
    assert_eq!(
        result.response,
        "<task>\nsome task description\n</task>\n<result>\nhello world\n</result>"
    );
}

#[tokio::test]
async fn test_validator_rejection_then_repair() {
    let scenario = build_scenario(
        &["script"],
        &["BAD return 1;", "return 2;"],
        Arc::new(EchoLlmClient),
        false,
        true,
    );

    let result = scenario
        .orchestrator
        .execute_turn(vec![Message::user("compute")], CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.raw_result, Some(json!(2)));
    assert_eq!(result.response, "2");
    assert_eq!(result.attempts, 2);
    // 恰好两次脚本智能体调用；被拒的脚本从未执行
    assert_eq!(scenario.script_llm.call_count(), 2);
    assert_eq!(scenario.evaluator.executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_runtime_error_then_repair() {
    let scenario = build_scenario(
        &["script"],
        &["throw();", "return 7;"],
        Arc::new(EchoLlmClient),
        false,
        true,
    );

    let result = scenario
        .orchestrator
        .execute_turn(vec![Message::user("compute")], CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.raw_result, Some(json!(7)));
    assert_eq!(result.attempts, 2);
    assert_eq!(scenario.evaluator.executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_direct_answer_never_executes() {
    let scenario = build_scenario(
        &["Plain answer with no script needed."],
        &[],
        Arc::new(EchoLlmClient),
        false,
        false,
    );

    let result = scenario
        .orchestrator
        .execute_turn(vec![Message::user("hello")], CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.route, TurnRoute::Answer);
    assert_eq!(result.response, "Plain answer with no script needed.");
    assert_eq!(result.attempts, 0);
    assert_eq!(scenario.script_llm.call_count(), 0);
    assert_eq!(scenario.evaluator.executions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_skip_reception_routes_directly() {
    // Reception LLM 无预设回复：若被调用会报错
    let scenario = build_scenario(&[], &["return 7;"], Arc::new(EchoLlmClient), true, true);

    let result = scenario
        .orchestrator
        .execute_turn(vec![Message::user("compute")], CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.raw_result, Some(json!(7)));
}

#[tokio::test]
async fn test_policy_refusal_surfaces_verbatim() {
    struct RefusingEvaluator;

    #[async_trait]
    impl ScriptEvaluator for RefusingEvaluator {
        async fn eval(&self, _code: &str, _pipeline: Arc<InvocationPipeline>) -> Result<Value, String> {
            Err("Cannot operate the door lock remotely".to_string())
        }
    }

    let mut config = AppConfig::default();
    config.orchestrator.max_fix_attempts = 3;
    config.orchestrator.skip_reception = true;
    config.orchestrator.skip_explainer = true;

    let script_llm = Arc::new(ScriptedLlmClient::new(["return 1;", "return 1;"]));
    let orchestrator = OrchestratorBuilder::new(config)
        .with_llm(script_llm.clone())
        .with_catalog(test_catalog())
        .with_root_instance(Arc::new(TestRootOperator))
        .with_evaluator(Arc::new(RefusingEvaluator))
        .build()
        .unwrap();

    let result = orchestrator
        .execute_turn(vec![Message::user("open the door")], CancellationToken::new())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.response, "Cannot operate the door lock remotely");
    assert_eq!(script_llm.call_count(), 1);
}

#[tokio::test]
async fn test_execute_script_direct_bypasses_agents() {
    let scenario = build_scenario(&[], &[], Arc::new(EchoLlmClient), true, true);

    let text = scenario
        .orchestrator
        .execute_script_direct("return 7;", true)
        .await
        .unwrap();
    assert_eq!(text, "7");
    assert_eq!(scenario.script_llm.call_count(), 0);

    // 校验开启时禁用关键字仍被拒
    let err = scenario
        .orchestrator
        .execute_script_direct("BAD return 1;", true)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Validation failed"));
}

/// 吐出若干 Token 后悬住的 LLM，用于取消测试
struct StallingLlmClient {
    prefix: Vec<&'static str>,
}

#[async_trait]
impl LlmClient for StallingLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
        Ok(self.prefix.concat())
    }

    async fn complete_stream(&self, _messages: &[Message]) -> Result<TokenStream, String> {
        let ready = futures_util::stream::iter(
            self.prefix
                .iter()
                .map(|s| Ok::<String, String>(s.to_string()))
                .collect::<Vec<_>>(),
        );
        let stalled = futures_util::stream::pending::<Result<String, String>>();
        let chained: Pin<Box<dyn Stream<Item = Result<String, String>> + Send>> =
            Box::pin(futures_util::StreamExt::chain(ready, stalled));
        Ok(chained)
    }
}

#[tokio::test]
async fn test_cancellation_during_answer_stream() {
    let mut config = AppConfig::default();
    config.orchestrator.skip_explainer = false;

    let orchestrator = OrchestratorBuilder::new(config)
        .with_reception_llm(Arc::new(StallingLlmClient {
            prefix: vec!["Partial ", "answer "],
        }))
        .with_script_llm(Arc::new(ScriptedLlmClient::default()))
        .with_explainer_llm(Arc::new(EchoLlmClient))
        .with_catalog(test_catalog())
        .with_root_instance(Arc::new(TestRootOperator))
        .with_evaluator(Arc::new(ScenarioEvaluator::new()))
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    let mut events = orchestrator.stream(vec![Message::user("hello")], cancel.clone());

    // 等到第一个 Token 再取消
    let mut saw_token = false;
    loop {
        match events.recv().await {
            Some(StreamEvent::Token(_)) => {
                if !saw_token {
                    saw_token = true;
                    cancel.cancel();
                }
            }
            Some(StreamEvent::Cancelled) => break,
            Some(other) => panic!("unexpected event: {other:?}"),
            None => panic!("stream ended without terminal event"),
        }
    }
    assert!(saw_token);
    // 终态事件后无更多块
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn test_streaming_script_route_hides_routing_tokens() {
    let scenario = build_scenario(
        &["script\n<task>\nsome task description\n</task>"],
        &["return 2;"],
        Arc::new(EchoLlmClient),
        false,
        true,
    );

    let mut events = scenario.orchestrator.stream(
        vec![Message::user("compute")],
        CancellationToken::new(),
    );

    let mut tokens = String::new();
    let mut completed = None;
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Token(token) => tokens.push_str(&token),
            StreamEvent::Completed(result) => completed = Some(result),
            other => panic!("unexpected event: {other:?}"),
        }
    }
    // 路由标记与 <task> 块从未流出；只看到最终结果
    assert_eq!(tokens, "2");
    let result = completed.expect("missing Completed event");
    assert!(result.success);
    assert_eq!(result.raw_result, Some(json!(2)));
}

#[tokio::test]
async fn test_consolidated_task_reaches_explainer() {
    // Reception 改写任务：Explainer 的 <task> 块应是改写后的文本
    let scenario = build_scenario(
        &["script\n<task>\nrewritten consolidated task\n</task>"],
        &["return 2;"],
        Arc::new(EchoLlmClient),
        false,
        false,
    );

    let result = scenario
        .orchestrator
        .execute_turn(vec![Message::user("original wording")], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        result.response,
        "<task>\nrewritten consolidated task\n</task>\n<result>\n2\n</result>"
    );
}
