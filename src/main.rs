//! Mantis - LLM 脚本编排引擎
//!
//! 入口：初始化日志、加载配置、装配编排器（演示用 Operator 目录 + 演示求值器），
//! 从 stdin 读用户输入并流式输出回复。默认进程内执行，开箱即用；
//! 配置切到 external_process / container / 远程 Runner 时走线协议。

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};

use mantis::agents::Message;
use mantis::config::load_config;
use mantis::core::{OrchestratorBuilder, StreamEvent};
use mantis::invoke::{
    HandlePolicy, InvocationPipeline, InvokeContext, MethodEntry, OperatorCatalog,
    OperatorDescriptor, ParamDescriptor, ParamKind, ReturnKind,
};
use mantis::llm::{EchoLlmClient, LlmClient, OpenAiClient};
use mantis::runner::ScriptEvaluator;

/// 演示目录：一个系统信息门面
fn demo_catalog() -> OperatorCatalog {
    OperatorCatalog::new().operator(
        OperatorDescriptor::new("SystemInfo", HandlePolicy::Static)
            .describe("Read-only information about the host system")
            .method(
                MethodEntry::static_method(
                    "SystemInfo",
                    "Hostname",
                    vec![],
                    ReturnKind::Value("string".to_string()),
                    Arc::new(|_cx: InvokeContext, _args| {
                        Box::pin(async {
                            Ok(json!(std::env::var("HOSTNAME").unwrap_or_default()))
                        })
                    }),
                )
                .describe("Returns the host name"),
            )
            .method(
                MethodEntry::static_method(
                    "SystemInfo",
                    "Add",
                    vec![
                        ParamDescriptor::new("left", ParamKind::Int),
                        ParamDescriptor::new("right", ParamKind::Int),
                    ],
                    ReturnKind::Value("int".to_string()),
                    Arc::new(|_cx: InvokeContext, args| {
                        Box::pin(async move {
                            let left = args[0].as_i64().unwrap_or(0);
                            let right = args[1].as_i64().unwrap_or(0);
                            Ok(json!(left + right))
                        })
                    }),
                )
                .describe("Adds two integers"),
            ),
    )
}

/// 演示求值器：只认 `return <Type>.<Method>(<字面量参数>);` 形式的单行脚本，
/// 经调用管线执行对应的门面方法。完整的脚本语言由外部 Runner 提供。
struct DemoEvaluator;

#[async_trait]
impl ScriptEvaluator for DemoEvaluator {
    async fn eval(&self, code: &str, pipeline: Arc<InvocationPipeline>) -> Result<Value, String> {
        // 用户脚本在拼接文本的最后一个非空行
        let line = code
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default()
            .trim();
        let call = line
            .strip_prefix("return ")
            .unwrap_or(line)
            .trim_end_matches(';');

        let (target, rest) = call
            .split_once('.')
            .ok_or("expected a single `Type.Method(...)` call")?;
        let (method, args_text) = rest
            .split_once('(')
            .ok_or("expected a single `Type.Method(...)` call")?;
        let args_text = args_text
            .strip_suffix(')')
            .ok_or("unterminated argument list")?;

        let mut args = Vec::new();
        for piece in args_text.split(',') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            if let Some(text) = piece.strip_prefix('"').and_then(|p| p.strip_suffix('"')) {
                args.push(json!(text));
            } else if let Ok(number) = piece.parse::<i64>() {
                args.push(json!(number));
            } else {
                return Err(format!("unsupported argument literal: {piece}"));
            }
        }

        pipeline
            .invoke_operator(target.trim(), method.trim(), None, args)
            .await
            .map_err(|e| e.to_string())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mantis::observability::init();

    let config = load_config(None).context("Failed to load config")?;

    let llm: Arc<dyn LlmClient> = if std::env::var("OPENAI_API_KEY").is_ok() {
        tracing::info!("Using OpenAI-compatible LLM ({})", config.llm.model);
        Arc::new(OpenAiClient::from_config(&config.llm, None))
    } else {
        tracing::warn!("No API key set, using Echo LLM");
        Arc::new(EchoLlmClient)
    };

    let orchestrator = OrchestratorBuilder::new(config)
        .with_llm(llm)
        .with_catalog(demo_catalog())
        .with_evaluator(Arc::new(DemoEvaluator))
        .build()
        .context("Failed to build orchestrator")?;

    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        line.clear();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/quit" {
            break;
        }

        let cancel = tokio_util::sync::CancellationToken::new();
        let mut events = orchestrator.stream(vec![Message::user(input)], cancel);
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Token(token) => {
                    print!("{token}");
                    std::io::stdout().flush().ok();
                }
                StreamEvent::Completed(_) => println!(),
                StreamEvent::Failed(error) => println!("\nerror: {error}"),
                StreamEvent::Cancelled => println!("\n(cancelled)"),
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
