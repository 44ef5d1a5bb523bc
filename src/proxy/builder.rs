//! 代理束构建器
//!
//! 由 Operator 目录一次性生成运行时代理文本与签名文本，并汇总方法缓存；
//! 异步方法裁掉 Async 后缀暴露同步面，裁剪后同型同名同元数冲突是构建期错误。
//! 构建末尾异步拉取各工具服务目录并追加工具代理类，该步骤完成后才放行首个用户回合。

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::OrchestratorError;
use crate::invoke::{
    MethodCache, MethodEntry, ModelDescriptor, OperatorCatalog, OperatorDescriptor, HandlePolicy,
    ReturnKind, ToolServerRegistry,
};
use crate::proxy::ProxyBundle;

/// 方法过滤谓词（additional_method_filter）
pub type MethodFilter = Arc<dyn Fn(&MethodEntry) -> bool + Send + Sync>;

/// 代理束构建器
pub struct ProxyBuilder {
    catalog: Arc<OperatorCatalog>,
    tools: Arc<ToolServerRegistry>,
    method_filter: Option<MethodFilter>,
}

impl ProxyBuilder {
    pub fn new(catalog: Arc<OperatorCatalog>, tools: Arc<ToolServerRegistry>) -> Self {
        Self {
            catalog,
            tools,
            method_filter: None,
        }
    }

    /// 叠加方法过滤视图；被滤掉的方法既不出现在文本里也不可调用
    pub fn with_method_filter(mut self, filter: MethodFilter) -> Self {
        self.method_filter = Some(filter);
        self
    }

    /// 构建代理束；重复方法键与 Async 裁剪冲突在此失败
    pub async fn build(&self) -> Result<ProxyBundle, OrchestratorError> {
        if self.catalog.is_empty() {
            return Err(OrchestratorError::Build(
                "operator catalog is empty".to_string(),
            ));
        }

        let cache = self.catalog.build_cache()?;
        let cache = match &self.method_filter {
            Some(filter) => cache.filtered(&**filter),
            None => cache,
        };

        check_script_name_collisions(&cache)?;

        let mut runtime = String::new();
        let mut signatures = String::new();

        // 宿主绑定桩始终在最前
        runtime.push_str("ProxyRuntime.Host = Host;\n");
        runtime.push_str("using System;\n");
        runtime.push_str("using System.Collections.Generic;\n\n");

        for model in &self.catalog.models {
            emit_model(&mut runtime, model, true);
            emit_model(&mut signatures, model, false);
        }

        for descriptor in &self.catalog.operators {
            emit_operator(&mut runtime, descriptor, &cache, true);
            emit_operator(&mut signatures, descriptor, &cache, false);
        }

        self.augment_with_tools(&mut runtime, &mut signatures).await;

        tracing::info!(
            methods = cache.len(),
            "proxy bundle built"
        );
        Ok(ProxyBundle {
            runtime_text: runtime,
            signatures_text: signatures,
            cache: Arc::new(cache),
        })
    }

    /// 拉取各工具服务目录并追加一类一服务的工具代理；目录不可用时跳过该服务
    async fn augment_with_tools(&self, runtime: &mut String, signatures: &mut String) {
        for server in self.tools.server_names() {
            let client = match self.tools.get(&server) {
                Some(client) => client,
                None => continue,
            };
            let tools = match client.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!(%server, error = %e, "skipping tool server: catalog unavailable");
                    continue;
                }
            };
            if tools.is_empty() {
                continue;
            }

            let class_name = format!("Tools_{}", sanitize_identifier(&server));
            runtime.push_str(&format!("public static class {class_name} {{\n"));
            signatures.push_str(&format!("public static class {class_name} {{\n"));
            for tool in &tools {
                let method = pascal_case(&sanitize_identifier(&tool.name));
                if let Some(description) = &tool.description {
                    signatures.push_str(&format!("    // {description}\n"));
                }
                runtime.push_str(&format!(
                    "    public static object {method}(object arguments) => ProxyRuntime.InvokeTool(\"{server}\", \"{}\", arguments);\n",
                    tool.name
                ));
                signatures.push_str(&format!("    object {method}(object arguments);\n"));
            }
            runtime.push_str("}\n\n");
            signatures.push_str("}\n\n");
        }
    }
}

/// Async 裁剪后 `(类型, 暴露名, 元数)` 必须唯一
fn check_script_name_collisions(cache: &MethodCache) -> Result<(), OrchestratorError> {
    let mut seen = HashSet::new();
    for entry in cache.entries() {
        let key = (
            entry.declaring_type.clone(),
            entry.script_name().to_string(),
            entry.arity(),
        );
        if !seen.insert(key.clone()) {
            return Err(OrchestratorError::Build(format!(
                "proxy name collision: {}.{} with {} argument(s) (Async suffix trimming)",
                key.0, key.1, key.2
            )));
        }
    }
    Ok(())
}

fn emit_model(out: &mut String, model: &ModelDescriptor, with_body: bool) {
    out.push_str(&format!("public class {} {{\n", model.name));
    for (field, type_name) in &model.fields {
        if with_body {
            out.push_str(&format!("    public {type_name} {field} {{ get; set; }}\n"));
        } else {
            out.push_str(&format!("    {type_name} {field};\n"));
        }
    }
    out.push_str("}\n\n");
}

fn emit_operator(
    out: &mut String,
    descriptor: &OperatorDescriptor,
    cache: &MethodCache,
    with_body: bool,
) {
    let type_name = &descriptor.type_name;
    let is_static = descriptor.handle_policy == HandlePolicy::Static;

    if let Some(description) = &descriptor.description {
        if !with_body {
            out.push_str(&format!("// {description}\n"));
        }
    }
    if is_static {
        out.push_str(&format!("public static class {type_name} {{\n"));
    } else {
        out.push_str(&format!("public class {type_name} {{\n"));
        if with_body {
            out.push_str("    private string _handle;\n");
            if descriptor.handle_policy == HandlePolicy::SelfRooted {
                // 根实例：哨兵 Handle 即类型名
                out.push_str(&format!(
                    "    public {type_name}() {{ _handle = \"{type_name}\"; }}\n"
                ));
            }
            out.push_str(&format!(
                "    public {type_name}(string handle) {{ _handle = handle; }}\n"
            ));
        }
    }

    for entry in &descriptor.methods {
        // 过滤视图裁掉的方法不出现在任何文本中
        if cache
            .lookup(&entry.declaring_type, &entry.name, entry.arity())
            .is_none()
        {
            continue;
        }
        emit_method(out, entry, is_static, with_body);
    }
    out.push_str("}\n\n");
}

fn emit_method(out: &mut String, entry: &MethodEntry, is_static: bool, with_body: bool) {
    let params = entry
        .params
        .iter()
        .map(|p| format!("{} {}", p.kind.display(), p.name))
        .collect::<Vec<_>>()
        .join(", ");
    let arg_names = entry
        .params
        .iter()
        .map(|p| p.name.clone())
        .collect::<Vec<_>>()
        .join(", ");
    let return_display = match &entry.returns {
        ReturnKind::Void => "void".to_string(),
        ReturnKind::Value(name) => name.clone(),
        ReturnKind::Operator(name) => name.clone(),
    };
    let script_name = entry.script_name();

    if !with_body {
        if let Some(description) = &entry.description {
            out.push_str(&format!("    // {description}\n"));
        }
        out.push_str(&format!("    {return_display} {script_name}({params});\n"));
        return;
    }

    let modifier = if is_static { "static " } else { "" };
    let handle_expr = if is_static { "null" } else { "_handle" };
    let call = format!(
        "\"{}\", \"{}\", new object[] {{ {arg_names} }}, {handle_expr}",
        entry.declaring_type, entry.name
    );
    let body = match &entry.returns {
        ReturnKind::Void => format!("ProxyRuntime.InvokeVoid({call})"),
        ReturnKind::Value(name) => format!("ProxyRuntime.Invoke<{name}>({call})"),
        // 返回 Operator：用收到的 Handle 包一个新的脚本侧包装
        ReturnKind::Operator(name) => {
            format!("new {name}(ProxyRuntime.Invoke<string>({call}))")
        }
    };
    out.push_str(&format!(
        "    public {modifier}{return_display} {script_name}({params}) => {body};\n"
    ));
}

fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn pascal_case(raw: &str) -> String {
    raw.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::{
        InvokeContext, MethodHandler, ParamDescriptor, ParamKind,
    };
    use serde_json::Value;

    fn noop() -> MethodHandler {
        Arc::new(|_cx: InvokeContext, _args: Vec<Value>| Box::pin(async { Ok(Value::Null) }))
    }

    fn sample_catalog() -> OperatorCatalog {
        OperatorCatalog::new()
            .model(
                ModelDescriptor::new("TestModel")
                    .field("A", "int")
                    .field("B", "int"),
            )
            .operator(
                OperatorDescriptor::new("TestRootOperator", HandlePolicy::SelfRooted)
                    .describe("Root entry point")
                    .method(
                        MethodEntry::instance(
                            "TestRootOperator",
                            "GetSimpleOperator",
                            vec![],
                            ReturnKind::Operator("SimpleOperator".to_string()),
                            noop(),
                        )
                        .describe("Creates the simple operator"),
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
                            noop(),
                        )
                        .asynchronous()
                        .describe("Adds the two numbers in the model"),
                    )
                    .method(MethodEntry::instance(
                        "SimpleOperator",
                        "Concatenate",
                        vec![
                            ParamDescriptor::new("left", ParamKind::String),
                            ParamDescriptor::new("right", ParamKind::String),
                        ],
                        ReturnKind::Value("string".to_string()),
                        noop(),
                    )),
            )
    }

    async fn build(catalog: OperatorCatalog) -> Result<ProxyBundle, OrchestratorError> {
        ProxyBuilder::new(Arc::new(catalog), Arc::new(ToolServerRegistry::new()))
            .build()
            .await
    }

    #[tokio::test]
    async fn test_runtime_text_layout() {
        let bundle = build(sample_catalog()).await.unwrap();
        let runtime = &bundle.runtime_text;

        assert!(runtime.starts_with("ProxyRuntime.Host = Host;"));
        assert!(runtime.contains("public class TestModel {"));
        assert!(runtime.contains("public int A { get; set; }"));
        // 异步方法暴露为同步名，转发用宿主原名
        assert!(runtime.contains(
            "public int AddNumbers(TestModel model) => ProxyRuntime.Invoke<int>(\"SimpleOperator\", \"AddNumbersAsync\", new object[] { model }, _handle);"
        ));
        // 返回 Operator 的方法包装 Handle
        assert!(runtime.contains(
            "public SimpleOperator GetSimpleOperator() => new SimpleOperator(ProxyRuntime.Invoke<string>(\"TestRootOperator\", \"GetSimpleOperator\", new object[] {  }, _handle));"
        ));
        // 根类型有无参构造
        assert!(runtime.contains("public TestRootOperator() { _handle = \"TestRootOperator\"; }"));
    }

    #[tokio::test]
    async fn test_signatures_and_runtime_declare_same_methods() {
        let bundle = build(sample_catalog()).await.unwrap();
        for name in ["AddNumbers", "Concatenate", "GetSimpleOperator"] {
            assert!(bundle.runtime_text.contains(&format!(" {name}(")), "{name} in runtime");
            assert!(
                bundle.signatures_text.contains(&format!(" {name}(")),
                "{name} in signatures"
            );
        }
        // 签名里不出现宿主原名
        assert!(!bundle.signatures_text.contains("AddNumbersAsync"));
        // 描述进签名
        assert!(bundle
            .signatures_text
            .contains("// Adds the two numbers in the model"));
    }

    #[tokio::test]
    async fn test_duplicate_method_key_fails_build() {
        let catalog = OperatorCatalog::new().operator(
            OperatorDescriptor::new("T", HandlePolicy::Static)
                .method(MethodEntry::static_method(
                    "T",
                    "M",
                    vec![ParamDescriptor::new("a", ParamKind::Int)],
                    ReturnKind::Void,
                    noop(),
                ))
                .method(MethodEntry::static_method(
                    "T",
                    "M",
                    vec![ParamDescriptor::new("a", ParamKind::Int)],
                    ReturnKind::Void,
                    noop(),
                )),
        );
        let err = build(catalog).await.unwrap_err();
        assert!(err.to_string().contains("duplicate method entry"));
    }

    #[tokio::test]
    async fn test_async_trim_collision_fails_build() {
        let catalog = OperatorCatalog::new().operator(
            OperatorDescriptor::new("T", HandlePolicy::Static)
                .method(MethodEntry::static_method(
                    "T",
                    "Foo",
                    vec![],
                    ReturnKind::Void,
                    noop(),
                ))
                .method(
                    MethodEntry::static_method("T", "FooAsync", vec![], ReturnKind::Void, noop())
                        .asynchronous(),
                ),
        );
        let err = build(catalog).await.unwrap_err();
        assert!(err.to_string().contains("proxy name collision"));
    }

    #[tokio::test]
    async fn test_empty_catalog_fails_build() {
        let err = build(OperatorCatalog::new()).await.unwrap_err();
        assert!(err.to_string().contains("operator catalog is empty"));
    }

    #[tokio::test]
    async fn test_method_filter_hides_entry() {
        let bundle = ProxyBuilder::new(
            Arc::new(sample_catalog()),
            Arc::new(ToolServerRegistry::new()),
        )
        .with_method_filter(Arc::new(|entry| entry.name != "Concatenate"))
        .build()
        .await
        .unwrap();
        assert!(!bundle.runtime_text.contains("Concatenate"));
        assert!(bundle.cache.lookup("SimpleOperator", "Concatenate", 2).is_none());
        assert!(bundle
            .cache
            .lookup("SimpleOperator", "AddNumbersAsync", 1)
            .is_some());
    }

    #[test]
    fn test_pascal_case() {
        assert_eq!(pascal_case("read_file"), "ReadFile");
        assert_eq!(pascal_case("echo"), "Echo");
    }
}
