//! Operator 注册表：描述符、方法缓存与 Handle 表
//!
//! Operator 的发现在宿主侧完成，这里只消费注册进来的元数据：每个方法条目携带
//! 异步处理器闭包，按 `(声明类型, 方法名, 元数)` 建键；开放泛型定义按实参运行时
//! 类别实例化并记忆化。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use futures_util::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use crate::core::OrchestratorError;
use crate::invoke::{InvokeError, JsonKind, ParamKind};

/// 宿主 Operator 实例；处理器通过 as_any 向下转型取回具体类型
pub trait Operator: Send + Sync {
    fn type_name(&self) -> &str;
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Handle 策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlePolicy {
    /// 静态门面：无实例，方法无接收者
    Static,
    /// 根实例：哨兵 Handle 即类型名，prelude 中无参构造
    SelfRooted,
    /// 子实例：按需创建，Handle 为随机 hex
    HandleAssigned,
}

/// Handle 表：Handle 字符串 → 存活实例；根实例不可释放
#[derive(Default)]
pub struct HandleTable {
    inner: RwLock<HashMap<String, HandleSlot>>,
}

struct HandleSlot {
    instance: Arc<dyn Operator>,
    root: bool,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册根实例，Handle 为类型名
    pub fn register_root(&self, instance: Arc<dyn Operator>) -> String {
        let handle = instance.type_name().to_string();
        self.inner.write().expect("handle table lock").insert(
            handle.clone(),
            HandleSlot {
                instance,
                root: true,
            },
        );
        handle
    }

    /// 注册子实例，返回新分配的不透明 Handle
    pub fn register(&self, instance: Arc<dyn Operator>) -> String {
        let handle = Uuid::new_v4().simple().to_string();
        self.inner.write().expect("handle table lock").insert(
            handle.clone(),
            HandleSlot {
                instance,
                root: false,
            },
        );
        handle
    }

    pub fn resolve(&self, handle: &str) -> Option<Arc<dyn Operator>> {
        self.inner
            .read()
            .expect("handle table lock")
            .get(handle)
            .map(|slot| slot.instance.clone())
    }

    /// 释放子实例；根实例忽略并返回 false
    pub fn release(&self, handle: &str) -> bool {
        let mut inner = self.inner.write().expect("handle table lock");
        match inner.get(handle) {
            Some(slot) if !slot.root => {
                inner.remove(handle);
                true
            }
            Some(_) => {
                tracing::warn!(%handle, "refusing to release root operator instance");
                false
            }
            None => false,
        }
    }

    /// 存活的子实例 (handle, type_name)，供 prelude 变量声明
    pub fn live_instances(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .inner
            .read()
            .expect("handle table lock")
            .iter()
            .filter(|(_, slot)| !slot.root)
            .map(|(handle, slot)| (handle.clone(), slot.instance.type_name().to_string()))
            .collect();
        out.sort();
        out
    }

    /// 根实例类型名
    pub fn root_types(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .inner
            .read()
            .expect("handle table lock")
            .values()
            .filter(|slot| slot.root)
            .map(|slot| slot.instance.type_name().to_string())
            .collect();
        out.sort();
        out
    }
}

/// 传给方法处理器的调用上下文
#[derive(Clone)]
pub struct InvokeContext {
    /// 实例方法的接收者；静态方法为 None
    pub receiver: Option<Arc<dyn Operator>>,
    /// Handle 表，供返回 Operator 的方法注册新实例
    pub handles: Arc<HandleTable>,
}

impl InvokeContext {
    /// 取回具体类型的接收者
    pub fn receiver_as<T: 'static>(&self) -> Result<&T, InvokeError> {
        let receiver = self
            .receiver
            .as_ref()
            .ok_or_else(|| InvokeError::Handler("missing receiver".to_string()))?;
        receiver
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| {
                InvokeError::Handler(format!(
                    "receiver type mismatch: expected {}",
                    std::any::type_name::<T>()
                ))
            })
    }
}

/// 方法处理器：接收调用上下文与已规整的实参
pub type MethodHandler =
    Arc<dyn Fn(InvokeContext, Vec<Value>) -> BoxFuture<'static, Result<Value, InvokeError>> + Send + Sync>;

/// 参数描述符
#[derive(Clone)]
pub struct ParamDescriptor {
    pub name: String,
    pub kind: ParamKind,
}

impl ParamDescriptor {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// 返回类别；签名与代理生成据此决定包装方式
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReturnKind {
    Void,
    /// 普通值，携带签名展示类型名
    Value(String),
    /// 返回 Operator 实例：结果为 Handle，代理侧包装为新的脚本对象
    Operator(String),
}

/// 开放泛型定义：按实参类别序列实例化处理器并记忆化
pub struct GenericDefinition {
    instantiate:
        Arc<dyn Fn(&[JsonKind]) -> Result<MethodHandler, InvokeError> + Send + Sync>,
    memo: Mutex<HashMap<Vec<JsonKind>, MethodHandler>>,
}

impl GenericDefinition {
    pub fn new(
        instantiate: impl Fn(&[JsonKind]) -> Result<MethodHandler, InvokeError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            instantiate: Arc::new(instantiate),
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// 推断类型实参（实参的运行时类别）并返回封闭实例
    pub fn resolve(&self, args: &[Value]) -> Result<MethodHandler, InvokeError> {
        let kinds = JsonKind::of_args(args);
        let mut memo = self.memo.lock().expect("generic memo lock");
        if let Some(handler) = memo.get(&kinds) {
            return Ok(handler.clone());
        }
        let handler = (self.instantiate)(&kinds)?;
        memo.insert(kinds, handler.clone());
        Ok(handler)
    }

    /// 已记忆化的封闭实例数
    pub fn memoized_count(&self) -> usize {
        self.memo.lock().expect("generic memo lock").len()
    }
}

enum HandlerKind {
    Fixed(MethodHandler),
    Generic(GenericDefinition),
}

/// 方法条目：`(declaring_type, name, arity)` 在一次会话内唯一
pub struct MethodEntry {
    pub declaring_type: String,
    /// 宿主方法原名（异步方法带 Async 后缀）
    pub name: String,
    pub is_static: bool,
    pub is_async: bool,
    pub params: Vec<ParamDescriptor>,
    pub returns: ReturnKind,
    pub description: Option<String>,
    handler: HandlerKind,
}

impl MethodEntry {
    /// 实例方法条目
    pub fn instance(
        declaring_type: impl Into<String>,
        name: impl Into<String>,
        params: Vec<ParamDescriptor>,
        returns: ReturnKind,
        handler: MethodHandler,
    ) -> Self {
        Self {
            declaring_type: declaring_type.into(),
            name: name.into(),
            is_static: false,
            is_async: false,
            params,
            returns,
            description: None,
            handler: HandlerKind::Fixed(handler),
        }
    }

    /// 静态门面方法条目
    pub fn static_method(
        declaring_type: impl Into<String>,
        name: impl Into<String>,
        params: Vec<ParamDescriptor>,
        returns: ReturnKind,
        handler: MethodHandler,
    ) -> Self {
        let mut entry = Self::instance(declaring_type, name, params, returns, handler);
        entry.is_static = true;
        entry
    }

    /// 开放泛型定义条目
    pub fn generic(
        declaring_type: impl Into<String>,
        name: impl Into<String>,
        params: Vec<ParamDescriptor>,
        returns: ReturnKind,
        definition: GenericDefinition,
    ) -> Self {
        Self {
            declaring_type: declaring_type.into(),
            name: name.into(),
            is_static: false,
            is_async: false,
            params,
            returns,
            description: None,
            handler: HandlerKind::Generic(definition),
        }
    }

    /// 标记为异步宿主方法（调用时等待并解包）
    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn is_generic_definition(&self) -> bool {
        matches!(self.handler, HandlerKind::Generic(_))
    }

    /// 取处理器；泛型定义先按实参类别实例化
    pub fn resolve_handler(&self, args: &[Value]) -> Result<MethodHandler, InvokeError> {
        match &self.handler {
            HandlerKind::Fixed(handler) => Ok(handler.clone()),
            HandlerKind::Generic(definition) => definition.resolve(args),
        }
    }

    /// 脚本侧暴露名：异步方法裁掉 Async 后缀
    pub fn script_name(&self) -> &str {
        if self.is_async {
            self.name.strip_suffix("Async").unwrap_or(&self.name)
        } else {
            &self.name
        }
    }
}

/// 方法缓存：`(type, name, arity)` → 条目；重复注册是构建期错误
#[derive(Default)]
pub struct MethodCache {
    entries: HashMap<(String, String, usize), Arc<MethodEntry>>,
}

impl MethodCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: Arc<MethodEntry>) -> Result<(), OrchestratorError> {
        let key = (
            entry.declaring_type.clone(),
            entry.name.clone(),
            entry.arity(),
        );
        if self.entries.contains_key(&key) {
            return Err(OrchestratorError::Build(format!(
                "duplicate method entry: {}.{} with {} argument(s)",
                key.0, key.1, key.2
            )));
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    pub fn lookup(&self, type_name: &str, method: &str, arity: usize) -> Option<Arc<MethodEntry>> {
        self.entries
            .get(&(type_name.to_string(), method.to_string(), arity))
            .cloned()
    }

    /// 该类型是否有任何条目
    pub fn has_type(&self, type_name: &str) -> bool {
        self.entries.keys().any(|(t, _, _)| t == type_name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<MethodEntry>> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 过滤视图：仅保留谓词接受的条目（additional_method_filter）
    pub fn filtered(&self, predicate: &dyn Fn(&MethodEntry) -> bool) -> MethodCache {
        MethodCache {
            entries: self
                .entries
                .iter()
                .filter(|(_, entry)| predicate(entry))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Operator 描述符：类型名、Handle 策略与方法集合
pub struct OperatorDescriptor {
    pub type_name: String,
    pub handle_policy: HandlePolicy,
    pub description: Option<String>,
    pub methods: Vec<Arc<MethodEntry>>,
}

impl OperatorDescriptor {
    pub fn new(type_name: impl Into<String>, handle_policy: HandlePolicy) -> Self {
        Self {
            type_name: type_name.into(),
            handle_policy,
            description: None,
            methods: Vec::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn method(mut self, entry: MethodEntry) -> Self {
        self.methods.push(Arc::new(entry));
        self
    }
}

/// DTO 模型描述符：代理文本中的数据类声明
#[derive(Clone)]
pub struct ModelDescriptor {
    pub name: String,
    /// (属性名, 展示类型名)
    pub fields: Vec<(String, String)>,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.fields.push((name.into(), type_name.into()));
        self
    }
}

/// Operator 目录：宿主注册的全部描述符与 DTO 模型
#[derive(Default)]
pub struct OperatorCatalog {
    pub operators: Vec<OperatorDescriptor>,
    pub models: Vec<ModelDescriptor>,
}

impl OperatorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operator(mut self, descriptor: OperatorDescriptor) -> Self {
        self.operators.push(descriptor);
        self
    }

    pub fn model(mut self, model: ModelDescriptor) -> Self {
        self.models.push(model);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// 汇总方法缓存；重复键在此失败
    pub fn build_cache(&self) -> Result<MethodCache, OrchestratorError> {
        let mut cache = MethodCache::new();
        for descriptor in &self.operators {
            for entry in &descriptor.methods {
                cache.insert(entry.clone())?;
            }
        }
        Ok(cache)
    }
}
