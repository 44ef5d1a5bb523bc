//! JSON 参数编解码
//!
//! 把线上传来的 JSON 实参按声明的参数类别规整：数字归到目标数值类别、数组逐元素处理、
//! DTO 对象保持 JSON 形态交由处理器用 serde 解码。

use serde_json::Value;

use crate::invoke::{InvokeError, ParamDescriptor};

/// JSON 值的运行时类别；用于泛型实例化的类型实参推断
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JsonKind {
    Null,
    Bool,
    Int,
    Float,
    String,
    Array,
    Object,
}

impl JsonKind {
    pub fn of(value: &Value) -> JsonKind {
        match value {
            Value::Null => JsonKind::Null,
            Value::Bool(_) => JsonKind::Bool,
            Value::Number(n) if n.is_f64() => JsonKind::Float,
            Value::Number(_) => JsonKind::Int,
            Value::String(_) => JsonKind::String,
            Value::Array(_) => JsonKind::Array,
            Value::Object(_) => JsonKind::Object,
        }
    }

    /// 一组实参的类别序列
    pub fn of_args(args: &[Value]) -> Vec<JsonKind> {
        args.iter().map(JsonKind::of).collect()
    }
}

/// 声明的参数类别
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    String,
    Array(Box<ParamKind>),
    /// DTO 类型，携带签名中展示的类型名
    Object(String),
    /// 不做规整，原样传给处理器
    Any,
}

impl ParamKind {
    /// 签名文本中的类型展示名
    pub fn display(&self) -> String {
        match self {
            ParamKind::Bool => "bool".to_string(),
            ParamKind::Int => "int".to_string(),
            ParamKind::Float => "double".to_string(),
            ParamKind::String => "string".to_string(),
            ParamKind::Array(inner) => format!("{}[]", inner.display()),
            ParamKind::Object(name) => name.clone(),
            ParamKind::Any => "object".to_string(),
        }
    }
}

/// 规整单个实参
pub fn coerce_value(value: Value, kind: &ParamKind) -> Result<Value, InvokeError> {
    match kind {
        ParamKind::Any => Ok(value),
        ParamKind::Bool => match value {
            Value::Bool(_) => Ok(value),
            other => Err(mismatch("bool", &other)),
        },
        ParamKind::Int => match &value {
            Value::Number(n) => {
                if n.as_i64().is_some() {
                    Ok(value)
                } else if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 {
                        Ok(Value::from(f as i64))
                    } else {
                        Err(mismatch("int", &value))
                    }
                } else {
                    Err(mismatch("int", &value))
                }
            }
            _ => Err(mismatch("int", &value)),
        },
        ParamKind::Float => match &value {
            Value::Number(n) => n
                .as_f64()
                .map(Value::from)
                .ok_or_else(|| mismatch("double", &value)),
            _ => Err(mismatch("double", &value)),
        },
        ParamKind::String => match value {
            Value::String(_) => Ok(value),
            other => Err(mismatch("string", &other)),
        },
        ParamKind::Array(inner) => match value {
            Value::Array(items) => {
                let coerced = items
                    .into_iter()
                    .map(|item| coerce_value(item, inner))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(coerced))
            }
            other => Err(mismatch("array", &other)),
        },
        ParamKind::Object(name) => match value {
            Value::Object(_) => Ok(value),
            other => Err(mismatch(name, &other)),
        },
    }
}

/// 规整整组实参；长度已由按元数查找保证一致
pub fn coerce_arguments(
    params: &[ParamDescriptor],
    args: Vec<Value>,
) -> Result<Vec<Value>, InvokeError> {
    params
        .iter()
        .zip(args)
        .map(|(param, arg)| {
            coerce_value(arg, &param.kind).map_err(|e| {
                InvokeError::Argument(format!("parameter `{}`: {}", param.name, e))
            })
        })
        .collect()
}

fn mismatch(expected: &str, got: &Value) -> InvokeError {
    InvokeError::Argument(format!("expected {expected}, got {got}"))
}
