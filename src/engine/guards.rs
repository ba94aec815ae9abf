//! 参数守卫：占位符识别、标识符格式、前序结果可用性
//!
//! 调用工具前参数必须满足：无占位符、无字面量 "null"、标识符形参数符合外部注册表格式。
//! 这些规则全部确定性执行，不依赖 Oracle。

use regex::Regex;
use serde_json::{Map, Value};

use crate::config::CoordinationSection;
use crate::core::EngineError;
use crate::engine::PartialResult;
use crate::tools::{is_identifier_field, is_missing_value, ActionSchema};

pub struct ParameterGuard {
    id_format: Regex,
    id_length: usize,
    placeholders: Vec<Regex>,
    step_ref: Regex,
}

impl ParameterGuard {
    /// 无效的占位符模式记录告警后忽略；无效的标识符格式直接报错
    pub fn from_config(config: &CoordinationSection) -> Result<Self, EngineError> {
        let id_format = Regex::new(&config.id_pattern)
            .map_err(|e| EngineError::Config(format!("invalid id_pattern: {e}")))?;
        let placeholders = config
            .placeholder_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!("Ignoring invalid placeholder pattern {}: {}", p, e);
                    None
                }
            })
            .collect();
        let step_ref = Regex::new(r"(?i)step_?(\d+)")
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(Self {
            id_format,
            id_length: config.id_length,
            placeholders,
            step_ref,
        })
    }

    pub fn is_placeholder(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => {
                let s = s.trim();
                self.placeholders.iter().any(|re| re.is_match(s))
            }
            _ => false,
        }
    }

    /// 占位符中引用的步骤序号（如 "extracted_from_step_2" → 2）
    pub fn referenced_step(&self, value: &Value) -> Option<u32> {
        let s = value.as_str()?;
        self.step_ref
            .captures(s)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// 标识符取值是否可接受：符合格式，或不短于标准长度（非标准但可能有效）
    pub fn accepts_identifier(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => {
                let s = s.trim();
                if self.id_format.is_match(s) {
                    return true;
                }
                s.chars().count() >= self.id_length
                    && !s.contains(char::is_whitespace)
                    && !self.is_placeholder(value)
            }
            Value::Number(_) => true,
            _ => false,
        }
    }

    /// 候选取值是否可写入参数：非空、非 "null"、非占位符，标识符形参数需通过格式校验
    pub fn admits(&self, name: &str, value: &Value) -> bool {
        if is_missing_value(value) || self.is_placeholder(value) {
            return false;
        }
        !is_identifier_field(name) || self.accepts_identifier(value)
    }

    /// 未解析参数：取值为占位符 / 缺失，以及 schema 必填但未提供的参数
    pub fn unresolved_params(
        &self,
        params: &Map<String, Value>,
        schema: Option<&ActionSchema>,
    ) -> Vec<String> {
        let mut unresolved: Vec<String> = params
            .iter()
            .filter(|(_, v)| self.is_placeholder(v) || is_missing_value(v))
            .map(|(k, _)| k.clone())
            .collect();
        if let Some(schema) = schema {
            for name in &schema.required {
                if !params.contains_key(name) && !unresolved.contains(name) {
                    unresolved.push(name.clone());
                }
            }
        }
        unresolved
    }

    pub fn placeholder_params(&self, params: &Map<String, Value>) -> Vec<String> {
        params
            .iter()
            .filter(|(_, v)| self.is_placeholder(v))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// 参数所依赖的前序结果：占位符显式引用的步骤，否则取最近一条。
    /// 非占位符参数只有标识符形字段才隐式依赖最近结果；其余（如带 default 的 limit）不依赖任何步骤。
    pub fn dependency_for<'a>(
        &self,
        name: &str,
        value: Option<&Value>,
        previous: &'a [PartialResult],
    ) -> Option<&'a PartialResult> {
        match value {
            Some(v) if self.is_placeholder(v) => {
                if let Some(order) = self.referenced_step(v) {
                    if let Some(hit) = previous.iter().rev().find(|p| p.step_order == order) {
                        return Some(hit);
                    }
                }
                previous.last()
            }
            _ if is_identifier_field(name) => previous.last(),
            _ => None,
        }
    }

    /// 调用前的最终检查；违反时短路为声明过的错误，不触达注册表
    pub fn check_invocation(&self, params: &Map<String, Value>) -> Result<(), EngineError> {
        let placeholders = self.placeholder_params(params);
        if !placeholders.is_empty() {
            return Err(EngineError::Coordination(format!(
                "unresolved placeholders in parameters: {}",
                placeholders.join(", ")
            )));
        }
        for (name, value) in params {
            if let Value::String(s) = value {
                if s.trim().eq_ignore_ascii_case("null") {
                    return Err(EngineError::Validation(format!(
                        "parameter '{name}' is the literal string \"null\""
                    )));
                }
            }
            if is_identifier_field(name) && !value.is_null() && !self.accepts_identifier(value) {
                return Err(EngineError::Validation(format!(
                    "parameter '{name}' is not a valid identifier: {value}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
impl Default for ParameterGuard {
    fn default() -> Self {
        Self::from_config(&CoordinationSection::default())
            .expect("default coordination patterns are valid")
    }
}

/// 前序结果是否为空（空数组，或 data / items / results 包装的空数组）
pub fn is_empty_result(output: &Value) -> bool {
    match output {
        Value::Array(items) => items.is_empty(),
        Value::Null => true,
        Value::Object(map) => ["data", "items", "results"].iter().any(|k| {
            map.get(*k)
                .and_then(Value::as_array)
                .map(|a| a.is_empty())
                .unwrap_or(false)
        }),
        _ => false,
    }
}

/// 前序结果是否携带错误
pub fn is_error_result(output: &Value) -> bool {
    match output {
        Value::Object(map) => {
            map.get("error").map(|e| !e.is_null()).unwrap_or(false)
                || map.get("isError").and_then(Value::as_bool).unwrap_or(false)
        }
        Value::String(s) => {
            let lower = s.trim_start().to_lowercase();
            lower.starts_with("error") || lower.starts_with("failed")
        }
        _ => false,
    }
}

/// 结果中的首个条目（数组首项，或 data / items / results 包装的首项）
pub fn first_item(output: &Value) -> Option<&Value> {
    match output {
        Value::Array(items) => items.first(),
        Value::Object(map) => ["data", "items", "results"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array))
            .and_then(|a| a.first()),
        _ => None,
    }
}
