//! Oracle 回复格式的 JSON Schema 生成（schemars）
//!
//! 将期望的决策结构注入 system prompt，减少 LLM 输出格式错误。

use schemars::{schema_for, JsonSchema};

/// 返回类型 T 的 JSON Schema 字符串，可拼入 system prompt
pub fn response_schema_json<T: JsonSchema>() -> String {
    let schema = schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}
