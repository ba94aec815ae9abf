//! Oracle 回复解码：定位首个平衡的 `{...}` 片段 → 反序列化 → 结构校验
//!
//! 允许 JSON 前后夹带说明文字或 ```json 代码块；字符串内的花括号与转义不参与计数。

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Oracle 回复无法解码为期望的决策类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleDecodeError {
    #[error("no JSON object found in oracle reply")]
    NoJsonObject,

    #[error("malformed oracle JSON: {0}")]
    Malformed(String),

    #[error("invalid oracle decision: {0}")]
    Invalid(String),
}

/// 解码后的结构校验（字段组合是否自洽）
pub trait Validate {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// 返回文本中第一个括号平衡的 JSON 对象片段
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// 解码为 T 并校验
pub fn decode<T>(raw: &str) -> Result<T, OracleDecodeError>
where
    T: DeserializeOwned + Validate,
{
    let json = extract_json_object(raw).ok_or(OracleDecodeError::NoJsonObject)?;
    let value: T =
        serde_json::from_str(json).map_err(|e| OracleDecodeError::Malformed(e.to_string()))?;
    value.validate().map_err(OracleDecodeError::Invalid)?;
    Ok(value)
}
