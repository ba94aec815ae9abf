//! 动作参数 schema 查询与格式化
//!
//! 动作名先在工具列表中查找，再在工作流模板中查找；统一为 ActionSchema（必填 / 可选 / 属性定义）。

use serde_json::{Map, Value};

use crate::tools::{ToolError, ToolRegistryAdapter};

/// 动作来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Tool,
    Prompt,
}

#[derive(Debug, Clone)]
pub struct ActionSchema {
    pub name: String,
    pub kind: ActionKind,
    pub description: String,
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub properties: Map<String, Value>,
}

impl ActionSchema {
    pub fn declares(&self, param: &str) -> bool {
        self.required.iter().any(|p| p == param) || self.optional.iter().any(|p| p == param)
    }

    pub fn is_required(&self, param: &str) -> bool {
        self.required.iter().any(|p| p == param)
    }

    /// 供 prompt 使用的紧凑描述
    pub fn describe(&self) -> String {
        let mut lines = vec![format!("{} ({:?}): {}", self.name, self.kind, self.description)];
        for name in &self.required {
            lines.push(format!("  - {} (required){}", name, self.property_hint(name)));
        }
        for name in &self.optional {
            lines.push(format!("  - {} (optional){}", name, self.property_hint(name)));
        }
        lines.join("\n")
    }

    fn property_hint(&self, name: &str) -> String {
        let Some(prop) = self.properties.get(name) else {
            return String::new();
        };
        let ty = prop.get("type").and_then(Value::as_str).unwrap_or("any");
        match prop.get("description").and_then(Value::as_str) {
            Some(desc) => format!(" [{}] {}", ty, desc),
            None => format!(" [{}]", ty),
        }
    }
}

/// 查询动作的 schema；工具与模板都不存在时返回 None
pub async fn lookup_schema(
    registry: &dyn ToolRegistryAdapter,
    action: &str,
) -> Result<Option<ActionSchema>, ToolError> {
    let tools = registry.list_tools().await?;
    if let Some(tool) = tools.into_iter().find(|t| t.name == action) {
        let required = tool.input_schema.required.clone();
        let optional = tool
            .input_schema
            .properties
            .keys()
            .filter(|k| !required.contains(k))
            .cloned()
            .collect();
        return Ok(Some(ActionSchema {
            name: tool.name,
            kind: ActionKind::Tool,
            description: tool.description,
            required,
            optional,
            properties: tool.input_schema.properties,
        }));
    }

    let prompts = registry.list_prompts().await?;
    Ok(prompts.into_iter().find(|p| p.name == action).map(|p| {
        let (required, optional): (Vec<_>, Vec<_>) =
            p.arguments.iter().partition(|a| a.required);
        let properties = p
            .arguments
            .iter()
            .map(|a| {
                let mut prop = Map::new();
                prop.insert("type".into(), Value::String("string".into()));
                if let Some(desc) = &a.description {
                    prop.insert("description".into(), Value::String(desc.clone()));
                }
                (a.name.clone(), Value::Object(prop))
            })
            .collect();
        ActionSchema {
            name: p.name,
            kind: ActionKind::Prompt,
            description: p.description,
            required: required.into_iter().map(|a| a.name.clone()).collect(),
            optional: optional.into_iter().map(|a| a.name.clone()).collect(),
            properties,
        }
    }))
}

/// 参数名是否形如标识符（id / _id / facilityId / facility_id）
pub fn is_identifier_field(name: &str) -> bool {
    name == "id"
        || name == "_id"
        || name.ends_with("_id")
        || name.ends_with("Id")
        || name.ends_with("ID")
}

/// 值是否视为「缺失」：null、空串、字符串 "null"
pub fn is_missing_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let s = s.trim();
            s.is_empty() || s.eq_ignore_ascii_case("null")
        }
        _ => false,
    }
}
