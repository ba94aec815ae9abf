//! 进程内工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 LocalToolRegistry 按名注册，
//! 并实现 ToolRegistryAdapter：供演示、测试与嵌入式场景使用，无需远端注册表。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::tools::schema::{is_identifier_field, is_missing_value};
use crate::tools::{
    InputSchema, ParamCategorization, PromptDescriptor, ToolDescriptor, ToolError,
    ToolRegistryAdapter, ValidationContext, ValidationReport,
};

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 与结果均为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String>;
}

/// 进程内注册表：工具按名存储 Arc<dyn Tool>，另可登记工作流模板描述
#[derive(Default)]
pub struct LocalToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    prompts: Vec<PromptDescriptor>,
}

impl LocalToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn register_prompt(&mut self, prompt: PromptDescriptor) {
        self.prompts.retain(|p| p.name != prompt.name);
        self.prompts.push(prompt);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    fn input_schema(tool: &dyn Tool) -> InputSchema {
        serde_json::from_value(tool.parameters_schema()).unwrap_or_default()
    }

    /// 缺失参数分类：声明了 default → 可推断；标识符形参数 → 可调用其它工具解析；其余必须问用户
    fn categorize(schema: &InputSchema, missing: &[String]) -> ParamCategorization {
        let mut cat = ParamCategorization::default();
        for name in missing {
            let has_default = schema
                .properties
                .get(name)
                .map(|p| p.get("default").is_some())
                .unwrap_or(false);
            if has_default {
                cat.can_infer.push(name.clone());
            } else if is_identifier_field(name) {
                cat.resolvable.push(name.clone());
            } else {
                cat.must_ask_user.push(name.clone());
            }
        }
        cat
    }
}

#[async_trait]
impl ToolRegistryAdapter for LocalToolRegistry {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        let mut tools: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: Self::input_schema(t.as_ref()),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>, ToolError> {
        Ok(self.prompts.clone())
    }

    async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(arguments)
            .await
            .map_err(|message| ToolError::Execution {
                tool: name.to_string(),
                message,
            })
    }

    async fn validate(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        _context: &ValidationContext,
    ) -> Result<ValidationReport, ToolError> {
        let schema = match self.tools.get(name) {
            Some(tool) => Self::input_schema(tool.as_ref()),
            None => {
                let prompt = self
                    .prompts
                    .iter()
                    .find(|p| p.name == name)
                    .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
                InputSchema {
                    properties: Map::new(),
                    required: prompt
                        .arguments
                        .iter()
                        .filter(|a| a.required)
                        .map(|a| a.name.clone())
                        .collect(),
                }
            }
        };

        let provided_params: Vec<String> = arguments
            .iter()
            .filter(|(_, v)| !is_missing_value(v))
            .map(|(k, _)| k.clone())
            .collect();
        let missing_params: Vec<String> = schema
            .required
            .iter()
            .filter(|r| !provided_params.contains(r))
            .cloned()
            .collect();

        Ok(ValidationReport {
            is_valid: missing_params.is_empty(),
            categorization: Self::categorize(&schema, &missing_params),
            missing_params,
            required_params: schema.required.clone(),
            provided_params,
        })
    }
}
