//! Stepwise - 计划步骤执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与步骤失败分类
//! - **engine**: 协调、校验、调用、错误恢复、追问与进度评估
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: tracing 日志初始化
//! - **oracle**: LLM 决策的解码与校验边界
//! - **tools**: 工具注册表适配器、进程内注册表与执行器

pub mod config;
pub mod core;
pub mod engine;
pub mod llm;
pub mod observability;
pub mod oracle;
pub mod tools;
