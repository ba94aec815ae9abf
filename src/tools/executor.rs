//! 工具执行器
//!
//! 持有注册表适配器与可选超时，invoke(tool_name, args) 调用 registry.invoke；
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::tools::{ToolError, ToolRegistryAdapter};

/// 工具执行器：审计每次调用；配置了超时才施加超时
pub struct ToolExecutor {
    registry: Arc<dyn ToolRegistryAdapter>,
    timeout: Option<Duration>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<dyn ToolRegistryAdapter>, timeout_secs: Option<u64>) -> Self {
        Self {
            registry,
            timeout: timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn registry(&self) -> &dyn ToolRegistryAdapter {
        self.registry.as_ref()
    }

    /// 调用指定工具；超时返回 ToolTimeout；输出 JSON 审计日志
    pub async fn invoke(&self, tool_name: &str, args: Value) -> Result<Value, ToolError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);

        let result = match self.timeout {
            Some(limit) => timeout(limit, self.registry.invoke(tool_name, args))
                .await
                .unwrap_or_else(|_| Err(ToolError::Timeout(tool_name.to_string()))),
            None => self.registry.invoke(tool_name, args).await,
        };

        let (ok, outcome): (bool, &str) = match &result {
            Ok(_) => (true, "ok"),
            Err(ToolError::Timeout(_)) => (false, "timeout"),
            Err(_) => (false, "error"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{LocalToolRegistry, Tool};
    use async_trait::async_trait;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn execute(&self, _args: Value) -> Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_timeout_only_when_configured() {
        let mut registry = LocalToolRegistry::new();
        registry.register(SlowTool);
        let executor = ToolExecutor::new(Arc::new(registry), Some(0));
        let err = executor.invoke("slow", Value::Null).await.unwrap_err();
        assert_eq!(err, ToolError::Timeout("slow".to_string()));
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = Value::String("x".repeat(500));
        assert!(args_preview(&long).ends_with("..."));
    }
}
