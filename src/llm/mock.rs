//! Mock LLM 客户端（用于测试与离线演示，无需 API）
//!
//! - MockLlmClient：始终不可用，驱动各组件走兜底逻辑
//! - ScriptedLlmClient：按 system prompt 中的角色标记路由预置回复，并记录每次调用

use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{CompletionRequest, LlmClient, LlmError};

/// 离线客户端：每次调用都返回 Unavailable
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
        Err(LlmError::Unavailable("mock client has no backend".to_string()))
    }
}

/// 脚本化客户端：`route(marker, reply)` 命中 system prompt 含 marker 的请求；
/// 同一 marker 可注册多条回复，按顺序消费，最后一条重复使用
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    routes: Mutex<Vec<(String, Vec<String>)>>,
    fallback: Option<String>,
    unavailable: bool,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有请求都失败（模拟 Oracle 不可达）
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn route(self, marker: impl Into<String>, reply: impl Into<String>) -> Self {
        let marker = marker.into();
        let reply = reply.into();
        if let Ok(mut routes) = self.routes.lock() {
            match routes.iter_mut().find(|(m, _)| *m == marker) {
                Some((_, replies)) => replies.push(reply),
                None => routes.push((marker, vec![reply])),
            }
        }
        self
    }

    /// 无路由命中时的回复
    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// 命中 marker 的调用次数
    pub fn calls_matching(&self, marker: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|r| r.system_prompt().contains(marker)).count())
            .unwrap_or(0)
    }

    /// 最近一次命中 marker 的 user prompt
    pub fn last_user_prompt(&self, marker: &str) -> Option<String> {
        self.calls.lock().ok().and_then(|c| {
            c.iter()
                .rev()
                .find(|r| r.system_prompt().contains(marker))
                .map(|r| r.user_prompt().to_string())
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        if self.unavailable {
            return Err(LlmError::Unavailable("scripted outage".to_string()));
        }

        let system = request.system_prompt();
        let mut routes = self
            .routes
            .lock()
            .map_err(|e| LlmError::ApiError(e.to_string()))?;
        if let Some((_, replies)) = routes.iter_mut().find(|(m, _)| system.contains(m.as_str())) {
            let reply = if replies.len() > 1 {
                replies.remove(0)
            } else {
                replies[0].clone()
            };
            return Ok(reply);
        }

        self.fallback
            .clone()
            .ok_or_else(|| LlmError::Unavailable("no scripted reply".to_string()))
    }
}
