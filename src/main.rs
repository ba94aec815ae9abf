//! Stepwise - 计划步骤执行引擎
//!
//! 入口：初始化日志与配置，读取计划 JSON，按序执行并输出执行报告。
//!
//! 用法：`stepwise <plan.json> [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use stepwise::config::load_config;
use stepwise::engine::{
    ExecutionState, PartialResult, Plan, PlanRunner, PlanValidator, RequestContext, Step,
    StepExecutor,
};
use stepwise::llm::create_client_from_config;
use stepwise::oracle::ReasoningOracle;
use stepwise::tools::{EchoTool, LocalToolRegistry};

/// 计划文件格式
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanFile {
    goal: String,
    #[serde(default)]
    user_query: Option<String>,
    steps: Vec<Step>,
    #[serde(default)]
    previous_results: Vec<PartialResult>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stepwise::observability::init();

    let mut args = std::env::args().skip(1);
    let plan_path = args
        .next()
        .context("usage: stepwise <plan.json> [config.toml]")?;
    let config_path = args.next().map(PathBuf::from);

    let config = load_config(config_path).context("Failed to load config")?;
    let raw = std::fs::read_to_string(&plan_path)
        .with_context(|| format!("Failed to read plan file {plan_path}"))?;
    let file: PlanFile = serde_json::from_str(&raw).context("Invalid plan file")?;

    let llm = create_client_from_config(&config.llm);
    let oracle = ReasoningOracle::from_config(llm, &config.oracle);

    let mut registry = LocalToolRegistry::new();
    registry.register(EchoTool);
    let registry = Arc::new(registry);

    let executor = StepExecutor::new(registry, oracle.clone(), &config)
        .context("Failed to create step executor")?;
    let runner = PlanRunner::new(executor, PlanValidator::new(oracle.clone()));

    // Ctrl-C：不中断当前工具调用，只阻止下一步开始
    let cancel = runner.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let query = file.user_query.unwrap_or_else(|| file.goal.clone());
    let state = ExecutionState::new(RequestContext::new(query), Plan::new(file.goal, file.steps))
        .with_previous_results(file.previous_results);
    let report = runner.run(state).await;

    let (prompt, completion, total) = oracle.token_usage();
    tracing::info!(prompt, completion, total, "Oracle token usage");

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize report")?
    );
    Ok(())
}
