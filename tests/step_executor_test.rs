//! 步骤执行引擎集成测试

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use stepwise::config::AppConfig;
    use stepwise::core::ErrorType;
    use stepwise::engine::{
        ExecutionState, PartialResult, Plan, PlanRunner, PlanValidator, RequestContext,
        RunOutcome, Step, StepExecutor, StepStatus,
    };
    use stepwise::llm::ScriptedLlmClient;
    use stepwise::oracle::ReasoningOracle;
    use stepwise::tools::{
        EchoTool, LocalToolRegistry, PromptDescriptor, Tool, ToolDescriptor, ToolError,
        ToolRegistryAdapter, ValidationContext, ValidationReport,
    };

    const HANNOVER_ID: &str = "6905db9211cc522275d5f013";

    /// get_facility：按 id 查询单个设施；fail 时始终返回 "not found"
    struct GetFacility {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Tool for GetFacility {
        fn name(&self) -> &str {
            "get_facility"
        }

        fn description(&self) -> &str {
            "Get one facility by id"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "verbose": {"type": "boolean"}
                },
                "required": ["id"]
            })
        }

        async fn execute(&self, args: Value) -> Result<Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("facility not found".to_string());
            }
            Ok(json!({"_id": args["id"], "name": "Hannover"}))
        }
    }

    struct ListFacilities {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for ListFacilities {
        fn name(&self) -> &str {
            "list_facilities"
        }

        fn description(&self) -> &str {
            "List all facilities"
        }

        async fn execute(&self, _args: Value) -> Result<Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!([{"_id": HANNOVER_ID, "name": "Hannover"}]))
        }
    }

    struct FacilityReport {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for FacilityReport {
        fn name(&self) -> &str {
            "facility_report"
        }

        fn description(&self) -> &str {
            "Build a report for a facility"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"facilityId": {"type": "string"}},
                "required": ["facilityId"]
            })
        }

        async fn execute(&self, _args: Value) -> Result<Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"ok": true}))
        }
    }

    /// summarize_alerts：limit 带 default，不依赖任何前序步骤
    struct SummarizeAlerts;

    #[async_trait]
    impl Tool for SummarizeAlerts {
        fn name(&self) -> &str {
            "summarize_alerts"
        }

        fn description(&self) -> &str {
            "Summarize the most recent alerts"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"limit": {"type": "integer", "default": 10}},
                "required": ["limit"]
            })
        }

        async fn execute(&self, args: Value) -> Result<Value, String> {
            Ok(json!({"summarized": args["limit"]}))
        }
    }

    /// 首次之后 list_tools 一律失败的注册表
    struct FlakyCatalog {
        inner: LocalToolRegistry,
        listings: AtomicUsize,
    }

    #[async_trait]
    impl ToolRegistryAdapter for FlakyCatalog {
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
            if self.listings.fetch_add(1, Ordering::SeqCst) >= 1 {
                return Err(ToolError::Registry("catalog offline".to_string()));
            }
            self.inner.list_tools().await
        }

        async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>, ToolError> {
            self.inner.list_prompts().await
        }

        async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
            self.inner.invoke(name, arguments).await
        }

        async fn validate(
            &self,
            name: &str,
            arguments: &Map<String, Value>,
            context: &ValidationContext,
        ) -> Result<ValidationReport, ToolError> {
            self.inner.validate(name, arguments, context).await
        }
    }

    struct Harness {
        llm: Arc<ScriptedLlmClient>,
        get_calls: Arc<AtomicUsize>,
        list_calls: Arc<AtomicUsize>,
        report_calls: Arc<AtomicUsize>,
        registry: Arc<LocalToolRegistry>,
    }

    fn harness(llm: ScriptedLlmClient, get_fails: bool) -> Harness {
        let get_calls = Arc::new(AtomicUsize::new(0));
        let list_calls = Arc::new(AtomicUsize::new(0));
        let report_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = LocalToolRegistry::new();
        registry.register(GetFacility {
            calls: get_calls.clone(),
            fail: get_fails,
        });
        registry.register(ListFacilities {
            calls: list_calls.clone(),
        });
        registry.register(FacilityReport {
            calls: report_calls.clone(),
        });
        registry.register(SummarizeAlerts);
        registry.register(EchoTool);
        Harness {
            llm: Arc::new(llm),
            get_calls,
            list_calls,
            report_calls,
            registry: Arc::new(registry),
        }
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.executor.backoff_base_ms = 0;
        config
    }

    impl Harness {
        fn oracle(&self) -> ReasoningOracle {
            ReasoningOracle::new(self.llm.clone())
        }

        fn executor(&self) -> StepExecutor {
            self.executor_with(&test_config())
        }

        fn executor_with(&self, config: &AppConfig) -> StepExecutor {
            StepExecutor::new(self.registry.clone(), self.oracle(), config).unwrap()
        }

        fn runner(&self) -> PlanRunner {
            PlanRunner::new(self.executor(), PlanValidator::new(self.oracle()))
        }
    }

    fn listed(output: Value) -> Vec<PartialResult> {
        vec![PartialResult {
            step_id: "s1".into(),
            step_order: 1,
            action: "list_facilities".into(),
            output,
        }]
    }

    fn state_for(step: &Step, query: &str, previous: Vec<PartialResult>) -> ExecutionState {
        ExecutionState::new(
            RequestContext::new(query),
            Plan::new("Show the requested facility", vec![step.clone()]),
        )
        .with_previous_results(previous)
    }

    #[tokio::test]
    async fn test_empty_lookup_is_coordination_error_without_invocation() {
        let h = harness(ScriptedLlmClient::unavailable(), false);
        let step = Step::new("s2", 2, "facility_report")
            .with_param("facilityId", json!("extracted_from_step_1"));
        let mut state = state_for(&step, "Report on Hannover", listed(json!([])));

        let outcome = h.executor().execute_step(&step, &mut state).await;

        assert!(!outcome.result.success);
        assert_eq!(outcome.result.status, StepStatus::Failed);
        assert_eq!(outcome.result.error_type, Some(ErrorType::CoordinationError));
        assert_eq!(outcome.result.retries, 0);
        assert_eq!(h.report_calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_successful_extraction_adds_only_declared_id() {
        let reply = json!({
            "needsCoordination": true,
            "reasoning": "the user asked for Hannover",
            "parameters": {"id": HANNOVER_ID},
            "extractedValues": {"id": HANNOVER_ID, "name": "Hannover"}
        })
        .to_string();
        let h = harness(
            ScriptedLlmClient::new().route("parameter coordinator", reply),
            false,
        );
        let step = Step::new("s2", 2, "get_facility");
        let mut state = state_for(
            &step,
            "Show me Hannover",
            listed(json!([{"_id": HANNOVER_ID, "name": "Hannover"}])),
        );

        let outcome = h.executor().execute_step(&step, &mut state).await;

        assert!(outcome.result.success);
        assert_eq!(outcome.result.retries, 1);
        assert_eq!(outcome.result.parameters_used.len(), 1);
        assert_eq!(outcome.result.parameters_used["id"], HANNOVER_ID);

        let update = outcome.plan_update.unwrap();
        assert!(update.original_parameters.is_empty());
        assert_eq!(update.updated_parameters["id"], HANNOVER_ID);

        // 原步骤未被修改；修订交由调用方提交
        assert!(step.parameters.is_empty());
        let revision = outcome.revision.unwrap();
        assert!(state.plan.commit(revision));
        assert_eq!(state.plan.version, 1);
        assert_eq!(state.plan.steps[0].parameters["id"], HANNOVER_ID);
    }

    #[tokio::test]
    async fn test_missing_values_are_discarded() {
        let reply = json!({
            "needsCoordination": true,
            "extractedValues": {"id": HANNOVER_ID, "verbose": "null"}
        })
        .to_string();
        let h = harness(
            ScriptedLlmClient::new().route("parameter coordinator", reply),
            false,
        );
        let step = Step::new("s2", 2, "get_facility").with_param("verbose", json!(""));
        let mut state = state_for(
            &step,
            "Show me Hannover",
            listed(json!([{"_id": HANNOVER_ID, "name": "Hannover"}])),
        );

        let outcome = h.executor().execute_step(&step, &mut state).await;

        assert!(outcome.result.success);
        assert!(!outcome.result.parameters_used.contains_key("verbose"));
        assert_eq!(outcome.result.parameters_used["id"], HANNOVER_ID);
    }

    #[tokio::test]
    async fn test_short_identifier_leaves_parameter_unset() {
        let reply = json!({"needsCoordination": true, "extractedValues": {"id": "6905db92"}}).to_string();
        let h = harness(
            ScriptedLlmClient::new().route("parameter coordinator", reply),
            false,
        );
        let step = Step::new("s2", 2, "get_facility");
        let mut state = state_for(&step, "Show me Hannover", listed(json!({"count": 1})));

        let outcome = h.executor().execute_step(&step, &mut state).await;

        assert!(!outcome.result.success);
        assert_eq!(outcome.result.error_type, Some(ErrorType::ValidationError));
        assert!(!outcome.result.parameters_used.contains_key("id"));
        assert_eq!(h.get_calls.load(Ordering::SeqCst), 0);

        let question = outcome.question.unwrap();
        assert_eq!(question.context.missing_params, vec!["id".to_string()]);
        assert_eq!(state.questions_asked.len(), 1);
    }

    #[tokio::test]
    async fn test_concrete_parameters_need_no_oracle() {
        let h = harness(ScriptedLlmClient::unavailable(), false);
        let step = Step::new("s2", 2, "get_facility").with_param("id", json!(HANNOVER_ID));
        let mut state = state_for(&step, "Show me Hannover", Vec::new());

        let outcome = h.executor().execute_step(&step, &mut state).await;

        assert!(outcome.result.success);
        assert!(outcome.plan_update.is_none());
        assert!(outcome.revision.is_none());
        assert_eq!(h.llm.call_count(), 0);
        assert_eq!(state.partial_results.len(), 1);
    }

    #[tokio::test]
    async fn test_adapt_switches_action_for_next_attempt() {
        let decision = json!({
            "decision": "adapt",
            "reason": "single lookup failed, list instead",
            "adaptation": {"adaptedAction": "list_facilities"}
        })
        .to_string();
        let h = harness(
            ScriptedLlmClient::new().route("error recovery advisor", decision),
            true,
        );
        let step = Step::new("s2", 2, "get_facility").with_param("id", json!(HANNOVER_ID));
        let mut state = state_for(&step, "Show me Hannover", Vec::new());

        let outcome = h.executor().execute_step(&step, &mut state).await;

        assert!(outcome.result.success);
        assert_eq!(outcome.result.tool_called, "list_facilities");
        assert_eq!(outcome.result.retries, 2);
        assert_eq!(h.get_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.list_calls.load(Ordering::SeqCst), 1);

        assert_eq!(state.adaptations.len(), 1);
        assert_eq!(state.adaptations[0].from_action, "get_facility");
        assert_eq!(
            outcome.plan_update.unwrap().updated_action.as_deref(),
            Some("list_facilities")
        );
        assert_eq!(outcome.revision.unwrap().action, "list_facilities");
    }

    fn adapt_to_report(adapted_parameters: Value) -> String {
        json!({
            "decision": "adapt",
            "reason": "lookup failed, build the report instead",
            "adaptation": {
                "adaptedAction": "facility_report",
                "adaptedParameters": adapted_parameters
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_adapted_action_is_recoordinated_from_previous_results() {
        let h = harness(
            ScriptedLlmClient::new().route("error recovery advisor", adapt_to_report(json!({}))),
            true,
        );
        let step = Step::new("s2", 2, "get_facility").with_param("id", json!(HANNOVER_ID));
        let mut state = state_for(
            &step,
            "Report on Hannover",
            listed(json!([{"_id": HANNOVER_ID, "name": "Hannover"}])),
        );

        let outcome = h.executor().execute_step(&step, &mut state).await;

        assert!(outcome.result.success);
        assert_eq!(outcome.result.tool_called, "facility_report");
        assert_eq!(outcome.result.parameters_used["facilityId"], HANNOVER_ID);
        assert_eq!(h.get_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.report_calls.load(Ordering::SeqCst), 1);
        // 协调 Oracle 只在切换动作后被询问一次
        assert_eq!(h.llm.calls_matching("parameter coordinator"), 1);
    }

    #[tokio::test]
    async fn test_adapt_without_recoordination_invokes_guarded_parameters() {
        let h = harness(
            ScriptedLlmClient::new().route(
                "error recovery advisor",
                adapt_to_report(json!({"facilityId": HANNOVER_ID, "note": "null"})),
            ),
            true,
        );
        let mut config = test_config();
        config.executor.recoordinate_on_adapt = false;
        let step = Step::new("s2", 2, "get_facility").with_param("id", json!(HANNOVER_ID));
        let mut state = state_for(
            &step,
            "Report on Hannover",
            listed(json!([{"_id": HANNOVER_ID, "name": "Hannover"}])),
        );

        let outcome = h.executor_with(&config).execute_step(&step, &mut state).await;

        assert!(outcome.result.success);
        assert_eq!(outcome.result.tool_called, "facility_report");
        assert_eq!(outcome.result.parameters_used.len(), 1);
        assert_eq!(outcome.result.parameters_used["facilityId"], HANNOVER_ID);
        assert_eq!(h.report_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.llm.calls_matching("parameter coordinator"), 0);
    }

    #[tokio::test]
    async fn test_empty_result_leaves_defaulted_param_to_resolver() {
        let h = harness(ScriptedLlmClient::unavailable(), false);
        let step = Step::new("s2", 2, "summarize_alerts");
        let mut state = state_for(&step, "Summarize alerts", listed(json!([])));

        let outcome = h.executor().execute_step(&step, &mut state).await;

        assert!(outcome.result.success);
        assert_eq!(outcome.result.error_type, None);
        assert_eq!(outcome.result.parameters_used["limit"], 10);
        assert_eq!(outcome.result.result, Some(json!({"summarized": 10})));
    }

    #[tokio::test]
    async fn test_error_handler_failure_keeps_last_tool_error() {
        let mut inner = LocalToolRegistry::new();
        inner.register(GetFacility {
            calls: Arc::new(AtomicUsize::new(0)),
            fail: true,
        });
        let registry = Arc::new(FlakyCatalog {
            inner,
            listings: AtomicUsize::new(0),
        });
        let oracle = ReasoningOracle::new(Arc::new(ScriptedLlmClient::unavailable()));
        let executor = StepExecutor::new(registry, oracle, &test_config()).unwrap();
        let step = Step::new("s2", 2, "get_facility").with_param("id", json!(HANNOVER_ID));
        let mut state = state_for(&step, "Show me Hannover", Vec::new());

        let outcome = executor.execute_step(&step, &mut state).await;

        assert_eq!(outcome.result.status, StepStatus::Failed);
        assert_eq!(outcome.result.error_type, Some(ErrorType::ToolError));
        assert!(outcome.result.error.unwrap().contains("facility not found"));
        assert_eq!(outcome.result.retries, 1);
        assert!(outcome.question.is_none());
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let h = harness(
            ScriptedLlmClient::new().route(
                "error recovery advisor",
                json!({"decision": "retry", "reason": "transient"}).to_string(),
            ),
            true,
        );
        let step = Step::new("s2", 2, "get_facility").with_param("id", json!(HANNOVER_ID));
        let mut state = state_for(&step, "Show me Hannover", Vec::new());

        let outcome = h.executor().execute_step(&step, &mut state).await;

        assert!(!outcome.result.success);
        assert_eq!(outcome.result.retries, 3);
        assert_eq!(outcome.result.error_type, Some(ErrorType::ToolError));
        assert_eq!(h.get_calls.load(Ordering::SeqCst), 3);
        assert_eq!(state.execution_results.len(), 1);
    }

    #[tokio::test]
    async fn test_decision_max_retries_lowers_the_bound() {
        let h = harness(
            ScriptedLlmClient::new().route(
                "error recovery advisor",
                json!({"decision": "retry", "maxRetries": 2}).to_string(),
            ),
            true,
        );
        let step = Step::new("s2", 2, "get_facility").with_param("id", json!(HANNOVER_ID));
        let mut state = state_for(&step, "Show me Hannover", Vec::new());

        let outcome = h.executor().execute_step(&step, &mut state).await;

        assert_eq!(outcome.result.retries, 2);
        assert_eq!(h.get_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_outage_asks_user() {
        let h = harness(ScriptedLlmClient::unavailable(), true);
        let step = Step::new("s2", 2, "get_facility").with_param("id", json!(HANNOVER_ID));
        let mut state = state_for(&step, "Show me Hannover", Vec::new());

        let outcome = h.executor().execute_step(&step, &mut state).await;

        assert_eq!(outcome.result.status, StepStatus::AwaitingUser);
        assert_eq!(outcome.result.retries, 1);
        let question = outcome.question.unwrap();
        assert_eq!(question.context.what_failed, "facility not found");
        assert!(!question.context.suggestion.is_empty());
    }

    #[tokio::test]
    async fn test_skip_does_not_block_the_plan() {
        let h = harness(
            ScriptedLlmClient::new().route(
                "error recovery advisor",
                json!({"decision": "skip", "reason": "not essential"}).to_string(),
            ),
            true,
        );
        let plan = Plan::new(
            "Greet and look up",
            vec![
                Step::new("s1", 1, "get_facility").with_param("id", json!(HANNOVER_ID)),
                Step::new("s2", 2, "echo").with_param("text", json!("hi")),
            ],
        );
        let state = ExecutionState::new(RequestContext::new("hi"), plan);

        let report = h.runner().run(state).await;

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].status, StepStatus::Skipped);
        assert!(report.results[1].success);
        assert!(report.errors.is_empty());
        assert!(matches!(report.outcome, RunOutcome::Completed));
    }

    #[tokio::test]
    async fn test_validator_fails_closed_and_halts_run() {
        let h = harness(
            ScriptedLlmClient::new().route(
                "error recovery advisor",
                json!({"decision": "retry"}).to_string(),
            ),
            true,
        );
        let plan = Plan::new(
            "Look up and report",
            vec![
                Step::new("s1", 1, "get_facility").with_param("id", json!(HANNOVER_ID)),
                Step::new("s2", 2, "echo").with_param("text", json!("done")),
            ],
        );
        let state = ExecutionState::new(RequestContext::new("Hannover"), plan);

        let report = h.runner().run(state).await;

        assert!(matches!(report.outcome, RunOutcome::Halted { .. }));
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.validations.len(), 1);
        assert!(!report.validations[0].should_continue);
    }

    #[tokio::test]
    async fn test_runner_completes_and_honours_cancellation() {
        let h = harness(ScriptedLlmClient::unavailable(), false);
        let steps = vec![
            Step::new("a", 1, "echo").with_param("text", json!("hello")),
            Step::new("b", 2, "echo").with_param("text", json!("again")),
        ];

        let report = h
            .runner()
            .run(ExecutionState::new(
                RequestContext::new("hello"),
                Plan::new("greet", steps.clone()),
            ))
            .await;
        assert!(matches!(report.outcome, RunOutcome::Completed));
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[1].result, Some(json!("again")));
        assert_eq!(report.plan.version, 0);

        let runner = h.runner();
        runner.cancel_token().cancel();
        let report = runner
            .run(ExecutionState::new(
                RequestContext::new("hello"),
                Plan::new("greet", steps),
            ))
            .await;
        assert!(matches!(report.outcome, RunOutcome::Cancelled));
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn test_report_serializes_outcome_tag() {
        let h = harness(ScriptedLlmClient::unavailable(), false);
        let steps = vec![Step::new("a", 1, "echo").with_param("text", json!("hello"))];
        let report = h
            .runner()
            .run(ExecutionState::new(
                RequestContext::new("hello"),
                Plan::new("greet", steps),
            ))
            .await;
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["outcome"], "completed");
        assert_eq!(v["results"][0]["status"], "succeeded");
    }
}
