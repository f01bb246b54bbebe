//! Planner: selects the next tool for the investigation loop.
//!
//! LLM-primary with strict validation against the valid menu; two
//! consecutive invalid responses, an open circuit breaker, or a repeated
//! selection switch the run to the deterministic sequence for its
//! remainder.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::investigation::InvestigationState;
use crate::llm::{
    extract_json, CircuitBreaker, CompletionClient, CompletionRequest, FieldSpec, FieldType,
    OutputSchema,
};
use crate::tools::{name, ToolRegistry};

/// The fallback execution order. `rule_draft` only enters the menu once a
/// rule-candidate recommendation exists.
pub const DETERMINISTIC_SEQUENCE: [&str; 6] = [
    name::CONTEXT,
    name::PATTERN,
    name::SIMILARITY,
    name::REASONING,
    name::RECOMMENDATION,
    name::RULE_DRAFT,
];

/// Outcome of one planning step.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerAction {
    /// Run the named tool next.
    Run {
        tool: String,
        rationale: String,
        /// True when the deterministic sequence made the choice.
        fallback: bool,
    },
    /// Finish the investigation.
    Complete { rationale: String },
}

/// Per-run planner. Holds the fallback latch and invalid-response streak
/// for one investigation loop.
pub struct Planner {
    llm: Arc<dyn CompletionClient>,
    breaker: Arc<CircuitBreaker>,
    model: String,
    max_steps: u32,
    invalid_streak: u32,
    forced_deterministic: bool,
    last_selected: Option<String>,
}

impl Planner {
    pub fn new(
        llm: Arc<dyn CompletionClient>,
        breaker: Arc<CircuitBreaker>,
        model: impl Into<String>,
        max_steps: u32,
    ) -> Self {
        Self {
            llm,
            breaker,
            model: model.into(),
            max_steps,
            invalid_streak: 0,
            forced_deterministic: false,
            last_selected: None,
        }
    }

    fn output_schema() -> OutputSchema {
        OutputSchema::new(vec![
            FieldSpec::new("tool_name", FieldType::String),
            FieldSpec::new("rationale", FieldType::String),
        ])
    }

    /// Decide the next action for the loop.
    pub async fn next_action(
        &mut self,
        registry: &ToolRegistry,
        state: &InvestigationState,
    ) -> PlannerAction {
        let menu = registry.valid_menu(state);

        if menu.is_empty() {
            return PlannerAction::Complete {
                rationale: "no runnable tools remain".to_string(),
            };
        }
        if state.step_count >= self.max_steps {
            return PlannerAction::Complete {
                rationale: format!("step cap of {} reached", self.max_steps),
            };
        }

        if self.forced_deterministic {
            return self.deterministic(&menu, "deterministic sequence active");
        }
        if self.breaker.is_open() {
            return self.deterministic(&menu, "planner circuit breaker open");
        }

        // Primary path: one LLM call, validated; a second consecutive
        // invalid response latches the deterministic sequence.
        for _ in 0..2 {
            match self.ask_llm(registry, state, &menu).await {
                Some((tool, rationale)) => {
                    if self.last_selected.as_deref() == Some(tool.as_str()) {
                        warn!(tool = %tool, "planner repeated its previous selection");
                        self.forced_deterministic = true;
                        return self.deterministic(&menu, "planner repeated the last tool");
                    }
                    self.invalid_streak = 0;
                    self.last_selected = Some(tool.clone());
                    return PlannerAction::Run {
                        tool,
                        rationale,
                        fallback: false,
                    };
                }
                None => {
                    self.invalid_streak += 1;
                    if self.invalid_streak >= 2 {
                        self.forced_deterministic = true;
                        return self
                            .deterministic(&menu, "planner produced two invalid selections");
                    }
                }
            }
        }

        self.forced_deterministic = true;
        self.deterministic(&menu, "planner exhausted its attempts")
    }

    async fn ask_llm(
        &self,
        registry: &ToolRegistry,
        state: &InvestigationState,
        menu: &[&'static str],
    ) -> Option<(String, String)> {
        let request = self.build_prompt(registry, state, menu);

        let response = match self.llm.complete(request).await {
            Ok(response) => {
                self.breaker.record_success();
                response
            }
            Err(e) => {
                warn!(error = %e, "planner LLM call failed");
                self.breaker.record_failure();
                return None;
            }
        };

        let value = extract_json(&response.content)?;
        if !Self::output_schema().validate(&value).is_empty() {
            debug!("planner response failed schema validation");
            return None;
        }

        let tool = value["tool_name"].as_str()?.trim().to_string();
        if !menu.contains(&tool.as_str()) {
            debug!(tool = %tool, "planner selected a tool outside the menu");
            return None;
        }

        let rationale = value["rationale"].as_str().unwrap_or_default().to_string();
        Some((tool, rationale))
    }

    fn build_prompt(
        &self,
        registry: &ToolRegistry,
        state: &InvestigationState,
        menu: &[&'static str],
    ) -> CompletionRequest {
        let mut body = format!(
            "Investigation of transaction {} (step {} of {}).\n",
            state.transaction_id,
            state.step_count + 1,
            self.max_steps
        );

        let completed: Vec<&str> = state.successful_tools().into_iter().collect();
        if !completed.is_empty() {
            body.push_str(&format!("Completed tools: {}.\n", completed.join(", ")));
        }
        if !state.evidence.is_empty() {
            let mut strongest: Vec<(&str, f64)> = state
                .evidence
                .iter()
                .map(|e| (e.category.as_str(), e.strength))
                .collect();
            strongest.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            strongest.truncate(5);
            let rendered: Vec<String> = strongest
                .iter()
                .map(|(c, s)| format!("{} ({:.2})", c, s))
                .collect();
            body.push_str(&format!("Evidence so far: {}.\n", rendered.join(", ")));
        }

        body.push_str("\nAvailable tools:\n");
        for (tool_name, description) in registry.menu_entries() {
            if menu.contains(&tool_name) {
                body.push_str(&format!("- {}: {}\n", tool_name, description));
            }
        }

        body.push_str("\nSelect exactly one tool from the list above.\n");
        body.push_str(&Self::output_schema().prompt_instructions());

        CompletionRequest::single_turn(
            Some("You plan a fraud investigation by choosing the most informative next tool.".into()),
            body,
        )
        .with_model(self.model.clone())
        .with_max_tokens(256)
    }

    fn deterministic(&self, menu: &[&'static str], reason: &str) -> PlannerAction {
        for tool in DETERMINISTIC_SEQUENCE {
            if menu.contains(&tool) {
                return PlannerAction::Run {
                    tool: tool.to_string(),
                    rationale: format!("{}; next in sequence", reason),
                    fallback: true,
                };
            }
        }
        PlannerAction::Complete {
            rationale: format!("{}; sequence exhausted", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureFlags;
    use crate::error::Error;
    use crate::investigation::{
        InvestigationMode, InvestigationState, ToolExecution, ToolOutcome, ToolStatus,
    };
    use crate::llm::testing::ScriptedCompletionClient;
    use crate::tools::AnalysisTool;
    use async_trait::async_trait;
    use std::time::Duration;
    use uuid::Uuid;

    struct StubTool {
        name: &'static str,
        prerequisites: &'static [&'static str],
    }

    #[async_trait]
    impl AnalysisTool for StubTool {
        fn name(&self) -> &'static str {
            self.name
        }

        fn description(&self) -> &'static str {
            "stub"
        }

        fn prerequisites(&self) -> &'static [&'static str] {
            self.prerequisites
        }

        async fn run(&self, _state: &InvestigationState) -> crate::error::Result<ToolOutcome> {
            Ok(ToolOutcome::default())
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StubTool { name: name::CONTEXT, prerequisites: &[] }));
        registry.register(Arc::new(StubTool {
            name: name::PATTERN,
            prerequisites: &[name::CONTEXT],
        }));
        registry.register(Arc::new(StubTool {
            name: name::SIMILARITY,
            prerequisites: &[name::CONTEXT],
        }));
        registry.register(Arc::new(StubTool {
            name: name::REASONING,
            prerequisites: &[name::PATTERN, name::SIMILARITY],
        }));
        registry
    }

    fn state() -> InvestigationState {
        InvestigationState::new(
            Uuid::new_v4(),
            "txn-1",
            InvestigationMode::Full,
            FeatureFlags::default(),
        )
    }

    fn mark_succeeded(state: &mut InvestigationState, tool: &str) {
        let step = state.next_step_number();
        state.record_execution(ToolExecution {
            step_number: step,
            tool_name: tool.to_string(),
            status: ToolStatus::Ok,
            input_summary: String::new(),
            output_summary: String::new(),
            execution_time_ms: 1,
            error_message: None,
        });
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(3, Duration::from_secs(60)))
    }

    fn planner(llm: Arc<ScriptedCompletionClient>) -> Planner {
        Planner::new(llm, breaker(), "planner-model", 20)
    }

    #[tokio::test]
    async fn test_valid_llm_selection() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        llm.push_text(r#"{"tool_name": "context", "rationale": "nothing assembled yet"}"#);

        let action = planner(llm).next_action(&registry(), &state()).await;
        assert_eq!(
            action,
            PlannerAction::Run {
                tool: "context".to_string(),
                rationale: "nothing assembled yet".to_string(),
                fallback: false,
            }
        );
    }

    #[tokio::test]
    async fn test_empty_menu_completes() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        let registry = registry();
        let mut s = state();
        for tool in [name::CONTEXT, name::PATTERN, name::SIMILARITY, name::REASONING] {
            mark_succeeded(&mut s, tool);
        }

        let action = planner(llm.clone()).next_action(&registry, &s).await;
        assert!(matches!(action, PlannerAction::Complete { .. }));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_step_cap_completes() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        let mut s = state();
        mark_succeeded(&mut s, name::CONTEXT);

        let mut planner = Planner::new(llm, breaker(), "planner-model", 1);
        let action = planner.next_action(&registry(), &s).await;
        assert!(matches!(action, PlannerAction::Complete { .. }));
    }

    #[tokio::test]
    async fn test_invalid_tool_twice_latches_deterministic() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        llm.push_text(r#"{"tool_name": "nonexistent", "rationale": "x"}"#);
        llm.push_text(r#"{"tool_name": "also_wrong", "rationale": "x"}"#);

        let mut planner = planner(llm.clone());
        let action = planner.next_action(&registry(), &state()).await;
        assert_eq!(
            action,
            PlannerAction::Run {
                tool: "context".to_string(),
                rationale: "planner produced two invalid selections; next in sequence".to_string(),
                fallback: true,
            }
        );

        // The latch holds for the rest of the run: no further LLM calls.
        let mut s = state();
        mark_succeeded(&mut s, name::CONTEXT);
        let action = planner.next_action(&registry(), &s).await;
        assert!(matches!(action, PlannerAction::Run { ref tool, fallback: true, .. } if tool == "pattern"));
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_prerequisite_violating_selection_rejected() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        // Reasoning requires pattern+similarity; it is not in the menu yet.
        llm.push_text(r#"{"tool_name": "reasoning", "rationale": "skip ahead"}"#);
        llm.push_text(r#"{"tool_name": "reasoning", "rationale": "skip ahead"}"#);

        let action = planner(llm).next_action(&registry(), &state()).await;
        assert!(matches!(action, PlannerAction::Run { ref tool, fallback: true, .. } if tool == "context"));
    }

    #[tokio::test]
    async fn test_repeat_selection_falls_back() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        llm.push_text(r#"{"tool_name": "context", "rationale": "start"}"#);
        llm.push_text(r#"{"tool_name": "context", "rationale": "again"}"#);

        let registry = registry();
        let mut planner = planner(llm);

        let first = planner.next_action(&registry, &state()).await;
        assert!(matches!(first, PlannerAction::Run { fallback: false, .. }));

        // Context failed (still in menu); the LLM repeats itself.
        let mut s = state();
        s.record_execution(ToolExecution {
            step_number: 1,
            tool_name: name::CONTEXT.to_string(),
            status: ToolStatus::Failed,
            input_summary: String::new(),
            output_summary: String::new(),
            execution_time_ms: 1,
            error_message: Some("boom".to_string()),
        });
        let second = planner.next_action(&registry, &s).await;
        assert!(matches!(second, PlannerAction::Run { fallback: true, .. }));
    }

    #[tokio::test]
    async fn test_llm_errors_fall_back_and_trip_breaker() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        llm.push_error(Error::timeout(5_000));
        llm.push_error(Error::timeout(5_000));

        let shared = breaker();
        let mut planner = Planner::new(llm, shared.clone(), "planner-model", 20);
        let action = planner.next_action(&registry(), &state()).await;
        assert!(matches!(action, PlannerAction::Run { fallback: true, .. }));
    }

    #[tokio::test]
    async fn test_open_breaker_goes_deterministic_without_calls() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        let shared = breaker();
        shared.record_failure();
        shared.record_failure();
        shared.record_failure();

        let mut planner = Planner::new(llm.clone(), shared, "planner-model", 20);
        let action = planner.next_action(&registry(), &state()).await;
        assert!(matches!(action, PlannerAction::Run { fallback: true, .. }));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_deterministic_sequence_order() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        let registry = registry();
        let mut planner = planner(llm);
        planner.forced_deterministic = true;

        let mut s = state();
        mark_succeeded(&mut s, name::CONTEXT);
        mark_succeeded(&mut s, name::PATTERN);

        // Similarity precedes reasoning in the sequence.
        let action = planner.next_action(&registry, &s).await;
        assert!(matches!(action, PlannerAction::Run { ref tool, .. } if tool == "similarity"));
    }
}
