//! Executor: runs one planner-selected tool under its timeout and records
//! the execution in the investigation state.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info_span, warn, Instrument};

use crate::config::Safeguards;
use crate::investigation::{InvestigationState, ToolExecution, ToolStatus};
use crate::tools::ToolRegistry;

/// Runs tools against the state. Failures never abort the investigation;
/// the planner observes them on the next iteration.
pub struct Executor {
    registry: Arc<ToolRegistry>,
    safeguards: Safeguards,
}

impl Executor {
    pub fn new(registry: Arc<ToolRegistry>, safeguards: Safeguards) -> Self {
        Self {
            registry,
            safeguards,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute `tool_name`, merge its outcome into the state, and return
    /// the log entry. Only the log entry is written on failure; domain
    /// tables are untouched either way.
    pub async fn run(&self, tool_name: &str, state: &mut InvestigationState) -> ToolExecution {
        let step_number = state.next_step_number();
        let model_mode = if state.feature_flags.reasoning_llm_enabled {
            "agentic"
        } else {
            "deterministic"
        };
        let span = info_span!(
            "tool_execution",
            investigation_id = %state.investigation_id,
            transaction_id = %state.transaction_id,
            tool_name = %tool_name,
            step_number,
            model_mode,
            tool_status = tracing::field::Empty,
        );

        let snapshot: &InvestigationState = &*state;
        let (execution, outcome) = async {
            let Some(tool) = self.registry.get(tool_name) else {
                warn!(tool_name = %tool_name, "tool not found in registry");
                let entry = ToolExecution {
                    step_number,
                    tool_name: tool_name.to_string(),
                    status: ToolStatus::Failed,
                    input_summary: String::new(),
                    output_summary: String::new(),
                    execution_time_ms: 0,
                    error_message: Some(format!("tool '{}' is not registered", tool_name)),
                };
                return (entry, None);
            };

            let timeout_ms = self.safeguards.timeout_for(tool_name);
            let started = Instant::now();
            let result =
                tokio::time::timeout(Duration::from_millis(timeout_ms), tool.run(snapshot)).await;
            let execution_time_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(Ok(outcome)) => {
                    let status = if outcome.fallback {
                        ToolStatus::Fallback
                    } else {
                        ToolStatus::Ok
                    };
                    let entry = ToolExecution {
                        step_number,
                        tool_name: tool_name.to_string(),
                        status,
                        input_summary: outcome.input_summary.clone(),
                        output_summary: outcome.output_summary.clone(),
                        execution_time_ms,
                        error_message: None,
                    };
                    (entry, Some(outcome))
                }
                Ok(Err(e)) => {
                    warn!(tool_name = %tool_name, error = %e, "tool execution failed");
                    let entry = ToolExecution {
                        step_number,
                        tool_name: tool_name.to_string(),
                        status: ToolStatus::Failed,
                        input_summary: String::new(),
                        output_summary: String::new(),
                        execution_time_ms,
                        error_message: Some(e.to_string()),
                    };
                    (entry, None)
                }
                Err(_) => {
                    warn!(tool_name = %tool_name, timeout_ms, "tool execution timed out");
                    let entry = ToolExecution {
                        step_number,
                        tool_name: tool_name.to_string(),
                        status: ToolStatus::Timeout,
                        input_summary: String::new(),
                        output_summary: String::new(),
                        execution_time_ms,
                        error_message: Some(format!("timed out after {}ms", timeout_ms)),
                    };
                    (entry, None)
                }
            }
        }
        .instrument(span.clone())
        .await;

        span.record("tool_status", execution.status.as_str());
        if let Some(outcome) = outcome {
            state.apply_outcome(tool_name, outcome);
        }
        state.record_execution(execution.clone());
        execution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureFlags;
    use crate::error::{Error, Result};
    use crate::investigation::{InvestigationMode, ToolOutcome};
    use crate::tools::AnalysisTool;
    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    enum StubBehavior {
        Succeed,
        Fail,
        Hang,
        Fallback,
    }

    struct StubTool {
        name: &'static str,
        behavior: StubBehavior,
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
            &[]
        }

        async fn run(&self, _state: &InvestigationState) -> Result<ToolOutcome> {
            match self.behavior {
                StubBehavior::Succeed => Ok(ToolOutcome::default()
                    .with_output(json!({"worked": true}))
                    .with_summaries("in", "out")),
                StubBehavior::Fail => Err(Error::dependency("stub", "simulated failure")),
                StubBehavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(ToolOutcome::default())
                }
                StubBehavior::Fallback => {
                    let mut outcome = ToolOutcome::default().with_output(json!({"degraded": true}));
                    outcome.fallback = true;
                    Ok(outcome)
                }
            }
        }
    }

    fn executor(behavior: StubBehavior) -> Executor {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StubTool {
            name: "stub",
            behavior,
        }));
        let mut safeguards = Safeguards::default();
        safeguards.tool_timeout_ms = 100;
        Executor::new(Arc::new(registry), safeguards)
    }

    fn state() -> InvestigationState {
        InvestigationState::new(
            Uuid::new_v4(),
            "txn-1",
            InvestigationMode::Full,
            FeatureFlags::default(),
        )
    }

    #[tokio::test]
    async fn test_success_merges_outcome() {
        let mut s = state();
        let entry = executor(StubBehavior::Succeed).run("stub", &mut s).await;

        assert_eq!(entry.status, ToolStatus::Ok);
        assert_eq!(entry.step_number, 1);
        assert_eq!(entry.output_summary, "out");
        assert_eq!(s.tool_outputs["stub"]["worked"], true);
        assert_eq!(s.step_count, 1);
        assert!(s.has_succeeded("stub"));
    }

    #[tokio::test]
    async fn test_failure_records_log_only() {
        let mut s = state();
        let entry = executor(StubBehavior::Fail).run("stub", &mut s).await;

        assert_eq!(entry.status, ToolStatus::Failed);
        assert!(entry.error_message.as_deref().unwrap().contains("simulated failure"));
        assert!(!s.has_succeeded("stub"));
        assert!(s.tool_outputs.is_empty());
        // The failed attempt still consumes a step.
        assert_eq!(s.step_count, 1);
    }

    #[tokio::test]
    async fn test_timeout_is_contained() {
        let mut s = state();
        let entry = executor(StubBehavior::Hang).run("stub", &mut s).await;

        assert_eq!(entry.status, ToolStatus::Timeout);
        assert!(entry.error_message.as_deref().unwrap().contains("timed out"));
        assert!(!s.has_succeeded("stub"));
    }

    #[tokio::test]
    async fn test_fallback_outcome_status() {
        let mut s = state();
        let entry = executor(StubBehavior::Fallback).run("stub", &mut s).await;

        assert_eq!(entry.status, ToolStatus::Fallback);
        // Fallback output still merges; the tool produced usable results.
        assert_eq!(s.tool_outputs["stub"]["degraded"], true);
        assert!(s.has_succeeded("stub"));
    }

    #[tokio::test]
    async fn test_unknown_tool_records_failed_entry() {
        let mut s = state();
        let entry = executor(StubBehavior::Succeed).run("ghost", &mut s).await;

        assert_eq!(entry.status, ToolStatus::Failed);
        assert!(entry.error_message.as_deref().unwrap().contains("not registered"));
        assert_eq!(s.step_count, 1);
        assert!(s.tool_outputs.is_empty());
    }

    #[tokio::test]
    async fn test_per_tool_timeout_override() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StubTool {
            name: "slow",
            behavior: StubBehavior::Hang,
        }));
        let mut safeguards = Safeguards::default();
        safeguards.tool_timeout_ms = 60_000;
        safeguards
            .tool_timeout_overrides_ms
            .insert("slow".to_string(), 50);
        let executor = Executor::new(Arc::new(registry), safeguards);

        let mut s = state();
        let started = Instant::now();
        let entry = executor.run("slow", &mut s).await;
        assert_eq!(entry.status, ToolStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
