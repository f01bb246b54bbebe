//! Analysis tools and their registry.
//!
//! A tool is a bounded unit of analysis: it reads the investigation state,
//! performs its work, and returns a [`ToolOutcome`] state delta plus log
//! summaries. Tools never write to domain tables; only the completion node
//! does that.

mod context;
mod pattern;
mod recommendation;
mod reasoning;
mod rule_draft;
mod similarity;

pub use context::ContextTool;
pub use pattern::PatternTool;
pub use reasoning::{severity_from_evidence, ReasoningTool};
pub use recommendation::RecommendationTool;
pub use rule_draft::RuleDraftTool;
pub use similarity::SimilarityTool;

use crate::error::Result;
use crate::investigation::{InvestigationState, ToolOutcome};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registered tool names.
pub mod name {
    pub const CONTEXT: &str = "context";
    pub const PATTERN: &str = "pattern";
    pub const SIMILARITY: &str = "similarity";
    pub const REASONING: &str = "reasoning";
    pub const RECOMMENDATION: &str = "recommendation";
    pub const RULE_DRAFT: &str = "rule_draft";
}

/// A bounded unit of analysis with a fixed input/output contract.
#[async_trait]
pub trait AnalysisTool: Send + Sync {
    /// Registered name; the planner selects by this name.
    fn name(&self) -> &'static str;

    /// One-line description shown in the planner menu.
    fn description(&self) -> &'static str;

    /// Tools that must have succeeded before this one may run.
    fn prerequisites(&self) -> &'static [&'static str];

    /// Whether the tool may run against the current state. The default
    /// checks prerequisites only.
    fn is_ready(&self, state: &InvestigationState) -> bool {
        self.prerequisites()
            .iter()
            .all(|dep| state.has_succeeded(dep))
    }

    /// Run the tool and return its state delta.
    async fn run(&self, state: &InvestigationState) -> Result<ToolOutcome>;
}

/// Resolves tool names to their executable contracts.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn AnalysisTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its name. Last registration wins.
    pub fn register(&mut self, tool: Arc<dyn AnalysisTool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AnalysisTool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered names in stable order.
    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    /// (name, description) pairs for planner prompts.
    pub fn menu_entries(&self) -> Vec<(&'static str, &'static str)> {
        self.tools
            .values()
            .map(|t| (t.name(), t.description()))
            .collect()
    }

    /// Tools that are ready to run and have not yet succeeded.
    pub fn valid_menu(&self, state: &InvestigationState) -> Vec<&'static str> {
        self.tools
            .values()
            .filter(|t| !state.has_succeeded(t.name()) && t.is_ready(state))
            .map(|t| t.name())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureFlags;
    use crate::investigation::{InvestigationMode, InvestigationState};
    use serde_json::Value;
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

        async fn run(&self, _state: &InvestigationState) -> Result<ToolOutcome> {
            Ok(ToolOutcome::default().with_output(Value::from(true)))
        }
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
        state.record_execution(crate::investigation::ToolExecution {
            step_number: step,
            tool_name: tool.to_string(),
            status: crate::investigation::ToolStatus::Ok,
            input_summary: String::new(),
            output_summary: String::new(),
            execution_time_ms: 1,
            error_message: None,
        });
    }

    #[test]
    fn test_menu_respects_prerequisites() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StubTool {
            name: name::CONTEXT,
            prerequisites: &[],
        }));
        registry.register(Arc::new(StubTool {
            name: name::PATTERN,
            prerequisites: &[name::CONTEXT],
        }));

        let mut s = state();
        assert_eq!(registry.valid_menu(&s), vec![name::CONTEXT]);

        mark_succeeded(&mut s, name::CONTEXT);
        assert_eq!(registry.valid_menu(&s), vec![name::PATTERN]);

        mark_succeeded(&mut s, name::PATTERN);
        assert!(registry.valid_menu(&s).is_empty());
    }

    #[test]
    fn test_lookup_unknown_tool() {
        let registry = ToolRegistry::new();
        assert!(registry.get("nonexistent").is_none());
        assert!(!registry.contains("nonexistent"));
    }
}
