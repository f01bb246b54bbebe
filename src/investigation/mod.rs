//! Investigation domain model and working state.

mod state;
mod types;

pub use state::{
    InvestigationState, PlannerDecision, ToolExecution, ToolOutcome, ToolStatus,
    STATE_SCHEMA_VERSION,
};
pub use types::{
    AuditEvent, Hypothesis, Insight, Investigation, InvestigationMode, InvestigationStatus,
    InvestigationSummary, LlmStatus, ModelMode, ReasoningOutcome, Recommendation,
    RecommendationCandidate, RecommendationStatus, RecommendationType, RuleCondition, RuleDraft,
    RuleDraftStatus, Severity,
};
