//! Core domain types for investigations and their persisted artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::{FeatureFlags, Safeguards};

/// How much analysis depth a run is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestigationMode {
    Quick,
    Deep,
    Full,
}

impl InvestigationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Deep => "deep",
            Self::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quick" => Some(Self::Quick),
            "deep" => Some(Self::Deep),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

impl std::fmt::Display for InvestigationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of an investigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl InvestigationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the investigation occupies the per-transaction active slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for InvestigationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fraud severity. Ordering follows escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// One level down, saturating at Low.
    pub fn lowered(&self) -> Self {
        match self {
            Self::Critical => Self::High,
            Self::High => Self::Medium,
            Self::Medium | Self::Low => Self::Low,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether the run used the agentic (LLM-enabled) pipeline. Agentic covers
/// fallback outcomes too; `LlmStatus` distinguishes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelMode {
    Agentic,
    Deterministic,
}

impl ModelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agentic => "agentic",
            Self::Deterministic => "deterministic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agentic" => Some(Self::Agentic),
            "deterministic" => Some(Self::Deterministic),
            _ => None,
        }
    }
}

impl std::fmt::Display for ModelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of the reasoning LLM path, exposed instead of provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmStatus {
    Disabled,
    Skipped,
    Success,
    Fallback,
    Failed,
}

impl LlmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Skipped => "skipped",
            Self::Success => "success",
            Self::Fallback => "fallback",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disabled" => Some(Self::Disabled),
            "skipped" => Some(Self::Skipped),
            "success" => Some(Self::Success),
            "fallback" => Some(Self::Fallback),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for LlmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One end-to-end analytic run on a single transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investigation {
    pub id: Uuid,
    pub transaction_id: String,
    pub mode: InvestigationMode,
    pub status: InvestigationStatus,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub step_count: u32,
    pub max_steps: u32,
    pub planner_model: String,
    pub model_mode: ModelMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_status: Option<LlmStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    /// Flags captured at start; never re-read mid-run.
    pub runtime_feature_flags: FeatureFlags,
    /// Safety envelope captured at start.
    pub runtime_safeguards: Safeguards,
    /// Per-tool wall-clock durations recorded at completion.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stage_durations_ms: BTreeMap<String, u64>,
    /// Set when the run deadline forced completion with partial analysis.
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_ref: Option<String>,
}

/// The persisted summary produced at completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: Uuid,
    pub investigation_id: Uuid,
    pub transaction_id: String,
    pub evaluation_type: String,
    pub insight_type: String,
    pub model_mode: ModelMode,
    pub severity: Severity,
    pub summary: String,
    pub confidence_score: f64,
    pub transaction_timestamp: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub idempotency_key: String,
}

/// Recommendation categories exposed to analysts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationType {
    ReviewPriority,
    CaseAction,
    RuleCandidate,
}

impl RecommendationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReviewPriority => "review_priority",
            Self::CaseAction => "case_action",
            Self::RuleCandidate => "rule_candidate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "review_priority" => Some(Self::ReviewPriority),
            "case_action" => Some(Self::CaseAction),
            "rule_candidate" => Some(Self::RuleCandidate),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecommendationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Analyst-facing status of a persisted recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationStatus {
    Open,
    Acknowledged,
    Rejected,
    Exported,
}

impl RecommendationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::Rejected => "rejected",
            Self::Exported => "exported",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "acknowledged" => Some(Self::Acknowledged),
            "rejected" => Some(Self::Rejected),
            "exported" => Some(Self::Exported),
            _ => None,
        }
    }

    /// Legal transitions: OPEN→ACKNOWLEDGED, OPEN→REJECTED,
    /// ACKNOWLEDGED→EXPORTED.
    pub fn can_transition_to(&self, next: RecommendationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Acknowledged)
                | (Self::Open, Self::Rejected)
                | (Self::Acknowledged, Self::Exported)
        )
    }
}

impl std::fmt::Display for RecommendationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A recommendation produced by the recommendation tool, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationCandidate {
    pub rec_type: RecommendationType,
    /// 1 is most urgent, 5 least.
    pub priority: u8,
    pub title: String,
    pub impact: String,
    pub payload: Value,
    /// Hash over (type, title, normalized impact, policy-relevant payload
    /// fields); unique per insight.
    pub signature_hash: String,
}

/// A persisted recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Uuid,
    pub insight_id: Uuid,
    pub rec_type: RecommendationType,
    pub priority: u8,
    pub title: String,
    pub impact: String,
    pub payload: Value,
    pub signature_hash: String,
    pub status: RecommendationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

/// A single condition in a rule draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Feature the condition tests, e.g. "card_txn_count_1h".
    pub field: String,
    /// Comparison operator, e.g. ">" or ">=".
    pub operator: String,
    pub threshold: f64,
}

/// Export status of a rule draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDraftStatus {
    NotExported,
    Exported,
}

impl RuleDraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotExported => "not_exported",
            Self::Exported => "exported",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_exported" => Some(Self::NotExported),
            "exported" => Some(Self::Exported),
            _ => None,
        }
    }
}

/// A proposed fraud-rule package derived from a rule-candidate
/// recommendation. Export happens only on explicit analyst action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDraft {
    pub rule_name: String,
    pub rule_description: String,
    pub conditions: Vec<RuleCondition>,
    /// Raw triggering values the thresholds were derived from.
    pub thresholds: Value,
    pub metadata: Value,
}

/// An append-only audit record for a mutating transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub performed_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    pub ts: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        action: impl Into<String>,
        performed_by: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            action: action.into(),
            performed_by: performed_by.into(),
            old_value: None,
            new_value: None,
            ts: Utc::now(),
        }
    }

    pub fn with_old(mut self, value: Value) -> Self {
        self.old_value = Some(value);
        self
    }

    pub fn with_new(mut self, value: Value) -> Self {
        self.new_value = Some(value);
        self
    }
}

/// One hypothesis inside a reasoning outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub label: String,
    pub confidence: f64,
    #[serde(default)]
    pub supporting_evidence_refs: Vec<String>,
    #[serde(default)]
    pub counter_evidence_refs: Vec<String>,
}

/// Structured narrative produced by the reasoning tool (LLM or fallback).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningOutcome {
    pub severity: Severity,
    pub confidence: f64,
    pub narrative: String,
    #[serde(default)]
    pub known_facts: Vec<String>,
    #[serde(default)]
    pub unknowns: Vec<String>,
    #[serde(default)]
    pub hypotheses: Vec<Hypothesis>,
    #[serde(default)]
    pub what_would_change_my_mind: Vec<String>,
    pub llm_status: LlmStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_error: Option<String>,
}

/// Summary returned by `run_investigation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationSummary {
    pub investigation_id: Uuid,
    pub transaction_id: String,
    pub status: InvestigationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub step_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub model_mode: ModelMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_status: Option<LlmStatus>,
    #[serde(default)]
    pub partial: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::Critical.lowered(), Severity::High);
        assert_eq!(Severity::Low.lowered(), Severity::Low);
    }

    #[test]
    fn test_status_transitions() {
        use RecommendationStatus::*;
        assert!(Open.can_transition_to(Acknowledged));
        assert!(Open.can_transition_to(Rejected));
        assert!(Acknowledged.can_transition_to(Exported));
        assert!(!Open.can_transition_to(Exported));
        assert!(!Rejected.can_transition_to(Acknowledged));
        assert!(!Exported.can_transition_to(Open));
    }

    #[test]
    fn test_active_statuses() {
        assert!(InvestigationStatus::Pending.is_active());
        assert!(InvestigationStatus::InProgress.is_active());
        assert!(!InvestigationStatus::Completed.is_active());
        assert!(InvestigationStatus::Failed.is_terminal());
    }

    #[test]
    fn test_enum_round_trips() {
        for status in [
            InvestigationStatus::Pending,
            InvestigationStatus::InProgress,
            InvestigationStatus::Completed,
            InvestigationStatus::Failed,
        ] {
            assert_eq!(InvestigationStatus::parse(status.as_str()), Some(status));
        }
        for severity in [Severity::Low, Severity::Medium, Severity::High, Severity::Critical] {
            assert_eq!(Severity::parse(severity.as_str()), Some(severity));
        }
        for llm in [
            LlmStatus::Disabled,
            LlmStatus::Skipped,
            LlmStatus::Success,
            LlmStatus::Fallback,
            LlmStatus::Failed,
        ] {
            assert_eq!(LlmStatus::parse(llm.as_str()), Some(llm));
        }
    }

    #[test]
    fn test_severity_parse_case_insensitive() {
        assert_eq!(Severity::parse("HIGH"), Some(Severity::High));
    }
}
