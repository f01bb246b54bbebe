//! Versioned working memory of the investigation loop.
//!
//! The state is persisted as a JSON blob after every step and rehydrated on
//! resume. A `schema_version` field plus a migration dispatch table keeps
//! older persisted blobs readable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::config::FeatureFlags;
use crate::error::{Error, Result};
use crate::evidence::EvidenceItem;
use crate::features::TransactionFeatures;

use super::types::{
    InvestigationMode, ReasoningOutcome, RecommendationCandidate, RuleDraft,
};

/// Current state blob schema version.
pub const STATE_SCHEMA_VERSION: u32 = 2;

/// Execution status of one tool run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolStatus {
    Ok,
    Failed,
    Timeout,
    Fallback,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Fallback => "FALLBACK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(Self::Ok),
            "FAILED" => Some(Self::Failed),
            "TIMEOUT" => Some(Self::Timeout),
            "FALLBACK" => Some(Self::Fallback),
            _ => None,
        }
    }

    /// Fallback still produced usable output.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::Fallback)
    }
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One planner decision, recorded whether it came from the LLM or the
/// deterministic sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerDecision {
    pub step_number: u32,
    /// Tool name, or "COMPLETE".
    pub selected_tool: String,
    pub rationale: String,
    pub fallback: bool,
    pub ts: DateTime<Utc>,
}

/// One tool execution log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    pub step_number: u32,
    pub tool_name: String,
    pub status: ToolStatus,
    pub input_summary: String,
    pub output_summary: String,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// State delta returned by a tool run. The executor merges it into the
/// investigation state; tools never write to domain tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Tool-keyed summary payload stored under the tool's name.
    pub output: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<EvidenceItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<TransactionFeatures>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<RecommendationCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_draft: Option<RuleDraft>,
    /// The tool produced output through its degraded path.
    #[serde(default)]
    pub fallback: bool,
    #[serde(default)]
    pub input_summary: String,
    #[serde(default)]
    pub output_summary: String,
}

impl ToolOutcome {
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_evidence(mut self, evidence: Vec<EvidenceItem>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn with_summaries(
        mut self,
        input_summary: impl Into<String>,
        output_summary: impl Into<String>,
    ) -> Self {
        self.input_summary = input_summary.into();
        self.output_summary = output_summary.into();
        self
    }
}

/// The working memory of one investigation loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationState {
    pub schema_version: u32,
    pub investigation_id: Uuid,
    pub transaction_id: String,
    pub mode: InvestigationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<TransactionFeatures>,
    /// Per-tool outputs keyed by tool name.
    #[serde(default)]
    pub tool_outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
    #[serde(default)]
    pub planner_decisions: Vec<PlannerDecision>,
    #[serde(default)]
    pub tool_executions: Vec<ToolExecution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningOutcome>,
    #[serde(default)]
    pub recommendation_candidates: Vec<RecommendationCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_draft_candidate: Option<RuleDraft>,
    /// Flags captured at start; the loop never re-reads live flags.
    pub feature_flags: FeatureFlags,
    pub step_count: u32,
}

impl InvestigationState {
    pub fn new(
        investigation_id: Uuid,
        transaction_id: impl Into<String>,
        mode: InvestigationMode,
        feature_flags: FeatureFlags,
    ) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            investigation_id,
            transaction_id: transaction_id.into(),
            mode,
            features: None,
            tool_outputs: BTreeMap::new(),
            evidence: Vec::new(),
            planner_decisions: Vec::new(),
            tool_executions: Vec::new(),
            reasoning: None,
            recommendation_candidates: Vec::new(),
            rule_draft_candidate: None,
            feature_flags,
            step_count: 0,
        }
    }

    /// Tools that have completed with a usable result.
    pub fn successful_tools(&self) -> BTreeSet<&str> {
        self.tool_executions
            .iter()
            .filter(|e| e.status.is_success())
            .map(|e| e.tool_name.as_str())
            .collect()
    }

    pub fn has_succeeded(&self, tool_name: &str) -> bool {
        self.tool_executions
            .iter()
            .any(|e| e.tool_name == tool_name && e.status.is_success())
    }

    /// Step number for the next execution (contiguous from 1).
    pub fn next_step_number(&self) -> u32 {
        self.step_count + 1
    }

    /// Record a planner decision. Re-recording the same step number (resume
    /// after a crash between decision and execution) replaces the entry.
    pub fn record_decision(&mut self, decision: PlannerDecision) {
        if let Some(existing) = self
            .planner_decisions
            .iter_mut()
            .find(|d| d.step_number == decision.step_number)
        {
            *existing = decision;
        } else {
            self.planner_decisions.push(decision);
        }
    }

    /// Record a tool execution, idempotent by step number, and advance the
    /// step counter.
    pub fn record_execution(&mut self, execution: ToolExecution) {
        let step = execution.step_number;
        if let Some(existing) = self
            .tool_executions
            .iter_mut()
            .find(|e| e.step_number == step)
        {
            *existing = execution;
        } else {
            self.tool_executions.push(execution);
        }
        self.step_count = self.step_count.max(step);
    }

    /// Merge a tool's state delta. Evidence lists are appended (deduped by
    /// id), never replaced.
    pub fn apply_outcome(&mut self, tool_name: &str, outcome: ToolOutcome) {
        if !outcome.output.is_null() {
            self.tool_outputs
                .insert(tool_name.to_string(), outcome.output);
        }
        for item in outcome.evidence {
            if !self.evidence.iter().any(|e| e.id == item.id) {
                self.evidence.push(item);
            }
        }
        if outcome.features.is_some() {
            self.features = outcome.features;
        }
        if outcome.reasoning.is_some() {
            self.reasoning = outcome.reasoning;
        }
        for candidate in outcome.recommendations {
            if !self
                .recommendation_candidates
                .iter()
                .any(|c| c.signature_hash == candidate.signature_hash)
            {
                self.recommendation_candidates.push(candidate);
            }
        }
        if outcome.rule_draft.is_some() {
            self.rule_draft_candidate = outcome.rule_draft;
        }
    }

    /// Serialize to the persisted blob form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize a persisted blob, migrating older schema versions.
    pub fn from_json(blob: &str) -> Result<Self> {
        let mut value: Value = serde_json::from_str(blob)?;
        let version = value
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32;

        if version > STATE_SCHEMA_VERSION {
            return Err(Error::Internal(format!(
                "state schema version {} is newer than supported {}",
                version, STATE_SCHEMA_VERSION
            )));
        }

        // Migration dispatch: each step upgrades one version.
        let mut current = version;
        while current < STATE_SCHEMA_VERSION {
            match current {
                1 => migrate_v1_to_v2(&mut value),
                _ => {
                    return Err(Error::Internal(format!(
                        "no migration from state schema version {}",
                        current
                    )))
                }
            }
            current += 1;
        }

        Ok(serde_json::from_value(value)?)
    }
}

/// v1 blobs predate per-run flag snapshots; assume defaults.
fn migrate_v1_to_v2(value: &mut Value) {
    if let Some(object) = value.as_object_mut() {
        if !object.contains_key("feature_flags") {
            object.insert(
                "feature_flags".to_string(),
                serde_json::to_value(FeatureFlags::default()).unwrap_or(Value::Null),
            );
        }
        object.insert("schema_version".to_string(), Value::from(STATE_SCHEMA_VERSION));
    }
}
