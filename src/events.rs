//! Semantic event stream for observable investigation runs.
//!
//! Events can be rendered differently depending on the consumer:
//! - Analyst UI: live progress for a running investigation
//! - Metrics pipeline: counters keyed by event type
//! - Analysis: JSON export for replay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Types of events emitted during an investigation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvestigationEventType {
    /// Run created or resumed
    RunStarted,
    /// Planner selected a tool (or chose to complete)
    PlannerDecision,
    /// Tool execution started
    ToolStarted,
    /// Tool execution finished (any status)
    ToolCompleted,
    /// A deterministic fallback path engaged (planner, reasoning, similarity)
    FallbackEngaged,
    /// Evidence items appended to the working state
    EvidenceAdded,
    /// Completion node persisted the final insight
    RunCompleted,
    /// Run marked failed
    RunFailed,
}

impl std::fmt::Display for InvestigationEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RunStarted => "RUN_STARTED",
            Self::PlannerDecision => "PLANNER_DECISION",
            Self::ToolStarted => "TOOL_STARTED",
            Self::ToolCompleted => "TOOL_COMPLETED",
            Self::FallbackEngaged => "FALLBACK_ENGAGED",
            Self::EvidenceAdded => "EVIDENCE_ADDED",
            Self::RunCompleted => "RUN_COMPLETED",
            Self::RunFailed => "RUN_FAILED",
        };
        write!(f, "{}", s)
    }
}

/// An event emitted during an investigation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationEvent {
    /// Type of the event
    pub event_type: InvestigationEventType,
    /// Investigation this event belongs to
    pub investigation_id: String,
    /// Human-readable content describing the event
    pub content: String,
    /// Event-specific metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
}

impl InvestigationEvent {
    /// Create a new event.
    pub fn new(
        event_type: InvestigationEventType,
        investigation_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            investigation_id: investigation_id.into(),
            content: content.into(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Add a metadata entry to the event.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Get a metadata value.
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref()?.get(key)
    }

    /// Create a run-started event.
    pub fn run_started(investigation_id: impl Into<String>, transaction_id: &str) -> Self {
        Self::new(
            InvestigationEventType::RunStarted,
            investigation_id,
            format!("investigation started for transaction {}", transaction_id),
        )
        .with_metadata("transaction_id", transaction_id)
    }

    /// Create a planner-decision event.
    pub fn planner_decision(
        investigation_id: impl Into<String>,
        selected: &str,
        fallback: bool,
    ) -> Self {
        Self::new(
            InvestigationEventType::PlannerDecision,
            investigation_id,
            format!("planner selected {}", selected),
        )
        .with_metadata("selected_tool", selected)
        .with_metadata("fallback", fallback)
    }

    /// Create a tool-completed event.
    pub fn tool_completed(
        investigation_id: impl Into<String>,
        tool_name: &str,
        status: &str,
        execution_time_ms: u64,
    ) -> Self {
        Self::new(
            InvestigationEventType::ToolCompleted,
            investigation_id,
            format!("tool {} finished with status {}", tool_name, status),
        )
        .with_metadata("tool_name", tool_name)
        .with_metadata("tool_status", status)
        .with_metadata("execution_time_ms", execution_time_ms)
    }

    /// Create a fallback-engaged event.
    pub fn fallback_engaged(investigation_id: impl Into<String>, stage: &str, reason: &str) -> Self {
        Self::new(
            InvestigationEventType::FallbackEngaged,
            investigation_id,
            format!("{} fell back: {}", stage, reason),
        )
        .with_metadata("stage", stage)
        .with_metadata("reason", reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_metadata() {
        let event = InvestigationEvent::planner_decision("inv-1", "pattern", false);
        assert_eq!(event.event_type, InvestigationEventType::PlannerDecision);
        assert_eq!(
            event.get_metadata("selected_tool"),
            Some(&Value::from("pattern"))
        );
        assert_eq!(event.get_metadata("fallback"), Some(&Value::from(false)));
    }

    #[test]
    fn test_event_serde_round_trip() {
        let event = InvestigationEvent::tool_completed("inv-1", "similarity", "FALLBACK", 412);
        let json = serde_json::to_string(&event).unwrap();
        let back: InvestigationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_display_is_screaming_snake() {
        assert_eq!(InvestigationEventType::RunCompleted.to_string(), "RUN_COMPLETED");
        assert_eq!(
            InvestigationEventType::FallbackEngaged.to_string(),
            "FALLBACK_ENGAGED"
        );
    }
}
