//! Completion node: materializes the final insight, recommendations, and
//! rule draft, and finalizes the investigation row.

use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::evidence::{category, EvidenceItem, EvidenceKind};
use crate::investigation::{
    Insight, Investigation, InvestigationState, InvestigationStatus, InvestigationSummary,
    LlmStatus, ModelMode, Recommendation, RecommendationStatus, RecommendationType, Severity,
};
use crate::store::{CompletionArtifacts, SqliteStore};
use crate::tools::{name, severity_from_evidence};

const EVALUATION_TYPE: &str = "fraud_investigation";
const INSIGHT_TYPE: &str = "transaction_analysis";

/// Finalizes one investigation run. Persistence retries once on transient
/// failures; anything further fails the run.
pub struct Completion {
    store: Arc<SqliteStore>,
}

impl Completion {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    /// Compute and persist the completion artifacts, marking the
    /// investigation COMPLETED. Returns the run summary.
    ///
    /// Fails only when no insight can be materialized at all, or when
    /// persistence fails twice.
    pub fn finalize(
        &self,
        mut investigation: Investigation,
        state: &InvestigationState,
        partial: bool,
    ) -> Result<InvestigationSummary> {
        if state.features.is_none() && state.evidence.is_empty() && state.reasoning.is_none() {
            return Err(Error::Internal(
                "no insight can be materialized: the run produced no features, evidence, or reasoning"
                    .into(),
            ));
        }

        let flags = &state.feature_flags;
        let model_mode = if flags.reasoning_llm_enabled {
            ModelMode::Agentic
        } else {
            ModelMode::Deterministic
        };

        let mut evidence = state.evidence.clone();
        append_evidence_gap_marker(state, &mut evidence);

        // Dominant severity: the evidence-derived severity (already bounded
        // by counter-evidence) against the reasoning severity, which the
        // dominance rule bounds downward here.
        let (evidence_severity, evidence_confidence) =
            severity_from_evidence(&evidence, flags.freshness_enabled);
        let counter_dominates = counter_dominates(&evidence, flags.freshness_enabled);

        let (severity, confidence) = match &state.reasoning {
            Some(reasoning) => {
                let bounded = if counter_dominates {
                    reasoning.severity.lowered()
                } else {
                    reasoning.severity
                };
                (bounded.max(evidence_severity), reasoning.confidence)
            }
            None => (evidence_severity, evidence_confidence),
        };

        let summary_text = summary_text(state, severity, &evidence);
        let transaction_timestamp = state
            .features
            .as_ref()
            .map(|f| f.timestamp)
            .unwrap_or(investigation.started_at);

        let idempotency_key = insight_idempotency_key(
            &state.transaction_id,
            EVALUATION_TYPE,
            &transaction_timestamp.to_rfc3339(),
            INSIGHT_TYPE,
            model_mode,
        );

        let insight = Insight {
            id: Uuid::new_v4(),
            investigation_id: investigation.id,
            transaction_id: state.transaction_id.clone(),
            evaluation_type: EVALUATION_TYPE.to_string(),
            insight_type: INSIGHT_TYPE.to_string(),
            model_mode,
            severity,
            summary: summary_text,
            confidence_score: confidence,
            transaction_timestamp,
            generated_at: Utc::now(),
            idempotency_key: idempotency_key.clone(),
        };

        let recommendations: Vec<Recommendation> = state
            .recommendation_candidates
            .iter()
            .map(|candidate| Recommendation {
                id: Uuid::new_v4(),
                insight_id: insight.id,
                rec_type: candidate.rec_type,
                priority: candidate.priority,
                title: candidate.title.clone(),
                impact: candidate.impact.clone(),
                payload: candidate.payload.clone(),
                signature_hash: candidate.signature_hash.clone(),
                status: RecommendationStatus::Open,
                acknowledged_by: None,
                acknowledged_at: None,
                idempotency_key: recommendation_idempotency_key(
                    &idempotency_key,
                    candidate.rec_type,
                    &candidate.signature_hash,
                ),
                created_at: Utc::now(),
            })
            .collect();

        let rule_draft = state.rule_draft_candidate.as_ref().and_then(|draft| {
            state
                .recommendation_candidates
                .iter()
                .find(|c| c.rec_type == RecommendationType::RuleCandidate)
                .map(|c| (c.signature_hash.clone(), draft.clone()))
        });

        // Finalize the investigation row fields.
        let reasoning = state.reasoning.as_ref();
        investigation.status = InvestigationStatus::Completed;
        investigation.severity = Some(severity);
        investigation.confidence = Some(confidence);
        investigation.step_count = state.step_count;
        investigation.model_mode = model_mode;
        investigation.llm_status = Some(
            reasoning
                .map(|r| r.llm_status)
                .unwrap_or(if flags.reasoning_llm_enabled {
                    LlmStatus::Skipped
                } else {
                    LlmStatus::Disabled
                }),
        );
        investigation.llm_error = reasoning.and_then(|r| r.llm_error.clone());
        investigation.llm_model = reasoning.and_then(|r| r.llm_model.clone());
        investigation.completed_at = Some(Utc::now());
        investigation.duration_ms = investigation
            .completed_at
            .map(|end| (end - investigation.started_at).num_milliseconds().max(0) as u64);
        investigation.stage_durations_ms = stage_durations(state);
        investigation.partial = partial;
        investigation.runtime_feature_flags = state.feature_flags.clone();

        let artifacts = CompletionArtifacts {
            investigation: investigation.clone(),
            insight,
            evidence,
            recommendations,
            rule_draft,
        };

        // Short transaction with a single rollback-retry on transient
        // failures.
        let insight_id = match self.store.persist_completion(&artifacts) {
            Ok(id) => id,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "completion persistence failed; retrying once");
                self.store.persist_completion(&artifacts)?
            }
            Err(e) => return Err(e),
        };

        self.emit_audit(&artifacts, insight_id);
        info!(
            investigation_id = %investigation.id,
            severity = %severity,
            recommendations = artifacts.recommendations.len(),
            "investigation completed"
        );

        Ok(InvestigationSummary {
            investigation_id: investigation.id,
            transaction_id: investigation.transaction_id.clone(),
            status: InvestigationStatus::Completed,
            severity: Some(severity),
            confidence: Some(confidence),
            step_count: investigation.step_count,
            duration_ms: investigation.duration_ms,
            model_mode,
            llm_status: investigation.llm_status,
            partial,
        })
    }

    fn emit_audit(&self, artifacts: &CompletionArtifacts, insight_id: Uuid) {
        let events = [
            crate::investigation::AuditEvent::new(
                "investigation",
                artifacts.investigation.id.to_string(),
                "completed",
                "system",
            )
            .with_new(json!({
                "severity": artifacts.investigation.severity.map(|s| s.as_str()),
                "partial": artifacts.investigation.partial,
            })),
            crate::investigation::AuditEvent::new(
                "insight",
                insight_id.to_string(),
                "upserted",
                "system",
            )
            .with_new(json!({
                "idempotency_key": artifacts.insight.idempotency_key,
                "evidence_count": artifacts.evidence.len(),
            })),
        ];
        for event in events {
            if let Err(e) = self.store.append_audit(&event) {
                warn!(error = %e, "audit append failed");
            }
        }
        for rec in &artifacts.recommendations {
            let event = crate::investigation::AuditEvent::new(
                "recommendation",
                rec.id.to_string(),
                "created",
                "system",
            )
            .with_new(json!({"type": rec.rec_type.as_str(), "priority": rec.priority}));
            if let Err(e) = self.store.append_audit(&event) {
                warn!(error = %e, "audit append failed");
            }
        }
    }
}

/// The "no close matches" evidence-gap marker: emitted whenever vector
/// search ran with embeddings enabled and found nothing, regardless of
/// severity.
fn append_evidence_gap_marker(state: &InvestigationState, evidence: &mut Vec<EvidenceItem>) {
    let Some(diagnostics) = state.tool_outputs.get(name::SIMILARITY) else {
        return;
    };
    let enabled = diagnostics["vector_feature_enabled"].as_bool().unwrap_or(false);
    let executed = diagnostics["vector_stage_executed"].as_bool().unwrap_or(false);
    let match_count = diagnostics["vector_match_count"].as_u64().unwrap_or(0);

    if enabled && executed && match_count == 0 {
        let anchor = state
            .features
            .as_ref()
            .map(|f| f.timestamp)
            .unwrap_or_else(Utc::now);
        evidence.push(
            EvidenceItem::new(
                EvidenceKind::Context,
                category::NO_CLOSE_MATCH,
                0.0,
                "vector search executed and found no close historical matches",
            )
            .with_timestamp(anchor),
        );
    }
}

fn counter_dominates(evidence: &[EvidenceItem], freshness_enabled: bool) -> bool {
    let support: f64 = evidence
        .iter()
        .filter(|e| e.is_supporting())
        .map(|e| e.effective_strength(freshness_enabled))
        .sum();
    let counter: f64 = evidence
        .iter()
        .filter(|e| !e.is_supporting())
        .map(|e| e.effective_strength(freshness_enabled))
        .sum();
    counter > support
}

fn summary_text(state: &InvestigationState, severity: Severity, evidence: &[EvidenceItem]) -> String {
    if let Some(reasoning) = &state.reasoning {
        let mut narrative = reasoning.narrative.clone();
        if narrative.len() > 240 {
            narrative.truncate(240);
        }
        if !narrative.is_empty() {
            return format!("{}: {}", severity, narrative);
        }
    }
    let top = evidence
        .iter()
        .filter(|e| e.is_supporting() && e.strength > 0.0)
        .max_by(|a, b| {
            a.strength
                .partial_cmp(&b.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    match top {
        Some(item) => format!("{}: {}", severity, item.description),
        None => format!("{}: no anomalous signals found", severity),
    }
}

fn stage_durations(state: &InvestigationState) -> BTreeMap<String, u64> {
    let mut durations = BTreeMap::new();
    for execution in &state.tool_executions {
        *durations.entry(execution.tool_name.clone()).or_insert(0) +=
            execution.execution_time_ms;
    }
    durations
}

fn insight_idempotency_key(
    transaction_id: &str,
    evaluation_type: &str,
    transaction_timestamp: &str,
    insight_type: &str,
    model_mode: ModelMode,
) -> String {
    let mut hasher = Sha256::new();
    for part in [
        transaction_id,
        evaluation_type,
        transaction_timestamp,
        insight_type,
        model_mode.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    format!("{:x}", hasher.finalize())
}

fn recommendation_idempotency_key(
    insight_key: &str,
    rec_type: RecommendationType,
    signature_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    for part in [insight_key, rec_type.as_str(), signature_hash] {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeatureFlags, Safeguards};
    use crate::investigation::{InvestigationMode, ReasoningOutcome, ToolExecution, ToolStatus};
    use serde_json::json;

    fn investigation(state: &InvestigationState) -> Investigation {
        Investigation {
            id: state.investigation_id,
            transaction_id: state.transaction_id.clone(),
            mode: state.mode,
            status: InvestigationStatus::InProgress,
            priority: 3,
            severity: None,
            confidence: None,
            step_count: state.step_count,
            max_steps: 20,
            planner_model: "planner-model".to_string(),
            model_mode: ModelMode::Agentic,
            llm_status: None,
            llm_error: None,
            llm_model: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error_summary: None,
            runtime_feature_flags: FeatureFlags::default(),
            runtime_safeguards: Safeguards::default(),
            stage_durations_ms: BTreeMap::new(),
            partial: false,
            trigger_ref: None,
        }
    }

    fn state_with_evidence() -> InvestigationState {
        let mut state = InvestigationState::new(
            Uuid::new_v4(),
            "txn-1",
            InvestigationMode::Full,
            FeatureFlags::default(),
        );
        state.evidence.push(EvidenceItem::new(
            EvidenceKind::Pattern,
            category::VELOCITY_BURST,
            0.9,
            "12 txns in 1h",
        ));
        state.record_execution(ToolExecution {
            step_number: 1,
            tool_name: "context".to_string(),
            status: ToolStatus::Ok,
            input_summary: String::new(),
            output_summary: String::new(),
            execution_time_ms: 40,
            error_message: None,
        });
        state.record_execution(ToolExecution {
            step_number: 2,
            tool_name: "pattern".to_string(),
            status: ToolStatus::Ok,
            input_summary: String::new(),
            output_summary: String::new(),
            execution_time_ms: 5,
            error_message: None,
        });
        state
    }

    fn seeded(store: &SqliteStore, state: &InvestigationState) -> Investigation {
        let inv = investigation(state);
        store.create_investigation(&inv).unwrap();
        inv
    }

    #[test]
    fn test_finalize_persists_insight_and_marks_completed() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let state = state_with_evidence();
        let inv = seeded(&store, &state);

        let summary = Completion::new(store.clone())
            .finalize(inv.clone(), &state, false)
            .unwrap();

        assert_eq!(summary.status, InvestigationStatus::Completed);
        assert_eq!(summary.severity, Some(Severity::High));
        assert_eq!(summary.step_count, 2);

        let stored = store.get_investigation(inv.id).unwrap();
        assert_eq!(stored.status, InvestigationStatus::Completed);
        assert_eq!(stored.stage_durations_ms["context"], 40);

        let insight = store.get_insight_for_investigation(inv.id).unwrap().unwrap();
        assert_eq!(insight.severity, Severity::High);
        assert_eq!(store.list_evidence(insight.id).unwrap().len(), 1);

        // Audit trail covers the completion.
        let trail = store.list_audit("investigation", &inv.id.to_string()).unwrap();
        assert!(trail.iter().any(|e| e.action == "completed"));
    }

    #[test]
    fn test_no_materializable_insight_fails() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let state = InvestigationState::new(
            Uuid::new_v4(),
            "txn-1",
            InvestigationMode::Full,
            FeatureFlags::default(),
        );
        let inv = seeded(&store, &state);

        let err = Completion::new(store).finalize(inv, &state, false).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_reasoning_severity_combines_with_evidence() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut state = state_with_evidence();
        state.reasoning = Some(ReasoningOutcome {
            severity: Severity::Critical,
            confidence: 0.9,
            narrative: "coordinated attack".to_string(),
            known_facts: vec![],
            unknowns: vec![],
            hypotheses: vec![],
            what_would_change_my_mind: vec![],
            llm_status: LlmStatus::Success,
            llm_model: Some("model-x".to_string()),
            llm_error: None,
        });
        let inv = seeded(&store, &state);

        let summary = Completion::new(store.clone()).finalize(inv, &state, false).unwrap();
        assert_eq!(summary.severity, Some(Severity::Critical));
        assert_eq!(summary.llm_status, Some(LlmStatus::Success));
    }

    #[test]
    fn test_counter_dominance_bounds_reasoning_downward() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut state = InvestigationState::new(
            Uuid::new_v4(),
            "txn-1",
            InvestigationMode::Full,
            FeatureFlags::default(),
        );
        state.evidence.push(
            EvidenceItem::new(
                EvidenceKind::CounterEvidence,
                category::COUNTER_EVIDENCE,
                0.9,
                "trusted device",
            )
            .with_id("counter_evidence:a".to_string()),
        );
        state.reasoning = Some(ReasoningOutcome {
            severity: Severity::High,
            confidence: 0.5,
            narrative: String::new(),
            known_facts: vec![],
            unknowns: vec![],
            hypotheses: vec![],
            what_would_change_my_mind: vec![],
            llm_status: LlmStatus::Success,
            llm_model: None,
            llm_error: None,
        });
        let inv = seeded(&store, &state);

        let summary = Completion::new(store).finalize(inv, &state, false).unwrap();
        assert_eq!(summary.severity, Some(Severity::Medium));
    }

    #[test]
    fn test_evidence_gap_marker_emitted() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut state = state_with_evidence();
        state.tool_outputs.insert(
            "similarity".to_string(),
            json!({
                "vector_feature_enabled": true,
                "vector_stage_executed": true,
                "vector_match_count": 0,
            }),
        );
        let inv = seeded(&store, &state);

        Completion::new(store.clone()).finalize(inv.clone(), &state, false).unwrap();

        let insight = store.get_insight_for_investigation(inv.id).unwrap().unwrap();
        let evidence = store.list_evidence(insight.id).unwrap();
        assert!(evidence.iter().any(|e| e.category == category::NO_CLOSE_MATCH));
    }

    #[test]
    fn test_no_gap_marker_when_matches_found() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut state = state_with_evidence();
        state.tool_outputs.insert(
            "similarity".to_string(),
            json!({
                "vector_feature_enabled": true,
                "vector_stage_executed": true,
                "vector_match_count": 3,
            }),
        );
        let inv = seeded(&store, &state);

        Completion::new(store.clone()).finalize(inv.clone(), &state, false).unwrap();

        let insight = store.get_insight_for_investigation(inv.id).unwrap().unwrap();
        let evidence = store.list_evidence(insight.id).unwrap();
        assert!(!evidence.iter().any(|e| e.category == category::NO_CLOSE_MATCH));
    }

    #[test]
    fn test_replay_refreshes_same_insight() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let state = state_with_evidence();
        let inv = seeded(&store, &state);

        let completion = Completion::new(store.clone());
        completion.finalize(inv.clone(), &state, false).unwrap();
        let first = store.get_insight_for_investigation(inv.id).unwrap().unwrap();

        completion.finalize(inv.clone(), &state, false).unwrap();
        let second = store.get_insight_for_investigation(inv.id).unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.idempotency_key, second.idempotency_key);
    }
}
