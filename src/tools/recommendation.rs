//! Recommendation synthesis: policy-gated analyst actions derived from the
//! reasoning outcome and the evidence.

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::evidence::{category, EvidenceItem, EvidenceKind};
use crate::investigation::{
    InvestigationState, ReasoningOutcome, RecommendationCandidate, RecommendationType, Severity,
    ToolOutcome,
};

use super::{name, AnalysisTool};

/// Pattern categories that qualify for a rule-candidate recommendation.
const RULE_CANDIDATE_CATEGORIES: [&str; 4] = [
    category::VELOCITY_BURST,
    category::CROSS_MERCHANT_SPREAD,
    category::HIGH_DECLINE_RATIO,
    category::CARD_TESTING_LADDER,
];

/// Policy-driven recommendation synthesis. Pure over its inputs.
#[derive(Default)]
pub struct RecommendationTool;

impl RecommendationTool {
    pub fn new() -> Self {
        Self
    }

    /// Apply the recommendation policy.
    pub fn evaluate(
        reasoning: &ReasoningOutcome,
        evidence: &[EvidenceItem],
        freshness_enabled: bool,
    ) -> Vec<RecommendationCandidate> {
        let supporting: Vec<&EvidenceItem> =
            evidence.iter().filter(|e| e.is_supporting()).collect();
        let support_sum: f64 = supporting
            .iter()
            .map(|e| e.effective_strength(freshness_enabled))
            .sum();
        let counter_sum: f64 = evidence
            .iter()
            .filter(|e| !e.is_supporting())
            .map(|e| e.effective_strength(freshness_enabled))
            .sum();
        let counter_dominates = counter_sum > support_sum;
        let has_strong_support = supporting.iter().any(|e| e.strength >= 0.5);

        // Bidirectional trust of the reasoning severity: a quiet evidence
        // picture plus a LOW assessment emits nothing.
        if reasoning.severity == Severity::Low && !has_strong_support {
            return Vec::new();
        }

        // Counter-evidence dominance caps the output at a low-priority
        // review and suppresses everything stronger.
        if counter_dominates {
            if reasoning.severity >= Severity::Medium {
                return vec![candidate(
                    RecommendationType::ReviewPriority,
                    4,
                    "Review when capacity allows",
                    "low-priority queue placement; counter-evidence dominates",
                    json!({
                        "severity": reasoning.severity.as_str(),
                        "counter_evidence_strength": counter_sum,
                    }),
                )];
            }
            return Vec::new();
        }

        let mut recommendations = Vec::new();

        if reasoning.severity >= Severity::Medium {
            let priority = match reasoning.severity {
                Severity::Critical => 1,
                Severity::High => 2,
                _ => 3,
            };
            recommendations.push(candidate(
                RecommendationType::ReviewPriority,
                priority,
                &format!("Review transaction ({} severity)", reasoning.severity),
                "prioritized placement in the analyst review queue",
                json!({
                    "severity": reasoning.severity.as_str(),
                    "confidence": reasoning.confidence,
                }),
            ));
        }

        if reasoning.severity >= Severity::High {
            recommendations.push(candidate(
                RecommendationType::CaseAction,
                match reasoning.severity {
                    Severity::Critical => 1,
                    _ => 2,
                },
                "Open a fraud case for this card",
                "starts case workflow with the accumulated evidence attached",
                json!({
                    "action": "open_case",
                    "severity": reasoning.severity.as_str(),
                }),
            ));
        }

        // Strong pattern signal in a rule-eligible category proposes a rule
        // candidate carrying the normalized preconditions.
        let top_pattern = supporting
            .iter()
            .filter(|e| e.kind == EvidenceKind::Pattern)
            .max_by(|a, b| {
                a.strength
                    .partial_cmp(&b.strength)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        if let Some(pattern) = top_pattern {
            if pattern.strength >= 0.7
                && RULE_CANDIDATE_CATEGORIES.contains(&pattern.category.as_str())
            {
                recommendations.push(candidate(
                    RecommendationType::RuleCandidate,
                    2,
                    &format!("Draft a rule for {}", pattern.category),
                    "proposes a fraud rule capturing the observed pattern",
                    json!({
                        "category": pattern.category,
                        "strength": pattern.strength,
                        "preconditions": pattern.supporting_data,
                    }),
                ));
            }
        }

        recommendations
    }
}

/// Build a candidate with its signature hash over the policy-relevant
/// fields.
fn candidate(
    rec_type: RecommendationType,
    priority: u8,
    title: &str,
    impact: &str,
    payload: Value,
) -> RecommendationCandidate {
    let normalized_impact = impact.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(rec_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(title.as_bytes());
    hasher.update(b"|");
    hasher.update(normalized_impact.as_bytes());
    hasher.update(b"|");
    hasher.update(payload.to_string().as_bytes());
    let signature_hash = format!("{:x}", hasher.finalize());

    RecommendationCandidate {
        rec_type,
        priority,
        title: title.to_string(),
        impact: impact.to_string(),
        payload,
        signature_hash,
    }
}

#[async_trait]
impl AnalysisTool for RecommendationTool {
    fn name(&self) -> &'static str {
        name::RECOMMENDATION
    }

    fn description(&self) -> &'static str {
        "Synthesize policy-gated analyst recommendations from reasoning and evidence"
    }

    fn prerequisites(&self) -> &'static [&'static str] {
        &[name::REASONING]
    }

    async fn run(&self, state: &InvestigationState) -> Result<ToolOutcome> {
        let reasoning = state
            .reasoning
            .as_ref()
            .ok_or_else(|| Error::Internal("recommendation tool requires a reasoning outcome".into()))?;

        let recommendations = Self::evaluate(
            reasoning,
            &state.evidence,
            state.feature_flags.freshness_enabled,
        );

        let types: Vec<&str> = recommendations
            .iter()
            .map(|r| r.rec_type.as_str())
            .collect();
        let output = json!({
            "recommendation_count": recommendations.len(),
            "types": types,
        });
        let output_summary = if recommendations.is_empty() {
            "no recommendations emitted".to_string()
        } else {
            format!("{} recommendation(s): {}", recommendations.len(), types.join(", "))
        };

        let mut outcome = ToolOutcome::default().with_output(output).with_summaries(
            format!("severity {}", reasoning.severity),
            output_summary,
        );
        outcome.recommendations = recommendations;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::investigation::LlmStatus;

    fn reasoning(severity: Severity) -> ReasoningOutcome {
        ReasoningOutcome {
            severity,
            confidence: 0.8,
            narrative: "test".to_string(),
            known_facts: vec![],
            unknowns: vec![],
            hypotheses: vec![],
            what_would_change_my_mind: vec![],
            llm_status: LlmStatus::Success,
            llm_model: None,
            llm_error: None,
        }
    }

    fn pattern(cat: &str, strength: f64) -> EvidenceItem {
        EvidenceItem::new(EvidenceKind::Pattern, cat, strength, "signal")
    }

    fn counter(strength: f64, id: &str) -> EvidenceItem {
        EvidenceItem::new(
            EvidenceKind::CounterEvidence,
            category::COUNTER_EVIDENCE,
            strength,
            "trust signal",
        )
        .with_id(id.to_string())
    }

    #[test]
    fn test_quiet_low_emits_nothing() {
        let evidence = vec![pattern(category::AMOUNT_OUTLIER, 0.3)];
        let recs = RecommendationTool::evaluate(&reasoning(Severity::Low), &evidence, false);
        assert!(recs.is_empty());
    }

    #[test]
    fn test_medium_gets_review_priority_only() {
        let evidence = vec![pattern(category::HIGH_DECLINE_RATIO, 0.6)];
        let recs = RecommendationTool::evaluate(&reasoning(Severity::Medium), &evidence, false);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].rec_type, RecommendationType::ReviewPriority);
        assert_eq!(recs[0].priority, 3);
    }

    #[test]
    fn test_high_gets_case_action_and_rule_candidate() {
        let evidence = vec![pattern(category::VELOCITY_BURST, 0.9)];
        let recs = RecommendationTool::evaluate(&reasoning(Severity::High), &evidence, false);

        let types: Vec<RecommendationType> = recs.iter().map(|r| r.rec_type).collect();
        assert!(types.contains(&RecommendationType::ReviewPriority));
        assert!(types.contains(&RecommendationType::CaseAction));
        assert!(types.contains(&RecommendationType::RuleCandidate));

        let review = recs
            .iter()
            .find(|r| r.rec_type == RecommendationType::ReviewPriority)
            .unwrap();
        assert_eq!(review.priority, 2);
    }

    #[test]
    fn test_critical_maps_to_top_priority() {
        let evidence = vec![
            pattern(category::CARD_TESTING_LADDER, 0.9),
            pattern(category::HIGH_DECLINE_RATIO, 0.9),
        ];
        let recs = RecommendationTool::evaluate(&reasoning(Severity::Critical), &evidence, false);
        let review = recs
            .iter()
            .find(|r| r.rec_type == RecommendationType::ReviewPriority)
            .unwrap();
        assert_eq!(review.priority, 1);
    }

    #[test]
    fn test_counter_dominance_caps_at_low_review() {
        let evidence = vec![
            pattern(category::VELOCITY_BURST, 0.7),
            counter(0.6, "counter_evidence:a"),
            counter(0.5, "counter_evidence:b"),
        ];
        let recs = RecommendationTool::evaluate(&reasoning(Severity::High), &evidence, false);

        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].rec_type, RecommendationType::ReviewPriority);
        assert_eq!(recs[0].priority, 4);
    }

    #[test]
    fn test_weak_pattern_no_rule_candidate() {
        let evidence = vec![pattern(category::VELOCITY_BURST, 0.6)];
        let recs = RecommendationTool::evaluate(&reasoning(Severity::Medium), &evidence, false);
        assert!(recs
            .iter()
            .all(|r| r.rec_type != RecommendationType::RuleCandidate));
    }

    #[test]
    fn test_non_rule_category_no_rule_candidate() {
        let evidence = vec![pattern(category::AMOUNT_OUTLIER, 0.7)];
        let recs = RecommendationTool::evaluate(&reasoning(Severity::Medium), &evidence, false);
        assert!(recs
            .iter()
            .all(|r| r.rec_type != RecommendationType::RuleCandidate));
    }

    #[test]
    fn test_signature_hash_dedup_and_stability() {
        let evidence = vec![pattern(category::VELOCITY_BURST, 0.9)];
        let a = RecommendationTool::evaluate(&reasoning(Severity::High), &evidence, false);
        let b = RecommendationTool::evaluate(&reasoning(Severity::High), &evidence, false);

        let hashes_a: Vec<&str> = a.iter().map(|r| r.signature_hash.as_str()).collect();
        let hashes_b: Vec<&str> = b.iter().map(|r| r.signature_hash.as_str()).collect();
        assert_eq!(hashes_a, hashes_b);

        // Hashes are unique within a run.
        let mut deduped = hashes_a.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), hashes_a.len());
    }
}
