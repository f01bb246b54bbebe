//! Narrative reasoning over the accumulated evidence.
//!
//! LLM-primary with a strict output schema and local validation; every
//! failure path degrades to a deterministic evidence-based outcome with the
//! same record shape, so downstream consumers never branch on "LLM or not".

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::error::{Error, Result};
use crate::evidence::EvidenceItem;
use crate::investigation::{
    Hypothesis, InvestigationState, LlmStatus, ReasoningOutcome, Severity, ToolOutcome,
};
use crate::llm::{
    extract_json, CircuitBreaker, CompletionClient, CompletionRequest, FieldSpec, FieldType,
    OutputSchema,
};
use crate::redact;

use super::{name, AnalysisTool};

/// Severity and confidence derived from aggregate evidence strength.
///
/// The mapping: `s_max >= 0.85` with a second signal at 0.7 is CRITICAL,
/// `s_max >= 0.85` HIGH, `s_max >= 0.6` MEDIUM, else LOW. Counter-evidence
/// dominance (sum of counter strengths exceeding supporting) lowers the
/// result one level.
pub fn severity_from_evidence(
    evidence: &[EvidenceItem],
    freshness_enabled: bool,
) -> (Severity, f64) {
    let supporting: Vec<f64> = evidence
        .iter()
        .filter(|e| e.is_supporting())
        .map(|e| e.effective_strength(freshness_enabled))
        .collect();
    let counter_sum: f64 = evidence
        .iter()
        .filter(|e| !e.is_supporting())
        .map(|e| e.effective_strength(freshness_enabled))
        .sum();
    let support_sum: f64 = supporting.iter().sum();

    if supporting.is_empty() {
        return (Severity::Low, 0.2);
    }

    let s_max = supporting.iter().cloned().fold(0.0f64, f64::max);
    let strong_signals = supporting.iter().filter(|s| **s >= 0.7).count();

    let mut severity = if s_max >= 0.85 && strong_signals >= 2 {
        Severity::Critical
    } else if s_max >= 0.85 {
        Severity::High
    } else if s_max >= 0.6 {
        Severity::Medium
    } else {
        Severity::Low
    };

    if counter_sum > support_sum {
        severity = severity.lowered();
    }

    let mean = support_sum / supporting.len() as f64;
    let confidence = (s_max * 0.6 + mean * 0.4).clamp(0.05, 0.95);
    (severity, confidence)
}

/// Constrained-LLM reasoning with an evidence-based fallback.
pub struct ReasoningTool {
    llm: Arc<dyn CompletionClient>,
    breaker: Arc<CircuitBreaker>,
    model: String,
    retries: u32,
}

impl ReasoningTool {
    pub fn new(
        llm: Arc<dyn CompletionClient>,
        breaker: Arc<CircuitBreaker>,
        model: impl Into<String>,
        retries: u32,
    ) -> Self {
        Self {
            llm,
            breaker,
            model: model.into(),
            retries,
        }
    }

    fn output_schema() -> OutputSchema {
        OutputSchema::new(vec![
            FieldSpec::new(
                "severity",
                FieldType::Enum(vec!["low", "medium", "high", "critical"]),
            ),
            FieldSpec::new("confidence", FieldType::Number).range(0.0, 1.0),
            FieldSpec::new("narrative", FieldType::String),
            FieldSpec::new("known_facts", FieldType::Array),
            FieldSpec::new("unknowns", FieldType::Array),
            FieldSpec::new("hypotheses", FieldType::Array).items(2, 4),
            FieldSpec::new("what_would_change_my_mind", FieldType::Array),
        ])
    }

    fn build_prompt(&self, state: &InvestigationState) -> CompletionRequest {
        let flags = &state.feature_flags;
        let system = match flags.narrative_version.as_str() {
            "v1" => {
                "You are a fraud analyst assistant. Assess the transaction using only the \
                 evidence provided. Cite evidence ids for every hypothesis."
            }
            _ => {
                "You are a fraud analyst assistant. Assess the transaction using only the \
                 evidence provided. Separate established facts from unknowns, cite evidence \
                 ids for every hypothesis, and state what observation would change your \
                 assessment."
            }
        };

        let mut body = String::new();
        if let Some(features) = &state.features {
            body.push_str(&format!(
                "Transaction {}: amount {:.2} {}, decision {}, mcc {}, card {}, merchant {}.\n",
                features.transaction_id,
                features.amount,
                features.currency,
                features.decision,
                features.mcc,
                features.card_id,
                features.merchant_id,
            ));
            let one_hour = features.card_stats("1h");
            body.push_str(&format!(
                "Card 1h window: {} txns, decline rate {:.2}. 24h distinct merchants: {}.\n",
                one_hour.txn_count,
                one_hour.decline_rate,
                features.card_stats("24h").distinct_merchants,
            ));
        }

        body.push_str("\nEvidence:\n");
        for item in &state.evidence {
            body.push_str(&format!(
                "- [{}] kind={} category={} strength={:.2} {}\n",
                item.id, item.kind, item.category, item.strength, item.description
            ));
        }

        if flags.conflict_matrix_enabled {
            let supporting: Vec<&str> = state
                .evidence
                .iter()
                .filter(|e| e.is_supporting())
                .map(|e| e.id.as_str())
                .collect();
            let counter: Vec<&str> = state
                .evidence
                .iter()
                .filter(|e| !e.is_supporting())
                .map(|e| e.id.as_str())
                .collect();
            if !supporting.is_empty() && !counter.is_empty() {
                body.push_str(&format!(
                    "\nConflicts: supporting [{}] vs counter [{}]. Weigh both sides.\n",
                    supporting.join(", "),
                    counter.join(", ")
                ));
            }
        }

        body.push_str("\n");
        body.push_str(&Self::output_schema().prompt_instructions());
        body.push_str(
            "\nEach hypothesis must be an object with label, confidence, \
             supporting_evidence_refs, and counter_evidence_refs.",
        );

        CompletionRequest::single_turn(Some(system.to_string()), redact::redact(&body))
            .with_model(self.model.clone())
            .with_max_tokens(2048)
    }

    /// Parse and validate an LLM response into a reasoning outcome.
    fn parse_response(&self, state: &InvestigationState, content: &str) -> Result<ReasoningOutcome> {
        let value = extract_json(content)
            .ok_or_else(|| Error::Llm("reasoning response contained no JSON object".into()))?;

        let violations = Self::output_schema().validate(&value);
        if !violations.is_empty() {
            let joined = violations
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::Llm(format!("reasoning schema violations: {}", joined)));
        }

        let severity = Severity::parse(value["severity"].as_str().unwrap_or_default())
            .ok_or_else(|| Error::Llm("unparseable severity".into()))?;
        let confidence = value["confidence"].as_f64().unwrap_or(0.0);

        let hypotheses: Vec<Hypothesis> = value["hypotheses"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|h| Hypothesis {
                        label: h["label"].as_str().unwrap_or("unlabeled").to_string(),
                        confidence: h["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0),
                        supporting_evidence_refs: string_array(&h["supporting_evidence_refs"]),
                        counter_evidence_refs: string_array(&h["counter_evidence_refs"]),
                    })
                    .collect()
            })
            .unwrap_or_default();

        // Citations must reference evidence actually present.
        for hypothesis in &hypotheses {
            for reference in hypothesis
                .supporting_evidence_refs
                .iter()
                .chain(hypothesis.counter_evidence_refs.iter())
            {
                if !state.evidence.iter().any(|e| &e.id == reference) {
                    return Err(Error::Llm(format!(
                        "hypothesis cites unknown evidence id '{}'",
                        reference
                    )));
                }
            }
        }

        // Severity must be consistent with the evidence strengths.
        if severity >= Severity::High
            && !state.evidence.iter().any(|e| e.is_supporting() && e.strength >= 0.6)
        {
            return Err(Error::Llm(
                "severity high or above requires supporting evidence with strength >= 0.6".into(),
            ));
        }

        Ok(ReasoningOutcome {
            severity,
            confidence,
            narrative: value["narrative"].as_str().unwrap_or_default().to_string(),
            known_facts: string_array(&value["known_facts"]),
            unknowns: string_array(&value["unknowns"]),
            hypotheses,
            what_would_change_my_mind: string_array(&value["what_would_change_my_mind"]),
            llm_status: LlmStatus::Success,
            llm_model: Some(self.model.clone()),
            llm_error: None,
        })
    }

    /// Deterministic evidence-based outcome used on every degraded path.
    fn fallback_outcome(
        &self,
        state: &InvestigationState,
        llm_status: LlmStatus,
        llm_error: Option<String>,
    ) -> ReasoningOutcome {
        let flags = &state.feature_flags;
        let (severity, confidence) =
            severity_from_evidence(&state.evidence, flags.freshness_enabled);

        let mut ordered: Vec<&EvidenceItem> =
            state.evidence.iter().filter(|e| e.is_supporting()).collect();
        ordered.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let top: Vec<&&EvidenceItem> = ordered.iter().take(3).collect();

        let narrative = if top.is_empty() {
            "No anomalous signals were found for this transaction.".to_string()
        } else {
            format!(
                "Signals observed: {}.",
                top.iter()
                    .map(|e| e.description.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            )
        };

        let mut known_facts = Vec::new();
        if let Some(features) = &state.features {
            known_facts.push(format!(
                "amount {:.2} {} with decision {}",
                features.amount, features.currency, features.decision
            ));
            known_facts.push(format!(
                "{} card transactions in the hour before the anchor",
                features.card_stats("1h").txn_count
            ));
        }

        let supporting_refs: Vec<String> = top.iter().map(|e| e.id.clone()).collect();
        let counter_refs: Vec<String> = state
            .evidence
            .iter()
            .filter(|e| !e.is_supporting())
            .map(|e| e.id.clone())
            .collect();

        let hypotheses = vec![
            Hypothesis {
                label: "transaction is fraudulent".to_string(),
                confidence,
                supporting_evidence_refs: supporting_refs,
                counter_evidence_refs: counter_refs.clone(),
            },
            Hypothesis {
                label: "transaction is legitimate".to_string(),
                confidence: (1.0 - confidence).clamp(0.0, 1.0),
                supporting_evidence_refs: counter_refs,
                counter_evidence_refs: Vec::new(),
            },
        ];

        ReasoningOutcome {
            severity,
            confidence,
            narrative,
            known_facts,
            unknowns: vec![
                "cardholder confirmation of recent activity".to_string(),
                "merchant dispute history outside the observed window".to_string(),
            ],
            hypotheses,
            what_would_change_my_mind: vec![
                "a successful 3DS challenge on this card".to_string(),
                "cardholder confirming the purchases".to_string(),
            ],
            llm_status,
            llm_model: None,
            llm_error,
        }
    }
}

fn string_array(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl AnalysisTool for ReasoningTool {
    fn name(&self) -> &'static str {
        name::REASONING
    }

    fn description(&self) -> &'static str {
        "Produce a structured narrative with hypotheses, citations, severity, and confidence"
    }

    fn prerequisites(&self) -> &'static [&'static str] {
        &[name::PATTERN, name::SIMILARITY]
    }

    async fn run(&self, state: &InvestigationState) -> Result<ToolOutcome> {
        let flags = &state.feature_flags;
        let mut prompt_key = None;

        let reasoning = if !flags.reasoning_llm_enabled {
            self.fallback_outcome(state, LlmStatus::Disabled, None)
        } else if self.breaker.is_open() {
            self.fallback_outcome(state, LlmStatus::Skipped, Some("circuit breaker open".into()))
        } else {
            let request = self.build_prompt(state);
            // Stable content key for replay correlation.
            prompt_key = Some(request.prompt_key());
            let mut last_error: Option<String> = None;
            let mut parsed = None;

            for _attempt in 0..=self.retries {
                match self.llm.complete(request.clone()).await {
                    Ok(response) => match self.parse_response(state, &response.content) {
                        Ok(outcome) => {
                            self.breaker.record_success();
                            parsed = Some(outcome);
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "reasoning response rejected");
                            last_error = Some(e.to_string());
                        }
                    },
                    Err(e) => {
                        self.breaker.record_failure();
                        last_error = Some(e.to_string());
                    }
                }
            }

            match parsed {
                Some(outcome) => outcome,
                None => {
                    // An errored LLM with no evidence to ground the fallback
                    // is the one case reported as failed.
                    let status = if state.evidence.is_empty() {
                        LlmStatus::Failed
                    } else {
                        LlmStatus::Fallback
                    };
                    self.fallback_outcome(state, status, last_error)
                }
            }
        };

        let fallback = matches!(
            reasoning.llm_status,
            LlmStatus::Skipped | LlmStatus::Fallback | LlmStatus::Failed
        );
        let output = json!({
            "llm_status": reasoning.llm_status.as_str(),
            "severity": reasoning.severity.as_str(),
            "confidence": reasoning.confidence,
            "hypothesis_count": reasoning.hypotheses.len(),
            "prompt_key": prompt_key,
        });
        let output_summary = format!(
            "severity {} (confidence {:.2}, llm {})",
            reasoning.severity, reasoning.confidence, reasoning.llm_status
        );

        let mut outcome = ToolOutcome::default().with_output(output).with_summaries(
            format!("{} evidence item(s)", state.evidence.len()),
            output_summary,
        );
        outcome.fallback = fallback;
        outcome.reasoning = Some(reasoning);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureFlags;
    use crate::evidence::{category, EvidenceKind};
    use crate::investigation::InvestigationMode;
    use crate::llm::testing::ScriptedCompletionClient;
    use std::time::Duration;
    use uuid::Uuid;

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(3, Duration::from_secs(60)))
    }

    fn state_with_evidence(strengths: &[(&str, f64)]) -> InvestigationState {
        let mut state = InvestigationState::new(
            Uuid::new_v4(),
            "txn-1",
            InvestigationMode::Full,
            FeatureFlags::default(),
        );
        for (i, (cat, strength)) in strengths.iter().enumerate() {
            state.evidence.push(
                EvidenceItem::new(EvidenceKind::Pattern, *cat, *strength, "signal")
                    .with_id(format!("pattern:{}:{}", cat, i)),
            );
        }
        state
    }

    fn valid_response(severity: &str, refs: &str) -> String {
        format!(
            r#"{{"severity": "{severity}", "confidence": 0.8,
                "narrative": "coordinated card testing",
                "known_facts": ["many declines"], "unknowns": ["cardholder intent"],
                "hypotheses": [
                    {{"label": "fraud", "confidence": 0.8,
                      "supporting_evidence_refs": [{refs}], "counter_evidence_refs": []}},
                    {{"label": "legitimate", "confidence": 0.2,
                      "supporting_evidence_refs": [], "counter_evidence_refs": []}}
                ],
                "what_would_change_my_mind": ["3DS success"]}}"#
        )
    }

    #[tokio::test]
    async fn test_valid_llm_response_is_success() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        llm.push_text(valid_response("high", "\"pattern:velocity_burst:0\""));
        let state = state_with_evidence(&[(category::VELOCITY_BURST, 0.9)]);

        let tool = ReasoningTool::new(llm, breaker(), "model-x", 1);
        let outcome = tool.run(&state).await.unwrap();
        let reasoning = outcome.reasoning.unwrap();

        assert_eq!(reasoning.llm_status, LlmStatus::Success);
        assert_eq!(reasoning.severity, Severity::High);
        assert!(!outcome.fallback);
        assert_eq!(reasoning.hypotheses.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_citation_falls_back() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        // Both attempts cite a fabricated evidence id.
        llm.push_text(valid_response("high", "\"pattern:fabricated:99\""));
        llm.push_text(valid_response("high", "\"pattern:fabricated:99\""));
        let state = state_with_evidence(&[(category::VELOCITY_BURST, 0.9)]);

        let tool = ReasoningTool::new(llm.clone(), breaker(), "model-x", 1);
        let outcome = tool.run(&state).await.unwrap();
        let reasoning = outcome.reasoning.unwrap();

        assert_eq!(reasoning.llm_status, LlmStatus::Fallback);
        assert_eq!(llm.call_count(), 2);
        assert!(outcome.fallback);
        // Fallback derives severity from the evidence.
        assert_eq!(reasoning.severity, Severity::High);
    }

    #[tokio::test]
    async fn test_high_severity_without_strong_evidence_rejected() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        llm.push_text(valid_response("high", "\"pattern:amount_outlier:0\""));
        llm.push_text(valid_response("high", "\"pattern:amount_outlier:0\""));
        let state = state_with_evidence(&[(category::AMOUNT_OUTLIER, 0.3)]);

        let tool = ReasoningTool::new(llm, breaker(), "model-x", 1);
        let reasoning = tool.run(&state).await.unwrap().reasoning.unwrap();

        assert_eq!(reasoning.llm_status, LlmStatus::Fallback);
        assert_eq!(reasoning.severity, Severity::Low);
    }

    #[tokio::test]
    async fn test_llm_timeout_falls_back_and_continues() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        llm.push_error(Error::timeout(30_000));
        llm.push_error(Error::timeout(30_000));
        let state = state_with_evidence(&[(category::HIGH_DECLINE_RATIO, 0.9)]);

        let tool = ReasoningTool::new(llm, breaker(), "model-x", 1);
        let outcome = tool.run(&state).await.unwrap();
        let reasoning = outcome.reasoning.unwrap();

        assert_eq!(reasoning.llm_status, LlmStatus::Fallback);
        assert!(reasoning.llm_error.is_some());
        assert_eq!(reasoning.severity, Severity::High);
    }

    #[tokio::test]
    async fn test_disabled_flag_skips_llm() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        let mut state = state_with_evidence(&[(category::VELOCITY_BURST, 0.7)]);
        state.feature_flags.reasoning_llm_enabled = false;

        let tool = ReasoningTool::new(llm.clone(), breaker(), "model-x", 1);
        let reasoning = tool.run(&state).await.unwrap().reasoning.unwrap();

        assert_eq!(reasoning.llm_status, LlmStatus::Disabled);
        assert_eq!(llm.call_count(), 0);
        assert_eq!(reasoning.severity, Severity::Medium);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_llm() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        let shared = breaker();
        shared.record_failure();
        shared.record_failure();
        shared.record_failure();
        let state = state_with_evidence(&[(category::VELOCITY_BURST, 0.9)]);

        let tool = ReasoningTool::new(llm.clone(), shared, "model-x", 1);
        let reasoning = tool.run(&state).await.unwrap().reasoning.unwrap();

        assert_eq!(reasoning.llm_status, LlmStatus::Skipped);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_llm_error_with_no_evidence_is_failed() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        llm.push_error(Error::Llm("boom".into()));
        llm.push_error(Error::Llm("boom".into()));
        let state = state_with_evidence(&[]);

        let tool = ReasoningTool::new(llm, breaker(), "model-x", 1);
        let reasoning = tool.run(&state).await.unwrap().reasoning.unwrap();

        assert_eq!(reasoning.llm_status, LlmStatus::Failed);
        assert_eq!(reasoning.severity, Severity::Low);
    }

    #[test]
    fn test_severity_mapping_table() {
        // Lone 0.9 velocity burst maps to HIGH.
        let state = state_with_evidence(&[(category::VELOCITY_BURST, 0.9)]);
        let (severity, _) = severity_from_evidence(&state.evidence, false);
        assert_eq!(severity, Severity::High);

        // Two strong signals escalate to CRITICAL.
        let state = state_with_evidence(&[
            (category::CARD_TESTING_LADDER, 0.9),
            (category::HIGH_DECLINE_RATIO, 0.9),
        ]);
        let (severity, _) = severity_from_evidence(&state.evidence, false);
        assert_eq!(severity, Severity::Critical);

        // Mid strength is MEDIUM.
        let state = state_with_evidence(&[(category::HIGH_DECLINE_RATIO, 0.6)]);
        let (severity, _) = severity_from_evidence(&state.evidence, false);
        assert_eq!(severity, Severity::Medium);

        // No evidence is LOW with token confidence.
        let (severity, confidence) = severity_from_evidence(&[], false);
        assert_eq!(severity, Severity::Low);
        assert!(confidence <= 0.2);
    }

    #[test]
    fn test_counter_dominance_lowers_severity() {
        let mut state = state_with_evidence(&[(category::VELOCITY_BURST, 0.9)]);
        state.evidence.push(
            EvidenceItem::new(
                EvidenceKind::CounterEvidence,
                category::COUNTER_EVIDENCE,
                0.95,
                "trusted device",
            )
            .with_id("counter_evidence:a".to_string()),
        );
        state.evidence.push(
            EvidenceItem::new(
                EvidenceKind::CounterEvidence,
                category::COUNTER_EVIDENCE,
                0.6,
                "3ds success",
            )
            .with_id("counter_evidence:b".to_string()),
        );

        let (severity, _) = severity_from_evidence(&state.evidence, false);
        assert_eq!(severity, Severity::Medium);
    }

    #[test]
    fn test_prompt_is_redacted_and_lists_evidence() {
        let llm = Arc::new(ScriptedCompletionClient::new());
        let mut state = state_with_evidence(&[(category::VELOCITY_BURST, 0.9)]);
        state.features = None;
        state.evidence[0].description = "holder jane@example.com flagged".to_string();

        let tool = ReasoningTool::new(llm, breaker(), "model-x", 1);
        let request = tool.build_prompt(&state);
        let prompt = &request.messages[0].content;

        assert!(prompt.contains("pattern:velocity_burst:0"));
        assert!(!prompt.contains("jane@example.com"));
        assert!(prompt.contains("[REDACTED-EMAIL]"));
    }
}
