//! Rule-draft assembly from an accepted rule-candidate recommendation.

use async_trait::async_trait;
use serde_json::json;

use crate::error::{Error, Result};
use crate::evidence::category;
use crate::investigation::{
    InvestigationState, RecommendationType, RuleCondition, RuleDraft, ToolOutcome,
};

use super::{name, AnalysisTool};

/// Fraction of the observed value used when widening a threshold. The rule
/// fires slightly before the observed extreme recurs, floored at the
/// pattern's own trigger.
const WIDENING_FACTOR: f64 = 0.8;

/// Builds a normalized rule draft from the rule-candidate recommendation's
/// preconditions. Performs no external export.
#[derive(Default)]
pub struct RuleDraftTool;

impl RuleDraftTool {
    pub fn new() -> Self {
        Self
    }

    fn conditions_for(
        pattern_category: &str,
        preconditions: &serde_json::Value,
    ) -> Vec<RuleCondition> {
        match pattern_category {
            category::VELOCITY_BURST => {
                let observed = preconditions["txn_count_1h"].as_f64().unwrap_or(0.0);
                let trigger = preconditions["trigger_threshold"].as_f64().unwrap_or(10.0);
                vec![RuleCondition {
                    field: "card_txn_count_1h".to_string(),
                    operator: ">".to_string(),
                    threshold: widen(observed, trigger),
                }]
            }
            category::CROSS_MERCHANT_SPREAD => {
                let observed = preconditions["distinct_merchants_24h"].as_f64().unwrap_or(0.0);
                let trigger = preconditions["trigger_threshold"].as_f64().unwrap_or(10.0);
                vec![RuleCondition {
                    field: "card_distinct_merchants_24h".to_string(),
                    operator: ">".to_string(),
                    threshold: widen(observed, trigger),
                }]
            }
            category::HIGH_DECLINE_RATIO => {
                let observed = preconditions["decline_rate_1h"].as_f64().unwrap_or(0.0);
                let trigger = preconditions["trigger_threshold"].as_f64().unwrap_or(0.5);
                vec![RuleCondition {
                    field: "card_decline_rate_1h".to_string(),
                    operator: ">".to_string(),
                    threshold: widen(observed, trigger),
                }]
            }
            category::CARD_TESTING_LADDER => {
                let smallest = preconditions["smallest_amount"].as_f64().unwrap_or(5.0);
                vec![
                    RuleCondition {
                        field: "card_declined_count_1h".to_string(),
                        operator: ">=".to_string(),
                        threshold: 3.0,
                    },
                    RuleCondition {
                        field: "min_declined_amount_1h".to_string(),
                        operator: "<=".to_string(),
                        threshold: smallest.max(1.0),
                    },
                ]
            }
            _ => Vec::new(),
        }
    }
}

/// Widened threshold: below the observed extreme so recurrence is caught,
/// never below the pattern's own trigger.
fn widen(observed: f64, trigger: f64) -> f64 {
    (observed * WIDENING_FACTOR).max(trigger)
}

#[async_trait]
impl AnalysisTool for RuleDraftTool {
    fn name(&self) -> &'static str {
        name::RULE_DRAFT
    }

    fn description(&self) -> &'static str {
        "Assemble a normalized fraud-rule draft from a rule-candidate recommendation"
    }

    fn prerequisites(&self) -> &'static [&'static str] {
        &[name::RECOMMENDATION]
    }

    fn is_ready(&self, state: &InvestigationState) -> bool {
        state.has_succeeded(name::RECOMMENDATION)
            && state
                .recommendation_candidates
                .iter()
                .any(|c| c.rec_type == RecommendationType::RuleCandidate)
    }

    async fn run(&self, state: &InvestigationState) -> Result<ToolOutcome> {
        let rule_candidate = state
            .recommendation_candidates
            .iter()
            .find(|c| c.rec_type == RecommendationType::RuleCandidate)
            .ok_or_else(|| {
                Error::Internal("rule-draft tool requires a rule-candidate recommendation".into())
            })?;

        let pattern_category = rule_candidate.payload["category"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let preconditions = &rule_candidate.payload["preconditions"];
        let conditions = Self::conditions_for(&pattern_category, preconditions);

        if conditions.is_empty() {
            return Err(Error::Validation(format!(
                "no rule conditions derivable for category '{}'",
                pattern_category
            )));
        }
        if conditions
            .iter()
            .any(|c| !c.threshold.is_finite() || c.threshold <= 0.0)
        {
            return Err(Error::Validation(
                "rule thresholds must be finite and positive".into(),
            ));
        }

        let draft = RuleDraft {
            rule_name: format!("{}_card_1h", pattern_category),
            rule_description: format!(
                "Flags cards matching the {} pattern observed on transaction {}",
                pattern_category, state.transaction_id
            ),
            conditions: conditions.clone(),
            thresholds: preconditions.clone(),
            metadata: json!({
                "category": pattern_category,
                "strength": rule_candidate.payload["strength"],
                "source_transaction_id": state.transaction_id,
            }),
        };

        let output = json!({
            "rule_name": draft.rule_name,
            "condition_count": draft.conditions.len(),
        });
        let output_summary = format!(
            "draft '{}' with {} condition(s)",
            draft.rule_name,
            draft.conditions.len()
        );

        let mut outcome = ToolOutcome::default().with_output(output).with_summaries(
            format!("rule candidate for {}", pattern_category),
            output_summary,
        );
        outcome.rule_draft = Some(draft);
        Ok(outcome)
    }
}
