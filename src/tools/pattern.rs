//! Rule-based anomaly scoring over the feature pack.

use async_trait::async_trait;
use serde_json::json;

use crate::error::{Error, Result};
use crate::evidence::{category, sort_evidence, EvidenceItem, EvidenceKind};
use crate::features::TransactionFeatures;
use crate::investigation::{InvestigationState, ToolOutcome};

use super::{name, AnalysisTool};

/// Amount (in currency units) at or below which a ladder's smallest decline
/// marks card testing.
const LADDER_MIN_AMOUNT: f64 = 5.0;

/// Deterministic pattern scorer. An empty result is valid.
#[derive(Default)]
pub struct PatternTool;

impl PatternTool {
    pub fn new() -> Self {
        Self
    }

    /// Score the feature pack. Evidence is ordered by strength descending,
    /// then category ascending; timestamps anchor at the transaction so
    /// identical features yield identical evidence.
    pub fn score(features: &TransactionFeatures) -> Vec<EvidenceItem> {
        let mut evidence = Vec::new();
        let anchor = features.timestamp;

        let one_hour = features.card_stats("1h");
        let day = features.card_stats("24h");
        let month = features.card_stats("30d");

        // Velocity burst
        let velocity_strength = if one_hour.txn_count > 10 {
            Some(0.9)
        } else if one_hour.txn_count > 5 {
            Some(0.7)
        } else {
            None
        };
        if let Some(strength) = velocity_strength {
            evidence.push(
                EvidenceItem::new(
                    EvidenceKind::Pattern,
                    category::VELOCITY_BURST,
                    strength,
                    format!(
                        "{} transactions on the card within 1h of the anchor",
                        one_hour.txn_count
                    ),
                )
                .with_timestamp(anchor)
                .with_supporting_data(json!({
                    "txn_count_1h": one_hour.txn_count,
                    "trigger_threshold": if one_hour.txn_count > 10 { 10 } else { 5 },
                })),
            );
        }

        // Cross-merchant spread
        let spread_strength = if day.distinct_merchants > 10 {
            Some(0.8)
        } else if day.distinct_merchants > 5 {
            Some(0.5)
        } else {
            None
        };
        if let Some(strength) = spread_strength {
            evidence.push(
                EvidenceItem::new(
                    EvidenceKind::Pattern,
                    category::CROSS_MERCHANT_SPREAD,
                    strength,
                    format!(
                        "card used at {} distinct merchants within 24h",
                        day.distinct_merchants
                    ),
                )
                .with_timestamp(anchor)
                .with_supporting_data(json!({
                    "distinct_merchants_24h": day.distinct_merchants,
                    "trigger_threshold": if day.distinct_merchants > 10 { 10 } else { 5 },
                })),
            );
        }

        // High decline ratio
        let decline_strength = if one_hour.decline_rate > 0.5 {
            Some(0.9)
        } else if one_hour.decline_rate > 0.3 {
            Some(0.6)
        } else {
            None
        };
        if let Some(strength) = decline_strength {
            evidence.push(
                EvidenceItem::new(
                    EvidenceKind::Pattern,
                    category::HIGH_DECLINE_RATIO,
                    strength,
                    format!(
                        "{:.0}% of card transactions declined within 1h",
                        one_hour.decline_rate * 100.0
                    ),
                )
                .with_timestamp(anchor)
                .with_supporting_data(json!({
                    "decline_rate_1h": one_hour.decline_rate,
                    "trigger_threshold": if one_hour.decline_rate > 0.5 { 0.5 } else { 0.3 },
                })),
            );
        }

        // Card-testing ladder: amounts in chronological order, never
        // pre-sorted, monotonically non-decreasing.
        let ladder = &features.card_declined_amounts_1h;
        if ladder.len() >= 3
            && ladder.windows(2).all(|w| w[0] <= w[1])
            && ladder.first().map(|a| *a <= LADDER_MIN_AMOUNT).unwrap_or(false)
        {
            evidence.push(
                EvidenceItem::new(
                    EvidenceKind::Pattern,
                    category::CARD_TESTING_LADDER,
                    0.9,
                    format!(
                        "{} declined authorizations climbing from {:.2} within 1h",
                        ladder.len(),
                        ladder[0]
                    ),
                )
                .with_timestamp(anchor)
                .with_supporting_data(json!({
                    "declined_amounts": ladder,
                    "smallest_amount": ladder[0],
                })),
            );
        }

        // Amount outlier against the 30d baseline
        if month.amount_zscore.abs() > 3.0 {
            evidence.push(
                EvidenceItem::new(
                    EvidenceKind::Pattern,
                    category::AMOUNT_OUTLIER,
                    0.7,
                    format!(
                        "amount {:.2} is {:.1} standard deviations from the 30d mean",
                        features.amount, month.amount_zscore
                    ),
                )
                .with_timestamp(anchor)
                .with_supporting_data(json!({
                    "amount_zscore_30d": month.amount_zscore,
                    "amount": features.amount,
                })),
            );
        }

        sort_evidence(&mut evidence);
        evidence
    }
}

#[async_trait]
impl AnalysisTool for PatternTool {
    fn name(&self) -> &'static str {
        name::PATTERN
    }

    fn description(&self) -> &'static str {
        "Score velocity, decline, cross-merchant, ladder, and outlier patterns"
    }

    fn prerequisites(&self) -> &'static [&'static str] {
        &[name::CONTEXT]
    }

    async fn run(&self, state: &InvestigationState) -> Result<ToolOutcome> {
        let features = state
            .features
            .as_ref()
            .ok_or_else(|| Error::Internal("pattern tool requires assembled features".into()))?;

        let evidence = Self::score(features);
        let categories: Vec<&str> = evidence.iter().map(|e| e.category.as_str()).collect();

        let output = json!({
            "rules_fired": evidence.len(),
            "categories": categories,
            "top_strength": evidence.first().map(|e| e.strength).unwrap_or(0.0),
        });
        let output_summary = if evidence.is_empty() {
            "no patterns fired".to_string()
        } else {
            format!("{} pattern(s): {}", evidence.len(), categories.join(", "))
        };

        Ok(ToolOutcome::default()
            .with_output(output)
            .with_evidence(evidence)
            .with_summaries(
                format!("features for {}", features.transaction_id),
                output_summary,
            ))
    }
}
