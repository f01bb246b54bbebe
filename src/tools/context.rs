//! Context-assembly tool: fetches the upstream snapshot and computes the
//! deterministic feature pack.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::evidence::{category, EvidenceItem, EvidenceKind};
use crate::features::TransactionFeatures;
use crate::investigation::{InvestigationState, ToolOutcome};
use crate::source::{TransactionQuery, TransactionSource};

use super::{name, AnalysisTool};

/// Widest stats window; card/merchant histories are fetched over this
/// horizon so every window statistic has full data.
const HISTORY_WINDOW_HOURS: i64 = 30 * 24;

/// Assembles [`TransactionFeatures`] from parallel upstream reads.
///
/// Sub-query failures are collected into the feature pack; only a failed
/// transaction-overview fetch fails the tool.
pub struct ContextTool {
    source: Arc<dyn TransactionSource>,
}

impl ContextTool {
    pub fn new(source: Arc<dyn TransactionSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl AnalysisTool for ContextTool {
    fn name(&self) -> &'static str {
        name::CONTEXT
    }

    fn description(&self) -> &'static str {
        "Fetch the transaction, its card/merchant histories, and compute window statistics"
    }

    fn prerequisites(&self) -> &'static [&'static str] {
        &[]
    }

    async fn run(&self, state: &InvestigationState) -> Result<ToolOutcome> {
        let transaction_id = &state.transaction_id;

        // The overview is the one required fetch.
        let overview = self
            .source
            .get_transaction_overview(transaction_id)
            .await
            .map_err(|e| match e {
                Error::NotFound(_) => e,
                other => Error::dependency(
                    "transaction-source",
                    format!("transaction overview failed: {}", other),
                ),
            })?;

        let card_query = TransactionQuery::for_card(&overview.card_id, HISTORY_WINDOW_HOURS);
        let merchant_query =
            TransactionQuery::for_merchant(&overview.merchant_id, HISTORY_WINDOW_HOURS);

        // Independent reads run in parallel; each failure is collected, not
        // propagated.
        let (card_history, merchant_history, rule_matches, reviews, notes, case) = futures::join!(
            self.source.query_transactions(&card_query),
            self.source.query_transactions(&merchant_query),
            self.source.get_rule_matches(transaction_id),
            self.source.get_reviews(transaction_id),
            self.source.get_notes(transaction_id),
            self.source.get_case(transaction_id),
        );

        let mut sub_errors = Vec::new();
        let card_history = card_history.unwrap_or_else(|e| {
            sub_errors.push(format!("card_history: {}", e));
            Vec::new()
        });
        let merchant_history = merchant_history.unwrap_or_else(|e| {
            sub_errors.push(format!("merchant_history: {}", e));
            Vec::new()
        });
        let rule_matches = rule_matches.unwrap_or_else(|e| {
            sub_errors.push(format!("rule_matches: {}", e));
            Vec::new()
        });
        let reviews = reviews.unwrap_or_else(|e| {
            sub_errors.push(format!("reviews: {}", e));
            Vec::new()
        });
        let notes = notes.unwrap_or_else(|e| {
            sub_errors.push(format!("notes: {}", e));
            Vec::new()
        });
        let case = case.unwrap_or_else(|e| {
            sub_errors.push(format!("case: {}", e));
            None
        });

        debug!(
            transaction_id = %transaction_id,
            card_history = card_history.len(),
            merchant_history = merchant_history.len(),
            sub_errors = sub_errors.len(),
            "context assembled"
        );

        let has_open_case = case
            .as_ref()
            .map(|c| c.status.eq_ignore_ascii_case("open"))
            .unwrap_or(false);

        let features = TransactionFeatures::assemble(
            &overview,
            &card_history,
            &merchant_history,
            rule_matches.len() as u32,
            reviews.len() as u32,
            notes.len() as u32,
            has_open_case,
            sub_errors.clone(),
        );

        // Contextual evidence is anchored at the transaction timestamp so
        // the tool output stays a pure function of the snapshot.
        let mut evidence = Vec::new();
        if has_open_case {
            evidence.push(
                EvidenceItem::new(
                    EvidenceKind::Context,
                    category::PRIOR_CASE_LINK,
                    0.4,
                    "transaction is attached to an open case",
                )
                .with_timestamp(features.timestamp),
            );
        }
        if !rule_matches.is_empty() {
            evidence.push(
                EvidenceItem::new(
                    EvidenceKind::Context,
                    category::RECENT_RULE_MATCHES,
                    0.3,
                    format!("{} fraud rule(s) matched this transaction", rule_matches.len()),
                )
                .with_timestamp(features.timestamp),
            );
        }

        let output = json!({
            "card_txn_count_1h": features.card_stats("1h").txn_count,
            "card_txn_count_24h": features.card_stats("24h").txn_count,
            "merchant_txn_count_1h": features.merchant_stats("1h").txn_count,
            "rule_match_count": features.rule_match_count,
            "has_open_case": features.has_open_case,
            "sub_query_errors": features.sub_query_errors,
        });

        let output_summary = format!(
            "features assembled: {} card txns (30d), {} merchant txns (30d), {} sub-query error(s)",
            card_history.len(),
            merchant_history.len(),
            sub_errors.len()
        );

        let mut outcome = ToolOutcome::default()
            .with_output(output)
            .with_evidence(evidence)
            .with_summaries(format!("transaction {}", transaction_id), output_summary);
        outcome.features = Some(features);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureFlags;
    use crate::investigation::InvestigationMode;
    use crate::source::{CaseLink, FixtureSource, TransactionDecision, TransactionRecord};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn txn(id: &str, card: &str, merchant: &str, minutes_ago: i64) -> TransactionRecord {
        TransactionRecord {
            transaction_id: id.to_string(),
            amount: 20.0,
            currency: "EUR".to_string(),
            decision: TransactionDecision::Approved,
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
            mcc: "5999".to_string(),
            card_id: card.to_string(),
            merchant_id: merchant.to_string(),
            ip_address: None,
            ip_country_alpha3: None,
            device_id: None,
            device_fingerprint_hash: None,
            three_ds_success: false,
            trusted_device: false,
            confirmed_fraud: false,
            reviewed_legitimate: false,
        }
    }

    fn state(transaction_id: &str) -> InvestigationState {
        InvestigationState::new(
            Uuid::new_v4(),
            transaction_id,
            InvestigationMode::Full,
            FeatureFlags::default(),
        )
    }

    #[tokio::test]
    async fn test_assembles_features_from_histories() {
        let source = Arc::new(FixtureSource::new());
        source.seed_transaction(txn("subject", "card_a", "m_1", 0));
        source.seed_transaction(txn("h1", "card_a", "m_2", 10));
        source.seed_transaction(txn("h2", "card_a", "m_3", 20));

        let tool = ContextTool::new(source);
        let outcome = tool.run(&state("subject")).await.unwrap();

        let features = outcome.features.unwrap();
        assert_eq!(features.card_stats("1h").txn_count, 3);
        assert_eq!(features.card_stats("1h").distinct_merchants, 3);
        assert!(features.sub_query_errors.is_empty());
    }

    #[tokio::test]
    async fn test_overview_failure_fails_tool() {
        let source = Arc::new(FixtureSource::new());
        let tool = ContextTool::new(source);

        let err = tool.run(&state("missing")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sub_query_failures_are_collected() {
        let source = Arc::new(FixtureSource::new());
        source.seed_transaction(txn("subject", "card_a", "m_1", 0));
        source.fail_endpoint("reviews");
        source.fail_endpoint("notes");

        let tool = ContextTool::new(source);
        let outcome = tool.run(&state("subject")).await.unwrap();

        let features = outcome.features.unwrap();
        assert_eq!(features.sub_query_errors.len(), 2);
        assert!(features.sub_query_errors.iter().any(|e| e.starts_with("reviews:")));
    }

    #[tokio::test]
    async fn test_open_case_emits_context_evidence() {
        let source = Arc::new(FixtureSource::new());
        source.seed_transaction(txn("subject", "card_a", "m_1", 0));
        source.seed_case(
            "subject",
            CaseLink {
                case_id: "case-9".to_string(),
                status: "OPEN".to_string(),
            },
        );

        let tool = ContextTool::new(source);
        let outcome = tool.run(&state("subject")).await.unwrap();

        assert!(outcome
            .evidence
            .iter()
            .any(|e| e.category == category::PRIOR_CASE_LINK));
        assert!(outcome.features.unwrap().has_open_case);
    }
}
