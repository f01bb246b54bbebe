//! Similarity retrieval: embedding + cosine nearest-neighbor with a
//! deterministic SQL heuristic fallback.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Safeguards;
use crate::error::{Error, Result};
use crate::evidence::{category, EvidenceItem, EvidenceKind};
use crate::features::TransactionFeatures;
use crate::investigation::{InvestigationState, ToolOutcome};
use crate::llm::EmbeddingClient;
use crate::redact;
use crate::source::{TransactionQuery, TransactionRecord, TransactionSource};
use crate::store::SqliteStore;

use super::{name, AnalysisTool};

/// Diagnostic reason recorded when the vector path could not produce
/// matches and the heuristic took over.
const FALLBACK_REASON: &str = "embedding_or_similarity_failed";

/// Amount band for the heuristic fallback, as a fraction of the subject
/// amount.
const HEURISTIC_AMOUNT_BAND: f64 = 0.2;

/// Retrieves the k nearest historical transactions and extracts supporting
/// and counter evidence from their recorded outcomes.
pub struct SimilarityTool {
    embedding: Arc<dyn EmbeddingClient>,
    store: Arc<SqliteStore>,
    source: Arc<dyn TransactionSource>,
    safeguards: Safeguards,
}

struct VectorStage {
    executed: bool,
    match_count: usize,
    fallback_reason: Option<String>,
}

impl SimilarityTool {
    pub fn new(
        embedding: Arc<dyn EmbeddingClient>,
        store: Arc<SqliteStore>,
        source: Arc<dyn TransactionSource>,
        safeguards: Safeguards,
    ) -> Self {
        Self {
            embedding,
            store,
            source,
            safeguards,
        }
    }

    /// Canonical textual rendering of the transaction: bounded, redacted,
    /// pseudonymous identifiers only.
    fn canonical_rendering(features: &TransactionFeatures) -> String {
        let band = amount_band(features.amount);
        let text = format!(
            "card {} merchant {} mcc {} amount_band {} currency {} decision {} hour {} country {}",
            features.card_id,
            features.merchant_id,
            features.mcc,
            band,
            features.currency,
            features.decision,
            features.timestamp.format("%H"),
            features.ip_country_alpha3.as_deref().unwrap_or("unknown"),
        );
        redact::redact(&text)
    }

    async fn vector_matches(
        &self,
        features: &TransactionFeatures,
    ) -> Result<Vec<(String, f64)>> {
        let rendering = Self::canonical_rendering(features);
        let timeout = Duration::from_millis(self.safeguards.embedding_timeout_ms);

        let vector = tokio::time::timeout(timeout, self.embedding.embed(&rendering))
            .await
            .map_err(|_| Error::timeout(self.safeguards.embedding_timeout_ms))??;

        // Grow the corpus as investigations run.
        self.store.upsert_embedding(
            &features.transaction_id,
            self.embedding.model_name(),
            &vector,
        )?;

        if self.store.embedding_count()? <= 1 {
            return Err(Error::Embedding("vector store is empty".into()));
        }

        let matches = self.store.nearest_embeddings(
            &vector,
            self.safeguards.search_limit,
            self.safeguards.min_similarity,
            &features.transaction_id,
        )?;
        Ok(matches
            .into_iter()
            .map(|m| (m.transaction_id, m.similarity))
            .collect())
    }

    /// Heuristic fallback: join by card, merchant, amount band, and time
    /// window through the upstream source.
    async fn heuristic_matches(
        &self,
        features: &TransactionFeatures,
    ) -> Result<Vec<(String, f64)>> {
        let window_hours = 24;
        let card_query = TransactionQuery::for_card(&features.card_id, window_hours);
        let merchant_query = TransactionQuery::for_merchant(&features.merchant_id, window_hours);

        let (card_history, merchant_history) = futures::join!(
            self.source.query_transactions(&card_query),
            self.source.query_transactions(&merchant_query),
        );

        let mut matches: Vec<(String, f64)> = Vec::new();
        let mut push = |record: &TransactionRecord, score: f64| {
            if record.transaction_id == features.transaction_id {
                return;
            }
            if !matches.iter().any(|(id, _)| id == &record.transaction_id) {
                matches.push((record.transaction_id.clone(), score));
            }
        };

        for record in card_history.unwrap_or_default().iter() {
            push(record, 0.5);
        }
        let band = features.amount * HEURISTIC_AMOUNT_BAND;
        for record in merchant_history.unwrap_or_default().iter() {
            if (record.amount - features.amount).abs() <= band {
                push(record, 0.4);
            }
        }

        matches.truncate(self.safeguards.search_limit);
        Ok(matches)
    }

    /// Turn matches into evidence, loading each match's recorded outcome.
    async fn evidence_for_matches(
        &self,
        features: &TransactionFeatures,
        matches: &[(String, f64)],
    ) -> Vec<EvidenceItem> {
        let mut evidence = Vec::new();
        for (transaction_id, score) in matches {
            let record = match self.source.get_transaction_overview(transaction_id).await {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!(transaction_id = %transaction_id, error = %e, "match outcome load failed");
                    None
                }
            };

            // A match only supports the fraud hypothesis as far as its
            // recorded outcome does: confirmed fraud carries the full
            // similarity, an unresolved match a fraction, and a vetted
            // legitimate one close to nothing.
            let (outcome_label, outcome_weight) = record
                .as_ref()
                .map(|r| {
                    if r.confirmed_fraud {
                        ("confirmed fraud", 1.0)
                    } else if r.reviewed_legitimate {
                        ("reviewed legitimate", 0.2)
                    } else if r.trusted_device {
                        ("trusted device", 0.2)
                    } else if r.three_ds_success {
                        ("3DS success", 0.2)
                    } else {
                        ("no recorded outcome", 0.4)
                    }
                })
                .unwrap_or(("outcome unavailable", 0.4));

            let timestamp = record
                .as_ref()
                .map(|r| r.timestamp)
                .unwrap_or(features.timestamp);

            evidence.push(
                EvidenceItem::new(
                    EvidenceKind::Similarity,
                    category::SIMILAR_TRANSACTION,
                    score * outcome_weight,
                    format!(
                        "historical transaction {} (similarity {:.2}, {})",
                        transaction_id, score, outcome_label
                    ),
                )
                .with_id(format!("similarity:{}", transaction_id))
                .with_related(vec![transaction_id.clone()])
                .with_timestamp(timestamp)
                .with_freshness(features.timestamp)
                .with_supporting_data(json!({
                    "similarity": score,
                    "outcome": outcome_label,
                })),
            );

            // Counter-evidence: trust signals on the same card reduce fraud
            // likelihood.
            if let Some(record) = record {
                if record.card_id == features.card_id
                    && (record.three_ds_success || record.trusted_device)
                {
                    let (strength, signal) = if record.trusted_device {
                        (0.6, "trusted_device")
                    } else {
                        (0.5, "3ds_success")
                    };
                    evidence.push(
                        EvidenceItem::new(
                            EvidenceKind::CounterEvidence,
                            category::COUNTER_EVIDENCE,
                            strength,
                            format!(
                                "same card seen with {} on transaction {}",
                                signal, record.transaction_id
                            ),
                        )
                        .with_id(format!("counter_evidence:{}", record.transaction_id))
                        .with_related(vec![record.transaction_id.clone()])
                        .with_timestamp(record.timestamp)
                        .with_freshness(features.timestamp)
                        .with_supporting_data(json!({ "signal": signal })),
                    );
                }
            }
        }
        evidence
    }
}

#[async_trait]
impl AnalysisTool for SimilarityTool {
    fn name(&self) -> &'static str {
        name::SIMILARITY
    }

    fn description(&self) -> &'static str {
        "Retrieve nearest historical transactions and extract counter-evidence"
    }

    fn prerequisites(&self) -> &'static [&'static str] {
        &[name::CONTEXT]
    }

    async fn run(&self, state: &InvestigationState) -> Result<ToolOutcome> {
        let features = state
            .features
            .as_ref()
            .ok_or_else(|| Error::Internal("similarity tool requires assembled features".into()))?;

        let vector_enabled = state.feature_flags.vector_enabled;
        let mut stage = VectorStage {
            executed: false,
            match_count: 0,
            fallback_reason: None,
        };

        let (matches, fallback_used) = if vector_enabled {
            stage.executed = true;
            match self.vector_matches(features).await {
                Ok(matches) => {
                    stage.match_count = matches.len();
                    (matches, false)
                }
                Err(e) => {
                    warn!(error = %e, "vector stage failed; using heuristic fallback");
                    stage.fallback_reason = Some(e.to_string());
                    (self.heuristic_matches(features).await?, true)
                }
            }
        } else {
            (self.heuristic_matches(features).await?, false)
        };

        let evidence = self.evidence_for_matches(features, &matches).await;

        // Mean over the actual match count, never a fixed divisor.
        let overall_score = if matches.is_empty() {
            0.0
        } else {
            matches.iter().map(|(_, s)| s).sum::<f64>() / matches.len() as f64
        };

        let mut diagnostics = json!({
            "vector_feature_enabled": vector_enabled,
            "vector_stage_executed": stage.executed,
            "vector_match_count": stage.match_count,
            "fallback_used": fallback_used,
            "match_count": matches.len(),
            "overall_score": overall_score,
        });
        if fallback_used {
            diagnostics["reason"] = json!(FALLBACK_REASON);
            if let Some(detail) = &stage.fallback_reason {
                diagnostics["detail"] = json!(detail);
            }
        }

        let output_summary = format!(
            "{} match(es), overall score {:.2}{}",
            matches.len(),
            overall_score,
            if fallback_used { " (heuristic fallback)" } else { "" }
        );

        let mut outcome = ToolOutcome::default()
            .with_output(diagnostics)
            .with_evidence(evidence)
            .with_summaries(
                format!("transaction {}", features.transaction_id),
                output_summary,
            );
        outcome.fallback = fallback_used;
        Ok(outcome)
    }
}

fn amount_band(amount: f64) -> &'static str {
    match amount {
        a if a < 5.0 => "micro",
        a if a < 50.0 => "small",
        a if a < 500.0 => "medium",
        a if a < 5000.0 => "large",
        _ => "very_large",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureFlags;
    use crate::investigation::InvestigationMode;
    use crate::llm::testing::{deterministic_vector, ScriptedEmbeddingClient};
    use crate::source::{FixtureSource, TransactionDecision};
    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    fn txn(id: &str, card: &str, merchant: &str, minutes_ago: i64) -> TransactionRecord {
        TransactionRecord {
            transaction_id: id.to_string(),
            amount: 20.0,
            currency: "EUR".to_string(),
            decision: TransactionDecision::Approved,
            timestamp: Utc::now() - ChronoDuration::minutes(minutes_ago),
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

    fn state_with_features() -> InvestigationState {
        let mut state = InvestigationState::new(
            Uuid::new_v4(),
            "subject",
            InvestigationMode::Full,
            FeatureFlags::default(),
        );
        state.features = Some(TransactionFeatures::assemble(
            &txn("subject", "card_a", "m_1", 0),
            &[],
            &[],
            0,
            0,
            0,
            false,
            vec![],
        ));
        state
    }

    fn tool(
        embedding: Arc<ScriptedEmbeddingClient>,
        store: Arc<SqliteStore>,
        source: Arc<FixtureSource>,
    ) -> SimilarityTool {
        SimilarityTool::new(embedding, store, source, Safeguards::default())
    }

    #[tokio::test]
    async fn test_vector_path_finds_matches() {
        let embedding = Arc::new(ScriptedEmbeddingClient::new());
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let source = Arc::new(FixtureSource::new());

        // A near-identical historical vector and its outcome record.
        store
            .upsert_embedding("historic", "scripted-embedding", &deterministic_vector(7))
            .unwrap();
        source.seed_transaction(txn("historic", "card_b", "m_2", 600));
        embedding.push_vector_for(7);

        let state = state_with_features();
        let outcome = tool(embedding, store.clone(), source).run(&state).await.unwrap();

        assert!(!outcome.fallback);
        assert_eq!(outcome.output["vector_stage_executed"], true);
        assert_eq!(outcome.output["vector_match_count"], 1);
        assert!(outcome
            .evidence
            .iter()
            .any(|e| e.kind == EvidenceKind::Similarity));
        // Subject embedding was upserted.
        assert_eq!(store.embedding_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_embedding_failure_uses_heuristic_fallback() {
        let embedding = Arc::new(ScriptedEmbeddingClient::new());
        embedding.push_error(Error::timeout(10_000));
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let source = Arc::new(FixtureSource::new());
        source.seed_transaction(txn("subject", "card_a", "m_1", 0));
        source.seed_transaction(txn("peer", "card_a", "m_9", 30));

        let state = state_with_features();
        let outcome = tool(embedding, store, source).run(&state).await.unwrap();

        assert!(outcome.fallback);
        assert_eq!(outcome.output["reason"], FALLBACK_REASON);
        assert_eq!(outcome.output["vector_stage_executed"], true);
        assert_eq!(outcome.output["vector_match_count"], 0);
        assert_eq!(outcome.output["match_count"], 1);
    }

    #[tokio::test]
    async fn test_empty_vector_store_falls_back() {
        let embedding = Arc::new(ScriptedEmbeddingClient::new());
        embedding.push_vector_for(1);
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let source = Arc::new(FixtureSource::new());
        source.seed_transaction(txn("subject", "card_a", "m_1", 0));

        let state = state_with_features();
        let outcome = tool(embedding, store, source).run(&state).await.unwrap();

        assert!(outcome.fallback);
        assert_eq!(outcome.output["match_count"], 0);
    }

    #[tokio::test]
    async fn test_zero_matches_with_populated_store_is_not_fallback() {
        let embedding = Arc::new(ScriptedEmbeddingClient::new());
        // Orthogonal-ish vectors: similarity below the 0.7 floor.
        embedding.push_vector_for(1);
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store
            .upsert_embedding("far", "scripted-embedding", &deterministic_vector(999_983))
            .unwrap();
        let source = Arc::new(FixtureSource::new());

        let state = state_with_features();
        let outcome = tool(embedding, store, source).run(&state).await.unwrap();

        assert!(!outcome.fallback);
        assert_eq!(outcome.output["vector_stage_executed"], true);
        assert_eq!(outcome.output["vector_match_count"], 0);
        assert_eq!(outcome.output["overall_score"], 0.0);
    }

    #[tokio::test]
    async fn test_counter_evidence_for_trusted_device_on_same_card() {
        let embedding = Arc::new(ScriptedEmbeddingClient::new());
        embedding.push_error(Error::Embedding("down".into()));
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let source = Arc::new(FixtureSource::new());
        source.seed_transaction(txn("subject", "card_a", "m_1", 0));
        let mut trusted = txn("trusted-peer", "card_a", "m_2", 120);
        trusted.trusted_device = true;
        source.seed_transaction(trusted);

        let state = state_with_features();
        let outcome = tool(embedding, store, source).run(&state).await.unwrap();

        let counter: Vec<&EvidenceItem> = outcome
            .evidence
            .iter()
            .filter(|e| e.kind == EvidenceKind::CounterEvidence)
            .collect();
        assert_eq!(counter.len(), 1);
        assert_eq!(counter[0].strength, 0.6);
        assert_eq!(counter[0].related_transaction_ids, vec!["trusted-peer"]);
    }

    #[tokio::test]
    async fn test_vector_disabled_uses_heuristic_without_fallback_marker() {
        let embedding = Arc::new(ScriptedEmbeddingClient::new());
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let source = Arc::new(FixtureSource::new());
        source.seed_transaction(txn("subject", "card_a", "m_1", 0));
        source.seed_transaction(txn("peer", "card_a", "m_2", 15));

        let mut state = state_with_features();
        state.feature_flags.vector_enabled = false;

        let outcome = tool(embedding, store, source).run(&state).await.unwrap();
        assert!(!outcome.fallback);
        assert_eq!(outcome.output["vector_stage_executed"], false);
        assert_eq!(outcome.output["match_count"], 1);
    }

    #[test]
    fn test_canonical_rendering_is_redacted_and_bounded() {
        let mut features = TransactionFeatures::assemble(
            &txn("subject", "card_a", "m_1", 0),
            &[],
            &[],
            0,
            0,
            0,
            false,
            vec![],
        );
        features.ip_address = Some("203.0.113.7".to_string());

        let rendering = SimilarityTool::canonical_rendering(&features);
        assert!(rendering.contains("card card_a"));
        assert!(rendering.contains("amount_band small"));
        // The raw IP never enters the rendering at all.
        assert!(!rendering.contains("203.0.113.7"));
        assert!(rendering.len() < 300);
    }
}
