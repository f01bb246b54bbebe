//! Deterministic in-memory transaction source for tests and offline runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

use super::types::{
    AnalystNote, CaseLink, ReviewRecord, RuleMatch, SourceHealth, TransactionQuery,
    TransactionRecord,
};
use super::TransactionSource;

/// Scripted [`TransactionSource`] backed by in-memory maps.
///
/// Sub-query failures can be injected per endpoint name to exercise the
/// partial-failure semantics of the context tool.
#[derive(Default)]
pub struct FixtureSource {
    transactions: Mutex<HashMap<String, TransactionRecord>>,
    rule_matches: Mutex<HashMap<String, Vec<RuleMatch>>>,
    reviews: Mutex<HashMap<String, Vec<ReviewRecord>>>,
    notes: Mutex<HashMap<String, Vec<AnalystNote>>>,
    cases: Mutex<HashMap<String, CaseLink>>,
    /// Endpoint names ("overview", "query", "rule_matches", "reviews",
    /// "notes", "case", "health") that should fail with a dependency error.
    failing: Mutex<Vec<String>>,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a transaction. It becomes visible to both overview fetches and
    /// history queries.
    pub fn seed_transaction(&self, record: TransactionRecord) {
        self.transactions
            .lock()
            .expect("fixture lock")
            .insert(record.transaction_id.clone(), record);
    }

    pub fn seed_rule_matches(&self, transaction_id: &str, matches: Vec<RuleMatch>) {
        self.rule_matches
            .lock()
            .expect("fixture lock")
            .insert(transaction_id.to_string(), matches);
    }

    pub fn seed_reviews(&self, transaction_id: &str, reviews: Vec<ReviewRecord>) {
        self.reviews
            .lock()
            .expect("fixture lock")
            .insert(transaction_id.to_string(), reviews);
    }

    pub fn seed_notes(&self, transaction_id: &str, notes: Vec<AnalystNote>) {
        self.notes
            .lock()
            .expect("fixture lock")
            .insert(transaction_id.to_string(), notes);
    }

    pub fn seed_case(&self, transaction_id: &str, case: CaseLink) {
        self.cases
            .lock()
            .expect("fixture lock")
            .insert(transaction_id.to_string(), case);
    }

    /// Make a named endpoint fail with a dependency error.
    pub fn fail_endpoint(&self, endpoint: &str) {
        self.failing
            .lock()
            .expect("fixture lock")
            .push(endpoint.to_string());
    }

    fn check(&self, endpoint: &str) -> Result<()> {
        if self
            .failing
            .lock()
            .expect("fixture lock")
            .iter()
            .any(|e| e == endpoint)
        {
            return Err(Error::dependency("transaction-source", format!("{} unavailable", endpoint)));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionSource for FixtureSource {
    async fn get_transaction_overview(&self, transaction_id: &str) -> Result<TransactionRecord> {
        self.check("overview")?;
        self.transactions
            .lock()
            .expect("fixture lock")
            .get(transaction_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("transaction {}", transaction_id)))
    }

    async fn query_transactions(&self, query: &TransactionQuery) -> Result<Vec<TransactionRecord>> {
        self.check("query")?;
        let transactions = self.transactions.lock().expect("fixture lock");
        let mut matches: Vec<TransactionRecord> = transactions
            .values()
            .filter(|t| {
                query
                    .card_id
                    .as_ref()
                    .map_or(true, |card| &t.card_id == card)
                    && query
                        .merchant_id
                        .as_ref()
                        .map_or(true, |merchant| &t.merchant_id == merchant)
                    && query
                        .ip_address
                        .as_ref()
                        .map_or(true, |ip| t.ip_address.as_ref() == Some(ip))
                    && query
                        .device_id
                        .as_ref()
                        .map_or(true, |device| t.device_id.as_ref() == Some(device))
            })
            .cloned()
            .collect();
        matches.sort_by_key(|t| t.timestamp);
        Ok(matches)
    }

    async fn get_rule_matches(&self, transaction_id: &str) -> Result<Vec<RuleMatch>> {
        self.check("rule_matches")?;
        Ok(self
            .rule_matches
            .lock()
            .expect("fixture lock")
            .get(transaction_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_reviews(&self, transaction_id: &str) -> Result<Vec<ReviewRecord>> {
        self.check("reviews")?;
        Ok(self
            .reviews
            .lock()
            .expect("fixture lock")
            .get(transaction_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_notes(&self, transaction_id: &str) -> Result<Vec<AnalystNote>> {
        self.check("notes")?;
        Ok(self
            .notes
            .lock()
            .expect("fixture lock")
            .get(transaction_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_case(&self, transaction_id: &str) -> Result<Option<CaseLink>> {
        self.check("case")?;
        Ok(self
            .cases
            .lock()
            .expect("fixture lock")
            .get(transaction_id)
            .cloned())
    }

    async fn get_health(&self) -> Result<SourceHealth> {
        self.check("health")?;
        Ok(SourceHealth {
            healthy: true,
            detail: None,
        })
    }
}
