//! Read-only client contract for the upstream transaction-management system.

mod client;
mod fixture;
mod types;

pub use client::{HttpTransactionSource, SourceClientConfig};
pub use fixture::FixtureSource;
pub use types::{
    AnalystNote, CaseLink, ReviewRecord, RuleMatch, SourceHealth, TransactionDecision,
    TransactionQuery, TransactionRecord,
};

use crate::error::Result;
use async_trait::async_trait;

/// Read-only access to transaction and history data.
///
/// Implementations must be thread-safe; one instance is shared across all
/// concurrent investigations.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Fetch the transaction under investigation. `Error::NotFound` when the
    /// id is unknown.
    async fn get_transaction_overview(&self, transaction_id: &str) -> Result<TransactionRecord>;

    /// Query historical transactions by entity filters over a time window.
    async fn query_transactions(&self, query: &TransactionQuery) -> Result<Vec<TransactionRecord>>;

    /// Fraud-rule matches recorded against the transaction.
    async fn get_rule_matches(&self, transaction_id: &str) -> Result<Vec<RuleMatch>>;

    /// Past analyst reviews of the transaction.
    async fn get_reviews(&self, transaction_id: &str) -> Result<Vec<ReviewRecord>>;

    /// Analyst notes attached to the transaction.
    async fn get_notes(&self, transaction_id: &str) -> Result<Vec<AnalystNote>>;

    /// Case link, if the transaction is attached to a case.
    async fn get_case(&self, transaction_id: &str) -> Result<Option<CaseLink>>;

    /// Source health probe.
    async fn get_health(&self) -> Result<SourceHealth>;
}
