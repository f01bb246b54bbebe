//! Wire types for the upstream transaction-management source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authorization decision recorded on a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionDecision {
    Approved,
    Declined,
    Review,
}

impl TransactionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Declined => "declined",
            Self::Review => "review",
        }
    }
}

impl std::fmt::Display for TransactionDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A transaction as returned by the upstream source. All identifiers are
/// stringified at this boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub amount: f64,
    pub currency: String,
    pub decision: TransactionDecision,
    pub timestamp: DateTime<Utc>,
    pub mcc: String,
    pub card_id: String,
    pub merchant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_country_alpha3: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_fingerprint_hash: Option<String>,
    /// Historical outcome signals used by the similarity tool.
    #[serde(default)]
    pub three_ds_success: bool,
    #[serde(default)]
    pub trusted_device: bool,
    #[serde(default)]
    pub confirmed_fraud: bool,
    #[serde(default)]
    pub reviewed_legitimate: bool,
}

/// Filter for history queries. At least one entity filter should be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// History horizon in hours, ending at the query time.
    pub window_hours: i64,
}

impl TransactionQuery {
    pub fn for_card(card_id: impl Into<String>, window_hours: i64) -> Self {
        Self {
            card_id: Some(card_id.into()),
            window_hours,
            ..Self::default()
        }
    }

    pub fn for_merchant(merchant_id: impl Into<String>, window_hours: i64) -> Self {
        Self {
            merchant_id: Some(merchant_id.into()),
            window_hours,
            ..Self::default()
        }
    }
}

/// A fraud-rule match recorded against a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_name: String,
    pub matched_at: DateTime<Utc>,
}

/// A past analyst review of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub reviewer: String,
    pub outcome: String,
    pub reviewed_at: DateTime<Utc>,
}

/// A free-form analyst note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalystNote {
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Link to an open or closed case in the case-management system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseLink {
    pub case_id: String,
    pub status: String,
}

/// Health report from the upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
