//! Scored evidence signals exchanged between analysis tools.
//!
//! Evidence is a tagged record: a single `kind` discriminator plus a
//! structured payload. Strength and freshness are orthogonal; freshness is
//! an exponential decay function of age whose time constant depends on the
//! category.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Evidence categories referenced by policy rules.
pub mod category {
    pub const VELOCITY_BURST: &str = "velocity_burst";
    pub const CROSS_MERCHANT_SPREAD: &str = "cross_merchant_spread";
    pub const HIGH_DECLINE_RATIO: &str = "high_decline_ratio";
    pub const CARD_TESTING_LADDER: &str = "card_testing_ladder";
    pub const AMOUNT_OUTLIER: &str = "amount_outlier";
    pub const SIMILAR_TRANSACTION: &str = "similar_transaction";
    pub const COUNTER_EVIDENCE: &str = "counter_evidence";
    pub const NO_CLOSE_MATCH: &str = "no_close_match";
    pub const PRIOR_CASE_LINK: &str = "prior_case_link";
    pub const RECENT_RULE_MATCHES: &str = "recent_rule_matches";
}

/// Discriminator for evidence records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// Rule-based anomaly signal from the pattern tool
    Pattern,
    /// Historical-match signal from the similarity tool
    Similarity,
    /// Contextual signal from the context tool
    Context,
    /// Signal reducing fraud likelihood (3DS success, trusted device)
    CounterEvidence,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Similarity => "similarity",
            Self::Context => "context",
            Self::CounterEvidence => "counter_evidence",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pattern" => Some(Self::Pattern),
            "similarity" => Some(Self::Similarity),
            "context" => Some(Self::Context),
            "counter_evidence" => Some(Self::CounterEvidence),
            _ => None,
        }
    }
}

impl std::fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A structured, scored signal consumed by reasoning, recommendation, and
/// rule-draft tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// Stable identifier, referenced by reasoning citations.
    pub id: String,
    pub kind: EvidenceKind,
    pub category: String,
    /// Signal strength in [0,1]. Counter-evidence strength is stored as a
    /// positive magnitude; the kind carries the sign.
    pub strength: f64,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    /// Exponential decay factor in [0,1] based on age.
    pub freshness_weight: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_transaction_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub supporting_data: Value,
}

impl EvidenceItem {
    /// Create an evidence item with full freshness.
    pub fn new(
        kind: EvidenceKind,
        category: impl Into<String>,
        strength: f64,
        description: impl Into<String>,
    ) -> Self {
        let category = category.into();
        Self {
            id: format!("{}:{}", kind.as_str(), category),
            kind,
            category,
            strength: strength.clamp(0.0, 1.0),
            description: description.into(),
            timestamp: Utc::now(),
            freshness_weight: 1.0,
            related_transaction_ids: Vec::new(),
            supporting_data: Value::Null,
        }
    }

    /// Override the generated id (needed when several items share a
    /// category, e.g. one similarity item per match).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_related(mut self, ids: Vec<String>) -> Self {
        self.related_transaction_ids = ids;
        self
    }

    pub fn with_supporting_data(mut self, data: Value) -> Self {
        self.supporting_data = data;
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = ts;
        self
    }

    /// Apply freshness decay for the item's age relative to `now`.
    pub fn with_freshness(mut self, now: DateTime<Utc>) -> Self {
        let age_hours = (now - self.timestamp).num_seconds() as f64 / 3600.0;
        self.freshness_weight = freshness_weight(&self.category, age_hours);
        self
    }

    /// Strength after freshness weighting.
    pub fn effective_strength(&self, freshness_enabled: bool) -> f64 {
        if freshness_enabled {
            self.strength * self.freshness_weight
        } else {
            self.strength
        }
    }

    /// Whether this item supports the fraud hypothesis (as opposed to
    /// counter-evidence).
    pub fn is_supporting(&self) -> bool {
        self.kind != EvidenceKind::CounterEvidence
    }
}

/// Decay time constant in hours for a category.
///
/// Pattern signals describe the transaction's immediate window and age
/// quickly; similarity and context signals reference history and decay over
/// weeks.
fn tau_hours(category: &str) -> f64 {
    match category {
        category::VELOCITY_BURST
        | category::HIGH_DECLINE_RATIO
        | category::CARD_TESTING_LADDER => 24.0,
        category::CROSS_MERCHANT_SPREAD | category::AMOUNT_OUTLIER => 72.0,
        category::SIMILAR_TRANSACTION | category::COUNTER_EVIDENCE => 24.0 * 30.0,
        _ => 24.0 * 7.0,
    }
}

/// Freshness weight `exp(-age / tau)` for a category, clamped to [0,1].
pub fn freshness_weight(category: &str, age_hours: f64) -> f64 {
    if age_hours <= 0.0 {
        return 1.0;
    }
    (-age_hours / tau_hours(category)).exp().clamp(0.0, 1.0)
}

/// Order evidence for presentation: strength descending, then category name
/// ascending.
pub fn sort_evidence(items: &mut [EvidenceItem]) {
    items.sort_by(|a, b| {
        b.strength
            .partial_cmp(&a.strength)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.category.cmp(&b.category))
    });
}
