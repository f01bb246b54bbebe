//! Deterministic transaction feature pack.
//!
//! Window statistics are anchored at the transaction's own timestamp:
//! history strictly after the anchor is excluded, so re-running an
//! investigation against the same upstream snapshot yields identical
//! features.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::source::{TransactionDecision, TransactionRecord};

/// Statistics windows computed for both card and merchant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    FiveMinutes,
    OneHour,
    Day,
    ThirtyDays,
}

impl Window {
    pub const ALL: [Window; 4] = [
        Window::FiveMinutes,
        Window::OneHour,
        Window::Day,
        Window::ThirtyDays,
    ];

    pub fn duration(&self) -> Duration {
        match self {
            Self::FiveMinutes => Duration::minutes(5),
            Self::OneHour => Duration::hours(1),
            Self::Day => Duration::hours(24),
            Self::ThirtyDays => Duration::days(30),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::FiveMinutes => "5m",
            Self::OneHour => "1h",
            Self::Day => "24h",
            Self::ThirtyDays => "30d",
        }
    }
}

/// Which entity a window is computed over. Determines which distinct-count
/// is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEntity {
    Card,
    Merchant,
}

/// Aggregate statistics over one (entity, window) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub txn_count: u32,
    pub decline_rate: f64,
    pub avg_amount: f64,
    /// (amount − µ) / σ over the window; 0 when σ = 0 or fewer than 3
    /// observations. Only populated for the 30d window.
    pub amount_zscore: f64,
    /// Distinct merchants seen for the card (card windows only).
    pub distinct_merchants: u32,
    /// Distinct cards seen at the merchant (merchant windows only).
    pub distinct_cards: u32,
}

impl WindowStats {
    /// Compute stats over `history` for the window ending at `anchor`.
    /// Transactions strictly after the anchor are excluded; the anchor
    /// transaction itself is included when present in the history.
    pub fn compute(
        subject_amount: f64,
        history: &[TransactionRecord],
        anchor: DateTime<Utc>,
        window: Window,
        entity: WindowEntity,
    ) -> Self {
        let start = anchor - window.duration();
        let in_window: Vec<&TransactionRecord> = history
            .iter()
            .filter(|t| t.timestamp > start && t.timestamp <= anchor)
            .collect();

        let txn_count = in_window.len() as u32;
        if txn_count == 0 {
            return Self::default();
        }

        let declines = in_window
            .iter()
            .filter(|t| t.decision == TransactionDecision::Declined)
            .count();
        let decline_rate = declines as f64 / txn_count as f64;

        let sum: f64 = in_window.iter().map(|t| t.amount).sum();
        let avg_amount = sum / txn_count as f64;

        let amount_zscore = if window == Window::ThirtyDays {
            zscore(subject_amount, &in_window)
        } else {
            0.0
        };

        let (distinct_merchants, distinct_cards) = match entity {
            WindowEntity::Card => {
                let merchants: BTreeSet<&str> =
                    in_window.iter().map(|t| t.merchant_id.as_str()).collect();
                (merchants.len() as u32, 0)
            }
            WindowEntity::Merchant => {
                let cards: BTreeSet<&str> = in_window.iter().map(|t| t.card_id.as_str()).collect();
                (0, cards.len() as u32)
            }
        };

        Self {
            txn_count,
            decline_rate,
            avg_amount,
            amount_zscore,
            distinct_merchants,
            distinct_cards,
        }
    }
}

fn zscore(subject_amount: f64, in_window: &[&TransactionRecord]) -> f64 {
    let n = in_window.len();
    if n < 3 {
        return 0.0;
    }
    let mean = in_window.iter().map(|t| t.amount).sum::<f64>() / n as f64;
    let variance = in_window
        .iter()
        .map(|t| (t.amount - mean).powi(2))
        .sum::<f64>()
        / (n - 1) as f64;
    let sigma = variance.sqrt();
    if sigma == 0.0 {
        return 0.0;
    }
    (subject_amount - mean) / sigma
}

/// The assembled feature pack for a transaction. Immutable once assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionFeatures {
    pub transaction_id: String,
    pub amount: f64,
    pub currency: String,
    pub decision: String,
    pub mcc: String,
    pub timestamp: DateTime<Utc>,
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
    /// Window stats keyed by window label ("5m", "1h", "24h", "30d").
    pub card_windows: BTreeMap<String, WindowStats>,
    pub merchant_windows: BTreeMap<String, WindowStats>,
    /// Amounts of declined authorizations on the card within 1 h of the
    /// anchor, in chronological order. Input to ladder detection.
    #[serde(default)]
    pub card_declined_amounts_1h: Vec<f64>,
    pub rule_match_count: u32,
    pub review_count: u32,
    pub note_count: u32,
    pub has_open_case: bool,
    /// Sub-queries that failed during assembly. Non-empty only on partial
    /// context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_query_errors: Vec<String>,
}

impl TransactionFeatures {
    /// Assemble features from an upstream snapshot. Pure: identical inputs
    /// yield identical output.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        overview: &TransactionRecord,
        card_history: &[TransactionRecord],
        merchant_history: &[TransactionRecord],
        rule_match_count: u32,
        review_count: u32,
        note_count: u32,
        has_open_case: bool,
        sub_query_errors: Vec<String>,
    ) -> Self {
        let anchor = overview.timestamp;

        let mut card_windows = BTreeMap::new();
        let mut merchant_windows = BTreeMap::new();
        for window in Window::ALL {
            card_windows.insert(
                window.label().to_string(),
                WindowStats::compute(
                    overview.amount,
                    card_history,
                    anchor,
                    window,
                    WindowEntity::Card,
                ),
            );
            merchant_windows.insert(
                window.label().to_string(),
                WindowStats::compute(
                    overview.amount,
                    merchant_history,
                    anchor,
                    window,
                    WindowEntity::Merchant,
                ),
            );
        }

        let ladder_start = anchor - Window::OneHour.duration();
        let mut declined: Vec<&TransactionRecord> = card_history
            .iter()
            .filter(|t| {
                t.decision == TransactionDecision::Declined
                    && t.timestamp > ladder_start
                    && t.timestamp <= anchor
            })
            .collect();
        declined.sort_by_key(|t| t.timestamp);
        let card_declined_amounts_1h = declined.iter().map(|t| t.amount).collect();

        Self {
            transaction_id: overview.transaction_id.clone(),
            amount: overview.amount,
            currency: overview.currency.clone(),
            decision: overview.decision.to_string(),
            mcc: overview.mcc.clone(),
            timestamp: anchor,
            card_id: overview.card_id.clone(),
            merchant_id: overview.merchant_id.clone(),
            ip_address: overview.ip_address.clone(),
            ip_country_alpha3: overview.ip_country_alpha3.clone(),
            device_id: overview.device_id.clone(),
            device_fingerprint_hash: overview.device_fingerprint_hash.clone(),
            card_windows,
            merchant_windows,
            card_declined_amounts_1h,
            rule_match_count,
            review_count,
            note_count,
            has_open_case,
            sub_query_errors,
        }
    }

    /// Card window stats by label.
    pub fn card_stats(&self, label: &str) -> &WindowStats {
        self.card_windows.get(label).unwrap_or_else(|| empty_stats())
    }

    /// Merchant window stats by label.
    pub fn merchant_stats(&self, label: &str) -> &WindowStats {
        self.merchant_windows.get(label).unwrap_or_else(|| empty_stats())
    }
}

fn empty_stats() -> &'static WindowStats {
    static STATS: std::sync::OnceLock<WindowStats> = std::sync::OnceLock::new();
    STATS.get_or_init(WindowStats::default)
}
