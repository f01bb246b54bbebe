//! Runtime configuration and per-run snapshots.
//!
//! A single immutable [`RuntimeConfig`] is built at process init. Each
//! investigation captures a [`FeatureFlags`] and [`Safeguards`] snapshot at
//! start and never re-reads live configuration mid-run.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Deployment environment. Human approval enforcement is mandatory outside
/// of `Local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Local,
    Staging,
    Production,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Local
    }
}

/// Feature flags recognized by the core, captured per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// If false, the reasoning tool skips its LLM call and uses the
    /// deterministic evidence fallback.
    pub reasoning_llm_enabled: bool,
    /// If false, similarity uses the heuristic SQL path only.
    pub vector_enabled: bool,
    /// Blocks any auto-export attempt; must be true outside Local.
    pub enforce_human_approval: bool,
    /// Selects the reasoning prompt template variant.
    pub narrative_version: String,
    /// Enables cross-evidence conflict scoring in the reasoning input.
    pub conflict_matrix_enabled: bool,
    /// Applies exponential freshness decay to evidence strengths.
    pub freshness_enabled: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            reasoning_llm_enabled: true,
            vector_enabled: true,
            enforce_human_approval: true,
            narrative_version: "v2".to_string(),
            conflict_matrix_enabled: false,
            freshness_enabled: true,
        }
    }
}

/// Safety envelope for a run: timeouts, caps, and retry budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Safeguards {
    /// Default per-tool timeout in milliseconds.
    pub tool_timeout_ms: u64,
    /// Per-tool timeout overrides keyed by tool name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tool_timeout_overrides_ms: HashMap<String, u64>,
    /// Maximum planner/executor steps per investigation.
    pub max_steps: u32,
    /// Retries per LLM call (planner and reasoning).
    pub llm_retries: u32,
    /// LLM call timeout in milliseconds.
    pub llm_timeout_ms: u64,
    /// Embedding call timeout in milliseconds. Embedding failures do not
    /// retry beyond the single built-in retry; the fallback path is
    /// authoritative.
    pub embedding_timeout_ms: u64,
    /// Max upstream HTTP fetch attempts (exponential backoff between).
    pub upstream_max_attempts: u32,
    /// Similarity search result bound.
    pub search_limit: usize,
    /// Minimum cosine similarity for a vector match.
    pub min_similarity: f64,
    /// Consecutive failures before an LLM circuit breaker opens.
    pub breaker_failure_threshold: u32,
    /// How long an open breaker stays open, in milliseconds.
    pub breaker_cooldown_ms: u64,
}

impl Default for Safeguards {
    fn default() -> Self {
        Self {
            tool_timeout_ms: 20_000,
            tool_timeout_overrides_ms: HashMap::new(),
            max_steps: 20,
            llm_retries: 1,
            llm_timeout_ms: 30_000,
            embedding_timeout_ms: 10_000,
            upstream_max_attempts: 3,
            search_limit: 20,
            min_similarity: 0.7,
            breaker_failure_threshold: 3,
            breaker_cooldown_ms: 60_000,
        }
    }
}

impl Safeguards {
    /// Effective timeout for a tool, honoring per-tool overrides.
    pub fn timeout_for(&self, tool_name: &str) -> u64 {
        self.tool_timeout_overrides_ms
            .get(tool_name)
            .copied()
            .unwrap_or(self.tool_timeout_ms)
    }

    /// Upper bound on a whole run, derived from the step cap and the widest
    /// tool timeout.
    pub fn run_deadline_ms(&self) -> u64 {
        let max_tool = self
            .tool_timeout_overrides_ms
            .values()
            .copied()
            .chain(std::iter::once(self.tool_timeout_ms))
            .max()
            .unwrap_or(self.tool_timeout_ms);
        u64::from(self.max_steps) * max_tool
    }
}

/// Immutable runtime configuration, built once at process init.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub environment: Environment,
    pub flags: FeatureFlags,
    pub safeguards: Safeguards,
    /// Model used for planner tool selection.
    pub planner_model: String,
    /// Model used for narrative reasoning.
    pub reasoning_model: String,
    /// Model used for transaction embeddings.
    pub embedding_model: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Local,
            flags: FeatureFlags::default(),
            safeguards: Safeguards::default(),
            planner_model: "claude-3-5-haiku-20241022".to_string(),
            reasoning_model: "claude-3-5-sonnet-20241022".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let environment = match std::env::var("INQUEST_ENV").ok().as_deref() {
            Some("production") => Environment::Production,
            Some("staging") => Environment::Staging,
            _ => Environment::Local,
        };

        let mut flags = defaults.flags;
        if let Some(v) = env_bool("INQUEST_REASONING_LLM_ENABLED") {
            flags.reasoning_llm_enabled = v;
        }
        if let Some(v) = env_bool("INQUEST_VECTOR_ENABLED") {
            flags.vector_enabled = v;
        }
        if let Some(v) = env_bool("INQUEST_ENFORCE_HUMAN_APPROVAL") {
            flags.enforce_human_approval = v;
        }
        if let Ok(v) = std::env::var("INQUEST_NARRATIVE_VERSION") {
            flags.narrative_version = v;
        }
        if let Some(v) = env_bool("INQUEST_CONFLICT_MATRIX_ENABLED") {
            flags.conflict_matrix_enabled = v;
        }
        if let Some(v) = env_bool("INQUEST_FRESHNESS_ENABLED") {
            flags.freshness_enabled = v;
        }

        let mut safeguards = defaults.safeguards;
        if let Some(v) = env_u64("INQUEST_TOOL_TIMEOUT_MS") {
            safeguards.tool_timeout_ms = v;
        }
        if let Some(v) = env_u64("INQUEST_MAX_STEPS") {
            safeguards.max_steps = v as u32;
        }

        Self {
            environment,
            flags,
            safeguards,
            planner_model: std::env::var("INQUEST_PLANNER_MODEL")
                .unwrap_or(defaults.planner_model),
            reasoning_model: std::env::var("INQUEST_REASONING_MODEL")
                .unwrap_or(defaults.reasoning_model),
            embedding_model: std::env::var("INQUEST_EMBEDDING_MODEL")
                .unwrap_or(defaults.embedding_model),
        }
    }

    /// Reject configurations that violate the safety envelope.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.environment != Environment::Local && !self.flags.enforce_human_approval {
            return Err(crate::error::Error::Validation(
                "enforce_human_approval must be true outside local environments".into(),
            ));
        }
        if self.safeguards.max_steps == 0 {
            return Err(crate::error::Error::Validation(
                "max_steps must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.safeguards.min_similarity) {
            return Err(crate::error::Error::Validation(
                "min_similarity must be within [0,1]".into(),
            ));
        }
        Ok(())
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|s| s != "0" && s.to_lowercase() != "false")
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_safety_envelope() {
        let config = RuntimeConfig::default();
        assert_eq!(config.safeguards.tool_timeout_ms, 20_000);
        assert_eq!(config.safeguards.max_steps, 20);
        assert_eq!(config.safeguards.llm_retries, 1);
        assert_eq!(config.safeguards.search_limit, 20);
        assert!((config.safeguards.min_similarity - 0.7).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_human_approval_required_outside_local() {
        let mut config = RuntimeConfig::default();
        config.environment = Environment::Production;
        config.flags.enforce_human_approval = false;
        assert!(config.validate().is_err());

        config.flags.enforce_human_approval = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_override() {
        let mut safeguards = Safeguards::default();
        safeguards
            .tool_timeout_overrides_ms
            .insert("reasoning".to_string(), 45_000);

        assert_eq!(safeguards.timeout_for("reasoning"), 45_000);
        assert_eq!(safeguards.timeout_for("pattern"), 20_000);
        assert_eq!(safeguards.run_deadline_ms(), 20 * 45_000);
    }

    #[test]
    fn test_flags_snapshot_round_trip() {
        let flags = FeatureFlags::default();
        let json = serde_json::to_string(&flags).unwrap();
        let back: FeatureFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(flags, back);
    }
}
