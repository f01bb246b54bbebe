//! # inquest-core
//!
//! An agentic fraud-investigation runtime: given a card-transaction
//! identifier it orchestrates a bounded, dynamic sequence of analysis tools,
//! aggregates their evidence, produces analyst-reviewable insights and
//! recommendations (optionally a draft rule), and persists a complete audit
//! trail. Analysts remain the decision authority; the runtime is strictly
//! advisory.
//!
//! ## Core components
//!
//! - **Planner / Executor / Completion**: the three roles of the
//!   investigation loop. The planner is LLM-primary with a deterministic
//!   fallback sequence; the executor runs one tool under its timeout; the
//!   completion node materializes the insight and finalizes the run.
//! - **Tools**: context assembly, pattern scoring, similarity retrieval,
//!   narrative reasoning, recommendation synthesis, rule-draft assembly.
//! - **Store**: idempotent SQLite persistence with optimistic state
//!   versioning and active-run uniqueness.
//!
//! ## Example
//!
//! ```rust,ignore
//! use inquest_core::{InvestigationMode, Runtime, RuntimeConfig, SqliteStore};
//!
//! let runtime = Runtime::new(
//!     RuntimeConfig::from_env(),
//!     store,
//!     transaction_source,
//!     planner_llm,
//!     reasoning_llm,
//!     embedding,
//! )?;
//!
//! let summary = runtime
//!     .run_investigation("txn-123", InvestigationMode::Full, None)
//!     .await?;
//! println!("severity: {:?}", summary.severity);
//! ```

pub mod completion;
pub mod config;
pub mod error;
pub mod events;
pub mod evidence;
pub mod executor;
pub mod features;
pub mod investigation;
pub mod llm;
pub mod orchestrator;
pub mod planner;
pub mod redact;
pub mod source;
pub mod store;
pub mod tools;

// Re-exports for convenience
pub use completion::Completion;
pub use config::{Environment, FeatureFlags, RuntimeConfig, Safeguards};
pub use error::{Error, Result};
pub use events::{InvestigationEvent, InvestigationEventType};
pub use evidence::{freshness_weight, sort_evidence, EvidenceItem, EvidenceKind};
pub use executor::Executor;
pub use features::{TransactionFeatures, Window, WindowStats};
pub use investigation::{
    AuditEvent, Hypothesis, Insight, Investigation, InvestigationMode, InvestigationState,
    InvestigationStatus, InvestigationSummary, LlmStatus, ModelMode, PlannerDecision,
    ReasoningOutcome, Recommendation, RecommendationCandidate, RecommendationStatus,
    RecommendationType, RuleCondition, RuleDraft, RuleDraftStatus, Severity, ToolExecution,
    ToolOutcome, ToolStatus,
};
pub use llm::{
    CircuitBreaker, CompletionClient, CompletionRequest, CompletionResponse, EmbeddingClient,
    HttpCompletionClient, HttpEmbeddingClient, LlmClientConfig, OutputSchema,
};
pub use orchestrator::{InvestigationDetail, RuleExport, Runtime, RuntimeHealth};
pub use planner::{Planner, PlannerAction, DETERMINISTIC_SEQUENCE};
pub use source::{
    FixtureSource, HttpTransactionSource, SourceClientConfig, TransactionDecision,
    TransactionQuery, TransactionRecord, TransactionSource,
};
pub use store::{SqliteStore, StartOutcome, WorklistFilter, WorklistPage};
pub use tools::{
    AnalysisTool, ContextTool, PatternTool, ReasoningTool, RecommendationTool, RuleDraftTool,
    SimilarityTool, ToolRegistry,
};
