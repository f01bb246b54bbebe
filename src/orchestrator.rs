//! Run lifecycle: idempotent start, the planner/executor loop, resume,
//! failure handling, and the operations exposed to the API layer.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::completion::Completion;
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::events::{InvestigationEvent, InvestigationEventType};
use crate::evidence::EvidenceItem;
use crate::executor::Executor;
use crate::features::TransactionFeatures;
use crate::investigation::{
    AuditEvent, Investigation, InvestigationMode, InvestigationState, InvestigationStatus,
    InvestigationSummary, ModelMode, PlannerDecision, ReasoningOutcome, Recommendation,
    RecommendationStatus, RecommendationType, RuleDraft, ToolExecution,
};
use crate::llm::{CircuitBreaker, CompletionClient, EmbeddingClient};
use crate::planner::{Planner, PlannerAction};
use crate::source::TransactionSource;
use crate::store::{SqliteStore, StartOutcome, WorklistFilter, WorklistPage};
use crate::tools::{
    ContextTool, PatternTool, ReasoningTool, RecommendationTool, RuleDraftTool, SimilarityTool,
    ToolRegistry,
};

/// Downstream rule-management export client. Used only on explicit analyst
/// action.
#[async_trait]
pub trait RuleExport: Send + Sync {
    /// Export a draft; returns the downstream reference.
    async fn export(&self, draft: &RuleDraft) -> Result<String>;
}

/// Full read model for one investigation.
#[derive(Debug, Clone)]
pub struct InvestigationDetail {
    pub investigation: Investigation,
    pub features: Option<TransactionFeatures>,
    pub evidence: Vec<EvidenceItem>,
    pub reasoning: Option<ReasoningOutcome>,
    pub recommendations: Vec<Recommendation>,
    pub rule_draft: Option<RuleDraft>,
    pub planner_decisions: Vec<PlannerDecision>,
    pub tool_executions: Vec<ToolExecution>,
}

/// Aggregated health report.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeHealth {
    pub source_healthy: bool,
    pub store_healthy: bool,
    pub planner_breaker_open: bool,
    pub reasoning_breaker_open: bool,
}

impl RuntimeHealth {
    pub fn healthy(&self) -> bool {
        self.source_healthy && self.store_healthy
    }
}

/// The investigation runtime: owns the tool registry, the loop, and the
/// persistence discipline around it.
pub struct Runtime {
    config: RuntimeConfig,
    store: Arc<SqliteStore>,
    source: Arc<dyn TransactionSource>,
    planner_llm: Arc<dyn CompletionClient>,
    planner_breaker: Arc<CircuitBreaker>,
    reasoning_breaker: Arc<CircuitBreaker>,
    executor: Executor,
    completion: Completion,
    events: broadcast::Sender<InvestigationEvent>,
    export: Option<Arc<dyn RuleExport>>,
}

impl Runtime {
    /// Build a runtime over its external collaborators. Validates the
    /// configuration's safety envelope.
    pub fn new(
        config: RuntimeConfig,
        store: Arc<SqliteStore>,
        source: Arc<dyn TransactionSource>,
        planner_llm: Arc<dyn CompletionClient>,
        reasoning_llm: Arc<dyn CompletionClient>,
        embedding: Arc<dyn EmbeddingClient>,
    ) -> Result<Self> {
        config.validate()?;

        let planner_breaker = Arc::new(CircuitBreaker::new(
            config.safeguards.breaker_failure_threshold,
            Duration::from_millis(config.safeguards.breaker_cooldown_ms),
        ));
        let reasoning_breaker = Arc::new(CircuitBreaker::new(
            config.safeguards.breaker_failure_threshold,
            Duration::from_millis(config.safeguards.breaker_cooldown_ms),
        ));

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ContextTool::new(source.clone())));
        registry.register(Arc::new(PatternTool::new()));
        registry.register(Arc::new(SimilarityTool::new(
            embedding,
            store.clone(),
            source.clone(),
            config.safeguards.clone(),
        )));
        registry.register(Arc::new(ReasoningTool::new(
            reasoning_llm,
            reasoning_breaker.clone(),
            config.reasoning_model.clone(),
            config.safeguards.llm_retries,
        )));
        registry.register(Arc::new(RecommendationTool::new()));
        registry.register(Arc::new(RuleDraftTool::new()));

        let executor = Executor::new(Arc::new(registry), config.safeguards.clone());
        let completion = Completion::new(store.clone());
        let (events, _) = broadcast::channel(256);

        Ok(Self {
            config,
            store,
            source,
            planner_llm,
            planner_breaker,
            reasoning_breaker,
            executor,
            completion,
            events,
            export: None,
        })
    }

    /// Attach the rule-export client.
    pub fn with_rule_export(mut self, export: Arc<dyn RuleExport>) -> Self {
        self.export = Some(export);
        self
    }

    /// Subscribe to the semantic event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<InvestigationEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: InvestigationEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    // ==================== Exposed operations ====================

    /// Start (or join) an investigation for a transaction. Idempotent on
    /// active-run uniqueness: a concurrent second caller receives the same
    /// investigation id with its current status.
    pub async fn run_investigation(
        &self,
        transaction_id: &str,
        mode: InvestigationMode,
        trigger_ref: Option<String>,
    ) -> Result<InvestigationSummary> {
        if transaction_id.trim().is_empty() || transaction_id.len() > 128 {
            return Err(Error::Validation("malformed transaction id".into()));
        }

        let flags = self.config.flags.clone();
        let investigation = Investigation {
            id: Uuid::new_v4(),
            transaction_id: transaction_id.to_string(),
            mode,
            status: InvestigationStatus::Pending,
            priority: 3,
            severity: None,
            confidence: None,
            step_count: 0,
            max_steps: self.config.safeguards.max_steps,
            planner_model: self.config.planner_model.clone(),
            model_mode: if flags.reasoning_llm_enabled {
                ModelMode::Agentic
            } else {
                ModelMode::Deterministic
            },
            llm_status: None,
            llm_error: None,
            llm_model: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error_summary: None,
            runtime_feature_flags: flags.clone(),
            runtime_safeguards: self.config.safeguards.clone(),
            stage_durations_ms: Default::default(),
            partial: false,
            trigger_ref,
        };

        match self.store.create_investigation(&investigation)? {
            StartOutcome::Existing(existing_id) => {
                let existing = self.store.get_investigation(existing_id)?;
                Ok(summary_of(&existing))
            }
            StartOutcome::Created => {
                let state = InvestigationState::new(
                    investigation.id,
                    transaction_id,
                    mode,
                    flags,
                );
                self.store.init_state(investigation.id, &state.to_json()?)?;
                self.store.append_audit(
                    &AuditEvent::new(
                        "investigation",
                        investigation.id.to_string(),
                        "created",
                        "system",
                    )
                    .with_new(json!({"transaction_id": transaction_id, "mode": mode.as_str()})),
                )?;
                self.emit(InvestigationEvent::run_started(
                    investigation.id.to_string(),
                    transaction_id,
                ));

                self.drive_loop(investigation, state, 1).await
            }
        }
    }

    /// Resume an interrupted investigation from its persisted state.
    pub async fn resume(&self, investigation_id: Uuid) -> Result<InvestigationSummary> {
        let investigation = self.store.get_investigation(investigation_id)?;
        if investigation.status.is_terminal() {
            return Ok(summary_of(&investigation));
        }

        let (blob, version) = self.store.load_state(investigation_id)?;
        let state = InvestigationState::from_json(&blob)?;
        self.emit(InvestigationEvent::run_started(
            investigation.id.to_string(),
            &investigation.transaction_id,
        ));
        self.drive_loop(investigation, state, version).await
    }

    /// Mark an investigation failed with an error summary.
    pub fn fail(&self, investigation_id: Uuid, error: &str) -> Result<()> {
        let mut investigation = self.store.get_investigation(investigation_id)?;
        self.mark_failed(&mut investigation, error)
    }

    /// Full read model for one investigation.
    pub fn get_investigation(&self, investigation_id: Uuid) -> Result<InvestigationDetail> {
        let investigation = self.store.get_investigation(investigation_id)?;

        let state = self
            .store
            .load_state(investigation_id)
            .ok()
            .and_then(|(blob, _)| InvestigationState::from_json(&blob).ok());

        let insight = self.store.get_insight_for_investigation(investigation_id)?;
        let (evidence, recommendations) = match &insight {
            Some(insight) => (
                self.store.list_evidence(insight.id)?,
                self.store.list_recommendations_for_insight(insight.id)?,
            ),
            None => (
                state.as_ref().map(|s| s.evidence.clone()).unwrap_or_default(),
                Vec::new(),
            ),
        };

        let rule_draft = recommendations
            .iter()
            .find(|r| r.rec_type == RecommendationType::RuleCandidate)
            .and_then(|r| self.store.get_rule_draft(r.id).ok().flatten())
            .map(|(_, draft, _, _)| draft);

        let tool_executions = self.store.list_tool_executions(investigation_id)?;

        Ok(InvestigationDetail {
            investigation,
            features: state.as_ref().and_then(|s| s.features.clone()),
            evidence,
            reasoning: state.as_ref().and_then(|s| s.reasoning.clone()),
            recommendations,
            rule_draft,
            planner_decisions: state.map(|s| s.planner_decisions).unwrap_or_default(),
            tool_executions,
        })
    }

    /// Keyset-paginated analyst worklist.
    pub fn list_worklist(
        &self,
        cursor: Option<&str>,
        filter: &WorklistFilter,
        limit: usize,
    ) -> Result<WorklistPage> {
        self.store.list_worklist(cursor, filter, limit)
    }

    /// Acknowledge an open recommendation.
    pub fn acknowledge_recommendation(&self, id: Uuid, actor: &str) -> Result<Recommendation> {
        self.transition(id, RecommendationStatus::Acknowledged, actor)
    }

    /// Reject an open recommendation.
    pub fn reject_recommendation(&self, id: Uuid, actor: &str) -> Result<Recommendation> {
        self.transition(id, RecommendationStatus::Rejected, actor)
    }

    fn transition(
        &self,
        id: Uuid,
        to: RecommendationStatus,
        actor: &str,
    ) -> Result<Recommendation> {
        let before = self.store.get_recommendation(id)?;
        let after = self.store.transition_recommendation(id, to, actor)?;
        self.store.append_audit(
            &AuditEvent::new("recommendation", id.to_string(), to.as_str(), actor)
                .with_old(json!({"status": before.status.as_str()}))
                .with_new(json!({"status": after.status.as_str()})),
        )?;
        Ok(after)
    }

    /// Export the rule draft behind an acknowledged rule-candidate
    /// recommendation. Explicit analyst action only; there is no automatic
    /// export path.
    pub async fn export_rule_draft(
        &self,
        recommendation_id: Uuid,
        actor: &str,
    ) -> Result<String> {
        let export = self
            .export
            .as_ref()
            .ok_or_else(|| Error::dependency("rule-export", "no export client configured"))?;

        let recommendation = self.store.get_recommendation(recommendation_id)?;
        if recommendation.rec_type != RecommendationType::RuleCandidate {
            return Err(Error::Validation(format!(
                "recommendation {} is not a rule candidate",
                recommendation_id
            )));
        }
        if recommendation.status != RecommendationStatus::Acknowledged {
            return Err(Error::Conflict(format!(
                "recommendation {} must be acknowledged before export",
                recommendation_id
            )));
        }

        let (draft_id, draft, _, _) = self
            .store
            .get_rule_draft(recommendation_id)?
            .ok_or_else(|| {
                Error::NotFound(format!("rule draft for recommendation {}", recommendation_id))
            })?;

        let export_ref = export.export(&draft).await?;
        self.store.mark_rule_draft_exported(draft_id, &export_ref)?;
        self.store
            .transition_recommendation(recommendation_id, RecommendationStatus::Exported, actor)?;
        self.store.append_audit(
            &AuditEvent::new("rule_draft", draft_id.to_string(), "exported", actor)
                .with_new(json!({"export_ref": export_ref})),
        )?;
        Ok(export_ref)
    }

    /// Aggregate health probe.
    pub async fn health(&self) -> RuntimeHealth {
        let source_healthy = self
            .source
            .get_health()
            .await
            .map(|h| h.healthy)
            .unwrap_or(false);
        let store_healthy = self.store.embedding_count().is_ok();
        RuntimeHealth {
            source_healthy,
            store_healthy,
            planner_breaker_open: self.planner_breaker.is_open(),
            reasoning_breaker_open: self.reasoning_breaker.is_open(),
        }
    }

    // ==================== The loop ====================

    async fn drive_loop(
        &self,
        mut investigation: Investigation,
        mut state: InvestigationState,
        mut version: i64,
    ) -> Result<InvestigationSummary> {
        investigation.status = InvestigationStatus::InProgress;
        self.store.update_investigation(&investigation)?;

        let mut planner = Planner::new(
            self.planner_llm.clone(),
            self.planner_breaker.clone(),
            self.config.planner_model.clone(),
            investigation.max_steps,
        );

        let deadline =
            Instant::now() + Duration::from_millis(self.config.safeguards.run_deadline_ms());
        let mut partial = false;

        loop {
            if Instant::now() >= deadline {
                warn!(investigation_id = %investigation.id, "run deadline exceeded; forcing completion");
                partial = true;
                break;
            }

            let action = planner.next_action(self.executor.registry(), &state).await;
            let (selected, rationale, fallback, complete) = match &action {
                PlannerAction::Run {
                    tool,
                    rationale,
                    fallback,
                } => (tool.clone(), rationale.clone(), *fallback, false),
                PlannerAction::Complete { rationale } => {
                    ("COMPLETE".to_string(), rationale.clone(), false, true)
                }
            };

            state.record_decision(PlannerDecision {
                step_number: state.next_step_number(),
                selected_tool: selected.clone(),
                rationale,
                fallback,
                ts: Utc::now(),
            });
            self.emit(InvestigationEvent::planner_decision(
                investigation.id.to_string(),
                &selected,
                fallback,
            ));
            if fallback {
                self.emit(InvestigationEvent::fallback_engaged(
                    investigation.id.to_string(),
                    "planner",
                    "deterministic sequence",
                ));
            }

            // Durable checkpoint before the tool's external calls.
            version = self.save_state(&investigation, &state, version)?;

            if complete {
                break;
            }

            self.emit(
                InvestigationEvent::new(
                    InvestigationEventType::ToolStarted,
                    investigation.id.to_string(),
                    format!("running {}", selected),
                )
                .with_metadata("tool_name", selected.as_str()),
            );

            let entry = self.executor.run(&selected, &mut state).await;

            self.store.record_tool_execution(investigation.id, &entry)?;
            self.store.append_audit(
                &AuditEvent::new("tool_execution", investigation.id.to_string(), "executed", "system")
                    .with_new(json!({
                        "tool_name": entry.tool_name,
                        "status": entry.status.as_str(),
                        "step_number": entry.step_number,
                    })),
            )?;
            self.emit(InvestigationEvent::tool_completed(
                investigation.id.to_string(),
                &entry.tool_name,
                entry.status.as_str(),
                entry.execution_time_ms,
            ));

            // Persist the merged state after the step.
            version = self.save_state(&investigation, &state, version)?;
            investigation.step_count = state.step_count;
            self.store.update_investigation(&investigation)?;
        }

        match self
            .completion
            .finalize(investigation.clone(), &state, partial)
        {
            Ok(summary) => {
                self.emit(
                    InvestigationEvent::new(
                        InvestigationEventType::RunCompleted,
                        investigation.id.to_string(),
                        format!(
                            "completed with severity {}",
                            summary
                                .severity
                                .map(|s| s.as_str())
                                .unwrap_or("unknown")
                        ),
                    )
                    .with_metadata("partial", summary.partial),
                );
                Ok(summary)
            }
            Err(e) => {
                self.mark_failed(&mut investigation, &e.to_string())?;
                // Commit the final state snapshot alongside the failure.
                let _ = self.save_state(&investigation, &state, version);
                Err(e)
            }
        }
    }

    fn save_state(
        &self,
        investigation: &Investigation,
        state: &InvestigationState,
        version: i64,
    ) -> Result<i64> {
        self.store
            .save_state(investigation.id, &state.to_json()?, version)
    }

    fn mark_failed(&self, investigation: &mut Investigation, error: &str) -> Result<()> {
        investigation.status = InvestigationStatus::Failed;
        investigation.error_summary = Some(error.to_string());
        investigation.completed_at = Some(Utc::now());
        investigation.duration_ms = investigation
            .completed_at
            .map(|end| (end - investigation.started_at).num_milliseconds().max(0) as u64);
        self.store.update_investigation(investigation)?;
        self.store.append_audit(
            &AuditEvent::new(
                "investigation",
                investigation.id.to_string(),
                "failed",
                "system",
            )
            .with_new(json!({"error": error})),
        )?;
        self.emit(InvestigationEvent::new(
            InvestigationEventType::RunFailed,
            investigation.id.to_string(),
            format!("failed: {}", error),
        ));
        info!(investigation_id = %investigation.id, error = %error, "investigation failed");
        Ok(())
    }
}

fn summary_of(investigation: &Investigation) -> InvestigationSummary {
    InvestigationSummary {
        investigation_id: investigation.id,
        transaction_id: investigation.transaction_id.clone(),
        status: investigation.status,
        severity: investigation.severity,
        confidence: investigation.confidence,
        step_count: investigation.step_count,
        duration_ms: investigation.duration_ms,
        model_mode: investigation.model_mode,
        llm_status: investigation.llm_status,
        partial: investigation.partial,
    }
}
