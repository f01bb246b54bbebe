//! SQLite-backed investigation store.
//!
//! All mutable writes are upsert-on-idempotency-key with explicit updates of
//! the mutable analysis fields. State writes use optimistic concurrency on a
//! monotonic version; investigation creation relies on a partial unique
//! index for active-run uniqueness.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::{FeatureFlags, Safeguards};
use crate::error::{Error, Result};
use crate::evidence::{EvidenceItem, EvidenceKind};
use crate::investigation::{
    AuditEvent, Insight, Investigation, InvestigationMode, InvestigationStatus, LlmStatus,
    ModelMode, Recommendation, RecommendationStatus, RecommendationType, RuleDraft,
    RuleDraftStatus, Severity, ToolExecution, ToolStatus,
};

use super::schema::{initialize_schema, is_initialized};

/// Result of an idempotent investigation create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new row was inserted.
    Created,
    /// An active investigation already exists for the transaction.
    Existing(Uuid),
}

/// A nearest-neighbor match from the embedding table.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub transaction_id: String,
    pub similarity: f64,
    pub model_name: String,
}

/// Worklist filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorklistFilter {
    pub status: Option<RecommendationStatus>,
    /// Keep only recommendations at least this urgent (priority <= value).
    pub max_priority: Option<u8>,
}

/// One keyset-paginated page of recommendations.
#[derive(Debug, Clone, PartialEq)]
pub struct WorklistPage {
    pub items: Vec<Recommendation>,
    pub next_cursor: Option<String>,
}

/// Everything the completion node persists in one short transaction.
#[derive(Debug, Clone)]
pub struct CompletionArtifacts {
    pub investigation: Investigation,
    pub insight: Insight,
    pub evidence: Vec<EvidenceItem>,
    pub recommendations: Vec<Recommendation>,
    /// Rule draft paired with the signature hash of its parent
    /// rule-candidate recommendation.
    pub rule_draft: Option<(String, RuleDraft)>,
}

/// SQLite-backed store shared by the whole runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(storage_err)?;
        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(storage_err)?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        initialize_schema(&conn).map_err(storage_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {}", e)))?;
        f(&conn).map_err(storage_err)
    }

    fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {}", e)))?;
        f(&mut conn).map_err(storage_err)
    }

    // ==================== Investigations ====================

    /// Insert a new investigation unless one is already active for the
    /// transaction. The partial unique index arbitrates races.
    pub fn create_investigation(&self, investigation: &Investigation) -> Result<StartOutcome> {
        if let Some(existing) = self.find_active_investigation(&investigation.transaction_id)? {
            return Ok(StartOutcome::Existing(existing));
        }

        let inserted = self.with_conn(|conn| {
            match conn.execute(
                "INSERT INTO investigations (
                    id, transaction_id, mode, status, priority, severity, confidence,
                    step_count, max_steps, planner_model, model_mode, llm_status, llm_error,
                    llm_model, started_at, completed_at, duration_ms, error_summary,
                    runtime_feature_flags, runtime_safeguards, stage_durations, partial,
                    trigger_ref, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                          ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?24)",
                params![
                    investigation.id.to_string(),
                    investigation.transaction_id,
                    investigation.mode.as_str(),
                    investigation.status.as_str(),
                    investigation.priority,
                    investigation.severity.map(|s| s.as_str()),
                    investigation.confidence,
                    investigation.step_count,
                    investigation.max_steps,
                    investigation.planner_model,
                    investigation.model_mode.as_str(),
                    investigation.llm_status.map(|s| s.as_str()),
                    investigation.llm_error,
                    investigation.llm_model,
                    investigation.started_at.to_rfc3339(),
                    investigation.completed_at.map(|t| t.to_rfc3339()),
                    investigation.duration_ms.map(|d| d as i64),
                    investigation.error_summary,
                    serde_json::to_string(&investigation.runtime_feature_flags)
                        .unwrap_or_default(),
                    serde_json::to_string(&investigation.runtime_safeguards).unwrap_or_default(),
                    serde_json::to_string(&investigation.stage_durations_ms).ok(),
                    investigation.partial,
                    investigation.trigger_ref,
                    investigation.started_at.to_rfc3339(),
                ],
            ) {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        })?;

        if inserted {
            return Ok(StartOutcome::Created);
        }

        // Lost the race; the winner's row must exist.
        self.find_active_investigation(&investigation.transaction_id)?
            .map(StartOutcome::Existing)
            .ok_or_else(|| {
                Error::Conflict(format!(
                    "active investigation for {} vanished during create",
                    investigation.transaction_id
                ))
            })
    }

    /// Id of the active (pending or in-progress) investigation for a
    /// transaction, if any.
    pub fn find_active_investigation(&self, transaction_id: &str) -> Result<Option<Uuid>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id FROM investigations
                 WHERE transaction_id = ?1 AND status IN ('pending', 'in_progress')",
                params![transaction_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .map(|id| id.map(|s| parse_uuid(&s)))
    }

    pub fn get_investigation(&self, id: Uuid) -> Result<Investigation> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM investigations WHERE id = ?1", INVESTIGATION_COLUMNS),
                params![id.to_string()],
                row_to_investigation,
            )
            .optional()
        })?
        .ok_or_else(|| Error::NotFound(format!("investigation {}", id)))
    }

    /// Update the mutable fields of an investigation row.
    pub fn update_investigation(&self, investigation: &Investigation) -> Result<()> {
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE investigations SET
                    status = ?2, priority = ?3, severity = ?4, confidence = ?5,
                    step_count = ?6, model_mode = ?7, llm_status = ?8, llm_error = ?9,
                    llm_model = ?10, completed_at = ?11, duration_ms = ?12,
                    error_summary = ?13, stage_durations = ?14, partial = ?15,
                    updated_at = ?16
                 WHERE id = ?1",
                params![
                    investigation.id.to_string(),
                    investigation.status.as_str(),
                    investigation.priority,
                    investigation.severity.map(|s| s.as_str()),
                    investigation.confidence,
                    investigation.step_count,
                    investigation.model_mode.as_str(),
                    investigation.llm_status.map(|s| s.as_str()),
                    investigation.llm_error,
                    investigation.llm_model,
                    investigation.completed_at.map(|t| t.to_rfc3339()),
                    investigation.duration_ms.map(|d| d as i64),
                    investigation.error_summary,
                    serde_json::to_string(&investigation.stage_durations_ms).ok(),
                    investigation.partial,
                    Utc::now().to_rfc3339(),
                ],
            )
        })?;
        if updated == 0 {
            return Err(Error::NotFound(format!("investigation {}", investigation.id)));
        }
        Ok(())
    }

    // ==================== Investigation state ====================

    /// Write the initial state blob at version 1.
    pub fn init_state(&self, investigation_id: Uuid, blob: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO investigation_state
                 (investigation_id, state, version, updated_at)
                 VALUES (?1, ?2, 1, ?3)",
                params![investigation_id.to_string(), blob, Utc::now().to_rfc3339()],
            )
        })?;
        Ok(())
    }

    /// Persist a new state snapshot. `expected_version` must match the
    /// stored version; a mismatch means a concurrent writer advanced the
    /// state and this writer must abort.
    pub fn save_state(
        &self,
        investigation_id: Uuid,
        blob: &str,
        expected_version: i64,
    ) -> Result<i64> {
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE investigation_state
                 SET state = ?2, version = ?3, updated_at = ?4
                 WHERE investigation_id = ?1 AND version = ?5",
                params![
                    investigation_id.to_string(),
                    blob,
                    expected_version + 1,
                    Utc::now().to_rfc3339(),
                    expected_version,
                ],
            )
        })?;
        if updated == 0 {
            return Err(Error::stale_version(investigation_id, expected_version));
        }
        Ok(expected_version + 1)
    }

    /// Load the state blob and its current version.
    pub fn load_state(&self, investigation_id: Uuid) -> Result<(String, i64)> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT state, version FROM investigation_state WHERE investigation_id = ?1",
                params![investigation_id.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
        })?
        .ok_or_else(|| Error::NotFound(format!("state for investigation {}", investigation_id)))
    }

    // ==================== Tool execution log ====================

    /// Append a tool execution log entry, idempotent by step number.
    pub fn record_tool_execution(
        &self,
        investigation_id: Uuid,
        execution: &ToolExecution,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tool_executions (
                    investigation_id, step_number, tool_name, status, input_summary,
                    output_summary, execution_time_ms, error_message
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT (investigation_id, step_number) DO UPDATE SET
                    tool_name = excluded.tool_name,
                    status = excluded.status,
                    input_summary = excluded.input_summary,
                    output_summary = excluded.output_summary,
                    execution_time_ms = excluded.execution_time_ms,
                    error_message = excluded.error_message",
                params![
                    investigation_id.to_string(),
                    execution.step_number,
                    execution.tool_name,
                    execution.status.as_str(),
                    execution.input_summary,
                    execution.output_summary,
                    execution.execution_time_ms as i64,
                    execution.error_message,
                ],
            )
        })?;
        Ok(())
    }

    /// Tool executions ordered by step number.
    pub fn list_tool_executions(&self, investigation_id: Uuid) -> Result<Vec<ToolExecution>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT step_number, tool_name, status, input_summary, output_summary,
                        execution_time_ms, error_message
                 FROM tool_executions WHERE investigation_id = ?1
                 ORDER BY step_number",
            )?;
            let executions = stmt
                .query_map(params![investigation_id.to_string()], |row| {
                    Ok(ToolExecution {
                        step_number: row.get(0)?,
                        tool_name: row.get(1)?,
                        status: ToolStatus::parse(&row.get::<_, String>(2)?)
                            .unwrap_or(ToolStatus::Failed),
                        input_summary: row.get(3)?,
                        output_summary: row.get(4)?,
                        execution_time_ms: row.get::<_, i64>(5)? as u64,
                        error_message: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(executions)
        })
    }

    // ==================== Completion artifacts ====================

    /// Persist the completion artifacts in one short transaction.
    ///
    /// Upserts update mutable analysis fields only: replaying a run with
    /// identical upstream data refreshes severity, summary, confidence, and
    /// the evidence set without creating duplicates, and never touches
    /// analyst-owned fields (recommendation status, acknowledgements).
    /// Returns the canonical insight id.
    pub fn persist_completion(&self, artifacts: &CompletionArtifacts) -> Result<Uuid> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            // Insight upsert: always DO UPDATE, never DO NOTHING, so stale
            // analysis cannot survive a replay.
            tx.execute(
                "INSERT INTO insights (
                    id, investigation_id, transaction_id, evaluation_type, insight_type,
                    model_mode, severity, summary, confidence_score, transaction_timestamp,
                    generated_at, idempotency_key
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT (idempotency_key) DO UPDATE SET
                    investigation_id = excluded.investigation_id,
                    severity = excluded.severity,
                    summary = excluded.summary,
                    confidence_score = excluded.confidence_score,
                    generated_at = excluded.generated_at",
                params![
                    artifacts.insight.id.to_string(),
                    artifacts.insight.investigation_id.to_string(),
                    artifacts.insight.transaction_id,
                    artifacts.insight.evaluation_type,
                    artifacts.insight.insight_type,
                    artifacts.insight.model_mode.as_str(),
                    artifacts.insight.severity.as_str(),
                    artifacts.insight.summary,
                    artifacts.insight.confidence_score,
                    artifacts.insight.transaction_timestamp.to_rfc3339(),
                    artifacts.insight.generated_at.to_rfc3339(),
                    artifacts.insight.idempotency_key,
                ],
            )?;
            let insight_id: String = tx.query_row(
                "SELECT id FROM insights WHERE idempotency_key = ?1",
                params![artifacts.insight.idempotency_key],
                |row| row.get(0),
            )?;

            // Refresh the evidence set under the insight.
            tx.execute(
                "DELETE FROM evidence WHERE insight_id = ?1",
                params![insight_id],
            )?;
            for item in &artifacts.evidence {
                tx.execute(
                    "INSERT INTO evidence (
                        insight_id, evidence_id, kind, category, strength, freshness_weight,
                        description, timestamp, related_transaction_ids, payload
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        insight_id,
                        item.id,
                        item.kind.as_str(),
                        item.category,
                        item.strength,
                        item.freshness_weight,
                        item.description,
                        item.timestamp.to_rfc3339(),
                        serde_json::to_string(&item.related_transaction_ids).ok(),
                        serde_json::to_string(&item.supporting_data).ok(),
                    ],
                )?;
            }

            // Recommendations: refresh analysis fields, preserve analyst
            // state. Track canonical ids for the rule draft link.
            let mut canonical_rec_ids: BTreeMap<String, String> = BTreeMap::new();
            for rec in &artifacts.recommendations {
                tx.execute(
                    "INSERT INTO recommendations (
                        id, insight_id, rec_type, priority, title, impact, payload,
                        signature_hash, status, acknowledged_by, acknowledged_at,
                        idempotency_key, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL, ?10, ?11)
                    ON CONFLICT (idempotency_key) DO UPDATE SET
                        priority = excluded.priority,
                        title = excluded.title,
                        impact = excluded.impact,
                        payload = excluded.payload",
                    params![
                        rec.id.to_string(),
                        insight_id,
                        rec.rec_type.as_str(),
                        rec.priority,
                        rec.title,
                        rec.impact,
                        serde_json::to_string(&rec.payload).ok(),
                        rec.signature_hash,
                        rec.status.as_str(),
                        rec.idempotency_key,
                        rec.created_at.to_rfc3339(),
                    ],
                )?;
                let canonical: String = tx.query_row(
                    "SELECT id FROM recommendations WHERE idempotency_key = ?1",
                    params![rec.idempotency_key],
                    |row| row.get(0),
                )?;
                canonical_rec_ids.insert(rec.signature_hash.clone(), canonical);
            }

            if let Some((signature_hash, draft)) = &artifacts.rule_draft {
                if let Some(rec_id) = canonical_rec_ids.get(signature_hash) {
                    tx.execute(
                        "INSERT INTO rule_drafts (
                            id, recommendation_id, rule_name, rule_description, conditions,
                            thresholds, metadata, status, created_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'not_exported', ?8)
                        ON CONFLICT (recommendation_id) DO UPDATE SET
                            rule_name = excluded.rule_name,
                            rule_description = excluded.rule_description,
                            conditions = excluded.conditions,
                            thresholds = excluded.thresholds,
                            metadata = excluded.metadata",
                        params![
                            Uuid::new_v4().to_string(),
                            rec_id,
                            draft.rule_name,
                            draft.rule_description,
                            serde_json::to_string(&draft.conditions).unwrap_or_default(),
                            serde_json::to_string(&draft.thresholds).ok(),
                            serde_json::to_string(&draft.metadata).ok(),
                            Utc::now().to_rfc3339(),
                        ],
                    )?;
                }
            }

            let inv = &artifacts.investigation;
            tx.execute(
                "UPDATE investigations SET
                    status = ?2, severity = ?3, confidence = ?4, step_count = ?5,
                    model_mode = ?6, llm_status = ?7, llm_error = ?8, llm_model = ?9,
                    completed_at = ?10, duration_ms = ?11, error_summary = ?12,
                    stage_durations = ?13, partial = ?14, updated_at = ?15
                 WHERE id = ?1",
                params![
                    inv.id.to_string(),
                    inv.status.as_str(),
                    inv.severity.map(|s| s.as_str()),
                    inv.confidence,
                    inv.step_count,
                    inv.model_mode.as_str(),
                    inv.llm_status.map(|s| s.as_str()),
                    inv.llm_error,
                    inv.llm_model,
                    inv.completed_at.map(|t| t.to_rfc3339()),
                    inv.duration_ms.map(|d| d as i64),
                    inv.error_summary,
                    serde_json::to_string(&inv.stage_durations_ms).ok(),
                    inv.partial,
                    Utc::now().to_rfc3339(),
                ],
            )?;

            tx.commit()?;
            Ok(parse_uuid(&insight_id))
        })
    }

    // ==================== Insights and evidence ====================

    pub fn get_insight_for_investigation(&self, investigation_id: Uuid) -> Result<Option<Insight>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, investigation_id, transaction_id, evaluation_type, insight_type,
                        model_mode, severity, summary, confidence_score, transaction_timestamp,
                        generated_at, idempotency_key
                 FROM insights WHERE investigation_id = ?1",
                params![investigation_id.to_string()],
                row_to_insight,
            )
            .optional()
        })
    }

    pub fn list_evidence(&self, insight_id: Uuid) -> Result<Vec<EvidenceItem>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT evidence_id, kind, category, strength, freshness_weight, description,
                        timestamp, related_transaction_ids, payload
                 FROM evidence WHERE insight_id = ?1
                 ORDER BY strength DESC, category ASC",
            )?;
            let items = stmt
                .query_map(params![insight_id.to_string()], |row| {
                    Ok(EvidenceItem {
                        id: row.get(0)?,
                        kind: EvidenceKind::parse(&row.get::<_, String>(1)?)
                            .unwrap_or(EvidenceKind::Context),
                        category: row.get(2)?,
                        strength: row.get(3)?,
                        freshness_weight: row.get(4)?,
                        description: row.get(5)?,
                        timestamp: parse_ts(&row.get::<_, String>(6)?),
                        related_transaction_ids: row
                            .get::<_, Option<String>>(7)?
                            .and_then(|s| serde_json::from_str(&s).ok())
                            .unwrap_or_default(),
                        supporting_data: row
                            .get::<_, Option<String>>(8)?
                            .and_then(|s| serde_json::from_str(&s).ok())
                            .unwrap_or(Value::Null),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(items)
        })
    }

    // ==================== Recommendations ====================

    pub fn get_recommendation(&self, id: Uuid) -> Result<Recommendation> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM recommendations WHERE id = ?1",
                    RECOMMENDATION_COLUMNS
                ),
                params![id.to_string()],
                row_to_recommendation,
            )
            .optional()
        })?
        .ok_or_else(|| Error::NotFound(format!("recommendation {}", id)))
    }

    pub fn list_recommendations_for_insight(&self, insight_id: Uuid) -> Result<Vec<Recommendation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM recommendations WHERE insight_id = ?1 ORDER BY priority, id",
                RECOMMENDATION_COLUMNS
            ))?;
            let recommendations = stmt
                .query_map(params![insight_id.to_string()], row_to_recommendation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(recommendations)
        })
    }

    /// Transition a recommendation with a row-level status guard. Only legal
    /// transitions pass; a raced or illegal transition returns Conflict.
    pub fn transition_recommendation(
        &self,
        id: Uuid,
        to: RecommendationStatus,
        actor: &str,
    ) -> Result<Recommendation> {
        let current = self.get_recommendation(id)?;
        if !current.status.can_transition_to(to) {
            return Err(Error::Conflict(format!(
                "recommendation {} cannot move from {} to {}",
                id, current.status, to
            )));
        }

        let acknowledged = matches!(
            to,
            RecommendationStatus::Acknowledged | RecommendationStatus::Rejected
        );
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE recommendations SET
                    status = ?2,
                    acknowledged_by = CASE WHEN ?3 THEN ?4 ELSE acknowledged_by END,
                    acknowledged_at = CASE WHEN ?3 THEN ?5 ELSE acknowledged_at END
                 WHERE id = ?1 AND status = ?6",
                params![
                    id.to_string(),
                    to.as_str(),
                    acknowledged,
                    actor,
                    Utc::now().to_rfc3339(),
                    current.status.as_str(),
                ],
            )
        })?;
        if updated == 0 {
            return Err(Error::Conflict(format!(
                "recommendation {} was modified concurrently",
                id
            )));
        }
        self.get_recommendation(id)
    }

    /// Keyset-paginated worklist ordered by (created_at DESC, id).
    pub fn list_worklist(
        &self,
        cursor: Option<&str>,
        filter: &WorklistFilter,
        limit: usize,
    ) -> Result<WorklistPage> {
        let limit = limit.clamp(1, 200);
        let cursor = cursor.map(parse_cursor).transpose()?;

        let items = self.with_conn(|conn| {
            let mut sql = format!(
                "SELECT {} FROM recommendations WHERE 1=1",
                RECOMMENDATION_COLUMNS
            );
            let mut bindings: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some((created_at, id)) = &cursor {
                sql.push_str(
                    " AND (created_at < ? OR (created_at = ? AND id > ?))",
                );
                bindings.push(Box::new(created_at.to_rfc3339()));
                bindings.push(Box::new(created_at.to_rfc3339()));
                bindings.push(Box::new(id.clone()));
            }
            if let Some(status) = filter.status {
                sql.push_str(" AND status = ?");
                bindings.push(Box::new(status.as_str().to_string()));
            }
            if let Some(max_priority) = filter.max_priority {
                sql.push_str(" AND priority <= ?");
                bindings.push(Box::new(i64::from(max_priority)));
            }

            sql.push_str(" ORDER BY created_at DESC, id ASC LIMIT ?");
            bindings.push(Box::new(limit as i64 + 1));

            let binding_refs: Vec<&dyn rusqlite::ToSql> =
                bindings.iter().map(|b| b.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let recommendations = stmt
                .query_map(binding_refs.as_slice(), row_to_recommendation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(recommendations)
        })?;

        let has_more = items.len() > limit;
        let mut items = items;
        items.truncate(limit);
        let next_cursor = if has_more {
            items
                .last()
                .map(|last| format!("{}|{}", last.created_at.to_rfc3339(), last.id))
        } else {
            None
        };

        Ok(WorklistPage { items, next_cursor })
    }

    // ==================== Rule drafts ====================

    /// Load a rule draft by its parent recommendation.
    pub fn get_rule_draft(
        &self,
        recommendation_id: Uuid,
    ) -> Result<Option<(Uuid, RuleDraft, RuleDraftStatus, Option<String>)>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, rule_name, rule_description, conditions, thresholds, metadata,
                        status, export_ref
                 FROM rule_drafts WHERE recommendation_id = ?1",
                params![recommendation_id.to_string()],
                |row| {
                    let draft = RuleDraft {
                        rule_name: row.get(1)?,
                        rule_description: row.get(2)?,
                        conditions: serde_json::from_str(&row.get::<_, String>(3)?)
                            .unwrap_or_default(),
                        thresholds: row
                            .get::<_, Option<String>>(4)?
                            .and_then(|s| serde_json::from_str(&s).ok())
                            .unwrap_or(Value::Null),
                        metadata: row
                            .get::<_, Option<String>>(5)?
                            .and_then(|s| serde_json::from_str(&s).ok())
                            .unwrap_or(Value::Null),
                    };
                    Ok((
                        parse_uuid(&row.get::<_, String>(0)?),
                        draft,
                        RuleDraftStatus::parse(&row.get::<_, String>(6)?)
                            .unwrap_or(RuleDraftStatus::NotExported),
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()
        })
    }

    /// Mark a rule draft exported with the downstream reference.
    pub fn mark_rule_draft_exported(&self, draft_id: Uuid, export_ref: &str) -> Result<()> {
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE rule_drafts SET status = 'exported', export_ref = ?2
                 WHERE id = ?1 AND status = 'not_exported'",
                params![draft_id.to_string(), export_ref],
            )
        })?;
        if updated == 0 {
            return Err(Error::Conflict(format!(
                "rule draft {} already exported or missing",
                draft_id
            )));
        }
        Ok(())
    }

    // ==================== Audit log ====================

    /// Append an audit event.
    pub fn append_audit(&self, event: &AuditEvent) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log
                    (entity_type, entity_id, action, performed_by, old_value, new_value, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.entity_type,
                    event.entity_id,
                    event.action,
                    event.performed_by,
                    event.old_value.as_ref().map(|v| v.to_string()),
                    event.new_value.as_ref().map(|v| v.to_string()),
                    event.ts.to_rfc3339(),
                ],
            )
        })?;
        Ok(())
    }

    /// Audit trail for one entity, oldest first.
    pub fn list_audit(&self, entity_type: &str, entity_id: &str) -> Result<Vec<AuditEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_type, entity_id, action, performed_by, old_value, new_value, ts
                 FROM audit_log WHERE entity_type = ?1 AND entity_id = ?2
                 ORDER BY id",
            )?;
            let events = stmt
                .query_map(params![entity_type, entity_id], |row| {
                    Ok(AuditEvent {
                        entity_type: row.get(0)?,
                        entity_id: row.get(1)?,
                        action: row.get(2)?,
                        performed_by: row.get(3)?,
                        old_value: row
                            .get::<_, Option<String>>(4)?
                            .and_then(|s| serde_json::from_str(&s).ok()),
                        new_value: row
                            .get::<_, Option<String>>(5)?
                            .and_then(|s| serde_json::from_str(&s).ok()),
                        ts: parse_ts(&row.get::<_, String>(6)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(events)
        })
    }

    // ==================== Transaction embeddings ====================

    /// Upsert the embedding for a transaction.
    pub fn upsert_embedding(
        &self,
        transaction_id: &str,
        model_name: &str,
        vector: &[f32],
    ) -> Result<()> {
        let blob: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO transaction_embeddings (transaction_id, model_name, vector, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (transaction_id) DO UPDATE SET
                    model_name = excluded.model_name,
                    vector = excluded.vector,
                    updated_at = excluded.updated_at",
                params![transaction_id, model_name, blob, Utc::now().to_rfc3339()],
            )
        })?;
        Ok(())
    }

    /// Number of stored embeddings.
    pub fn embedding_count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM transaction_embeddings",
                [],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|n| n as u64)
    }

    /// Cosine nearest neighbors over the stored embeddings, excluding the
    /// subject transaction, bounded by `k` and `min_similarity`.
    pub fn nearest_embeddings(
        &self,
        vector: &[f32],
        k: usize,
        min_similarity: f64,
        exclude_transaction_id: &str,
    ) -> Result<Vec<VectorMatch>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT transaction_id, model_name, vector FROM transaction_embeddings
                 WHERE transaction_id != ?1",
            )?;
            let rows = stmt
                .query_map(params![exclude_transaction_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut matches: Vec<VectorMatch> = rows
            .into_iter()
            .filter_map(|(transaction_id, model_name, blob)| {
                let candidate = decode_vector(&blob);
                let similarity = cosine_similarity(vector, &candidate)?;
                (similarity >= min_similarity).then_some(VectorMatch {
                    transaction_id,
                    similarity,
                    model_name,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(k);
        Ok(matches)
    }
}

fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_default()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn parse_cursor(cursor: &str) -> Result<(DateTime<Utc>, String)> {
    let (ts, id) = cursor
        .split_once('|')
        .ok_or_else(|| Error::Validation(format!("malformed cursor '{}'", cursor)))?;
    let created_at = DateTime::parse_from_rfc3339(ts)
        .map_err(|_| Error::Validation(format!("malformed cursor timestamp '{}'", ts)))?
        .with_timezone(&Utc);
    Ok((created_at, id.to_string()))
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
            f32::from_le_bytes(arr)
        })
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

const INVESTIGATION_COLUMNS: &str =
    "id, transaction_id, mode, status, priority, severity, confidence, step_count, max_steps,
     planner_model, model_mode, llm_status, llm_error, llm_model, started_at, completed_at,
     duration_ms, error_summary, runtime_feature_flags, runtime_safeguards, stage_durations,
     partial, trigger_ref";

fn row_to_investigation(row: &rusqlite::Row) -> rusqlite::Result<Investigation> {
    Ok(Investigation {
        id: parse_uuid(&row.get::<_, String>(0)?),
        transaction_id: row.get(1)?,
        mode: InvestigationMode::parse(&row.get::<_, String>(2)?)
            .unwrap_or(InvestigationMode::Full),
        status: InvestigationStatus::parse(&row.get::<_, String>(3)?)
            .unwrap_or(InvestigationStatus::Failed),
        priority: row.get(4)?,
        severity: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| Severity::parse(&s)),
        confidence: row.get(6)?,
        step_count: row.get(7)?,
        max_steps: row.get(8)?,
        planner_model: row.get(9)?,
        model_mode: ModelMode::parse(&row.get::<_, String>(10)?).unwrap_or(ModelMode::Agentic),
        llm_status: row
            .get::<_, Option<String>>(11)?
            .and_then(|s| LlmStatus::parse(&s)),
        llm_error: row.get(12)?,
        llm_model: row.get(13)?,
        started_at: parse_ts(&row.get::<_, String>(14)?),
        completed_at: row.get::<_, Option<String>>(15)?.map(|s| parse_ts(&s)),
        duration_ms: row.get::<_, Option<i64>>(16)?.map(|d| d as u64),
        error_summary: row.get(17)?,
        runtime_feature_flags: row
            .get::<_, String>(18)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        runtime_safeguards: row
            .get::<_, String>(19)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        stage_durations_ms: row
            .get::<_, Option<String>>(20)?
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        partial: row.get(21)?,
        trigger_ref: row.get(22)?,
    })
}

fn row_to_insight(row: &rusqlite::Row) -> rusqlite::Result<Insight> {
    Ok(Insight {
        id: parse_uuid(&row.get::<_, String>(0)?),
        investigation_id: parse_uuid(&row.get::<_, String>(1)?),
        transaction_id: row.get(2)?,
        evaluation_type: row.get(3)?,
        insight_type: row.get(4)?,
        model_mode: ModelMode::parse(&row.get::<_, String>(5)?).unwrap_or(ModelMode::Agentic),
        severity: Severity::parse(&row.get::<_, String>(6)?).unwrap_or(Severity::Low),
        summary: row.get(7)?,
        confidence_score: row.get(8)?,
        transaction_timestamp: parse_ts(&row.get::<_, String>(9)?),
        generated_at: parse_ts(&row.get::<_, String>(10)?),
        idempotency_key: row.get(11)?,
    })
}

const RECOMMENDATION_COLUMNS: &str =
    "id, insight_id, rec_type, priority, title, impact, payload, signature_hash, status,
     acknowledged_by, acknowledged_at, idempotency_key, created_at";

fn row_to_recommendation(row: &rusqlite::Row) -> rusqlite::Result<Recommendation> {
    Ok(Recommendation {
        id: parse_uuid(&row.get::<_, String>(0)?),
        insight_id: parse_uuid(&row.get::<_, String>(1)?),
        rec_type: RecommendationType::parse(&row.get::<_, String>(2)?)
            .unwrap_or(RecommendationType::ReviewPriority),
        priority: row.get::<_, i64>(3)? as u8,
        title: row.get(4)?,
        impact: row.get(5)?,
        payload: row
            .get::<_, Option<String>>(6)?
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(Value::Null),
        signature_hash: row.get(7)?,
        status: RecommendationStatus::parse(&row.get::<_, String>(8)?)
            .unwrap_or(RecommendationStatus::Open),
        acknowledged_by: row.get(9)?,
        acknowledged_at: row.get::<_, Option<String>>(10)?.map(|s| parse_ts(&s)),
        idempotency_key: row.get(11)?,
        created_at: parse_ts(&row.get::<_, String>(12)?),
    })
}
