//! The content-addressed registry.
//!
//! Owns artifact identity (canonicalization + hashing), uniqueness (at most
//! one active tool per content hash), fork lineage, telemetry merging, and
//! delisting. Mutations for one tool are serialized behind a per-id mutex;
//! inserts additionally hold a registry-wide lock so the duplicate check
//! and the write are atomic.

mod store;

pub use store::{LibSqlStore, ProvenanceRow};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{RegistryError, StoreError};
use crate::fitness::FitnessEngine;
use crate::hashing;
use crate::models::{
    ProvenanceEntry, SecurityScan, Submission, Tool, ToolFilter, TrustLevel, UsageReport, Verdict,
};

/// Everything needed to persist a freshly verified submission.
pub struct NewTool<'a> {
    pub submission: &'a Submission,
    pub verdict: &'a Verdict,
    /// Present for forks; version and lineage derive from it.
    pub parent: Option<&'a Tool>,
    /// Term map produced by the embedder, persisted for index rebuilds.
    pub terms: &'a HashMap<String, f32>,
}

/// What `record_usage` did.
#[derive(Debug, Clone)]
pub struct UsageOutcome {
    pub fitness: f64,
    pub delisted: bool,
    /// This report crossed the delisting threshold.
    pub newly_delisted: bool,
    pub trust_level: TrustLevel,
    /// The report was a replay of an already-recorded event.
    pub duplicate: bool,
}

/// The registry service.
pub struct ToolRegistry {
    store: Arc<LibSqlStore>,
    engine: FitnessEngine,
    /// Per-tool mutation locks, created on first touch.
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    /// Serializes duplicate-check-then-insert.
    insert_lock: Mutex<()>,
}

impl ToolRegistry {
    pub fn new(store: Arc<LibSqlStore>, engine: FitnessEngine) -> Self {
        Self {
            store,
            engine,
            locks: Mutex::new(HashMap::new()),
            insert_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<LibSqlStore> {
        &self.store
    }

    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(id).or_default())
    }

    /// Persist a verified submission.
    ///
    /// Canonicalizes the artifact, enforces content-hash uniqueness, assigns
    /// id / version / signature / timestamps, seeds fitness, and commits the
    /// tool, its provenance record, and its embedding terms in one
    /// transaction.
    pub async fn insert(&self, new: NewTool<'_>) -> Result<Tool, RegistryError> {
        debug_assert!(new.verdict.approved, "only approved verdicts reach insert");
        let _guard = self.insert_lock.lock().await;

        let code = hashing::canonicalize(&new.submission.code);
        let test_case = hashing::canonicalize(&new.submission.test_case);
        let content_hash = hashing::content_hash(&code, &test_case);

        if let Some(existing_id) = self.store.find_active_by_hash(&content_hash).await? {
            return Err(RegistryError::Duplicate { existing_id });
        }

        let now = Utc::now();
        let mut tool = Tool {
            id: Uuid::new_v4(),
            name: new.submission.name.clone(),
            description: new.submission.description.clone(),
            intent: new.submission.intent.clone(),
            code,
            test_case,
            input_schema: new.submission.input_schema.clone(),
            tags: new.submission.tags.clone(),
            author_agent_id: new.submission.author_agent_id.clone(),
            version: new.parent.map_or(1, |p| p.version + 1),
            parent_tool_id: new.parent.map(|p| p.id),
            content_hash: content_hash.clone(),
            signature: hashing::sign_record(&content_hash, &new.verdict.run_id),
            trust_level: TrustLevel::Verified,
            created_at: now,
            total_uses: 0,
            successful_uses: 0,
            unique_agents: 0,
            avg_execution_time_ms: new.verdict.exec_ms as f64,
            tokens_sum: 0,
            token_reports: 0,
            fitness_score: 0.0,
            low_fitness_streak: 0,
            exec_ms: new.verdict.exec_ms as i64,
            mem_kb: new.verdict.mem_kb as i64,
            delisted: false,
            delist_reason: None,
        };
        tool.fitness_score = self.engine.compute(&tool, now);

        let provenance = ProvenanceRow {
            tool_id: tool.id,
            version: tool.version,
            content_hash,
            parent_hash: new.parent.map(|p| p.content_hash.clone()),
            parent_tool_id: tool.parent_tool_id,
            author_agent_id: tool.author_agent_id.clone(),
            gauntlet_run_id: new.verdict.run_id,
            security_scan: new.verdict.security_scan,
            exec_ms: tool.exec_ms,
            mem_kb: tool.mem_kb,
            signature: tool.signature.clone(),
            created_at: now,
        };

        let terms_json = serde_json::to_string(new.terms)
            .map_err(|e| StoreError::Query(format!("failed to encode terms: {e}")))?;

        let conn = self.store.connect().await.map_err(RegistryError::Store)?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        store::insert_tool_row(&tx, &tool).await?;
        store::insert_provenance_row(&tx, &provenance).await?;
        store::upsert_embedding_terms(&tx, tool.id, &terms_json).await?;
        tx.commit()
            .await
            .map_err(|e| RegistryError::Store(StoreError::Query(e.to_string())))?;

        tracing::info!(
            tool_id = %tool.id,
            name = %tool.name,
            version = tool.version,
            fitness = tool.fitness_score,
            "tool registered"
        );
        Ok(tool)
    }

    /// Resolve and validate the parent of a fork.
    pub async fn fork_parent(&self, parent_id: Uuid) -> Result<Tool, RegistryError> {
        let parent = self
            .store
            .get_tool(parent_id)
            .await?
            .ok_or(RegistryError::ParentNotFound { id: parent_id })?;
        if parent.delisted {
            return Err(RegistryError::ParentDelisted { id: parent_id });
        }
        Ok(parent)
    }

    pub async fn get(&self, id: Uuid) -> Result<Tool, RegistryError> {
        self.store
            .get_tool(id)
            .await?
            .ok_or(RegistryError::NotFound { id })
    }

    /// Root-to-self lineage of a tool.
    pub async fn provenance(&self, id: Uuid) -> Result<Vec<ProvenanceEntry>, RegistryError> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = Some(id);

        while let Some(current) = cursor {
            if !visited.insert(current) {
                return Err(RegistryError::Store(StoreError::Corrupt(format!(
                    "provenance cycle at {current}"
                ))));
            }
            let tool = self
                .store
                .get_tool(current)
                .await?
                .ok_or(RegistryError::NotFound { id: current })?;

            let scan = self
                .store
                .provenance_rows(current)
                .await?
                .first()
                .map_or(SecurityScan::Pass, |row| row.security_scan);

            chain.push(ProvenanceEntry {
                id: tool.id,
                content_hash: tool.content_hash.clone(),
                version: tool.version,
                signature: tool.signature.clone(),
                exec_ms: tool.exec_ms,
                security_scan: scan,
            });
            cursor = tool.parent_tool_id;
        }

        chain.reverse();
        Ok(chain)
    }

    pub async fn list(&self, filter: &ToolFilter) -> Result<Vec<Tool>, RegistryError> {
        Ok(self.store.list_tools(filter).await?)
    }

    /// Apply a usage report: append the event, fold aggregates, recompute
    /// fitness, and run the delisting and trust-escalation policies — all
    /// in one transaction, serialized per tool id.
    ///
    /// Reports for a delisted tool are accepted but change nothing
    /// (delisted is terminal). Replayed reports are no-ops.
    pub async fn record_usage(&self, report: &UsageReport) -> Result<UsageOutcome, RegistryError> {
        let lock = self.lock_for(report.tool_id).await;
        let _guard = lock.lock().await;

        let conn = self.store.connect().await.map_err(RegistryError::Store)?;
        let tool = store::get_tool_on(&conn, report.tool_id)
            .await?
            .ok_or(RegistryError::NotFound { id: report.tool_id })?;

        if tool.delisted {
            return Ok(UsageOutcome {
                fitness: tool.fitness_score,
                delisted: true,
                newly_delisted: false,
                trust_level: tool.trust_level,
                duplicate: false,
            });
        }

        let now = Utc::now();
        let reported_at = report.timestamp.unwrap_or(now);

        let tx = conn
            .transaction()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        if !store::insert_usage_event(&tx, report, reported_at).await? {
            // Replay of an already-applied report.
            return Ok(UsageOutcome {
                fitness: tool.fitness_score,
                delisted: false,
                newly_delisted: false,
                trust_level: tool.trust_level,
                duplicate: true,
            });
        }

        store::bump_usage_aggregates(&tx, report).await?;
        store::record_agent_usage(&tx, report.tool_id, &report.agent_id).await?;

        let mut updated = store::get_tool_on(&tx, report.tool_id)
            .await?
            .ok_or(RegistryError::NotFound { id: report.tool_id })?;

        let fitness = self.engine.compute(&updated, now);
        let streak = if self.engine.is_low_fitness(fitness) {
            updated.low_fitness_streak + 1
        } else {
            0
        };
        store::write_fitness(&tx, report.tool_id, fitness, streak).await?;
        updated.fitness_score = fitness;
        updated.low_fitness_streak = streak;

        let mut trust_level = updated.trust_level;
        if let Some(promoted) = self.engine.trust_promotion(&updated) {
            store::promote_trust(&tx, report.tool_id, promoted).await?;
            trust_level = promoted;
            tracing::info!(tool_id = %report.tool_id, level = ?promoted, "trust escalated");
        }

        let mut newly_delisted = false;
        if let Some(reason) = self.engine.delist_reason(&updated) {
            store::set_delisted(&tx, report.tool_id, &reason).await?;
            newly_delisted = true;
            tracing::warn!(tool_id = %report.tool_id, %reason, "tool delisted");
        }

        tx.commit()
            .await
            .map_err(|e| RegistryError::Store(StoreError::Query(e.to_string())))?;

        Ok(UsageOutcome {
            fitness,
            delisted: newly_delisted,
            newly_delisted,
            trust_level,
            duplicate: false,
        })
    }

    /// Delist a tool. Idempotent; returns whether this call changed state.
    pub async fn mark_delisted(&self, id: Uuid, reason: &str) -> Result<bool, RegistryError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let conn = self.store.connect().await.map_err(RegistryError::Store)?;
        if store::get_tool_on(&conn, id).await?.is_none() {
            return Err(RegistryError::NotFound { id });
        }
        Ok(store::set_delisted(&conn, id, reason).await?)
    }
}
