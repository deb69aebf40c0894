//! Service wiring and request orchestration.
//!
//! `App` owns every subsystem as an explicit service object constructed at
//! startup — no process-wide singletons. It drives the control flows the
//! protocol surface exposes: submit → gauntlet → registry → index,
//! discovery → index → registry, usage → registry → index removal.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::discovery::{DiscoverOptions, Discovery};
use crate::error::{RegistryError, SandboxError, StoreError};
use crate::fitness::FitnessEngine;
use crate::gauntlet::{Gauntlet, SandboxExecutor, StaticScreener};
use crate::index::{BagOfWordsEmbedder, Embedder, EmbeddingIndex};
use crate::models::{
    DiscoveryHit, ProvenanceEntry, Submission, Tool, ToolFilter, UsageReport, Verdict,
};
use crate::registry::{LibSqlStore, NewTool, ToolRegistry, UsageOutcome};

/// Why a submission was not registered.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The request itself is malformed (empty fields, size caps).
    #[error("invalid submission: {0}")]
    Invalid(String),

    /// The static screen rejected the source. No sandbox run happened.
    #[error("rejected by static screening")]
    RejectedStatic(Verdict),

    /// The sandbox ran the declared test and it failed (or breached a limit).
    #[error("rejected by sandbox verification")]
    RejectedRuntime(Verdict),

    /// The sandbox pool and queue are full; try again later.
    #[error("sandbox overloaded")]
    Overloaded,

    /// Registry-level rejection (duplicate, missing/delisted parent, store).
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Verification could not run at all.
    #[error("verification failed to run: {0}")]
    Internal(String),
}

/// A successful submission.
#[derive(Debug)]
pub struct SubmitOutcome {
    pub tool: Tool,
    pub verdict: Verdict,
}

/// The assembled service.
pub struct App {
    config: Config,
    registry: Arc<ToolRegistry>,
    gauntlet: Gauntlet,
    index: Arc<EmbeddingIndex>,
    embedder: Arc<dyn Embedder>,
    discovery: Discovery,
}

impl App {
    /// Open the store under the configured data directory, run migrations,
    /// rebuild the embedding index, and wire all services.
    pub async fn new(config: Config) -> Result<Self, StoreError> {
        let store = Arc::new(LibSqlStore::new_local(&config.db_path()).await?);
        Self::assemble(config, store).await
    }

    /// In-memory variant for tests.
    pub async fn new_in_memory(config: Config) -> Result<Self, StoreError> {
        let store = Arc::new(LibSqlStore::new_memory().await?);
        Self::assemble(config, store).await
    }

    async fn assemble(config: Config, store: Arc<LibSqlStore>) -> Result<Self, StoreError> {
        store.run_migrations().await?;

        let embedder: Arc<dyn Embedder> = Arc::new(BagOfWordsEmbedder);
        let index = Arc::new(EmbeddingIndex::new(Arc::clone(&embedder)));
        for (tool_id, terms) in store.load_embedding_terms().await? {
            index.restore(tool_id, terms).await;
        }
        let restored = index.len().await;
        if restored > 0 {
            tracing::info!(tools = restored, "embedding index rebuilt");
        }

        let registry = Arc::new(ToolRegistry::new(
            store,
            FitnessEngine::new(config.fitness.clone()),
        ));
        let gauntlet = Gauntlet::new(
            StaticScreener::new(config.screener.clone()),
            Arc::new(SandboxExecutor::new(config.sandbox.clone())),
        );

        let discovery = Discovery::new(Arc::clone(&registry), Arc::clone(&index));

        Ok(Self {
            config,
            registry,
            gauntlet,
            index,
            embedder,
            discovery,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Publish a new tool: validate → verify → persist → index.
    pub async fn submit_tool(&self, submission: Submission) -> Result<SubmitOutcome, SubmitError> {
        self.validate(&submission)?;
        self.verify_and_register(submission, None).await
    }

    /// Publish an improved version of an existing tool.
    pub async fn fork_tool(
        &self,
        parent_id: Uuid,
        submission: Submission,
    ) -> Result<SubmitOutcome, SubmitError> {
        self.validate(&submission)?;
        let parent = self.registry.fork_parent(parent_id).await?;
        self.verify_and_register(submission, Some(parent)).await
    }

    async fn verify_and_register(
        &self,
        submission: Submission,
        parent: Option<Tool>,
    ) -> Result<SubmitOutcome, SubmitError> {
        let verdict = self
            .gauntlet
            .verify(&submission.code, &submission.test_case)
            .await
            .map_err(|e| match e {
                SandboxError::Overloaded { .. } => SubmitError::Overloaded,
                other => SubmitError::Internal(other.to_string()),
            })?;

        if !verdict.approved {
            // A failed scan short-circuits before the sandbox, so the scan
            // result alone tells the two rejection stages apart.
            return Err(if verdict.security_scan == crate::models::SecurityScan::Fail {
                SubmitError::RejectedStatic(verdict)
            } else {
                SubmitError::RejectedRuntime(verdict)
            });
        }

        let terms = self.embedder.embed(&embedding_document(&submission));
        let tool = self
            .registry
            .insert(NewTool {
                submission: &submission,
                verdict: &verdict,
                parent: parent.as_ref(),
                terms: &terms,
            })
            .await?;

        // Insertion is reported complete only after the index knows the
        // tool, so a discover immediately after submit can find it.
        self.index.restore(tool.id, terms).await;

        Ok(SubmitOutcome { tool, verdict })
    }

    pub async fn discover(
        &self,
        intent: &str,
        opts: &DiscoverOptions,
    ) -> Result<Vec<DiscoveryHit>, RegistryError> {
        self.discovery.discover(intent, opts).await
    }

    pub async fn get_tool(&self, id: Uuid) -> Result<Tool, RegistryError> {
        self.registry.get(id).await
    }

    pub async fn get_provenance(&self, id: Uuid) -> Result<Vec<ProvenanceEntry>, RegistryError> {
        self.registry.provenance(id).await
    }

    pub async fn list_tools(&self, filter: &ToolFilter) -> Result<Vec<Tool>, RegistryError> {
        self.registry.list(filter).await
    }

    /// Record a usage report; a delisting triggered by this report removes
    /// the tool from discovery immediately.
    pub async fn report_usage(&self, report: &UsageReport) -> Result<UsageOutcome, RegistryError> {
        let outcome = self.registry.record_usage(report).await?;
        if outcome.newly_delisted {
            self.index.remove(report.tool_id).await;
        }
        Ok(outcome)
    }

    fn validate(&self, submission: &Submission) -> Result<(), SubmitError> {
        if submission.name.trim().is_empty() {
            return Err(SubmitError::Invalid("name must not be empty".to_string()));
        }
        if submission.code.trim().is_empty() {
            return Err(SubmitError::Invalid("code must not be empty".to_string()));
        }
        if submission.test_case.trim().is_empty() {
            return Err(SubmitError::Invalid(
                "test_case must not be empty".to_string(),
            ));
        }
        if submission.intent.trim().is_empty() {
            return Err(SubmitError::Invalid("intent must not be empty".to_string()));
        }

        let caps = &self.config.screener;
        if submission.code.len() > caps.max_code_size_bytes {
            return Err(SubmitError::Invalid(format!(
                "code size {} exceeds maximum {}",
                submission.code.len(),
                caps.max_code_size_bytes
            )));
        }
        if submission.description.chars().count() > caps.max_description_len {
            return Err(SubmitError::Invalid(format!(
                "description too long (max {} chars)",
                caps.max_description_len
            )));
        }
        Ok(())
    }
}

/// Text the embedder sees for a tool: intent first, then name and tags.
fn embedding_document(submission: &Submission) -> String {
    let mut doc = submission.intent.clone();
    doc.push('\n');
    doc.push_str(&submission.name);
    if !submission.tags.is_empty() {
        doc.push('\n');
        doc.push_str(&submission.tags.join(" "));
    }
    doc
}
