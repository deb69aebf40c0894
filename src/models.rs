//! Core entities: tools, trust levels, verdicts, telemetry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trust tiers for tools.
///
/// Ordered: a higher tier implies every guarantee of the lower ones.
/// Promotion is one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TrustLevel {
    /// Submitted but never verified.
    Submitted,
    /// Passed the Gauntlet.
    Verified,
    /// Heavily used with a high success rate across distinct agents.
    BattleTested,
    /// Endorsed by external community signals.
    Community,
}

impl TrustLevel {
    /// Integer form used in storage and on the wire.
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// Parse the stored integer, clamping unknown values to `Submitted`.
    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Verified,
            2 => Self::BattleTested,
            3 => Self::Community,
            _ => Self::Submitted,
        }
    }
}

impl From<TrustLevel> for u8 {
    fn from(level: TrustLevel) -> Self {
        level as u8
    }
}

impl TryFrom<u8> for TrustLevel {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Submitted),
            1 => Ok(Self::Verified),
            2 => Ok(Self::BattleTested),
            3 => Ok(Self::Community),
            other => Err(format!("invalid trust level {other}")),
        }
    }
}

/// Outcome of the static security scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityScan {
    Pass,
    Warning,
    Fail,
}

impl SecurityScan {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warning => "warning",
            Self::Fail => "fail",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "warning" => Self::Warning,
            "fail" => Self::Fail,
            _ => Self::Pass,
        }
    }
}

/// Result of screening a submission.
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Whether the submission may proceed to the sandbox.
    pub safe: bool,
    pub scan: SecurityScan,
    /// Human-readable findings, one per issue.
    pub reasons: Vec<String>,
}

/// Measurements from one sandboxed execution.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Child exit code; -1 when killed.
    pub exit: i32,
    pub stdout: String,
    pub stderr: String,
    pub wall_ms: u64,
    pub cpu_ms: u64,
    pub peak_mem_kb: u64,
    /// Wall-clock or CPU limit breached.
    pub timed_out: bool,
    /// Memory limit breached.
    pub oom: bool,
}

/// The Gauntlet's decision on a submission.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub approved: bool,
    pub security_scan: SecurityScan,
    pub exec_ms: u64,
    pub mem_kb: u64,
    pub test_passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Identifies this verification run in provenance records.
    pub run_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oom: Option<bool>,
}

/// What an agent sends when publishing a tool.
#[derive(Debug, Clone, Deserialize)]
pub struct Submission {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Free text describing what the tool is for; the embedding source.
    pub intent: String,
    pub code: String,
    pub test_case: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
    #[serde(default = "default_agent_id")]
    pub author_agent_id: String,
}

pub(crate) fn default_agent_id() -> String {
    "anonymous".to_string()
}

/// An agent reports the outcome of using a tool.
#[derive(Debug, Clone, Deserialize)]
pub struct UsageReport {
    pub tool_id: Uuid,
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    pub success: bool,
    #[serde(default)]
    pub execution_time_ms: f64,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    /// Idempotency key component; defaults to receipt time when absent.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A tool in the registry.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub intent: String,
    pub code: String,
    pub test_case: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    pub tags: Vec<String>,
    pub author_agent_id: String,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tool_id: Option<Uuid>,
    pub content_hash: String,
    pub signature: String,
    pub trust_level: TrustLevel,
    pub created_at: DateTime<Utc>,

    // Telemetry aggregates.
    pub total_uses: i64,
    pub successful_uses: i64,
    pub unique_agents: i64,
    pub avg_execution_time_ms: f64,
    /// Sum and count of reported token usage; mean is derived.
    #[serde(skip)]
    pub tokens_sum: i64,
    #[serde(skip)]
    pub token_reports: i64,

    pub fitness_score: f64,
    #[serde(skip)]
    pub low_fitness_streak: i64,

    /// Gauntlet measurements at verification time.
    pub exec_ms: i64,
    pub mem_kb: i64,

    pub delisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delist_reason: Option<String>,
}

impl Tool {
    /// Fraction of uses that succeeded; 0 for an unused tool.
    pub fn success_rate(&self) -> f64 {
        self.successful_uses as f64 / (self.total_uses.max(1)) as f64
    }

    /// Mean reported tokens per use, if any report carried token data.
    pub fn tokens_per_use(&self) -> Option<f64> {
        if self.token_reports > 0 {
            Some(self.tokens_sum as f64 / self.token_reports as f64)
        } else {
            None
        }
    }
}

/// Lightweight tool info for listings.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSummary {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub fitness_score: f64,
    pub trust_level: TrustLevel,
    pub total_uses: i64,
    pub tags: Vec<String>,
    pub delisted: bool,
}

impl From<&Tool> for ToolSummary {
    fn from(t: &Tool) -> Self {
        Self {
            id: t.id,
            name: t.name.clone(),
            description: t.description.clone(),
            fitness_score: t.fitness_score,
            trust_level: t.trust_level,
            total_uses: t.total_uses,
            tags: t.tags.clone(),
            delisted: t.delisted,
        }
    }
}

/// Filter for `list_tools`.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolFilter {
    #[serde(default)]
    pub include_delisted: bool,
    #[serde(default)]
    pub min_fitness: Option<f64>,
    #[serde(default)]
    pub trust_level: Option<TrustLevel>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default = "default_list_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_list_limit() -> i64 {
    50
}

impl Default for ToolFilter {
    fn default() -> Self {
        Self {
            include_delisted: false,
            min_fitness: None,
            trust_level: None,
            author: None,
            tag: None,
            limit: default_list_limit(),
            offset: 0,
        }
    }
}

/// One ranked discovery result.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryHit {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub fitness: f64,
    pub trust_level: TrustLevel,
    pub similarity: f64,
}

/// One link of a provenance chain, root first.
#[derive(Debug, Clone, Serialize)]
pub struct ProvenanceEntry {
    pub id: Uuid,
    pub content_hash: String,
    pub version: i64,
    pub signature: String,
    pub exec_ms: i64,
    pub security_scan: SecurityScan,
}
