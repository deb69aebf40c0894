//! libSQL persistence for the registry.
//!
//! Single embedded database file. Every mutation runs inside one
//! transaction so a crash leaves either the whole change or none of it.
//! The partial unique index on `content_hash` (active tools only) is the
//! database-level backstop for artifact uniqueness.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{SecurityScan, Tool, ToolFilter, TrustLevel, UsageReport};

/// Explicit column list for the tools table; matches the positional access
/// in `row_to_tool`.
const TOOL_COLUMNS: &str = "\
    id, name, description, intent, code, test_case, input_schema, tags, \
    author_agent_id, version, parent_tool_id, content_hash, signature, \
    trust_level, created_at, total_uses, successful_uses, unique_agents, \
    avg_execution_time_ms, tokens_sum, token_reports, fitness_score, \
    low_fitness_streak, exec_ms, mem_kb, delisted, delist_reason";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tools (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    intent TEXT NOT NULL DEFAULT '',
    code TEXT NOT NULL,
    test_case TEXT NOT NULL,
    input_schema TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    author_agent_id TEXT NOT NULL DEFAULT 'anonymous',
    version INTEGER NOT NULL DEFAULT 1,
    parent_tool_id TEXT,
    content_hash TEXT NOT NULL,
    signature TEXT NOT NULL DEFAULT '',
    trust_level INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    total_uses INTEGER NOT NULL DEFAULT 0,
    successful_uses INTEGER NOT NULL DEFAULT 0,
    unique_agents INTEGER NOT NULL DEFAULT 0,
    avg_execution_time_ms REAL NOT NULL DEFAULT 0.0,
    tokens_sum INTEGER NOT NULL DEFAULT 0,
    token_reports INTEGER NOT NULL DEFAULT 0,
    fitness_score REAL NOT NULL DEFAULT 0.0,
    low_fitness_streak INTEGER NOT NULL DEFAULT 0,
    exec_ms INTEGER NOT NULL DEFAULT 0,
    mem_kb INTEGER NOT NULL DEFAULT 0,
    delisted INTEGER NOT NULL DEFAULT 0,
    delist_reason TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tools_hash_active
    ON tools(content_hash) WHERE delisted = 0;
CREATE INDEX IF NOT EXISTS idx_tools_fitness ON tools(fitness_score DESC);

CREATE TABLE IF NOT EXISTS usage_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tool_id TEXT NOT NULL,
    agent_id TEXT NOT NULL DEFAULT 'anonymous',
    success INTEGER NOT NULL,
    execution_time_ms REAL NOT NULL DEFAULT 0.0,
    tokens_used INTEGER,
    reported_at TEXT NOT NULL,
    UNIQUE (tool_id, agent_id, reported_at),
    FOREIGN KEY (tool_id) REFERENCES tools(id)
);
CREATE INDEX IF NOT EXISTS idx_usage_tool ON usage_events(tool_id);

CREATE TABLE IF NOT EXISTS agent_usage (
    tool_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    use_count INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (tool_id, agent_id),
    FOREIGN KEY (tool_id) REFERENCES tools(id)
);

CREATE TABLE IF NOT EXISTS provenance (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tool_id TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    content_hash TEXT NOT NULL,
    parent_hash TEXT,
    parent_tool_id TEXT,
    author_agent_id TEXT NOT NULL DEFAULT 'anonymous',
    gauntlet_run_id TEXT NOT NULL,
    security_scan TEXT NOT NULL DEFAULT 'pass',
    exec_ms INTEGER NOT NULL DEFAULT 0,
    mem_kb INTEGER NOT NULL DEFAULT 0,
    signature TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    FOREIGN KEY (tool_id) REFERENCES tools(id)
);
CREATE INDEX IF NOT EXISTS idx_provenance_tool ON provenance(tool_id);

CREATE TABLE IF NOT EXISTS embedding_vectors (
    tool_id TEXT PRIMARY KEY,
    terms TEXT NOT NULL,
    FOREIGN KEY (tool_id) REFERENCES tools(id)
);
"#;

/// A provenance row written alongside a tool at insert/fork time.
#[derive(Debug, Clone)]
pub struct ProvenanceRow {
    pub tool_id: Uuid,
    pub version: i64,
    pub content_hash: String,
    pub parent_hash: Option<String>,
    pub parent_tool_id: Option<Uuid>,
    pub author_agent_id: String,
    pub gauntlet_run_id: Uuid,
    pub security_scan: SecurityScan,
    pub exec_ms: i64,
    pub mem_kb: i64,
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

/// Embedded registry store.
pub struct LibSqlStore {
    db: Arc<LibSqlDatabase>,
}

impl LibSqlStore {
    /// Open (or create) a local database file.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("failed to create data directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("failed to open database: {e}")))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// In-memory database for tests.
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("failed to open in-memory database: {e}")))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Create a connection with a busy timeout so concurrent writers wait
    /// instead of failing instantly with "database is locked".
    pub(crate) async fn connect(&self) -> Result<Connection, StoreError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| StoreError::Open(format!("failed to create connection: {e}")))?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| StoreError::Open(format!("failed to set busy_timeout: {e}")))?;
        Ok(conn)
    }

    /// Apply the schema. Idempotent.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.connect().await?;
        conn.execute_batch(SCHEMA_SQL)
            .await
            .map_err(|e| StoreError::Query(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn get_tool(&self, id: Uuid) -> Result<Option<Tool>, StoreError> {
        let conn = self.connect().await?;
        get_tool_on(&conn, id).await
    }

    /// Id of the non-delisted tool carrying this content hash, if any.
    pub async fn find_active_by_hash(&self, content_hash: &str) -> Result<Option<Uuid>, StoreError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id FROM tools WHERE content_hash = ?1 AND delisted = 0",
                params![content_hash],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(parse_uuid(&get_text(&row, 0))?)),
            None => Ok(None),
        }
    }

    /// List tools ordered by fitness descending.
    pub async fn list_tools(&self, filter: &ToolFilter) -> Result<Vec<Tool>, StoreError> {
        let mut sql = format!("SELECT {TOOL_COLUMNS} FROM tools");
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();

        if !filter.include_delisted {
            clauses.push("delisted = 0".to_string());
        }
        if let Some(min_fitness) = filter.min_fitness {
            values.push(libsql::Value::Real(min_fitness));
            clauses.push(format!("fitness_score >= ?{}", values.len()));
        }
        if let Some(trust) = filter.trust_level {
            values.push(libsql::Value::Integer(trust.as_i64()));
            clauses.push(format!("trust_level >= ?{}", values.len()));
        }
        if let Some(ref author) = filter.author {
            values.push(libsql::Value::Text(author.clone()));
            clauses.push(format!("author_agent_id = ?{}", values.len()));
        }
        if let Some(ref tag) = filter.tag {
            // Tags are stored as a JSON array of strings.
            values.push(libsql::Value::Text(format!("%\"{tag}\"%")));
            clauses.push(format!("tags LIKE ?{}", values.len()));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        values.push(libsql::Value::Integer(filter.limit.max(0)));
        sql.push_str(&format!(" ORDER BY fitness_score DESC, created_at ASC LIMIT ?{}", values.len()));
        values.push(libsql::Value::Integer(filter.offset.max(0)));
        sql.push_str(&format!(" OFFSET ?{}", values.len()));

        let conn = self.connect().await?;
        let mut rows = conn
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(query_err)?;

        let mut tools = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            tools.push(row_to_tool(&row)?);
        }
        Ok(tools)
    }

    /// All persisted embedding term maps for active tools, for index rebuild.
    pub async fn load_embedding_terms(
        &self,
    ) -> Result<Vec<(Uuid, HashMap<String, f32>)>, StoreError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT v.tool_id, v.terms FROM embedding_vectors v \
                 JOIN tools t ON t.id = v.tool_id WHERE t.delisted = 0",
                (),
            )
            .await
            .map_err(query_err)?;

        let mut result = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let id = parse_uuid(&get_text(&row, 0))?;
            let terms: HashMap<String, f32> = serde_json::from_str(&get_text(&row, 1))
                .map_err(|e| StoreError::Corrupt(format!("bad embedding terms for {id}: {e}")))?;
            result.push((id, terms));
        }
        Ok(result)
    }

    /// Provenance rows for one tool, oldest first.
    pub async fn provenance_rows(&self, tool_id: Uuid) -> Result<Vec<ProvenanceRow>, StoreError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT tool_id, version, content_hash, parent_hash, parent_tool_id, \
                        author_agent_id, gauntlet_run_id, security_scan, exec_ms, mem_kb, \
                        signature, created_at \
                 FROM provenance WHERE tool_id = ?1 ORDER BY version ASC, id ASC",
                params![tool_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut result = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            result.push(ProvenanceRow {
                tool_id: parse_uuid(&get_text(&row, 0))?,
                version: get_i64(&row, 1),
                content_hash: get_text(&row, 2),
                parent_hash: get_opt_text(&row, 3),
                parent_tool_id: match get_opt_text(&row, 4) {
                    Some(s) => Some(parse_uuid(&s)?),
                    None => None,
                },
                author_agent_id: get_text(&row, 5),
                gauntlet_run_id: parse_uuid(&get_text(&row, 6))?,
                security_scan: SecurityScan::from_str_lossy(&get_text(&row, 7)),
                exec_ms: get_i64(&row, 8),
                mem_kb: get_i64(&row, 9),
                signature: get_text(&row, 10),
                created_at: get_ts(&row, 11)?,
            });
        }
        Ok(result)
    }
}

// ==================== Transactional building blocks ====================
//
// These take a `&Connection` so the registry can compose them inside one
// transaction (libsql's `Transaction` derefs to `Connection`).

pub(crate) async fn get_tool_on(conn: &Connection, id: Uuid) -> Result<Option<Tool>, StoreError> {
    let mut rows = conn
        .query(
            &format!("SELECT {TOOL_COLUMNS} FROM tools WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(query_err)?;

    match rows.next().await.map_err(query_err)? {
        Some(row) => Ok(Some(row_to_tool(&row)?)),
        None => Ok(None),
    }
}

pub(crate) async fn insert_tool_row(conn: &Connection, tool: &Tool) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO tools (\
            id, name, description, intent, code, test_case, input_schema, tags, \
            author_agent_id, version, parent_tool_id, content_hash, signature, \
            trust_level, created_at, total_uses, successful_uses, unique_agents, \
            avg_execution_time_ms, tokens_sum, token_reports, fitness_score, \
            low_fitness_streak, exec_ms, mem_kb, delisted, delist_reason) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                 ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)",
        params![
            tool.id.to_string(),
            tool.name.as_str(),
            tool.description.as_str(),
            tool.intent.as_str(),
            tool.code.as_str(),
            tool.test_case.as_str(),
            opt_text_owned(tool.input_schema.as_ref().map(|v| v.to_string())),
            serde_json::to_string(&tool.tags).unwrap_or_else(|_| "[]".to_string()),
            tool.author_agent_id.as_str(),
            tool.version,
            opt_text_owned(tool.parent_tool_id.map(|u| u.to_string())),
            tool.content_hash.as_str(),
            tool.signature.as_str(),
            tool.trust_level.as_i64(),
            fmt_ts(&tool.created_at),
            tool.total_uses,
            tool.successful_uses,
            tool.unique_agents,
            tool.avg_execution_time_ms,
            tool.tokens_sum,
            tool.token_reports,
            tool.fitness_score,
            tool.low_fitness_streak,
            tool.exec_ms,
            tool.mem_kb,
            tool.delisted as i64,
            opt_text(tool.delist_reason.as_deref()),
        ],
    )
    .await
    .map_err(query_err)?;
    Ok(())
}

pub(crate) async fn insert_provenance_row(
    conn: &Connection,
    row: &ProvenanceRow,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO provenance (\
            tool_id, version, content_hash, parent_hash, parent_tool_id, \
            author_agent_id, gauntlet_run_id, security_scan, exec_ms, mem_kb, \
            signature, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            row.tool_id.to_string(),
            row.version,
            row.content_hash.as_str(),
            opt_text(row.parent_hash.as_deref()),
            opt_text_owned(row.parent_tool_id.map(|u| u.to_string())),
            row.author_agent_id.as_str(),
            row.gauntlet_run_id.to_string(),
            row.security_scan.as_str(),
            row.exec_ms,
            row.mem_kb,
            row.signature.as_str(),
            fmt_ts(&row.created_at),
        ],
    )
    .await
    .map_err(query_err)?;
    Ok(())
}

pub(crate) async fn upsert_embedding_terms(
    conn: &Connection,
    tool_id: Uuid,
    terms_json: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO embedding_vectors (tool_id, terms) VALUES (?1, ?2) \
         ON CONFLICT (tool_id) DO UPDATE SET terms = excluded.terms",
        params![tool_id.to_string(), terms_json],
    )
    .await
    .map_err(query_err)?;
    Ok(())
}

/// Append a usage event. Returns false when the `(tool, agent, timestamp)`
/// key was already recorded (idempotent replay).
pub(crate) async fn insert_usage_event(
    conn: &Connection,
    report: &UsageReport,
    reported_at: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let affected = conn
        .execute(
            "INSERT OR IGNORE INTO usage_events \
                (tool_id, agent_id, success, execution_time_ms, tokens_used, reported_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.tool_id.to_string(),
                report.agent_id.as_str(),
                report.success as i64,
                report.execution_time_ms,
                match report.tokens_used {
                    Some(t) => libsql::Value::Integer(t as i64),
                    None => libsql::Value::Null,
                },
                fmt_event_ts(&reported_at),
            ],
        )
        .await
        .map_err(query_err)?;
    Ok(affected > 0)
}

/// Fold a report into the tool's aggregates (running mean for execution
/// time; all expressions evaluate against the pre-update row).
pub(crate) async fn bump_usage_aggregates(
    conn: &Connection,
    report: &UsageReport,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE tools SET \
            total_uses = total_uses + 1, \
            successful_uses = successful_uses + ?2, \
            avg_execution_time_ms = avg_execution_time_ms \
                + ((?3 - avg_execution_time_ms) / (total_uses + 1.0)), \
            tokens_sum = tokens_sum + COALESCE(?4, 0), \
            token_reports = token_reports + (CASE WHEN ?4 IS NULL THEN 0 ELSE 1 END) \
         WHERE id = ?1",
        params![
            report.tool_id.to_string(),
            report.success as i64,
            report.execution_time_ms,
            match report.tokens_used {
                Some(t) => libsql::Value::Integer(t as i64),
                None => libsql::Value::Null,
            },
        ],
    )
    .await
    .map_err(query_err)?;
    Ok(())
}

/// Track the distinct-agent set and refresh the cached count.
pub(crate) async fn record_agent_usage(
    conn: &Connection,
    tool_id: Uuid,
    agent_id: &str,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO agent_usage (tool_id, agent_id, use_count) VALUES (?1, ?2, 1) \
         ON CONFLICT (tool_id, agent_id) DO UPDATE SET use_count = use_count + 1",
        params![tool_id.to_string(), agent_id],
    )
    .await
    .map_err(query_err)?;

    conn.execute(
        "UPDATE tools SET unique_agents = \
            (SELECT COUNT(*) FROM agent_usage WHERE tool_id = ?1) \
         WHERE id = ?1",
        params![tool_id.to_string()],
    )
    .await
    .map_err(query_err)?;
    Ok(())
}

pub(crate) async fn write_fitness(
    conn: &Connection,
    tool_id: Uuid,
    fitness: f64,
    low_fitness_streak: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE tools SET fitness_score = ?2, low_fitness_streak = ?3 WHERE id = ?1",
        params![tool_id.to_string(), fitness, low_fitness_streak],
    )
    .await
    .map_err(query_err)?;
    Ok(())
}

/// Raise the trust level; never lowers it.
pub(crate) async fn promote_trust(
    conn: &Connection,
    tool_id: Uuid,
    level: TrustLevel,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE tools SET trust_level = MAX(trust_level, ?2) WHERE id = ?1",
        params![tool_id.to_string(), level.as_i64()],
    )
    .await
    .map_err(query_err)?;
    Ok(())
}

/// Mark a tool delisted. Returns false when it already was (idempotent).
pub(crate) async fn set_delisted(
    conn: &Connection,
    tool_id: Uuid,
    reason: &str,
) -> Result<bool, StoreError> {
    let affected = conn
        .execute(
            "UPDATE tools SET delisted = 1, delist_reason = ?2 \
             WHERE id = ?1 AND delisted = 0",
            params![tool_id.to_string(), reason],
        )
        .await
        .map_err(query_err)?;
    Ok(affected > 0)
}

// ==================== Row mapping helpers ====================

pub(crate) fn query_err(e: libsql::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

/// Format a timestamp for storage (RFC 3339 with millisecond precision).
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Usage events keep full precision: their timestamp is part of the
/// idempotency key, and server-assigned timestamps from back-to-back
/// reports must not collide.
fn fmt_event_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

/// Parse a stored timestamp, accepting RFC 3339 and naive SQLite formats.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    Err(StoreError::Corrupt(format!("unparseable timestamp {s:?}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    s.parse()
        .map_err(|_| StoreError::Corrupt(format!("invalid uuid {s:?}")))
}

fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

/// None for SQL NULL; preserves empty strings as Some("").
fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    row.get::<i64>(idx).unwrap_or(0)
}

fn get_f64(row: &libsql::Row, idx: i32) -> f64 {
    row.get::<f64>(idx).unwrap_or(0.0)
}

fn get_ts(row: &libsql::Row, idx: i32) -> Result<DateTime<Utc>, StoreError> {
    parse_timestamp(&get_text(row, idx))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn row_to_tool(row: &libsql::Row) -> Result<Tool, StoreError> {
    Ok(Tool {
        id: parse_uuid(&get_text(row, 0))?,
        name: get_text(row, 1),
        description: get_text(row, 2),
        intent: get_text(row, 3),
        code: get_text(row, 4),
        test_case: get_text(row, 5),
        input_schema: get_opt_text(row, 6).and_then(|s| serde_json::from_str(&s).ok()),
        tags: get_opt_text(row, 7)
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        author_agent_id: get_text(row, 8),
        version: get_i64(row, 9),
        parent_tool_id: get_opt_text(row, 10).and_then(|s| s.parse().ok()),
        content_hash: get_text(row, 11),
        signature: get_text(row, 12),
        trust_level: TrustLevel::from_i64(get_i64(row, 13)),
        created_at: get_ts(row, 14)?,
        total_uses: get_i64(row, 15),
        successful_uses: get_i64(row, 16),
        unique_agents: get_i64(row, 17),
        avg_execution_time_ms: get_f64(row, 18),
        tokens_sum: get_i64(row, 19),
        token_reports: get_i64(row, 20),
        fitness_score: get_f64(row, 21),
        low_fitness_streak: get_i64(row, 22),
        exec_ms: get_i64(row, 23),
        mem_kb: get_i64(row, 24),
        delisted: get_i64(row, 25) != 0,
        delist_reason: get_opt_text(row, 26),
    })
}
