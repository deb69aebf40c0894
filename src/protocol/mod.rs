//! JSON-RPC 2.0 protocol surface.
//!
//! Newline-delimited request/response over whatever byte stream the host
//! provides (the shipped binary uses stdio). This module owns request
//! parsing, method dispatch, and the error taxonomy; it is the only place
//! where internal errors convert to wire errors. No error escapes
//! unconverted: unexpected failures become an opaque `internal_error` with
//! a correlation id and a full log line.

use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::app::{App, SubmitError, SubmitOutcome};
use crate::discovery::DiscoverOptions;
use crate::error::RegistryError;
use crate::models::{Submission, ToolFilter, ToolSummary, TrustLevel, UsageReport};

/// JSON-RPC error codes.
const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
/// Application-level failures; `data.kind` carries the structured reason.
const APP_ERROR: i64 = -32000;
const INTERNAL_ERROR: i64 = -32603;

/// A parsed request envelope.
#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

/// A dispatch failure, ready to serialize as a JSON-RPC error object.
#[derive(Debug)]
pub struct RpcFailure {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcFailure {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    fn app(kind: &str, message: impl Into<String>, mut data: Value) -> Self {
        if let Some(obj) = data.as_object_mut() {
            obj.insert("kind".to_string(), json!(kind));
        }
        Self {
            code: APP_ERROR,
            message: message.into(),
            data: Some(data),
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
            data: Some(json!({"kind": "invalid_input"})),
        }
    }

    /// Opaque internal error with a correlation id; the cause is logged,
    /// never surfaced.
    fn internal(context: &str, cause: &dyn std::fmt::Display) -> Self {
        let correlation_id = Uuid::new_v4();
        tracing::error!(%correlation_id, context, error = %cause, "internal error");
        Self {
            code: INTERNAL_ERROR,
            message: "internal error".to_string(),
            data: Some(json!({
                "kind": "internal_error",
                "correlation_id": correlation_id,
            })),
        }
    }
}

/// Handle one raw request line. Returns `None` for notifications (requests
/// without an id), which get no response per JSON-RPC 2.0.
pub async fn handle_line(app: &App, line: &str) -> Option<Value> {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            return Some(error_response(
                Value::Null,
                RpcFailure::new(PARSE_ERROR, format!("parse error: {e}")),
            ));
        }
    };

    if let Some(ref version) = request.jsonrpc
        && version != "2.0"
    {
        let id = request.id.unwrap_or(Value::Null);
        return Some(error_response(
            id,
            RpcFailure::new(INVALID_REQUEST, "unsupported jsonrpc version"),
        ));
    }

    let id = request.id?;
    let response = match dispatch(app, &request.method, request.params).await {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(failure) => error_response(id, failure),
    };
    Some(response)
}

fn error_response(id: Value, failure: RpcFailure) -> Value {
    let mut error = json!({"code": failure.code, "message": failure.message});
    if let Some(data) = failure.data {
        error["data"] = data;
    }
    json!({"jsonrpc": "2.0", "id": id, "error": error})
}

/// Route a method call to the service.
pub async fn dispatch(app: &App, method: &str, params: Value) -> Result<Value, RpcFailure> {
    match method {
        "submit_tool" => {
            let submission: Submission = parse_params(params)?;
            let outcome = app.submit_tool(submission).await.map_err(submit_failure)?;
            Ok(submit_result(outcome))
        }
        "fork_tool" => {
            let fork: ForkParams = parse_params(params)?;
            let outcome = app
                .fork_tool(fork.parent_id, fork.submission)
                .await
                .map_err(submit_failure)?;
            Ok(submit_result(outcome))
        }
        "discover_tool" => {
            let query: DiscoverParams = parse_params(params)?;
            let opts = query.options();
            let hits = app
                .discover(&query.intent, &opts)
                .await
                .map_err(|e| registry_failure("discover_tool", e))?;
            Ok(json!({"results": hits}))
        }
        "get_tool" => {
            let by_id: IdParams = parse_params(params)?;
            let tool = app
                .get_tool(by_id.id)
                .await
                .map_err(|e| registry_failure("get_tool", e))?;
            Ok(serde_json::to_value(&tool)
                .map_err(|e| RpcFailure::internal("get_tool", &e))?)
        }
        "get_provenance" => {
            let by_id: IdParams = parse_params(params)?;
            let chain = app
                .get_provenance(by_id.id)
                .await
                .map_err(|e| registry_failure("get_provenance", e))?;
            Ok(json!({"chain": chain}))
        }
        "list_tools" => {
            let list: ListParams = parse_params(params)?;
            let filter = list.filter.unwrap_or_default();
            let tools = app
                .list_tools(&filter)
                .await
                .map_err(|e| registry_failure("list_tools", e))?;
            let summaries: Vec<ToolSummary> = tools.iter().map(ToolSummary::from).collect();
            Ok(json!({
                "tools": summaries,
                "count": summaries.len(),
                "offset": filter.offset,
            }))
        }
        "report_usage" => {
            let report: UsageReport = parse_params(params)?;
            let outcome = app
                .report_usage(&report)
                .await
                .map_err(|e| registry_failure("report_usage", e))?;
            Ok(json!({
                "fitness": outcome.fitness,
                "delisted": outcome.delisted,
                "trust_level": outcome.trust_level,
                "duplicate": outcome.duplicate,
            }))
        }
        other => Err(RpcFailure::new(
            METHOD_NOT_FOUND,
            format!("unknown method '{other}'"),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct ForkParams {
    parent_id: Uuid,
    #[serde(flatten)]
    submission: Submission,
}

#[derive(Debug, Deserialize)]
struct IdParams {
    id: Uuid,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    filter: Option<ToolFilter>,
}

#[derive(Debug, Deserialize)]
struct DiscoverParams {
    intent: String,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    min_fitness: Option<f64>,
    #[serde(default)]
    min_trust: Option<TrustLevel>,
    #[serde(default)]
    include_delisted: Option<bool>,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl DiscoverParams {
    fn options(&self) -> DiscoverOptions {
        let defaults = DiscoverOptions::default();
        DiscoverOptions {
            k: self.k.unwrap_or(defaults.k),
            min_fitness: self.min_fitness.unwrap_or(defaults.min_fitness),
            min_trust: self.min_trust.unwrap_or(defaults.min_trust),
            include_delisted: self.include_delisted.unwrap_or(defaults.include_delisted),
            tags: self.tags.clone(),
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, RpcFailure> {
    serde_json::from_value(params).map_err(|e| RpcFailure::invalid_params(e.to_string()))
}

fn submit_result(outcome: SubmitOutcome) -> Value {
    json!({
        "id": outcome.tool.id,
        "content_hash": outcome.tool.content_hash,
        "fitness": outcome.tool.fitness_score,
        "trust_level": outcome.tool.trust_level,
        "version": outcome.tool.version,
        "verdict": outcome.verdict,
    })
}

fn submit_failure(err: SubmitError) -> RpcFailure {
    match err {
        SubmitError::Invalid(message) => RpcFailure::invalid_params(message),
        SubmitError::RejectedStatic(verdict) => RpcFailure::app(
            "rejected_static",
            "submission rejected by static screening",
            json!({"verdict": verdict}),
        ),
        SubmitError::RejectedRuntime(verdict) => {
            let timed_out = verdict.timed_out.unwrap_or(false);
            let oom = verdict.oom.unwrap_or(false);
            RpcFailure::app(
                "rejected_runtime",
                "submission rejected by sandbox verification",
                json!({
                    "verdict": verdict,
                    "timed_out": timed_out,
                    "oom": oom,
                }),
            )
        }
        SubmitError::Overloaded => RpcFailure::app(
            "overloaded",
            "sandbox pool is at capacity, retry later",
            json!({}),
        ),
        SubmitError::Registry(e) => registry_failure("submit", e),
        SubmitError::Internal(message) => RpcFailure::internal("submit", &message),
    }
}

fn registry_failure(context: &str, err: RegistryError) -> RpcFailure {
    match err {
        RegistryError::Duplicate { existing_id } => RpcFailure::app(
            "duplicate",
            "identical artifact already registered",
            json!({"existing_id": existing_id}),
        ),
        RegistryError::NotFound { id } => {
            RpcFailure::app("not_found", format!("tool not found: {id}"), json!({"id": id}))
        }
        RegistryError::ParentNotFound { id } => RpcFailure::app(
            "parent_not_found",
            format!("parent tool not found: {id}"),
            json!({"parent_id": id}),
        ),
        RegistryError::ParentDelisted { id } => RpcFailure::app(
            "parent_delisted",
            format!("parent tool is delisted: {id}"),
            json!({"parent_id": id}),
        ),
        RegistryError::Store(e) => RpcFailure::internal(context, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn app() -> App {
        App::new_in_memory(Config::default()).await.expect("app")
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let app = app().await;
        let err = dispatch(&app, "no_such_method", json!({})).await.unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_params_are_invalid_input() {
        let app = app().await;
        let err = dispatch(&app, "submit_tool", json!({"name": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        assert_eq!(err.data.unwrap()["kind"], "invalid_input");
    }

    #[tokio::test]
    async fn get_tool_not_found_kind() {
        let app = app().await;
        let err = dispatch(&app, "get_tool", json!({"id": Uuid::new_v4()}))
            .await
            .unwrap_err();
        assert_eq!(err.code, APP_ERROR);
        assert_eq!(err.data.unwrap()["kind"], "not_found");
    }

    #[tokio::test]
    async fn report_usage_unknown_tool_not_found() {
        let app = app().await;
        let err = dispatch(
            &app,
            "report_usage",
            json!({"tool_id": Uuid::new_v4(), "success": true}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.data.unwrap()["kind"], "not_found");
    }

    #[tokio::test]
    async fn static_rejection_has_structured_kind() {
        let app = app().await;
        let err = dispatch(
            &app,
            "submit_tool",
            json!({
                "name": "evil",
                "intent": "run things",
                "code": "import subprocess",
                "test_case": "pass"
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, APP_ERROR);
        assert_eq!(err.data.unwrap()["kind"], "rejected_static");
    }

    #[tokio::test]
    async fn list_tools_accepts_empty_params() {
        let app = app().await;
        let result = dispatch(&app, "list_tools", json!({})).await.expect("list");
        assert_eq!(result["count"], 0);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let app = app().await;
        let response = handle_line(&app, r#"{"jsonrpc":"2.0","method":"list_tools"}"#).await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn parse_errors_respond_with_null_id() {
        let app = app().await;
        let response = handle_line(&app, "not json").await.expect("response");
        assert_eq!(response["id"], Value::Null);
        assert_eq!(response["error"]["code"], PARSE_ERROR);
    }

    #[tokio::test]
    async fn discover_on_empty_registry_is_empty() {
        let app = app().await;
        let result = dispatch(&app, "discover_tool", json!({"intent": "add numbers"}))
            .await
            .expect("discover");
        assert_eq!(result["results"], json!([]));
    }
}
