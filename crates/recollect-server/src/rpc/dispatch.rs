//! Method handlers.
//!
//! Every engine call that touches the store runs on the blocking pool. Methods
//! that can delete or archive records default to `dryRun: true`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use recollect_core::memory::{MemoryService, MemoryStore, RecallFilters, RecallStrategy};
use recollect_core::types::{MemoryType, NewMemory, Provenance};
use recollect_core::Database;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::types::JsonRpcError;
use crate::state::{AppState, Session};

/// Methods served before `initialize`.
const LIFECYCLE_METHODS: &[&str] = &["initialize", "ping"];

/// Methods that need an initialized session.
pub const ENGINE_METHODS: &[&str] = &[
    "memory.extract",
    "memory.store",
    "memory.recall",
    "memory.get",
    "memory.forget",
    "memory.stats",
    "retention.analyze",
    "retention.apply",
    "consolidation.find",
    "consolidation.run",
    "maintenance.run",
    "tracker.flush",
];

type RpcResult = std::result::Result<Value, JsonRpcError>;

// ─────────────────────────────────────────────────────────────────────────────
// Params
// ─────────────────────────────────────────────────────────────────────────────

fn default_dry_run() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopeParams {
    user_id: Option<String>,
    agent_id: Option<String>,
    session_id: Option<String>,
}

impl ScopeParams {
    fn provenance(&self) -> Provenance {
        Provenance::new(
            self.user_id.clone(),
            self.agent_id.clone(),
            self.session_id.clone(),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    store_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractParams {
    text: String,
    /// Store the candidates instead of only returning them.
    #[serde(default)]
    store: bool,
    #[serde(flatten)]
    scope: ScopeParams,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreParams {
    content: String,
    memory_type: Option<MemoryType>,
    importance: Option<f64>,
    confidence: Option<f64>,
    valid_to: Option<i64>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(flatten)]
    scope: ScopeParams,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecallParams {
    prompt: String,
    strategy: Option<String>,
    max_memories: Option<usize>,
    #[serde(default)]
    memory_types: Vec<MemoryType>,
    #[serde(flatten)]
    scope: ScopeParams,
}

#[derive(Debug, Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsParams {
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetentionParams {
    limit: Option<usize>,
    #[serde(default = "default_dry_run")]
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsolidationParams {
    max_items: Option<usize>,
    #[serde(default = "default_dry_run")]
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaintenanceParams {
    #[serde(default = "default_dry_run")]
    dry_run: bool,
}

/// Decode named params. Missing params decode as an empty object.
fn parse_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P, JsonRpcError> {
    let value = match params {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(Value::Array(_)) => {
            return Err(JsonRpcError::invalid_params(
                "positional params are not supported",
            ));
        }
        Some(value @ Value::Object(_)) => value,
        Some(_) => return Err(JsonRpcError::invalid_params("params must be an object")),
    };
    serde_json::from_value(value).map_err(JsonRpcError::invalid_params)
}

/// Run a store operation on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, JsonRpcError>
where
    F: FnOnce() -> recollect_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(JsonRpcError::internal)?
        .map_err(JsonRpcError::from)
}

fn to_value<T: serde::Serialize>(value: &T) -> RpcResult {
    serde_json::to_value(value).map_err(JsonRpcError::internal)
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

/// Route one request to its handler.
pub async fn dispatch(state: &AppState, method: &str, params: Option<Value>) -> RpcResult {
    if !LIFECYCLE_METHODS.contains(&method) && !ENGINE_METHODS.contains(&method) {
        return Err(JsonRpcError::method_not_found(method));
    }

    match method {
        "initialize" => return initialize(state, params).await,
        "ping" => return Ok(json!({})),
        _ => {}
    }

    let session = state
        .session()
        .await
        .ok_or_else(JsonRpcError::not_initialized)?;
    let service = Arc::clone(&session.service);
    let timeout = state.config.engine.lock.timeout();

    match method {
        "memory.extract" => memory_extract(service, params, timeout).await,
        "memory.store" => memory_store(service, params, timeout).await,
        "memory.recall" => memory_recall(&session, params).await,
        "memory.get" => {
            let p: IdParams = parse_params(params)?;
            let record = blocking(move || service.store().get_by_id(&p.id)).await?;
            to_value(&record)
        }
        "memory.forget" => {
            let p: IdParams = parse_params(params)?;
            let deleted = blocking(move || {
                let _lock = service.lock(timeout)?;
                service.store().delete(&p.id)
            })
            .await?;
            Ok(json!({ "deleted": deleted }))
        }
        "memory.stats" => {
            let p: StatsParams = parse_params(params)?;
            let stats = blocking(move || service.store().stats(p.user_id.as_deref())).await?;
            let mut value = to_value(&stats)?;
            value["tracker"] = json!({
                "running": session.tracker.is_running(),
                "writtenEvents": session.tracker.written_events(),
                "droppedEvents": session.tracker.dropped_events(),
            });
            Ok(value)
        }
        "retention.analyze" => {
            let p: RetentionParams = parse_params(params)?;
            let limit = p
                .limit
                .unwrap_or(service.config().retention.analyze_limit);
            let scores = blocking(move || service.retention().analyze(limit)).await?;
            Ok(json!({ "scores": scores }))
        }
        "retention.apply" => {
            let p: RetentionParams = parse_params(params)?;
            let limit = p
                .limit
                .unwrap_or(service.config().retention.analyze_limit);
            let report = blocking(move || {
                let lock = if p.dry_run {
                    None
                } else {
                    Some(service.lock(timeout)?)
                };
                let scores = service.retention().analyze(limit)?;
                service.retention().apply(&scores, p.dry_run, lock.as_ref())
            })
            .await?;
            to_value(&report)
        }
        "consolidation.find" => {
            let p: ConsolidationParams = parse_params(params)?;
            let max_items = p
                .max_items
                .unwrap_or(service.config().consolidation.max_items);
            let clusters = blocking(move || service.consolidation().find_clusters(max_items)).await?;
            Ok(json!({ "clusters": clusters }))
        }
        "consolidation.run" => {
            let p: ConsolidationParams = parse_params(params)?;
            let max_items = p
                .max_items
                .unwrap_or(service.config().consolidation.max_items);
            let report = blocking(move || {
                let lock = if p.dry_run {
                    None
                } else {
                    Some(service.lock(timeout)?)
                };
                let clusters = service.consolidation().find_clusters(max_items)?;
                service
                    .consolidation()
                    .execute(&clusters, p.dry_run, lock.as_ref())
            })
            .await?;
            to_value(&report)
        }
        "maintenance.run" => {
            let p: MaintenanceParams = parse_params(params)?;
            let report = blocking(move || service.run_maintenance(p.dry_run, timeout)).await?;
            to_value(&report)
        }
        "tracker.flush" => {
            let flushed = session.tracker.flush().await?;
            Ok(json!({ "flushed": flushed }))
        }
        _ => Err(JsonRpcError::method_not_found(method)),
    }
}

async fn initialize(state: &AppState, params: Option<Value>) -> RpcResult {
    let p: InitializeParams = parse_params(params)?;
    let store_path = p
        .store_path
        .unwrap_or_else(|| state.config.database_path.clone());

    let session = state
        .initialize(&store_path)
        .await
        .map_err(|e| JsonRpcError::new(super::types::TOOL_EXECUTION_ERROR, e.to_string()))?;

    Ok(json!({
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "storePath": session.store_path.display().to_string(),
        "methods": ENGINE_METHODS,
    }))
}

async fn memory_extract(
    service: Arc<MemoryService<Database>>,
    params: Option<Value>,
    timeout: std::time::Duration,
) -> RpcResult {
    let p: ExtractParams = parse_params(params)?;
    if p.store {
        let provenance = p.scope.provenance();
        let report = blocking(move || service.learn(&p.text, &provenance, timeout)).await?;
        to_value(&report)
    } else {
        let candidates = service.extract(&p.text);
        Ok(json!({ "candidates": candidates, "storedIds": [] }))
    }
}

async fn memory_store(
    service: Arc<MemoryService<Database>>,
    params: Option<Value>,
    timeout: std::time::Duration,
) -> RpcResult {
    let p: StoreParams = parse_params(params)?;

    let mut memory = NewMemory::new(p.content, p.memory_type.unwrap_or(MemoryType::Semantic))
        .with_provenance(&p.scope.provenance());
    memory.importance = p.importance;
    memory.confidence = p.confidence;
    memory.valid_to = p.valid_to;
    memory.entities = p.entities;
    memory.metadata = p.metadata;

    let id = blocking(move || service.remember(memory, timeout)).await?;
    Ok(json!({ "id": id }))
}

async fn memory_recall(session: &Arc<Session>, params: Option<Value>) -> RpcResult {
    let p: RecallParams = parse_params(params)?;
    let service = Arc::clone(&session.service);
    let tracker = Arc::clone(&session.tracker);

    let context = blocking(move || {
        let engine = service.recall_engine(Some(tracker));
        let strategy = match p.strategy.as_deref() {
            Some(name) => name.parse::<RecallStrategy>()?,
            None => engine.config().default_strategy,
        };
        let max_memories = p
            .max_memories
            .unwrap_or(engine.config().default_max_memories);
        let filters = RecallFilters {
            user_id: p.scope.user_id,
            agent_id: p.scope.agent_id,
            session_id: p.scope.session_id,
            memory_types: p.memory_types,
        };
        engine.recall(&p.prompt, strategy, max_memories, &filters)
    })
    .await?;
    to_value(&context)
}
