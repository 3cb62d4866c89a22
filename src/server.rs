//! HTTP server.
//!
//! Thin axum layer over the orchestration core: every handler validates its
//! input, dispatches to one component and shapes the response. All shared
//! state lives in [`AppState`], built once at startup.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | HTML list of ingested threads |
//! | `POST` | `/ask` | Ingest or reuse a thread, then stream an answer (`text/plain`) |
//! | `POST` | `/delete_thread` | Delete a thread and its cached engine |
//! | `GET`  | `/threads` | Thread listing with metadata |
//! | `GET`  | `/thread/{key}/summary` | Stored extractive summary |
//! | `POST` | `/thread/{key}/summary` | Generate a summary with the chat model |
//! | `GET`  | `/thread/{key}/analytics` | Stored analytics |
//! | `GET` `DELETE` | `/thread/{key}/questions` | Question history |
//! | `GET`  | `/thread/{key}/topics` | Topic index |
//! | `GET`  | `/thread/{key}/topics/summary` | Matched topics by count |
//! | `GET`  | `/thread/{key}/topics/{id}` | Matches for one topic |
//! | `POST` | `/search/{key}` | Rank posts without generating an answer |
//! | `GET`  | `/topics/available` | Configured topic definitions |
//! | `GET`  | `/topics/search/{id}` | One topic across all threads |
//! | `GET`  | `/topics/cache/stats` | Topic index cache counters |
//! | `GET`  | `/health` | Liveness, features, memory and config snapshot |
//! | `GET`  | `/stats` | Processing, cache and storage statistics |
//!
//! # Error Contract
//!
//! `/ask` and `/delete_thread` answer errors in plain text (`Error: <message>`).
//! Everything else uses JSON:
//!
//! ```json
//! { "error": { "code": "not_found", "message": "Thread not found" } }
//! ```
//!
//! Unexpected failures (including handler panics) get code `internal`, a
//! generic message and an `error_id` that is logged with the full error.

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderName, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::cache::EngineCache;
use crate::config::Config;
use crate::coordinator::IngestionCoordinator;
use crate::embedding::create_provider;
use crate::engine::{EngineFactory, ThreadEngineFactory};
use crate::fetch::PageFetcher;
use crate::history::QuestionHistory;
use crate::ingest::{ForumIngestor, ThreadIngestor};
use crate::llm::{ChatModel, OllamaChat};
use crate::models::IngestionRequest;
use crate::orchestrator::Orchestrator;
use crate::store::{ThreadStore, ANALYTICS_FILE, SUMMARY_FILE};
use crate::summary::{
    LlmSummarizer, ThreadSummarizer, DEFAULT_SUMMARY_POSTS, MAX_SUMMARY_POSTS, MIN_SUMMARY_POSTS,
};
use crate::thread_key::ThreadKey;
use crate::topics::{TopicIndexer, TopicStore};

const GENERIC_ERROR: &str = "An unexpected error occurred";
const DEFAULT_SEARCH_TOP_K: u64 = 10;
const DEFAULT_TOPIC_SEARCH_LIMIT: usize = 50;

/// The pluggable parts of the server.
pub struct Collaborators {
    pub ingestor: Arc<dyn ThreadIngestor>,
    pub engines: Arc<dyn EngineFactory>,
    pub summarizer: Arc<dyn ThreadSummarizer>,
}

impl Collaborators {
    /// Default collaborators: forum ingestor, Ollama chat and embeddings.
    pub fn from_config(config: &Config, store: &ThreadStore) -> anyhow::Result<Self> {
        let chat: Arc<dyn ChatModel> = Arc::new(OllamaChat::new(&config.llm)?);
        let embedder = create_provider(&config.embedding, &config.llm.base_url)?;
        let indexer = config
            .features
            .topic_index
            .then(|| TopicIndexer::new(config.topics.clone()));

        let ingestor = ForumIngestor::new(
            store.clone(),
            PageFetcher::new(&config.ingest)?,
            embedder.clone(),
            config.embedding.batch_size,
            indexer,
            config.ingest.max_pages,
        );
        let engines =
            ThreadEngineFactory::new(store.clone(), embedder, chat.clone(), config.retrieval.clone());
        let summarizer = LlmSummarizer::new(store.clone(), chat);

        Ok(Self {
            ingestor: Arc::new(ingestor),
            engines: Arc::new(engines),
            summarizer: Arc::new(summarizer),
        })
    }
}

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    store: ThreadStore,
    cache: Arc<EngineCache>,
    coordinator: Arc<IngestionCoordinator>,
    orchestrator: Orchestrator,
    history: Arc<QuestionHistory>,
    summarizer: Arc<dyn ThreadSummarizer>,
    topics: Arc<TopicStore>,
    indexer: Arc<TopicIndexer>,
    started: Instant,
}

impl AppState {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let store = ThreadStore::new(config.storage.threads_dir());
        let cache = Arc::new(EngineCache::new(config.cache.capacity, collaborators.engines));
        let coordinator = Arc::new(IngestionCoordinator::new(
            store.clone(),
            collaborators.ingestor,
            cache.clone(),
        ));
        let history = Arc::new(QuestionHistory::new(
            store.clone(),
            config.history.max_questions,
            config.features.question_history,
        ));
        let orchestrator = Orchestrator::new(
            coordinator.clone(),
            cache.clone(),
            history.clone(),
            config.streaming.channel_capacity,
        );

        Self {
            topics: Arc::new(TopicStore::new(store.clone())),
            indexer: Arc::new(TopicIndexer::new(config.topics.clone())),
            config: Arc::new(config),
            store,
            cache,
            coordinator,
            orchestrator,
            history,
            summarizer: collaborators.summarizer,
            started: Instant::now(),
        }
    }

    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    pub fn cache(&self) -> &EngineCache {
        &self.cache
    }

    fn internal(&self, err: impl std::fmt::Display) -> AppError {
        AppError::internal(err, self.config.server.debug)
    }

    /// Validate `raw` and require the thread directory to exist.
    fn existing_thread(&self, raw: &str) -> Result<ThreadKey, AppError> {
        let key = parse_key(raw)?;
        if !self.store.exists(&key) {
            return Err(AppError::not_found("Thread not found"));
        }
        Ok(key)
    }
}

/// Starts the HTTP server on `[server].bind` with the default collaborators.
///
/// Runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store = ThreadStore::new(config.storage.threads_dir());
    std::fs::create_dir_all(store.root()).with_context(|| {
        format!("Failed to create threads directory: {}", store.root().display())
    })?;

    let collaborators = Collaborators::from_config(config, &store)?;
    let state = AppState::new(config.clone(), collaborators);
    log_startup(config, &store);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, "server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

fn log_startup(config: &Config, store: &ThreadStore) {
    let threads = store.list_keys().map(|k| k.len()).unwrap_or(0);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        base_dir = %config.storage.base_dir.display(),
        threads_dir = %store.root().display(),
        llm_url = %config.llm.base_url,
        chat_model = %config.llm.chat_model,
        embed_model = %embed_model(config),
        topic_index = config.features.topic_index,
        question_history = config.features.question_history,
        summaries = config.features.summaries,
        cache_capacity = config.cache.capacity,
        threads,
        "forum-wisdom starting"
    );
}

fn embed_model(config: &Config) -> String {
    if config.embedding.is_enabled() {
        config
            .embedding
            .model
            .clone()
            .unwrap_or_else(|| config.embedding.provider.clone())
    } else {
        "disabled".to_string()
    }
}

pub fn build_router(state: AppState) -> Router {
    let debug = state.config.server.debug;
    let cors = CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods(AnyOrigin)
        .allow_headers(AnyOrigin);

    Router::new()
        .route("/", get(handle_index))
        .route("/ask", post(handle_ask))
        .route("/delete_thread", post(handle_delete))
        .route("/threads", get(handle_threads))
        .route(
            "/thread/{key}/summary",
            get(handle_get_summary).post(handle_generate_summary),
        )
        .route("/thread/{key}/analytics", get(handle_analytics))
        .route(
            "/thread/{key}/questions",
            get(handle_questions).delete(handle_clear_questions),
        )
        .route("/thread/{key}/topics", get(handle_topic_index))
        .route("/thread/{key}/topics/summary", get(handle_topic_summary))
        .route("/thread/{key}/topics/{topic_id}", get(handle_topic_matches))
        .route("/search/{key}", post(handle_search))
        .route("/topics/available", get(handle_topics_available))
        .route("/topics/search/{topic_id}", get(handle_topic_search))
        .route("/topics/cache/stats", get(handle_topic_cache_stats))
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .fallback(handle_not_found)
        .layer(CatchPanicLayer::custom(
            move |panic: Box<dyn Any + Send + 'static>| panic_response(panic, debug),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_id: Option<String>,
}

/// Error type that converts into a JSON HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    error_id: Option<String>,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
            error_id: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
            error_id: None,
        }
    }

    /// Logs `err` under a fresh correlation id. The message only reaches
    /// the client in debug mode.
    pub fn internal(err: impl std::fmt::Display, debug: bool) -> Self {
        let error_id = uuid::Uuid::new_v4().to_string();
        let detail = format!("{:#}", err);
        tracing::error!(error_id = %error_id, error = %detail, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: if debug { detail } else { GENERIC_ERROR.to_string() },
            error_id: Some(error_id),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                error_id: self.error_id,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn panic_response(panic: Box<dyn Any + Send + 'static>, debug: bool) -> Response {
    let message = panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "handler panicked".to_string());
    AppError::internal(format!("panic: {}", message), debug).into_response()
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    (status, format!("Error: {}", message)).into_response()
}

fn parse_key(raw: &str) -> Result<ThreadKey, AppError> {
    ThreadKey::parse(raw).map_err(|_| AppError::bad_request("Invalid thread key"))
}

async fn handle_not_found() -> AppError {
    AppError::not_found("Not found")
}

// ============ GET / ============

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

async fn handle_index(State(state): State<AppState>) -> Result<Html<String>, AppError> {
    let threads = state.store.list_threads().map_err(|e| state.internal(e))?;

    let mut items = String::new();
    for thread in &threads {
        let title = thread.title.as_deref().unwrap_or("(untitled)");
        items.push_str(&format!(
            "      <li><code>{}</code> {} ({} posts)</li>\n",
            escape_html(thread.thread_key.as_str()),
            escape_html(title),
            thread.posts_count.unwrap_or(0)
        ));
    }
    if threads.is_empty() {
        items.push_str("      <li>No threads yet. POST a URL to /ask to create one.</li>\n");
    }

    Ok(Html(format!(
        "<!DOCTYPE html>\n<html>\n  <head><meta charset=\"utf-8\"><title>Forum Wisdom</title></head>\n  \
         <body>\n    <h1>Forum Wisdom</h1>\n    <h2>Available threads ({})</h2>\n    <ul>\n{}    </ul>\n  \
         </body>\n</html>\n",
        threads.len(),
        items
    )))
}

// ============ POST /ask ============

#[derive(Debug, Default, Deserialize)]
struct AskBody {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    existing_thread: Option<String>,
    #[serde(default)]
    reprocess: bool,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Checks, in order: prompt present, exactly one thread source, valid key,
/// no reprocess of a URL.
fn validate_ask(body: AskBody) -> Result<(String, IngestionRequest), &'static str> {
    let prompt = non_blank(body.prompt).ok_or("Prompt is required")?;
    let request = match (non_blank(body.url), non_blank(body.existing_thread)) {
        (None, None) => return Err("Either URL or existing thread must be provided"),
        (Some(_), Some(_)) => return Err("Cannot specify both URL and existing thread"),
        (None, Some(raw)) => {
            let key = ThreadKey::parse(&raw).map_err(|_| "Invalid thread key")?;
            if body.reprocess {
                IngestionRequest::Reprocess { key }
            } else {
                IngestionRequest::Existing { key }
            }
        }
        (Some(url), None) => {
            if body.reprocess {
                return Err("Cannot reprocess when creating new thread from URL.");
            }
            IngestionRequest::Fresh { url }
        }
    };
    Ok((prompt, request))
}

async fn handle_ask(State(state): State<AppState>, body: Bytes) -> Response {
    let Ok(body) = serde_json::from_slice::<AskBody>(&body) else {
        tracing::warn!("ask rejected: no JSON body");
        return plain_error(StatusCode::BAD_REQUEST, "No JSON data provided");
    };
    let (prompt, request) = match validate_ask(body) {
        Ok(valid) => valid,
        Err(message) => {
            tracing::warn!(reason = message, "ask rejected");
            return plain_error(StatusCode::BAD_REQUEST, message);
        }
    };

    let stream = state.orchestrator.ask(prompt, request);
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

// ============ POST /delete_thread ============

#[derive(Deserialize)]
struct DeleteBody {
    #[serde(default)]
    thread_key: Option<String>,
}

async fn handle_delete(State(state): State<AppState>, body: Bytes) -> Response {
    let Ok(body) = serde_json::from_slice::<DeleteBody>(&body) else {
        return plain_error(StatusCode::BAD_REQUEST, "No JSON data provided");
    };
    let Some(raw) = non_blank(body.thread_key) else {
        return plain_error(StatusCode::BAD_REQUEST, "thread_key is required");
    };
    let Ok(key) = ThreadKey::parse(&raw) else {
        tracing::warn!("delete rejected: invalid thread key");
        return plain_error(StatusCode::BAD_REQUEST, "Invalid thread key");
    };

    match state.store.delete(&key) {
        Ok(true) => {
            // History and topic index lived in the directory; drop what is
            // still held in memory.
            let evicted = state.cache.invalidate(&key);
            state.topics.forget(&key);
            tracing::info!(thread_key = %key, evicted, "thread deleted");
            format!("Thread '{}' deleted successfully", key).into_response()
        }
        Ok(false) => plain_error(StatusCode::NOT_FOUND, "Thread not found"),
        Err(e) => state.internal(e).into_response(),
    }
}

// ============ GET /threads ============

async fn handle_threads(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let threads = state.store.list_threads().map_err(|e| state.internal(e))?;
    Ok(Json(json!({
        "count": threads.len(),
        "threads": threads,
    })))
}

// ============ /thread/{key}/summary ============

async fn handle_get_summary(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, AppError> {
    let key = state.existing_thread(&raw)?;
    let summary: Option<Value> = state
        .store
        .read_json(&key, SUMMARY_FILE)
        .map_err(|e| state.internal(e))?;
    summary
        .map(Json)
        .ok_or_else(|| AppError::not_found("Thread summary not available"))
}

fn requested_max_posts(body: &Bytes) -> Result<usize, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(DEFAULT_SUMMARY_POSTS as usize);
    }
    let params: Value =
        serde_json::from_slice(body).map_err(|_| AppError::bad_request("Invalid JSON body"))?;
    match params.get("max_posts") {
        None | Some(Value::Null) => Ok(DEFAULT_SUMMARY_POSTS as usize),
        Some(value) => value
            .as_u64()
            .filter(|n| (MIN_SUMMARY_POSTS..=MAX_SUMMARY_POSTS).contains(n))
            .map(|n| n as usize)
            .ok_or_else(|| {
                AppError::bad_request(format!(
                    "max_posts must be an integer between {} and {}",
                    MIN_SUMMARY_POSTS, MAX_SUMMARY_POSTS
                ))
            }),
    }
}

async fn handle_generate_summary(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let key = parse_key(&raw)?;
    let max_posts = requested_max_posts(&body)?;
    if !state.config.features.summaries {
        return Err(AppError::not_found("Thread summaries are disabled"));
    }
    let key = state.existing_thread(key.as_str())?;

    let mut summary = state
        .summarizer
        .summarize(&key, max_posts)
        .await
        .map_err(|e| state.internal(e))?;
    if let Value::Object(map) = &mut summary {
        map.insert("thread_key".into(), json!(key));
    }
    Ok(Json(summary))
}

// ============ GET /thread/{key}/analytics ============

async fn handle_analytics(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, AppError> {
    let key = state.existing_thread(&raw)?;
    let analytics: Option<Value> = state
        .store
        .read_json(&key, ANALYTICS_FILE)
        .map_err(|e| state.internal(e))?;
    analytics
        .map(Json)
        .ok_or_else(|| AppError::not_found("Analytics not found"))
}

// ============ /thread/{key}/questions ============

async fn handle_questions(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, AppError> {
    let key = state.existing_thread(&raw)?;
    let questions = state.history.questions(&key).map_err(|e| state.internal(e))?;
    Ok(Json(json!({
        "thread_key": key,
        "count": questions.len(),
        "questions": questions,
    })))
}

async fn handle_clear_questions(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, AppError> {
    let key = state.existing_thread(&raw)?;
    state.history.clear(&key).map_err(|e| state.internal(e))?;
    Ok(Json(json!({
        "thread_key": key,
        "message": "Question history cleared successfully",
    })))
}

// ============ POST /search/{key} ============

async fn handle_search(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let key = parse_key(&raw)?;
    let params: Value = serde_json::from_slice(&body)
        .ok()
        .filter(Value::is_object)
        .ok_or_else(|| AppError::bad_request("No JSON data provided"))?;
    let query = params
        .get("query")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| AppError::bad_request("Query is required"))?
        .to_string();
    let top_k = match params.get("top_k") {
        None | Some(Value::Null) => DEFAULT_SEARCH_TOP_K,
        Some(v) => v
            .as_u64()
            .filter(|n| *n > 0)
            .ok_or_else(|| AppError::bad_request("top_k must be a positive integer"))?,
    };
    let top_k = (top_k as usize).min(state.config.retrieval.max_search_top_k);
    let key = state.existing_thread(key.as_str())?;

    let engine = state
        .cache
        .get_or_create(&key)
        .await
        .map_err(|e| state.internal(e))?;
    let output = engine
        .search(&query, top_k)
        .await
        .map_err(|e| state.internal(e))?;

    Ok(Json(json!({
        "results": output.results,
        "metadata": output.metadata,
        "query": query,
        "thread_key": key,
    })))
}

// ============ Topics ============

const NO_TOPIC_INDEX: &str = "Topic index not found for this thread";

async fn handle_topic_index(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, AppError> {
    let key = state.existing_thread(&raw)?;
    let index = state
        .topics
        .load(&key)
        .map_err(|e| state.internal(e))?
        .ok_or_else(|| AppError::not_found(NO_TOPIC_INDEX))?;
    Ok(Json(json!(*index)))
}

async fn handle_topic_summary(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Json<Value>, AppError> {
    let key = state.existing_thread(&raw)?;
    let rows = state
        .topics
        .summary(&key)
        .map_err(|e| state.internal(e))?
        .ok_or_else(|| AppError::not_found(NO_TOPIC_INDEX))?;
    Ok(Json(json!({
        "thread_key": key,
        "total_topics": rows.len(),
        "topics": rows,
    })))
}

async fn handle_topic_matches(
    State(state): State<AppState>,
    Path((raw, topic_id)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    let key = state.existing_thread(&raw)?;
    if !state.topics.has_index(&key) {
        return Err(AppError::not_found(NO_TOPIC_INDEX));
    }
    let matches = state
        .topics
        .matches(&key, &topic_id)
        .map_err(|e| state.internal(e))?;

    if matches.is_empty() {
        return Ok(Json(json!({
            "topic_id": topic_id,
            "thread_key": key,
            "matches": [],
            "message": "No matches found for this topic",
        })));
    }
    Ok(Json(json!({
        "topic_id": topic_id,
        "thread_key": key,
        "match_count": matches.len(),
        "matches": matches,
    })))
}

#[derive(Deserialize)]
struct TopicSearchParams {
    limit: Option<usize>,
}

async fn handle_topic_search(
    State(state): State<AppState>,
    Path(topic_id): Path<String>,
    Query(params): Query<TopicSearchParams>,
) -> Result<Json<Value>, AppError> {
    if !state.indexer.available().iter().any(|t| t.id == topic_id) {
        return Err(AppError::not_found(format!("Topic '{}' not found", topic_id)));
    }
    let limit = params.limit.unwrap_or(DEFAULT_TOPIC_SEARCH_LIMIT).max(1);
    let matches = state
        .topics
        .search_across_threads(&topic_id, limit)
        .map_err(|e| state.internal(e))?;
    Ok(Json(json!({
        "topic_id": topic_id,
        "total_matches": matches.len(),
        "limit": limit,
        "matches": matches,
    })))
}

async fn handle_topics_available(State(state): State<AppState>) -> Json<Value> {
    let topics = state.indexer.available();
    Json(json!({
        "total_topics": topics.len(),
        "topics": topics,
    }))
}

async fn handle_topic_cache_stats(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let stats = state.topics.stats().map_err(|e| state.internal(e))?;
    Ok(Json(json!(stats)))
}

// ============ GET /health, GET /stats ============

/// Resident set size in MB, from `/proc/self/status`. `None` off Linux.
fn rss_mb() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let kb: f64 = status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))?
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some((kb / 1024.0 * 10.0).round() / 10.0)
}

async fn handle_health(State(state): State<AppState>) -> Json<Value> {
    let threads_available = state.store.list_keys().map(|k| k.len()).unwrap_or(0);
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "features": state.config.features,
        "threads_available": threads_available,
        "processing_stats": state.coordinator.stats(),
        "memory_status": { "rss_mb": rss_mb() },
        "config": {
            "ollama_url": state.config.llm.base_url,
            "chat_model": state.config.llm.chat_model,
            "embed_model": embed_model(&state.config),
            "threads_dir": state.store.root().display().to_string(),
        },
    }))
}

async fn handle_stats(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let (threads, bytes) = state.store.disk_usage().map_err(|e| state.internal(e))?;
    let uptime_hours = state.started.elapsed().as_secs_f64() / 3600.0;
    Ok(Json(json!({
        "processing": state.coordinator.stats(),
        "queries": {
            "cache_size": state.cache.len(),
            "max_cache_size": state.cache.capacity(),
        },
        "active_processors": state.cache.len(),
        "uptime_hours": (uptime_hours * 1000.0).round() / 1000.0,
        "storage": {
            "threads": threads,
            "bytes": bytes,
        },
    })))
}
