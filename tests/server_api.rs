use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use forum_wisdom::analytics::build_analytics;
use forum_wisdom::config::Config;
use forum_wisdom::engine::{EngineFactory, QueryAnswer, QueryEngine, QueryType};
use forum_wisdom::ingest::ThreadIngestor;
use forum_wisdom::models::{IngestionResult, Post, SearchHit, SearchOutput, ThreadMetadata};
use forum_wisdom::progress::ProgressReporter;
use forum_wisdom::server::{build_router, AppState, Collaborators};
use forum_wisdom::store::{
    ThreadStore, ANALYTICS_FILE, METADATA_FILE, POSTS_FILE, SUMMARY_FILE, TOPIC_INDEX_FILE,
};
use forum_wisdom::summary::{build_stored_summary, ThreadSummarizer};
use forum_wisdom::thread_key::ThreadKey;
use forum_wisdom::topics::TopicIndexer;

fn posts() -> Vec<Post> {
    [
        ("ann", "How do I keep my starter alive? It smells odd."),
        ("bob", "Feed it twice a day. The price of flour is low anyway."),
        ("ann", "Thanks, that fixed the problem."),
        ("cy", "I recommend rye flour for a stronger starter."),
    ]
    .iter()
    .enumerate()
    .map(|(i, (author, content))| Post {
        post_number: i as u64 + 1,
        author: author.to_string(),
        created_at: None,
        content: content.to_string(),
        likes: i as u64,
        page: 1,
    })
    .collect()
}

/// Write the artifacts a real ingestion would leave behind.
fn seed(store: &ThreadStore, key: &ThreadKey, url: &str) -> IngestionResult {
    let posts = posts();
    let metadata = ThreadMetadata {
        thread_key: key.clone(),
        url: url.to_string(),
        title: Some(format!("Thread {}", key)),
        total_pages: 1,
        total_posts: posts.len(),
        processed_at: Utc::now(),
    };
    let analytics = build_analytics(&metadata, &posts);
    store.ensure_dir(key).unwrap();
    store.write_json(key, POSTS_FILE, &posts).unwrap();
    store.write_json(key, ANALYTICS_FILE, &analytics).unwrap();
    store
        .write_json(key, SUMMARY_FILE, &build_stored_summary(&metadata, &posts, &analytics))
        .unwrap();
    store.write_json(key, METADATA_FILE, &metadata).unwrap();
    IngestionResult {
        thread_key: key.clone(),
        posts_count: posts.len(),
        analytics_summary: Some(analytics),
        from_cache: false,
    }
}

struct FakeIngestor {
    store: ThreadStore,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ThreadIngestor for FakeIngestor {
    async fn ingest(
        &self,
        url: &str,
        key: &ThreadKey,
        progress: &dyn ProgressReporter,
    ) -> anyhow::Result<IngestionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        progress.report("Downloading page 1").await;
        Ok(seed(&self.store, key, url))
    }

    async fn reprocess(
        &self,
        key: &ThreadKey,
        progress: &dyn ProgressReporter,
    ) -> anyhow::Result<IngestionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        progress.report("Parsing stored pages").await;
        Ok(seed(&self.store, key, "https://forum.example/t/reprocessed"))
    }
}

struct FakeEngine {
    key: ThreadKey,
}

#[async_trait]
impl QueryEngine for FakeEngine {
    async fn query(&self, prompt: &str) -> anyhow::Result<QueryAnswer> {
        let parts: Vec<anyhow::Result<String>> = vec![
            Ok(format!("Answer about {} ", self.key)),
            Ok(format!("for '{}'.", prompt)),
        ];
        Ok(QueryAnswer {
            analysis: None,
            context_posts: 2,
            query_type: QueryType::Retrieval,
            analytical_result: None,
            error: None,
            answer_stream: Some(futures::stream::iter(parts).boxed()),
        })
    }

    async fn search(&self, query: &str, top_k: usize) -> anyhow::Result<SearchOutput> {
        Ok(SearchOutput {
            results: vec![SearchHit {
                post_number: 4,
                author: "cy".into(),
                page: 1,
                score: 0.9,
                content: format!("match for {}", query),
            }],
            metadata: json!({"mode": "keyword", "top_k": top_k}),
        })
    }
}

struct FakeFactory {
    builds: Arc<AtomicUsize>,
}

#[async_trait]
impl EngineFactory for FakeFactory {
    async fn build(&self, key: &ThreadKey) -> anyhow::Result<Arc<dyn QueryEngine>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeEngine { key: key.clone() }))
    }
}

struct FakeSummarizer;

#[async_trait]
impl ThreadSummarizer for FakeSummarizer {
    async fn summarize(&self, key: &ThreadKey, max_posts: usize) -> anyhow::Result<Value> {
        Ok(json!({
            "summary": format!("Summary of {}", key),
            "posts_used": max_posts.min(4),
            "model": "fake",
        }))
    }
}

struct TestServer {
    base: String,
    state: AppState,
    ingests: Arc<AtomicUsize>,
    builds: Arc<AtomicUsize>,
    client: reqwest::Client,
    _tmp: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.base_dir = tmp.path().to_path_buf();
        config.cache.capacity = 4;

        let store = ThreadStore::new(config.storage.threads_dir());
        let ingests = Arc::new(AtomicUsize::new(0));
        let builds = Arc::new(AtomicUsize::new(0));
        let collaborators = Collaborators {
            ingestor: Arc::new(FakeIngestor {
                store,
                calls: ingests.clone(),
            }),
            engines: Arc::new(FakeFactory {
                builds: builds.clone(),
            }),
            summarizer: Arc::new(FakeSummarizer),
        };
        let state = AppState::new(config, collaborators);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            state,
            ingests,
            builds,
            client: reqwest::Client::new(),
            _tmp: tmp,
        }
    }

    fn key(&self, raw: &str) -> ThreadKey {
        ThreadKey::parse(raw).unwrap()
    }

    fn seed(&self, raw: &str) -> ThreadKey {
        let key = self.key(raw);
        seed(self.state.store(), &key, &format!("https://forum.example/t/{}", raw));
        key
    }

    async fn ask(&self, body: Value) -> (u16, String) {
        let resp = self
            .client
            .post(format!("{}/ask", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.text().await.unwrap())
    }

    async fn get_json(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn post_json(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn delete_thread(&self, body: &str) -> (u16, String) {
        let resp = self
            .client
            .post(format!("{}/delete_thread", self.base))
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.text().await.unwrap())
    }
}

fn error_message(body: &Value) -> &str {
    body["error"]["message"].as_str().unwrap_or_default()
}

// ============ /ask ============

#[tokio::test]
async fn ask_validation_rejects_before_any_work() {
    let server = TestServer::start().await;
    server.seed("abc123");

    let cases = [
        (json!({"url": "http://forum.example/t/1"}), "Error: Prompt is required"),
        (json!({"prompt": "x"}), "Error: Either URL or existing thread must be provided"),
        (
            json!({"prompt": "x", "url": "http://forum.example/t/1", "existing_thread": "abc123"}),
            "Error: Cannot specify both URL and existing thread",
        ),
        (
            json!({"prompt": "x", "url": "http://forum.example/t/1", "reprocess": true}),
            "Error: Cannot reprocess when creating new thread from URL.",
        ),
        (json!({"prompt": "x", "existing_thread": "../../etc"}), "Error: Invalid thread key"),
    ];
    for (body, expected) in cases {
        let (status, text) = server.ask(body).await;
        assert_eq!(status, 400);
        assert_eq!(text, expected);
    }

    let resp = server
        .client
        .post(format!("{}/ask", server.base))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    assert_eq!(resp.text().await.unwrap(), "Error: No JSON data provided");

    assert_eq!(server.ingests.load(Ordering::SeqCst), 0);
    assert_eq!(server.builds.load(Ordering::SeqCst), 0);
    assert!(server.state.cache().is_empty());
}

#[tokio::test]
async fn ask_new_thread_streams_progress_then_answer() {
    let server = TestServer::start().await;

    let (status, text) = server
        .ask(json!({"prompt": "summarize", "url": "http://forum.example/t/123"}))
        .await;
    assert_eq!(status, 200);
    assert!(text.starts_with("Creating new thread from: http://forum.example/t/123\n"));
    assert!(text.contains("PROGRESS: Downloading page 1\n"));
    assert!(text.contains("Posts processed: 4\n"));
    assert!(text.contains("Participants: 3\n"));
    assert!(text.contains("Most active: ann (2 posts)\n"));
    assert!(text.contains("Analyzing query and searching thread...\n\n"));
    assert!(text.ends_with("for 'summarize'."));
    assert_eq!(server.ingests.load(Ordering::SeqCst), 1);

    let (_, threads) = server.get_json("/threads").await;
    assert_eq!(threads["count"], 1);
    assert_eq!(threads["threads"][0]["url"], "http://forum.example/t/123");
}

#[tokio::test]
async fn ask_existing_thread_skips_ingestion() {
    let server = TestServer::start().await;
    server.seed("abc123");

    let (status, text) = server
        .ask(json!({"prompt": "What flour?", "existing_thread": "abc123"}))
        .await;
    assert_eq!(status, 200);
    assert!(text.starts_with("Using existing thread: abc123\n"));
    assert!(!text.contains("PROGRESS:"));
    assert!(text.ends_with("Answer about abc123 for 'What flour?'."));

    server
        .ask(json!({"prompt": "what FLOUR?", "existing_thread": "abc123"}))
        .await;
    assert_eq!(server.ingests.load(Ordering::SeqCst), 0);
    assert_eq!(server.builds.load(Ordering::SeqCst), 1);

    let (status, history) = server.get_json("/thread/abc123/questions").await;
    assert_eq!(status, 200);
    assert_eq!(history["count"], 1);
    assert_eq!(history["questions"][0]["question"], "what FLOUR?");
    assert_eq!(history["questions"][0]["times_asked"], 2);

    let resp = server
        .client
        .delete(format!("{}/thread/abc123/questions", server.base))
        .send()
        .await
        .unwrap();
    let cleared: Value = resp.json().await.unwrap();
    assert_eq!(cleared["message"], "Question history cleared successfully");
    let (_, history) = server.get_json("/thread/abc123/questions").await;
    assert_eq!(history["count"], 0);
}

#[tokio::test]
async fn ask_reprocess_rebuilds_and_refreshes_engine() {
    let server = TestServer::start().await;
    server.seed("abc123");
    server
        .ask(json!({"prompt": "q", "existing_thread": "abc123"}))
        .await;

    let (status, text) = server
        .ask(json!({"prompt": "q", "existing_thread": "abc123", "reprocess": true}))
        .await;
    assert_eq!(status, 200);
    assert!(text.starts_with("Reprocessing existing thread: abc123\n"));
    assert!(text.contains("Thread reprocessed successfully!\n"));
    assert_eq!(server.ingests.load(Ordering::SeqCst), 1);
    assert_eq!(server.builds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ask_missing_thread_is_single_error_line() {
    let server = TestServer::start().await;

    let (status, text) = server
        .ask(json!({"prompt": "x", "existing_thread": "ghost"}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(
        text,
        "Error: Thread 'ghost' not found. Please delete and recreate with URL.\n"
    );
    assert!(server.state.cache().is_empty());
}

// ============ /delete_thread ============

#[tokio::test]
async fn delete_invalidates_only_that_thread() {
    let server = TestServer::start().await;
    let abc = server.seed("abc123");
    let def = server.seed("def456");
    for key in ["abc123", "def456"] {
        server
            .ask(json!({"prompt": "q", "existing_thread": key}))
            .await;
    }
    assert_eq!(server.state.cache().len(), 2);

    let (status, text) = server.delete_thread(r#"{"thread_key": "abc123"}"#).await;
    assert_eq!(status, 200);
    assert_eq!(text, "Thread 'abc123' deleted successfully");
    assert!(!server.state.cache().contains(&abc));
    assert!(server.state.cache().contains(&def));
    assert!(!server.state.store().exists(&abc));

    let (_, text) = server
        .ask(json!({"prompt": "again", "existing_thread": "def456"}))
        .await;
    assert!(text.ends_with("Answer about def456 for 'again'."));
    assert_eq!(server.builds.load(Ordering::SeqCst), 2);

    let (status, text) = server.delete_thread(r#"{"thread_key": "abc123"}"#).await;
    assert_eq!((status, text.as_str()), (404, "Error: Thread not found"));
    let (status, text) = server.delete_thread(r#"{"thread_key": "../def456"}"#).await;
    assert_eq!((status, text.as_str()), (400, "Error: Invalid thread key"));
    let (status, text) = server.delete_thread(r#"{}"#).await;
    assert_eq!((status, text.as_str()), (400, "Error: thread_key is required"));
    let (status, text) = server.delete_thread("").await;
    assert_eq!((status, text.as_str()), (400, "Error: No JSON data provided"));
}

// ============ Thread data ============

#[tokio::test]
async fn summaries_and_analytics() {
    let server = TestServer::start().await;
    server.seed("abc123");

    let (status, summary) = server.get_json("/thread/abc123/summary").await;
    assert_eq!(status, 200);
    assert_eq!(summary["kind"], "extractive");
    assert_eq!(summary["total_posts"], 4);

    let (status, generated) = server
        .post_json("/thread/abc123/summary", json!({"max_posts": 5}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(generated["thread_key"], "abc123");
    assert_eq!(generated["posts_used"], 4);

    let (status, body) = server
        .post_json("/thread/abc123/summary", json!({"max_posts": 30}))
        .await;
    assert_eq!(status, 400);
    assert_eq!(error_message(&body), "max_posts must be an integer between 5 and 25");

    let (status, body) = server.post_json("/thread/ghost/summary", json!({})).await;
    assert_eq!(status, 404);
    assert_eq!(error_message(&body), "Thread not found");

    let (status, analytics) = server.get_json("/thread/abc123/analytics").await;
    assert_eq!(status, 200);
    assert_eq!(analytics["participants"]["total_participants"], 3);

    let bare = server.key("bare");
    server.state.store().ensure_dir(&bare).unwrap();
    let (status, body) = server.get_json("/thread/bare/summary").await;
    assert_eq!(status, 404);
    assert_eq!(error_message(&body), "Thread summary not available");
    let (status, body) = server.get_json("/thread/bare/analytics").await;
    assert_eq!(status, 404);
    assert_eq!(error_message(&body), "Analytics not found");

    let (status, body) = server.get_json("/thread/..%2Fetc/analytics").await;
    assert_eq!(status, 400);
    assert_eq!(error_message(&body), "Invalid thread key");
}

#[tokio::test]
async fn search_thread() {
    let server = TestServer::start().await;
    server.seed("abc123");

    let (status, body) = server
        .post_json("/search/abc123", json!({"query": "rye", "top_k": 500}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["query"], "rye");
    assert_eq!(body["thread_key"], "abc123");
    assert_eq!(body["results"][0]["post_number"], 4);
    assert_eq!(body["metadata"]["top_k"], 100);

    let (status, body) = server.post_json("/search/abc123", json!({"query": " "})).await;
    assert_eq!(status, 400);
    assert_eq!(error_message(&body), "Query is required");

    let (status, _) = server.post_json("/search/ghost", json!({"query": "rye"})).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn topic_endpoints() {
    let server = TestServer::start().await;
    let key = server.seed("abc123");
    server.seed("plain");
    let index = TopicIndexer::new(Vec::new()).build(&key, &posts());
    server
        .state
        .store()
        .write_json(&key, TOPIC_INDEX_FILE, &index)
        .unwrap();

    let (status, body) = server.get_json("/thread/abc123/topics").await;
    assert_eq!(status, 200);
    assert_eq!(body["total_posts"], 4);

    let (status, body) = server.get_json("/thread/abc123/topics/summary").await;
    assert_eq!(status, 200);
    assert!(body["total_topics"].as_u64().unwrap() > 0);

    let (status, body) = server.get_json("/thread/abc123/topics/pricing").await;
    assert_eq!(status, 200);
    assert_eq!(body["match_count"], 1);
    assert_eq!(body["matches"][0]["post_number"], 2);

    let (status, body) = server.get_json("/thread/abc123/topics/no-such-topic").await;
    assert_eq!(status, 200);
    assert_eq!(body["message"], "No matches found for this topic");

    let (status, body) = server.get_json("/thread/plain/topics").await;
    assert_eq!(status, 404);
    assert_eq!(error_message(&body), "Topic index not found for this thread");

    let (status, body) = server.get_json("/topics/search/pricing?limit=5").await;
    assert_eq!(status, 200);
    assert_eq!(body["total_matches"], 1);
    assert_eq!(body["limit"], 5);
    assert_eq!(body["matches"][0]["thread_key"], "abc123");

    let (status, body) = server.get_json("/topics/available").await;
    assert_eq!(status, 200);
    assert!(body["total_topics"].as_u64().unwrap() >= 1);

    let (status, body) = server.get_json("/topics/cache/stats").await;
    assert_eq!(status, 200);
    assert_eq!(body["threads_with_index"], 1);
}

// ============ Introspection ============

#[tokio::test]
async fn health_and_stats() {
    let server = TestServer::start().await;
    server.seed("abc123");
    server
        .ask(json!({"prompt": "q", "existing_thread": "abc123"}))
        .await;

    let (status, health) = server.get_json("/health").await;
    assert_eq!(status, 200);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["threads_available"], 1);
    assert_eq!(health["features"]["topic_index"], true);
    assert_eq!(health["processing_stats"]["threads_reused"], 1);
    assert!(health["config"]["threads_dir"].is_string());

    let (status, stats) = server.get_json("/stats").await;
    assert_eq!(status, 200);
    assert_eq!(stats["queries"]["cache_size"], 1);
    assert_eq!(stats["queries"]["max_cache_size"], 4);
    assert_eq!(stats["storage"]["threads"], 1);
    assert!(stats["storage"]["bytes"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn index_page_and_unknown_routes() {
    let server = TestServer::start().await;
    server.seed("abc123");

    let resp = server.client.get(&server.base).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let html = resp.text().await.unwrap();
    assert!(html.contains("<code>abc123</code>"));

    let (status, body) = server.get_json("/no/such/route").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");
}
