//! Streaming `/ask` orchestration.
//!
//! Each request gets one background task and one bounded channel. The task
//! runs the ingestion coordinator, then the query phase, writing every line
//! of the response into the channel; the response body drains the channel
//! until the task drops its sender.
//!
//! ```text
//! task:    coordinator.run ─▶ "Analyzing query..." ─▶ cache.get_or_create
//!              │                                       ─▶ engine.query
//!              │                                       ─▶ analysis hints
//!              ▼                                       ─▶ answer chunks
//!          StreamSender ══ bounded mpsc ══▶ response body
//! ```
//!
//! Failures never escape as HTTP errors once the body has started: each one
//! becomes a single trailing error line and the stream ends. A client that
//! disconnects stops reading; ingestion still runs to completion so its
//! artifacts are there for the next request, but the answer stream is
//! abandoned as soon as nobody is listening.

use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use crate::cache::EngineCache;
use crate::coordinator::IngestionCoordinator;
use crate::engine::{QueryAnswer, QueryType};
use crate::history::QuestionHistory;
use crate::logging::truncate_for_log;
use crate::models::IngestionRequest;
use crate::progress::StreamSender;
use crate::thread_key::ThreadKey;

pub const ANALYZING_MARKER: &str = "Analyzing query and searching thread...\n\n";
pub const NO_RESPONSE: &str = "Error: No response generated from query processor.\n";
pub const PROCESSING_FAILED: &str = "Error: Thread processing failed.\n";

/// Everything after a failure is dropped; this is the line that replaces it.
pub fn error_line(message: impl std::fmt::Display) -> String {
    format!("\n\nError: {}\n", message)
}

/// Completion figures of an answered query, logged once the answer ends.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerStats {
    /// Seconds since the request was accepted, ingestion included.
    pub elapsed_secs: f64,
    pub chars: usize,
    pub query_type: QueryType,
    /// Posts analyzed for analytical queries, context posts otherwise.
    pub posts: usize,
}

#[derive(Clone)]
pub struct Orchestrator {
    coordinator: Arc<IngestionCoordinator>,
    cache: Arc<EngineCache>,
    history: Arc<QuestionHistory>,
    channel_capacity: usize,
}

impl Orchestrator {
    pub fn new(
        coordinator: Arc<IngestionCoordinator>,
        cache: Arc<EngineCache>,
        history: Arc<QuestionHistory>,
        channel_capacity: usize,
    ) -> Self {
        Self {
            coordinator,
            cache,
            history,
            channel_capacity,
        }
    }

    /// Start answering `prompt` against the thread named by `request`.
    ///
    /// The request must already be validated. Work starts immediately, before
    /// the returned stream is first polled.
    pub fn ask(
        &self,
        prompt: String,
        request: IngestionRequest,
    ) -> impl Stream<Item = Result<String, Infallible>> + Send + 'static {
        let started = Instant::now();
        let (sender, mut rx) = StreamSender::channel(self.channel_capacity);
        tracing::info!(
            mode = request.mode(),
            prompt = %truncate_for_log(&prompt, 100),
            "ask request accepted"
        );

        let this = self.clone();
        let task = tokio::spawn(async move {
            this.run(&prompt, &request, started, &sender).await;
        });

        async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield Ok(event.text);
            }
            if let Err(e) = task.await {
                tracing::error!(error = %e, "ask task aborted");
                yield Ok(PROCESSING_FAILED.to_string());
            }
        }
    }

    async fn run(&self, prompt: &str, request: &IngestionRequest, started: Instant, out: &StreamSender) {
        let result = match self.coordinator.run(request, out).await {
            Ok(result) => result,
            Err(e) if e.is_not_found() => {
                out.send(format!("Error: {}\n", e)).await;
                return;
            }
            Err(e) => {
                out.send(error_line(e)).await;
                return;
            }
        };
        if out.is_closed() {
            tracing::info!(thread_key = %result.thread_key, "client gone, skipping query");
            return;
        }

        out.send(ANALYZING_MARKER).await;
        if let Err(message) = self.answer(&result.thread_key, prompt, started, out).await {
            tracing::error!(thread_key = %result.thread_key, error = %message, "query failed");
            out.send(error_line(message)).await;
        }
    }

    /// Query phase. `Ok(None)` when no answer was streamed to completion;
    /// `Err` carries the message for the trailing error line.
    async fn answer(
        &self,
        key: &ThreadKey,
        prompt: &str,
        started: Instant,
        out: &StreamSender,
    ) -> Result<Option<AnswerStats>, String> {
        let engine = self.cache.get_or_create(key).await.map_err(|e| e.to_string())?;
        let answer = engine.query(prompt).await.map_err(|e| e.to_string())?;

        let posts = answer.posts_analyzed();
        let QueryAnswer {
            analysis,
            query_type,
            error,
            answer_stream,
            ..
        } = answer;

        if let Some(error) = error {
            tracing::warn!(thread_key = %key, error = %error, "query engine reported an error");
            out.send(format!("Error processing query: {}\n", error)).await;
            return Ok(None);
        }

        if let Some(analysis) = &analysis {
            if analysis.is_vague {
                out.send("Detected broad/vague query - providing comprehensive overview.\n")
                    .await;
            }
            if !analysis.analytical_intent.is_empty() {
                out.send(format!(
                    "Analytical focus: {}\n",
                    analysis.analytical_intent.join(", ")
                ))
                .await;
            }
            if let Some(hint) = analysis.context_hints.first() {
                out.send(format!("Context: {}\n", hint)).await;
            }
            out.send("\n").await;
        }

        let Some(mut chunks) = answer_stream else {
            out.send(NO_RESPONSE).await;
            return Ok(None);
        };

        let mut chars = 0usize;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            if out.is_closed() {
                tracing::info!(thread_key = %key, chars, "client gone, answer abandoned");
                return Ok(None);
            }
            chars += chunk.chars().count();
            out.send(chunk).await;
        }

        if let Err(e) = self.history.record(key, prompt) {
            tracing::warn!(thread_key = %key, error = %e, "failed to record question");
        }

        let stats = AnswerStats {
            elapsed_secs: started.elapsed().as_secs_f64(),
            chars,
            query_type,
            posts,
        };
        if query_type == QueryType::Analytical {
            tracing::info!(
                thread_key = %key,
                elapsed_secs = stats.elapsed_secs,
                chars,
                query_type = %query_type,
                posts_analyzed = posts,
                "query answered"
            );
        } else {
            tracing::info!(
                thread_key = %key,
                elapsed_secs = stats.elapsed_secs,
                chars,
                query_type = %query_type,
                posts,
                "query answered"
            );
        }
        Ok(Some(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineFactory, QueryAnalysis, QueryEngine};
    use crate::ingest::ThreadIngestor;
    use crate::models::{IngestionResult, SearchOutput};
    use crate::progress::ProgressReporter;
    use crate::store::ThreadStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FakeIngestor {
        store: ThreadStore,
    }

    #[async_trait]
    impl ThreadIngestor for FakeIngestor {
        async fn ingest(
            &self,
            url: &str,
            key: &ThreadKey,
            progress: &dyn ProgressReporter,
        ) -> anyhow::Result<IngestionResult> {
            if url.contains("broken") {
                anyhow::bail!("forum returned 500");
            }
            self.store.ensure_dir(key)?;
            progress.report("Downloading page 1").await;
            Ok(IngestionResult {
                thread_key: key.clone(),
                posts_count: 3,
                analytics_summary: None,
                from_cache: false,
            })
        }

        async fn reprocess(
            &self,
            key: &ThreadKey,
            _progress: &dyn ProgressReporter,
        ) -> anyhow::Result<IngestionResult> {
            Ok(IngestionResult {
                thread_key: key.clone(),
                posts_count: 3,
                analytics_summary: None,
                from_cache: false,
            })
        }
    }

    /// Answers according to the prompt text.
    struct ScriptedEngine;

    #[async_trait]
    impl QueryEngine for ScriptedEngine {
        async fn query(&self, prompt: &str) -> anyhow::Result<QueryAnswer> {
            match prompt {
                "explode" => anyhow::bail!("index corrupted"),
                "refuse" => Ok(QueryAnswer::failed(QueryType::Retrieval, "model offline")),
                "silent" => Ok(QueryAnswer {
                    analysis: None,
                    context_posts: 0,
                    query_type: QueryType::Retrieval,
                    analytical_result: None,
                    error: None,
                    answer_stream: None,
                }),
                "midway" => {
                    let parts: Vec<anyhow::Result<String>> =
                        vec![Ok("Partial ".into()), Err(anyhow::anyhow!("connection reset"))];
                    Ok(QueryAnswer {
                        analysis: None,
                        context_posts: 1,
                        query_type: QueryType::Retrieval,
                        analytical_result: None,
                        error: None,
                        answer_stream: Some(futures::stream::iter(parts).boxed()),
                    })
                }
                _ => {
                    let parts: Vec<anyhow::Result<String>> =
                        vec![Ok("Rye ".into()), Ok("wins.".into())];
                    Ok(QueryAnswer {
                        analysis: Some(QueryAnalysis {
                            is_vague: true,
                            analytical_intent: vec!["ranking".into(), "participants".into()],
                            context_hints: vec!["first hint".into(), "second hint".into()],
                        }),
                        context_posts: 2,
                        query_type: QueryType::Analytical,
                        analytical_result: Some(serde_json::json!({"thread_stats": {"total_posts": 3}})),
                        error: None,
                        answer_stream: Some(futures::stream::iter(parts).boxed()),
                    })
                }
            }
        }

        async fn search(&self, _query: &str, _top_k: usize) -> anyhow::Result<SearchOutput> {
            anyhow::bail!("not used")
        }
    }

    #[derive(Default)]
    struct Factory {
        builds: AtomicUsize,
    }

    #[async_trait]
    impl EngineFactory for Factory {
        async fn build(&self, key: &ThreadKey) -> anyhow::Result<Arc<dyn QueryEngine>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if key.as_str() == "unloadable" {
                anyhow::bail!("posts.json missing");
            }
            Ok(Arc::new(ScriptedEngine))
        }
    }

    struct Setup {
        _tmp: TempDir,
        store: ThreadStore,
        orchestrator: Orchestrator,
        history: Arc<QuestionHistory>,
        factory: Arc<Factory>,
    }

    fn setup() -> Setup {
        let tmp = TempDir::new().unwrap();
        let store = ThreadStore::new(tmp.path());
        let factory = Arc::new(Factory::default());
        let cache = Arc::new(EngineCache::new(4, factory.clone()));
        let coordinator = Arc::new(IngestionCoordinator::new(
            store.clone(),
            Arc::new(FakeIngestor {
                store: store.clone(),
            }),
            cache.clone(),
        ));
        let history = Arc::new(QuestionHistory::new(store.clone(), 10, true));
        let orchestrator = Orchestrator::new(coordinator, cache, history.clone(), 4);
        Setup {
            _tmp: tmp,
            store,
            orchestrator,
            history,
            factory,
        }
    }

    async fn collect(
        orchestrator: &Orchestrator,
        prompt: &str,
        request: IngestionRequest,
    ) -> String {
        let stream = orchestrator.ask(prompt.to_string(), request);
        futures::pin_mut!(stream);
        let mut body = String::new();
        while let Some(Ok(chunk)) = stream.next().await {
            body.push_str(&chunk);
        }
        body
    }

    fn existing(s: &Setup, key: &str) -> IngestionRequest {
        let key = ThreadKey::parse(key).unwrap();
        s.store.ensure_dir(&key).unwrap();
        IngestionRequest::Existing { key }
    }

    #[tokio::test]
    async fn existing_thread_streams_hints_then_answer() {
        let s = setup();
        let body = collect(&s.orchestrator, "Who posted most?", existing(&s, "abc123")).await;
        assert_eq!(
            body,
            "Using existing thread: abc123\n\
             Analyzing query and searching thread...\n\n\
             Detected broad/vague query - providing comprehensive overview.\n\
             Analytical focus: ranking, participants\n\
             Context: first hint\n\
             \n\
             Rye wins."
        );

        let key = ThreadKey::parse("abc123").unwrap();
        let questions = s.history.questions(&key).unwrap();
        assert_eq!(questions[0].question, "Who posted most?");
    }

    #[tokio::test]
    async fn answer_stats_span_the_whole_request() {
        let s = setup();
        let IngestionRequest::Existing { key } = existing(&s, "abc123") else {
            unreachable!()
        };
        let (sender, _rx) = StreamSender::channel(64);
        let accepted = Instant::now() - std::time::Duration::from_millis(250);

        let stats = s
            .orchestrator
            .answer(&key, "Who posted most?", accepted, &sender)
            .await
            .unwrap()
            .unwrap();
        assert!(stats.elapsed_secs >= 0.25);
        assert_eq!(stats.chars, "Rye wins.".len());
        assert_eq!(stats.query_type, QueryType::Analytical);
        // Whole-thread count from the analytical result, not the 2 context posts.
        assert_eq!(stats.posts, 3);

        let refused = s
            .orchestrator
            .answer(&key, "refuse", Instant::now(), &sender)
            .await
            .unwrap();
        assert!(refused.is_none());
    }

    #[tokio::test]
    async fn fresh_thread_progress_precedes_answer() {
        let s = setup();
        let body = collect(
            &s.orchestrator,
            "summarize",
            IngestionRequest::Fresh {
                url: "http://forum.example/t/123".into(),
            },
        )
        .await;
        assert!(body.starts_with("Creating new thread from: http://forum.example/t/123\n"));
        let progress = body.find("PROGRESS: Downloading page 1\n").unwrap();
        let posts = body.find("Posts processed: 3\n").unwrap();
        let marker = body.find(ANALYZING_MARKER).unwrap();
        assert!(progress < posts && posts < marker);
        assert!(body.ends_with("Rye wins."));
    }

    #[tokio::test]
    async fn missing_thread_is_one_error_line() {
        let s = setup();
        let body = collect(
            &s.orchestrator,
            "x",
            IngestionRequest::Existing {
                key: ThreadKey::parse("ghost").unwrap(),
            },
        )
        .await;
        assert_eq!(
            body,
            "Error: Thread 'ghost' not found. Please delete and recreate with URL.\n"
        );
        assert_eq!(s.factory.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ingestion_failure_ends_stream_with_error() {
        let s = setup();
        let body = collect(
            &s.orchestrator,
            "x",
            IngestionRequest::Fresh {
                url: "http://forum.example/t/broken".into(),
            },
        )
        .await;
        assert!(body.ends_with("\n\nError: forum returned 500\n"));
        assert!(!body.contains(ANALYZING_MARKER));
    }

    #[tokio::test]
    async fn query_failures_become_trailing_lines() {
        let s = setup();

        let body = collect(&s.orchestrator, "explode", existing(&s, "abc123")).await;
        assert!(body.ends_with(&format!("{}\n\nError: index corrupted\n", ANALYZING_MARKER)));

        let body = collect(&s.orchestrator, "refuse", existing(&s, "abc123")).await;
        assert!(body.ends_with("Error processing query: model offline\n"));

        let body = collect(&s.orchestrator, "silent", existing(&s, "abc123")).await;
        assert!(body.ends_with(NO_RESPONSE));

        let body = collect(&s.orchestrator, "midway", existing(&s, "abc123")).await;
        assert!(body.ends_with("Partial \n\nError: connection reset\n"));

        let body = collect(&s.orchestrator, "anything", existing(&s, "unloadable")).await;
        assert!(body.ends_with("\n\nError: posts.json missing\n"));

        // Only complete answers are remembered.
        let key = ThreadKey::parse("abc123").unwrap();
        assert!(s.history.questions(&key).unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_questions_reuse_the_engine() {
        let s = setup();
        collect(&s.orchestrator, "one", existing(&s, "abc123")).await;
        collect(&s.orchestrator, "two", existing(&s, "abc123")).await;
        assert_eq!(s.factory.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_client_does_not_stop_ingestion() {
        let s = setup();
        let stream = s.orchestrator.ask(
            "summarize".into(),
            IngestionRequest::Fresh {
                url: "http://forum.example/t/77".into(),
            },
        );
        drop(stream);

        let normalized = crate::thread_key::normalize_url("http://forum.example/t/77").unwrap();
        let key = ThreadKey::from_url(&normalized).unwrap();
        for _ in 0..50 {
            if s.store.exists(&key) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(s.store.exists(&key));
    }
}
