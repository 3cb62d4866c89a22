//! Ingestion coordinator.
//!
//! Turns one [`IngestionRequest`] into one [`IngestionResult`]:
//!
//! ```text
//! Existing  → thread dir present? → DONE(from_cache)      else FAIL(not found)
//! Reprocess → thread dir present? → ingestor.reprocess    else FAIL(not found)
//! Fresh     → normalize URL, derive key → ingestor.ingest
//! ```
//!
//! Status lines and the ingestor's progress reports go through the same
//! [`StreamSender`], so the caller sees them in the order they happened.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::analytics::preview_lines;
use crate::cache::EngineCache;
use crate::error::{Error, Result};
use crate::ingest::ThreadIngestor;
use crate::models::{IngestionRequest, IngestionResult, ThreadMetadata};
use crate::progress::StreamSender;
use crate::store::{ThreadStore, METADATA_FILE};
use crate::thread_key::{normalize_url, ThreadKey};

/// Separator written after a fresh ingestion's summary block.
pub fn separator() -> String {
    format!("\n{}\n\n", "=".repeat(50))
}

#[derive(Default)]
pub struct ProcessingStats {
    created: AtomicU64,
    reprocessed: AtomicU64,
    reused: AtomicU64,
    failures: AtomicU64,
    posts_processed: AtomicU64,
    processing_ms: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProcessingStatsSnapshot {
    pub threads_created: u64,
    pub threads_reprocessed: u64,
    pub threads_reused: u64,
    pub failures: u64,
    pub total_posts_processed: u64,
    pub total_processing_secs: f64,
    pub avg_processing_secs: f64,
}

impl ProcessingStats {
    pub fn snapshot(&self) -> ProcessingStatsSnapshot {
        let created = self.created.load(Ordering::Relaxed);
        let reprocessed = self.reprocessed.load(Ordering::Relaxed);
        let secs = self.processing_ms.load(Ordering::Relaxed) as f64 / 1000.0;
        let runs = created + reprocessed;
        ProcessingStatsSnapshot {
            threads_created: created,
            threads_reprocessed: reprocessed,
            threads_reused: self.reused.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_posts_processed: self.posts_processed.load(Ordering::Relaxed),
            total_processing_secs: secs,
            avg_processing_secs: if runs == 0 { 0.0 } else { secs / runs as f64 },
        }
    }
}

pub struct IngestionCoordinator {
    store: ThreadStore,
    ingestor: Arc<dyn ThreadIngestor>,
    cache: Arc<EngineCache>,
    stats: ProcessingStats,
}

impl IngestionCoordinator {
    pub fn new(store: ThreadStore, ingestor: Arc<dyn ThreadIngestor>, cache: Arc<EngineCache>) -> Self {
        Self {
            store,
            ingestor,
            cache,
            stats: ProcessingStats::default(),
        }
    }

    pub fn stats(&self) -> ProcessingStatsSnapshot {
        self.stats.snapshot()
    }

    /// Resolve the request, writing status lines to `out` as work happens.
    pub async fn run(&self, request: &IngestionRequest, out: &StreamSender) -> Result<IngestionResult> {
        let started = Instant::now();
        tracing::info!(mode = request.mode(), "ingestion started");

        let outcome = self.dispatch(request, out).await;
        let elapsed = started.elapsed();

        match &outcome {
            Ok(result) => {
                if !result.from_cache {
                    self.stats
                        .posts_processed
                        .fetch_add(result.posts_count as u64, Ordering::Relaxed);
                    self.stats
                        .processing_ms
                        .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
                }
                tracing::info!(
                    thread_key = %result.thread_key,
                    posts = result.posts_count,
                    from_cache = result.from_cache,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "ingestion finished"
                );
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(error = %e, "thread not found");
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(mode = request.mode(), error = %e, "ingestion failed");
            }
        }
        outcome
    }

    async fn dispatch(&self, request: &IngestionRequest, out: &StreamSender) -> Result<IngestionResult> {
        match request {
            IngestionRequest::Existing { key } => {
                self.require_existing(key)?;
                out.send(format!("Using existing thread: {}\n", key)).await;
                self.stats.reused.fetch_add(1, Ordering::Relaxed);
                let posts_count = self
                    .store
                    .read_json::<ThreadMetadata>(key, METADATA_FILE)
                    .ok()
                    .flatten()
                    .map(|m| m.total_posts)
                    .unwrap_or(0);
                Ok(IngestionResult {
                    thread_key: key.clone(),
                    posts_count,
                    analytics_summary: None,
                    from_cache: true,
                })
            }
            IngestionRequest::Reprocess { key } => {
                self.require_existing(key)?;
                out.send(format!("Reprocessing existing thread: {}\n", key)).await;
                out.send("Re-parsing HTML files and rebuilding indexes...\n\n").await;

                let mut result = self.ingestor.reprocess(key, out).await?;
                result.thread_key = key.clone();
                self.cache.invalidate(key);
                self.stats.reprocessed.fetch_add(1, Ordering::Relaxed);

                out.send("Thread reprocessed successfully!\n").await;
                out.send(format!("Posts processed: {}\n", result.posts_count)).await;
                Ok(result)
            }
            IngestionRequest::Fresh { url } => {
                let normalized = normalize_url(url)?;
                let key = ThreadKey::from_url(&normalized)?;
                out.send(format!("Creating new thread from: {}\n", normalized)).await;
                out.send("Downloading and processing all pages...\n\n").await;

                let mut result = self.ingestor.ingest(&normalized, &key, out).await?;
                result.thread_key = key.clone();
                self.cache.invalidate(&key);
                self.stats.created.fetch_add(1, Ordering::Relaxed);

                out.send(format!("Thread processed: {}\n", key)).await;
                out.send(format!("Posts processed: {}\n", result.posts_count)).await;
                if let Some(analytics) = &result.analytics_summary {
                    for line in preview_lines(analytics) {
                        out.send(line).await;
                    }
                }
                out.send(separator()).await;
                Ok(result)
            }
        }
    }

    fn require_existing(&self, key: &ThreadKey) -> Result<()> {
        if self.store.exists(key) {
            Ok(())
        } else {
            Err(Error::ThreadNotFound(key.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineFactory, QueryEngine};
    use crate::progress::ProgressReporter;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FakeIngestor {
        store: ThreadStore,
    }

    #[async_trait]
    impl ThreadIngestor for FakeIngestor {
        async fn ingest(
            &self,
            _url: &str,
            key: &ThreadKey,
            progress: &dyn ProgressReporter,
        ) -> anyhow::Result<IngestionResult> {
            self.store.ensure_dir(key)?;
            progress.report("Fetched page 1").await;
            Ok(IngestionResult {
                thread_key: key.clone(),
                posts_count: 12,
                analytics_summary: Some(serde_json::json!({
                    "metadata": {"total_pages": 1},
                    "participants": {"total_participants": 3, "authors": {"ann": {"post_count": 6}}},
                })),
                from_cache: false,
            })
        }

        async fn reprocess(
            &self,
            key: &ThreadKey,
            _progress: &dyn ProgressReporter,
        ) -> anyhow::Result<IngestionResult> {
            if key.as_str() == "broken" {
                anyhow::bail!("no stored pages");
            }
            Ok(IngestionResult {
                thread_key: key.clone(),
                posts_count: 7,
                analytics_summary: None,
                from_cache: false,
            })
        }
    }

    struct NoEngines;

    #[async_trait]
    impl EngineFactory for NoEngines {
        async fn build(&self, _key: &ThreadKey) -> anyhow::Result<Arc<dyn QueryEngine>> {
            anyhow::bail!("not used")
        }
    }

    fn coordinator(tmp: &TempDir) -> IngestionCoordinator {
        let store = ThreadStore::new(tmp.path());
        let cache = Arc::new(EngineCache::new(2, Arc::new(NoEngines)));
        IngestionCoordinator::new(
            store.clone(),
            Arc::new(FakeIngestor { store }),
            cache,
        )
    }

    async fn run_collect(
        coordinator: &IngestionCoordinator,
        request: IngestionRequest,
    ) -> (Result<IngestionResult>, Vec<String>) {
        let (sender, mut rx) = StreamSender::channel(64);
        let outcome = coordinator.run(&request, &sender).await;
        drop(sender);
        let mut lines = Vec::new();
        while let Some(event) = rx.recv().await {
            lines.push(event.text);
        }
        (outcome, lines)
    }

    #[tokio::test]
    async fn fresh_ingest_emits_summary_block() {
        let tmp = TempDir::new().unwrap();
        let coordinator = coordinator(&tmp);
        let (outcome, lines) = run_collect(
            &coordinator,
            IngestionRequest::Fresh {
                url: "forum.example/t/123/".into(),
            },
        )
        .await;

        let result = outcome.unwrap();
        assert!(!result.from_cache);
        assert_eq!(lines[0], "Creating new thread from: https://forum.example/t/123\n");
        assert_eq!(lines[1], "Downloading and processing all pages...\n\n");
        assert_eq!(lines[2], "PROGRESS: Fetched page 1\n");
        assert_eq!(lines[3], format!("Thread processed: {}\n", result.thread_key));
        assert_eq!(lines[4], "Posts processed: 12\n");
        assert_eq!(lines[5], "Participants: 3\n");
        assert_eq!(lines[6], "Pages: 1\n");
        assert_eq!(lines[7], "Most active: ann (6 posts)\n");
        assert_eq!(lines[8], separator());
        assert_eq!(coordinator.stats().threads_created, 1);
        assert_eq!(coordinator.stats().total_posts_processed, 12);
    }

    #[tokio::test]
    async fn existing_thread_is_reused() {
        let tmp = TempDir::new().unwrap();
        let coordinator = coordinator(&tmp);
        let key = ThreadKey::parse("abc123").unwrap();
        ThreadStore::new(tmp.path()).ensure_dir(&key).unwrap();

        let (outcome, lines) =
            run_collect(&coordinator, IngestionRequest::Existing { key: key.clone() }).await;
        let result = outcome.unwrap();
        assert!(result.from_cache);
        assert_eq!(result.thread_key, key);
        assert_eq!(lines, vec!["Using existing thread: abc123\n"]);
        assert_eq!(coordinator.stats().threads_reused, 1);
    }

    #[tokio::test]
    async fn missing_thread_fails_without_output() {
        let tmp = TempDir::new().unwrap();
        let coordinator = coordinator(&tmp);
        let ghost = ThreadKey::parse("ghost").unwrap();

        for request in [
            IngestionRequest::Existing { key: ghost.clone() },
            IngestionRequest::Reprocess { key: ghost.clone() },
        ] {
            let (outcome, lines) = run_collect(&coordinator, request).await;
            assert!(outcome.unwrap_err().is_not_found());
            assert!(lines.is_empty());
        }
        assert_eq!(coordinator.stats().failures, 0);
    }

    #[tokio::test]
    async fn reprocess_reports_and_counts() {
        let tmp = TempDir::new().unwrap();
        let coordinator = coordinator(&tmp);
        let key = ThreadKey::parse("abc123").unwrap();
        ThreadStore::new(tmp.path()).ensure_dir(&key).unwrap();

        let (outcome, lines) =
            run_collect(&coordinator, IngestionRequest::Reprocess { key }).await;
        assert_eq!(outcome.unwrap().posts_count, 7);
        assert_eq!(
            lines,
            vec![
                "Reprocessing existing thread: abc123\n",
                "Re-parsing HTML files and rebuilding indexes...\n\n",
                "Thread reprocessed successfully!\n",
                "Posts processed: 7\n",
            ]
        );
        assert_eq!(coordinator.stats().threads_reprocessed, 1);
    }

    #[tokio::test]
    async fn collaborator_failure_is_counted() {
        let tmp = TempDir::new().unwrap();
        let coordinator = coordinator(&tmp);
        let key = ThreadKey::parse("broken").unwrap();
        ThreadStore::new(tmp.path()).ensure_dir(&key).unwrap();

        let (outcome, _) = run_collect(&coordinator, IngestionRequest::Reprocess { key }).await;
        assert_eq!(outcome.unwrap_err().to_string(), "no stored pages");
        assert_eq!(coordinator.stats().failures, 1);
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let coordinator = coordinator(&tmp);
        let (outcome, lines) = run_collect(
            &coordinator,
            IngestionRequest::Fresh {
                url: "ftp://forum.example/t/1".into(),
            },
        )
        .await;
        assert!(matches!(outcome, Err(Error::InvalidUrl(_))));
        assert!(lines.is_empty());
    }
}
