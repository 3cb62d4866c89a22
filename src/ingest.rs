//! Thread ingestion.
//!
//! [`ThreadIngestor`] is the collaborator the coordinator drives. The default
//! [`ForumIngestor`] downloads a thread page by page into `pages/`, then
//! rebuilds every derived artifact from those stored pages:
//!
//! ```text
//! pages/*.json → posts.json → metadata.json
//!                           → thread_analytics.json
//!                           → thread_summary.json
//!                           → topic_index.json   (features.topic_index)
//!                           → embeddings.json    (embedding.provider != disabled)
//! ```
//!
//! Reprocessing runs only the second half, so it never touches the network.
//! Embedding failures are non-fatal: the thread stays searchable by keyword.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::analytics::build_analytics;
use crate::embedding::{embed_in_batches, EmbeddingProvider};
use crate::fetch::PageFetcher;
use crate::models::{IngestionResult, Post, ThreadMetadata};
use crate::progress::{format_number, ProgressReporter};
use crate::store::{
    ThreadStore, ANALYTICS_FILE, EMBEDDINGS_FILE, METADATA_FILE, POSTS_FILE, SUMMARY_FILE,
    TOPIC_INDEX_FILE,
};
use crate::summary::build_stored_summary;
use crate::thread_key::ThreadKey;
use crate::topics::TopicIndexer;

const STAGING_DIR: &str = "pages.partial";

#[async_trait]
pub trait ThreadIngestor: Send + Sync {
    /// Download and process the thread at `url` into `key`'s directory.
    async fn ingest(
        &self,
        url: &str,
        key: &ThreadKey,
        progress: &dyn ProgressReporter,
    ) -> Result<IngestionResult>;

    /// Rebuild `key`'s artifacts from its stored pages.
    async fn reprocess(&self, key: &ThreadKey, progress: &dyn ProgressReporter) -> Result<IngestionResult>;
}

pub struct ForumIngestor {
    store: ThreadStore,
    fetcher: PageFetcher,
    embedder: Arc<dyn EmbeddingProvider>,
    embed_batch_size: usize,
    topics: Option<TopicIndexer>,
    max_pages: u32,
}

impl ForumIngestor {
    pub fn new(
        store: ThreadStore,
        fetcher: PageFetcher,
        embedder: Arc<dyn EmbeddingProvider>,
        embed_batch_size: usize,
        topics: Option<TopicIndexer>,
        max_pages: u32,
    ) -> Self {
        Self {
            store,
            fetcher,
            embedder,
            embed_batch_size,
            topics,
            max_pages,
        }
    }

    /// Download into `pages.partial/` and swap it in for `pages/` only once
    /// at least one page arrived, so a failed re-download keeps the pages
    /// the thread can still be reprocessed from.
    async fn download(&self, url: &str, key: &ThreadKey, progress: &dyn ProgressReporter) -> Result<u32> {
        let pages_dir = self.store.ensure_dir(key)?.join(crate::store::PAGES_DIR);
        let staging = self.store.thread_dir(key).join(STAGING_DIR);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let pages = match self.download_pages(url, &staging, progress).await {
            Ok(pages) => pages,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    tracing::warn!(thread_key = %key, error = %cleanup, "failed to remove partial download");
                }
                return Err(e);
            }
        };

        fs::remove_dir_all(&pages_dir)?;
        fs::rename(&staging, &pages_dir)?;
        Ok(pages)
    }

    async fn download_pages(&self, url: &str, dir: &Path, progress: &dyn ProgressReporter) -> Result<u32> {
        let mut seen: HashSet<u64> = HashSet::new();
        let mut expected_posts: Option<u64> = None;
        let mut pages = 0;

        for page in 1..=self.max_pages {
            progress.report(&format!("Downloading page {}", page)).await;
            let Some(body) = self.fetcher.fetch_page(url, page).await? else {
                break;
            };
            let (_, posts) = parse_page(&body, page);
            let fresh = posts.iter().filter(|p| seen.insert(p.post_number)).count();
            if fresh == 0 {
                break;
            }
            if expected_posts.is_none() {
                expected_posts = body.get("posts_count").and_then(Value::as_u64);
            }

            fs::write(
                dir.join(format!("page_{:04}.json", page)),
                serde_json::to_vec(&body)?,
            )?;
            pages = page;
            progress
                .report(&format!("Page {}: {} new posts", page, fresh))
                .await;

            if expected_posts.is_some_and(|n| seen.len() as u64 >= n) {
                break;
            }
        }

        if pages == 0 {
            bail!("No posts found at {}", url);
        }
        Ok(pages)
    }

    async fn build(
        &self,
        key: &ThreadKey,
        url: String,
        progress: &dyn ProgressReporter,
    ) -> Result<IngestionResult> {
        let (title, posts, total_pages) = self.parse_stored_pages(key)?;
        if posts.is_empty() {
            bail!("Stored pages for thread '{}' contain no posts", key);
        }
        progress
            .report(&format!(
                "Parsed {} posts from {} pages",
                format_number(posts.len() as u64),
                total_pages
            ))
            .await;

        let metadata = ThreadMetadata {
            thread_key: key.clone(),
            url,
            title,
            total_pages,
            total_posts: posts.len(),
            processed_at: Utc::now(),
        };
        self.store.write_json(key, POSTS_FILE, &posts)?;

        progress.report("Computing thread analytics").await;
        let analytics = build_analytics(&metadata, &posts);
        self.store.write_json(key, ANALYTICS_FILE, &analytics)?;
        self.store
            .write_json(key, SUMMARY_FILE, &build_stored_summary(&metadata, &posts, &analytics))?;

        if let Some(indexer) = &self.topics {
            progress.report("Building topic index").await;
            self.store
                .write_json(key, TOPIC_INDEX_FILE, &indexer.build(key, &posts))?;
        }

        self.embed_posts(key, &posts, progress).await?;

        // Written last: a thread with metadata is a fully processed thread.
        self.store.write_json(key, METADATA_FILE, &metadata)?;

        Ok(IngestionResult {
            thread_key: key.clone(),
            posts_count: posts.len(),
            analytics_summary: Some(analytics),
            from_cache: false,
        })
    }

    async fn embed_posts(&self, key: &ThreadKey, posts: &[Post], progress: &dyn ProgressReporter) -> Result<()> {
        let path = self.store.thread_dir(key).join(EMBEDDINGS_FILE);
        if !self.embedder.is_enabled() {
            return Ok(());
        }

        progress.report("Generating embeddings").await;
        let texts: Vec<String> = posts.iter().map(|p| p.content.clone()).collect();
        match embed_in_batches(self.embedder.as_ref(), &texts, self.embed_batch_size, progress).await {
            Ok(vectors) => self.store.write_json(key, EMBEDDINGS_FILE, &vectors)?,
            Err(e) => {
                tracing::warn!(thread_key = %key, error = %e, "embedding failed, keyword search only");
                progress
                    .report("Embedding failed; search will use keywords only")
                    .await;
                if path.exists() {
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    /// Parse every stored page in page order, dropping duplicate posts.
    fn parse_stored_pages(&self, key: &ThreadKey) -> Result<(Option<String>, Vec<Post>, u32)> {
        let pages_dir = self.store.pages_dir(key);
        if !pages_dir.is_dir() {
            bail!("No stored pages for thread '{}'", key);
        }
        let mut files: Vec<(u32, std::path::PathBuf)> = fs::read_dir(&pages_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter_map(|path| {
                let stem = path.file_stem()?.to_str()?;
                let page: u32 = stem.strip_prefix("page_")?.parse().ok()?;
                Some((page, path))
            })
            .collect();
        if files.is_empty() {
            bail!("No stored pages for thread '{}'", key);
        }
        files.sort_by_key(|(page, _)| *page);

        let mut title = None;
        let mut posts = Vec::new();
        let mut seen = HashSet::new();
        for (page, path) in &files {
            let body: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
            let (page_title, page_posts) = parse_page(&body, *page);
            if title.is_none() {
                title = page_title;
            }
            posts.extend(page_posts.into_iter().filter(|p| seen.insert(p.post_number)));
        }
        posts.sort_by_key(|p| p.post_number);
        let total_pages = files.last().map(|(page, _)| *page).unwrap_or(0);
        Ok((title, posts, total_pages))
    }
}

#[async_trait]
impl ThreadIngestor for ForumIngestor {
    async fn ingest(
        &self,
        url: &str,
        key: &ThreadKey,
        progress: &dyn ProgressReporter,
    ) -> Result<IngestionResult> {
        let existed = self.store.exists(key);
        let outcome = match self.download(url, key, progress).await {
            Ok(_) => self.build(key, url.to_string(), progress).await,
            Err(e) => Err(e),
        };
        if outcome.is_err() && !existed {
            // Leave no half-built directory that would pass as an existing thread.
            if let Err(e) = self.store.delete(key) {
                tracing::warn!(thread_key = %key, error = %e, "failed to remove partial thread");
            }
        }
        outcome
    }

    async fn reprocess(&self, key: &ThreadKey, progress: &dyn ProgressReporter) -> Result<IngestionResult> {
        let url = self
            .store
            .read_json::<ThreadMetadata>(key, METADATA_FILE)
            .ok()
            .flatten()
            .map(|m| m.url)
            .unwrap_or_default();
        self.build(key, url, progress).await
    }
}

/// Extract the title and posts from one page of a topic's JSON view.
///
/// Expects `post_stream.posts[]` entries with `post_number`, `username`,
/// `cooked` (HTML) and optionally `created_at` and `like_count` (or a
/// like entry, id 2, in `actions_summary`).
pub fn parse_page(body: &Value, page: u32) -> (Option<String>, Vec<Post>) {
    let title = body
        .get("title")
        .and_then(Value::as_str)
        .map(|t| t.to_string());
    let posts = body
        .pointer("/post_stream/posts")
        .and_then(Value::as_array)
        .map(|posts| posts.iter().filter_map(|p| parse_post(p, page)).collect())
        .unwrap_or_default();
    (title, posts)
}

fn parse_post(raw: &Value, page: u32) -> Option<Post> {
    let post_number = raw.get("post_number").and_then(Value::as_u64)?;
    let author = raw
        .get("username")
        .or_else(|| raw.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let content = raw
        .get("cooked")
        .and_then(Value::as_str)
        .map(html_to_text)
        .or_else(|| raw.get("raw").and_then(Value::as_str).map(|s| s.trim().to_string()))
        .unwrap_or_default();
    if content.is_empty() {
        return None;
    }
    let created_at = raw
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc));
    let likes = raw
        .get("like_count")
        .and_then(Value::as_u64)
        .or_else(|| {
            raw.get("actions_summary")?
                .as_array()?
                .iter()
                .find(|a| a.get("id").and_then(Value::as_u64) == Some(2))?
                .get("count")?
                .as_u64()
        })
        .unwrap_or(0);

    Some(Post {
        post_number,
        author,
        created_at,
        content,
        likes,
        page,
    })
}

/// Strip tags, decode common entities and collapse whitespace.
pub fn html_to_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                text.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}
