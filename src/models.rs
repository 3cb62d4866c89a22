//! Core data models shared by ingestion, storage and the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::thread_key::ThreadKey;

/// A single forum post, as extracted from a stored page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    /// Position within the thread, starting at 1.
    pub post_number: u64,
    pub author: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Plain text with markup stripped.
    pub content: String,
    #[serde(default)]
    pub likes: u64,
    /// Page the post was found on, starting at 1.
    pub page: u32,
}

impl Post {
    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }
}

/// Persisted as `metadata.json` in every thread directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMetadata {
    pub thread_key: ThreadKey,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    pub total_pages: u32,
    pub total_posts: usize,
    pub processed_at: DateTime<Utc>,
}

/// What a caller asked the coordinator to do.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestionRequest {
    /// Download and process a thread from its URL.
    Fresh { url: String },
    /// Use an already-ingested thread as is.
    Existing { key: ThreadKey },
    /// Rebuild an already-ingested thread from its stored pages.
    Reprocess { key: ThreadKey },
}

impl IngestionRequest {
    pub fn mode(&self) -> &'static str {
        match self {
            IngestionRequest::Fresh { .. } => "fresh",
            IngestionRequest::Existing { .. } => "existing",
            IngestionRequest::Reprocess { .. } => "reprocess",
        }
    }
}

/// Uniform outcome of one ingestion request.
#[derive(Debug, Clone)]
pub struct IngestionResult {
    pub thread_key: ThreadKey,
    pub posts_count: usize,
    /// Opaque analytics document; only read for the preview lines.
    pub analytics_summary: Option<serde_json::Value>,
    pub from_cache: bool,
}

/// One row of `GET /threads`.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadListing {
    pub thread_key: ThreadKey,
    pub title: Option<String>,
    pub url: Option<String>,
    pub posts_count: Option<usize>,
    pub participants: Option<u64>,
    pub pages: Option<u32>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// A post returned by a search, with its relevance score.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub post_number: u64,
    pub author: String,
    pub page: u32,
    pub score: f64,
    pub content: String,
}

/// Result of `QueryEngine::search`.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutput {
    pub results: Vec<SearchHit>,
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_round_trips_with_optional_fields_missing() {
        let post: Post = serde_json::from_str(
            r#"{"post_number": 3, "author": "ann", "content": "hello there", "page": 1}"#,
        )
        .unwrap();
        assert_eq!(post.likes, 0);
        assert!(post.created_at.is_none());
        assert_eq!(post.word_count(), 2);
    }

    #[test]
    fn request_modes_are_named() {
        let key = ThreadKey::parse("abc123").unwrap();
        assert_eq!(IngestionRequest::Existing { key: key.clone() }.mode(), "existing");
        assert_eq!(IngestionRequest::Reprocess { key }.mode(), "reprocess");
        assert_eq!(
            IngestionRequest::Fresh {
                url: "http://forum.example/t/1".into()
            }
            .mode(),
            "fresh"
        );
    }
}
