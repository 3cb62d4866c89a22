//! Thread summaries.
//!
//! Two kinds exist. The stored summary (`thread_summary.json`) is extractive
//! and written at ingestion time by [`build_stored_summary`]. The generated
//! summary comes from a [`ThreadSummarizer`] on demand (`POST
//! /thread/<key>/summary`) and is returned without being stored.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::analytics::most_active_author;
use crate::llm::{ChatMessage, ChatModel};
use crate::models::{Post, ThreadMetadata};
use crate::store::{ThreadStore, METADATA_FILE, POSTS_FILE};
use crate::thread_key::ThreadKey;

/// Accepted range for `max_posts`.
pub const MIN_SUMMARY_POSTS: u64 = 5;
pub const MAX_SUMMARY_POSTS: u64 = 25;
pub const DEFAULT_SUMMARY_POSTS: u64 = 15;

#[async_trait]
pub trait ThreadSummarizer: Send + Sync {
    async fn summarize(&self, key: &ThreadKey, max_posts: usize) -> Result<Value>;
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Pick the posts most worth summarizing: the opening post, then the most
/// liked, then the longest. Returned in thread order.
pub fn select_key_posts(posts: &[Post], max_posts: usize) -> Vec<&Post> {
    let mut ranked: Vec<&Post> = posts.iter().skip(1).collect();
    ranked.sort_by(|a, b| {
        b.likes
            .cmp(&a.likes)
            .then(b.word_count().cmp(&a.word_count()))
            .then(a.post_number.cmp(&b.post_number))
    });

    let mut picked: Vec<&Post> = posts.first().into_iter().collect();
    picked.extend(ranked.into_iter().take(max_posts.saturating_sub(1)));
    picked.truncate(max_posts);
    picked.sort_by_key(|p| p.post_number);
    picked
}

/// Extractive summary written next to the analytics at ingestion time.
pub fn build_stored_summary(metadata: &ThreadMetadata, posts: &[Post], analytics: &Value) -> Value {
    let key_posts: Vec<Value> = select_key_posts(posts, 5)
        .into_iter()
        .map(|p| {
            json!({
                "post_number": p.post_number,
                "author": p.author,
                "likes": p.likes,
                "excerpt": clip(&p.content, 300),
            })
        })
        .collect();

    json!({
        "kind": "extractive",
        "thread_key": metadata.thread_key,
        "title": metadata.title,
        "url": metadata.url,
        "total_posts": posts.len(),
        "total_pages": metadata.total_pages,
        "participants": analytics.pointer("/participants/total_participants"),
        "most_active": most_active_author(analytics).map(|(name, count)| json!({
            "author": name,
            "posts": count,
        })),
        "opening_post": posts.first().map(|p| clip(&p.content, 600)),
        "key_posts": key_posts,
        "generated_at": Utc::now(),
    })
}

/// Asks the chat model for a summary of the thread's key posts.
pub struct LlmSummarizer {
    store: ThreadStore,
    chat: Arc<dyn ChatModel>,
}

impl LlmSummarizer {
    pub fn new(store: ThreadStore, chat: Arc<dyn ChatModel>) -> Self {
        Self { store, chat }
    }
}

#[async_trait]
impl ThreadSummarizer for LlmSummarizer {
    async fn summarize(&self, key: &ThreadKey, max_posts: usize) -> Result<Value> {
        let posts: Vec<Post> = self
            .store
            .read_json(key, POSTS_FILE)?
            .ok_or_else(|| anyhow::anyhow!("Thread '{}' has no processed posts", key))?;
        if posts.is_empty() {
            bail!("Thread '{}' has no posts to summarize", key);
        }
        let metadata: Option<ThreadMetadata> = self.store.read_json(key, METADATA_FILE)?;
        let title = metadata
            .as_ref()
            .and_then(|m| m.title.clone())
            .unwrap_or_else(|| key.to_string());

        let selected = select_key_posts(&posts, max_posts);
        let mut body = format!("Thread: {}\n\n", title);
        for post in &selected {
            body.push_str(&format!(
                "[#{}] {} ({} likes): {}\n\n",
                post.post_number,
                post.author,
                post.likes,
                clip(&post.content, 1000)
            ));
        }
        body.push_str(
            "Write a concise summary of this discussion: the main question, the key answers \
             and any disagreements. Cite posts as [#number].",
        );

        let summary = self
            .chat
            .complete(vec![
                ChatMessage::system("You summarize forum threads accurately and briefly."),
                ChatMessage::user(body),
            ])
            .await?;

        Ok(json!({
            "title": title,
            "summary": summary.trim(),
            "posts_used": selected.len(),
            "post_numbers": selected.iter().map(|p| p.post_number).collect::<Vec<_>>(),
            "total_posts": posts.len(),
            "model": self.chat.model_name(),
            "generated_at": Utc::now(),
        }))
    }
}
