//! Thread analytics.
//!
//! [`build_analytics`] produces the `thread_analytics.json` document written
//! by the default ingestor. The remaining helpers read that document without
//! assuming anything about its shape: missing or mistyped fields degrade to
//! placeholders instead of errors, so a malformed summary can never fail a
//! request.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};

use crate::models::{Post, ThreadMetadata};

/// Placeholder shown for fields the analytics document lacks.
pub const UNKNOWN: &str = "Unknown";

/// Author with the highest `post_count`. Ties go to the author that appears
/// first in the document. Authors with no posts are never returned.
pub fn most_active_author(analytics: &Value) -> Option<(String, u64)> {
    let authors = analytics.pointer("/participants/authors")?.as_object()?;
    let mut best: Option<(&String, u64)> = None;
    for (name, data) in authors {
        let count = data.get("post_count").and_then(Value::as_u64).unwrap_or(0);
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((name, count));
        }
    }
    best.filter(|(_, count)| *count > 0)
        .map(|(name, count)| (name.clone(), count))
}

/// Human-readable preview lines shown after a fresh ingestion. An empty
/// or non-object summary yields no lines.
pub fn preview_lines(analytics: &Value) -> Vec<String> {
    if analytics.as_object().map_or(true, Map::is_empty) {
        return Vec::new();
    }
    let participants = display_field(analytics.pointer("/participants/total_participants"));
    let pages = display_field(analytics.pointer("/metadata/total_pages"));

    let mut lines = vec![
        format!("Participants: {}\n", participants),
        format!("Pages: {}\n", pages),
    ];
    if let Some((name, count)) = most_active_author(analytics) {
        lines.push(format!("Most active: {} ({} posts)\n", name, count));
    }
    lines
}

fn display_field(value: Option<&Value>) -> String {
    match value {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => UNKNOWN.to_string(),
    }
}

#[derive(Default)]
struct AuthorStats {
    post_count: u64,
    total_likes: u64,
    total_words: usize,
    first_post: u64,
    last_post: u64,
}

/// Compute the analytics document for a thread.
pub fn build_analytics(metadata: &ThreadMetadata, posts: &[Post]) -> Value {
    // `authors` keeps first-appearance order; `index` finds an author's slot.
    let mut authors: Vec<(String, AuthorStats)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for post in posts {
        let idx = match index.get(post.author.as_str()) {
            Some(&idx) => idx,
            None => {
                index.insert(post.author.as_str(), authors.len());
                authors.push((
                    post.author.clone(),
                    AuthorStats {
                        first_post: post.post_number,
                        ..Default::default()
                    },
                ));
                authors.len() - 1
            }
        };
        let stats = &mut authors[idx].1;
        stats.post_count += 1;
        stats.total_likes += post.likes;
        stats.total_words += post.word_count();
        stats.last_post = post.post_number;
    }

    let mut author_map = Map::new();
    for (name, stats) in &authors {
        author_map.insert(
            name.clone(),
            json!({
                "post_count": stats.post_count,
                "total_likes": stats.total_likes,
                "avg_words": average(stats.total_words, stats.post_count as usize),
                "first_post": stats.first_post,
                "last_post": stats.last_post,
            }),
        );
    }

    let dates: Vec<DateTime<Utc>> = posts.iter().filter_map(|p| p.created_at).collect();
    let mut posts_by_month: BTreeMap<String, u64> = BTreeMap::new();
    for date in &dates {
        *posts_by_month
            .entry(date.format("%Y-%m").to_string())
            .or_default() += 1;
    }
    let mut posts_by_page: BTreeMap<u32, u64> = BTreeMap::new();
    for post in posts {
        *posts_by_page.entry(post.page).or_default() += 1;
    }

    let total_words: usize = posts.iter().map(Post::word_count).sum();
    let mut top_posts: Vec<&Post> = posts.iter().filter(|p| p.likes > 0).collect();
    top_posts.sort_by(|a, b| b.likes.cmp(&a.likes).then(a.post_number.cmp(&b.post_number)));

    json!({
        "metadata": {
            "title": metadata.title,
            "url": metadata.url,
            "total_pages": metadata.total_pages,
            "total_posts": posts.len(),
            "first_post_date": dates.iter().min(),
            "last_post_date": dates.iter().max(),
            "processed_at": metadata.processed_at,
        },
        "participants": {
            "total_participants": authors.len(),
            "authors": Value::Object(author_map),
        },
        "activity": {
            "posts_by_page": posts_by_page,
            "posts_by_month": posts_by_month,
        },
        "content": {
            "total_words": total_words,
            "avg_words_per_post": average(total_words, posts.len()),
        },
        "top_posts": top_posts.iter().take(5).map(|p| json!({
            "post_number": p.post_number,
            "author": p.author,
            "likes": p.likes,
        })).collect::<Vec<_>>(),
    })
}

fn average(total: usize, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        ((total as f64 / count as f64) * 10.0).round() / 10.0
    }
}
