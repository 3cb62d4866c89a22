//! Topic indexing.
//!
//! A topic is a named keyword set. At ingestion time [`TopicIndexer`] scores
//! every post against every topic and writes the matches to
//! `topic_index.json`. [`TopicStore`] serves those files to the topic
//! endpoints, keeping parsed indexes in memory until the file changes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::engine::words;
use crate::error::Result;
use crate::models::Post;
use crate::store::{ThreadStore, TOPIC_INDEX_FILE};
use crate::thread_key::ThreadKey;

const EXCERPT_CHARS: usize = 240;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicDefinition {
    pub id: String,
    pub name: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl TopicDefinition {
    fn new(id: &str, name: &str, keywords: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            description: None,
        }
    }
}

/// Built-in topics used when the config defines none.
pub fn default_topics() -> Vec<TopicDefinition> {
    vec![
        TopicDefinition::new(
            "troubleshooting",
            "Troubleshooting",
            &["problem", "issue", "error", "broken", "fix", "failed", "doesn't work", "help"],
        ),
        TopicDefinition::new(
            "recommendations",
            "Recommendations",
            &["recommend", "suggest", "best", "should i", "worth", "prefer"],
        ),
        TopicDefinition::new(
            "comparisons",
            "Comparisons",
            &["versus", "vs", "compared", "better than", "difference", "instead of"],
        ),
        TopicDefinition::new(
            "howto",
            "How-to",
            &["how to", "step", "guide", "tutorial", "instructions", "tip"],
        ),
        TopicDefinition::new(
            "pricing",
            "Pricing",
            &["price", "cost", "cheap", "expensive", "budget", "paid", "deal"],
        ),
        TopicDefinition::new(
            "experience",
            "Personal experience",
            &["in my experience", "i tried", "i've been", "i have been", "years", "months"],
        ),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicMatch {
    pub post_number: u64,
    pub author: String,
    pub page: u32,
    pub score: u32,
    pub matched_keywords: Vec<String>,
    pub excerpt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicEntry {
    pub name: String,
    pub match_count: usize,
    pub matches: Vec<TopicMatch>,
}

/// Contents of `topic_index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicIndex {
    pub thread_key: ThreadKey,
    pub generated_at: DateTime<Utc>,
    pub total_posts: usize,
    pub topics: BTreeMap<String, TopicEntry>,
}

pub struct TopicIndexer {
    topics: Vec<TopicDefinition>,
}

impl TopicIndexer {
    /// Falls back to [`default_topics`] when `topics` is empty.
    pub fn new(topics: Vec<TopicDefinition>) -> Self {
        let topics = if topics.is_empty() {
            default_topics()
        } else {
            topics
        };
        Self { topics }
    }

    pub fn available(&self) -> &[TopicDefinition] {
        &self.topics
    }

    pub fn build(&self, key: &ThreadKey, posts: &[Post]) -> TopicIndex {
        let padded: Vec<String> = posts
            .iter()
            .map(|p| format!(" {} ", words(&p.content).join(" ")))
            .collect();

        let mut topics = BTreeMap::new();
        for topic in &self.topics {
            let mut matches = Vec::new();
            for (post, text) in posts.iter().zip(&padded) {
                let mut matched = Vec::new();
                let mut score = 0;
                for keyword in &topic.keywords {
                    let keyword_words = words(keyword);
                    if keyword_words.is_empty() {
                        continue;
                    }
                    let needle = format!(" {} ", keyword_words.join(" "));
                    let hits = text.matches(&needle).count() as u32;
                    if hits > 0 {
                        score += hits;
                        matched.push(keyword.clone());
                    }
                }
                if score > 0 {
                    matches.push(TopicMatch {
                        post_number: post.post_number,
                        author: post.author.clone(),
                        page: post.page,
                        score,
                        matched_keywords: matched,
                        excerpt: excerpt(&post.content),
                    });
                }
            }
            matches.sort_by(|a, b| b.score.cmp(&a.score).then(a.post_number.cmp(&b.post_number)));
            topics.insert(
                topic.id.clone(),
                TopicEntry {
                    name: topic.name.clone(),
                    match_count: matches.len(),
                    matches,
                },
            );
        }

        TopicIndex {
            thread_key: key.clone(),
            generated_at: Utc::now(),
            total_posts: posts.len(),
            topics,
        }
    }
}

fn excerpt(text: &str) -> String {
    match text.char_indices().nth(EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicSummaryRow {
    pub topic_id: String,
    pub name: String,
    pub match_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrossThreadMatch {
    pub thread_key: ThreadKey,
    #[serde(flatten)]
    pub post: TopicMatch,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TopicCacheStats {
    pub cached_indexes: usize,
    pub hits: u64,
    pub misses: u64,
    pub threads_with_index: usize,
}

/// Reads topic indexes, keeping parsed copies keyed by file mtime.
pub struct TopicStore {
    store: ThreadStore,
    cached: Mutex<HashMap<ThreadKey, (SystemTime, Arc<TopicIndex>)>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TopicStore {
    pub fn new(store: ThreadStore) -> Self {
        Self {
            store,
            cached: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn has_index(&self, key: &ThreadKey) -> bool {
        self.store.thread_dir(key).join(TOPIC_INDEX_FILE).is_file()
    }

    pub fn load(&self, key: &ThreadKey) -> Result<Option<Arc<TopicIndex>>> {
        let path = self.store.thread_dir(key).join(TOPIC_INDEX_FILE);
        let modified = match std::fs::metadata(&path) {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.cached.lock().remove(key);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if let Some((stamp, index)) = self.cached.lock().get(key) {
            if *stamp == modified {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(index.clone()));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let Some(index) = self.store.read_json::<TopicIndex>(key, TOPIC_INDEX_FILE)? else {
            return Ok(None);
        };
        let index = Arc::new(index);
        self.cached.lock().insert(key.clone(), (modified, index.clone()));
        Ok(Some(index))
    }

    /// Matches for one topic in one thread. Empty when the thread has no
    /// index or the topic never matched.
    pub fn matches(&self, key: &ThreadKey, topic_id: &str) -> Result<Vec<TopicMatch>> {
        Ok(self
            .load(key)?
            .and_then(|index| index.topics.get(topic_id).map(|t| t.matches.clone()))
            .unwrap_or_default())
    }

    /// Topics with at least one match, most matches first.
    pub fn summary(&self, key: &ThreadKey) -> Result<Option<Vec<TopicSummaryRow>>> {
        let Some(index) = self.load(key)? else {
            return Ok(None);
        };
        let mut rows: Vec<TopicSummaryRow> = index
            .topics
            .iter()
            .filter(|(_, entry)| entry.match_count > 0)
            .map(|(id, entry)| TopicSummaryRow {
                topic_id: id.clone(),
                name: entry.name.clone(),
                match_count: entry.match_count,
            })
            .collect();
        rows.sort_by(|a, b| b.match_count.cmp(&a.match_count).then(a.topic_id.cmp(&b.topic_id)));
        Ok(Some(rows))
    }

    /// Best matches for a topic across every indexed thread.
    pub fn search_across_threads(&self, topic_id: &str, limit: usize) -> Result<Vec<CrossThreadMatch>> {
        let mut all = Vec::new();
        for key in self.store.list_keys()? {
            let Some(index) = self.load(&key)? else { continue };
            if let Some(entry) = index.topics.get(topic_id) {
                all.extend(entry.matches.iter().map(|m| CrossThreadMatch {
                    thread_key: key.clone(),
                    post: m.clone(),
                }));
            }
        }
        all.sort_by(|a, b| b.post.score.cmp(&a.post.score));
        all.truncate(limit);
        Ok(all)
    }

    pub fn forget(&self, key: &ThreadKey) {
        self.cached.lock().remove(key);
    }

    pub fn stats(&self) -> Result<TopicCacheStats> {
        let keys = self.store.list_keys()?;
        let threads_with_index = keys.iter().filter(|k| self.has_index(k)).count();
        let live: HashSet<&ThreadKey> = keys.iter().collect();
        let cached_indexes = self
            .cached
            .lock()
            .keys()
            .filter(|k| live.contains(k))
            .count();
        Ok(TopicCacheStats {
            cached_indexes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            threads_with_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn post(n: u64, content: &str) -> Post {
        Post {
            post_number: n,
            author: format!("user{}", n),
            created_at: None,
            content: content.into(),
            likes: 0,
            page: 1,
        }
    }

    fn key(s: &str) -> ThreadKey {
        ThreadKey::parse(s).unwrap()
    }

    #[test]
    fn builds_scored_matches() {
        let indexer = TopicIndexer::new(Vec::new());
        let posts = vec![
            post(1, "I have a problem: the error shows twice. Any fix?"),
            post(2, "Nice weather today."),
            post(3, "Same issue here"),
        ];
        let index = indexer.build(&key("abc"), &posts);
        let trouble = &index.topics["troubleshooting"];
        assert_eq!(trouble.match_count, 2);
        assert_eq!(trouble.matches[0].post_number, 1);
        assert_eq!(trouble.matches[0].score, 3);
        assert_eq!(trouble.matches[1].matched_keywords, vec!["issue"]);
        assert_eq!(index.topics["pricing"].match_count, 0);
    }

    #[test]
    fn multi_word_keywords_match_on_word_boundaries() {
        let indexer = TopicIndexer::new(vec![TopicDefinition::new("h", "How", &["how to"])]);
        let index = indexer.build(
            &key("abc"),
            &[post(1, "Here is HOW TO shape a loaf"), post(2, "somehow tomorrow")],
        );
        assert_eq!(index.topics["h"].match_count, 1);
    }

    #[test]
    fn store_caches_and_searches_across_threads() {
        let tmp = TempDir::new().unwrap();
        let store = ThreadStore::new(tmp.path());
        let topics = TopicStore::new(store.clone());
        let indexer = TopicIndexer::new(Vec::new());

        for (k, text) in [("one", "price is too expensive"), ("two", "cheap deal, low price")] {
            let index = indexer.build(&key(k), &[post(1, text)]);
            store.write_json(&key(k), TOPIC_INDEX_FILE, &index).unwrap();
        }
        store.ensure_dir(&key("bare")).unwrap();

        assert!(topics.load(&key("bare")).unwrap().is_none());
        assert!(topics.load(&key("one")).unwrap().is_some());
        assert!(topics.load(&key("one")).unwrap().is_some());

        let found = topics.search_across_threads("pricing", 10).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].thread_key, key("two"));
        assert_eq!(topics.search_across_threads("pricing", 1).unwrap().len(), 1);

        let summary = topics.summary(&key("one")).unwrap().unwrap();
        assert_eq!(summary[0].topic_id, "pricing");

        let stats = topics.stats().unwrap();
        assert_eq!(stats.threads_with_index, 2);
        assert_eq!(stats.cached_indexes, 2);
        assert!(stats.hits >= 1);
    }
}
