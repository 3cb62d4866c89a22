//! Per-thread query engines.
//!
//! A [`QueryEngine`] answers prompts against one ingested thread. Engines are
//! expensive to build (posts, term statistics and embeddings are loaded into
//! memory), so they are only ever constructed through an [`EngineFactory`]
//! by the engine cache and then shared.
//!
//! The default [`ThreadEngine`] classifies each prompt, picks context posts
//! and streams an answer from the chat model:
//!
//! | Prompt kind | Context |
//! |---|---|
//! | analytical (who / how many / when / most) | whole-thread statistics plus the best-matching posts |
//! | vague (short or generic) | opening post, most-liked replies, an even spread of the rest |
//! | anything else | keyword or hybrid keyword + embedding ranking |

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::config::RetrievalConfig;
use crate::embedding::{cosine_similarity, embed_query, EmbeddingProvider};
use crate::llm::{AnswerStream, ChatMessage, ChatModel};
use crate::models::{Post, SearchHit, SearchOutput, ThreadMetadata};
use crate::store::{ThreadStore, EMBEDDINGS_FILE, METADATA_FILE, POSTS_FILE};
use crate::thread_key::ThreadKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Analytical,
    Overview,
    Retrieval,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryType::Analytical => "analytical",
            QueryType::Overview => "overview",
            QueryType::Retrieval => "retrieval",
        };
        f.write_str(s)
    }
}

/// How a prompt was understood, shown to the caller before the answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryAnalysis {
    pub is_vague: bool,
    pub analytical_intent: Vec<String>,
    pub context_hints: Vec<String>,
}

/// Result of [`QueryEngine::query`].
///
/// `error` is set when the engine understood the prompt but could not
/// produce an answer (no posts, model unreachable). `answer_stream` is
/// `None` only in that case.
pub struct QueryAnswer {
    pub analysis: Option<QueryAnalysis>,
    pub context_posts: usize,
    pub query_type: QueryType,
    /// Present for analytical queries; carries `thread_stats.total_posts`.
    pub analytical_result: Option<Value>,
    pub error: Option<String>,
    pub answer_stream: Option<AnswerStream>,
}

impl QueryAnswer {
    pub fn failed(query_type: QueryType, message: impl Into<String>) -> Self {
        Self {
            analysis: None,
            context_posts: 0,
            query_type,
            analytical_result: None,
            error: Some(message.into()),
            answer_stream: None,
        }
    }

    /// Posts the answer was based on: the whole thread for analytical
    /// queries, the context window otherwise.
    pub fn posts_analyzed(&self) -> usize {
        self.analytical_result
            .as_ref()
            .and_then(|r| r.pointer("/thread_stats/total_posts"))
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.context_posts)
    }
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn query(&self, prompt: &str) -> Result<QueryAnswer>;

    /// Rank posts without calling the chat model.
    async fn search(&self, query: &str, top_k: usize) -> Result<SearchOutput>;
}

/// Builds engines for the cache. Never called outside of it.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn build(&self, key: &ThreadKey) -> Result<Arc<dyn QueryEngine>>;
}

// ============ Prompt analysis ============

const INTENTS: &[(&str, &[&str])] = &[
    (
        "participants",
        &["who", "participants", "people", "users", "members", "authors", "posters", "contributors"],
    ),
    (
        "statistics",
        &["how many", "count", "number of", "statistics", "stats", "total", "average"],
    ),
    (
        "temporal",
        &["when", "timeline", "earliest", "latest", "over time", "date", "month", "year"],
    ),
    (
        "ranking",
        &["most", "top", "popular", "active", "liked", "least"],
    ),
];

const GENERIC_PROMPTS: &[&str] = &[
    "summarize",
    "summary",
    "overview",
    "tldr",
    "tl dr",
    "what is this thread about",
    "what is this about",
    "what is discussed",
    "what are people saying",
    "main points",
    "key points",
    "tell me about",
];

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "do", "does", "for", "from", "has",
    "have", "how", "i", "in", "is", "it", "of", "on", "or", "that", "the", "this", "to", "was",
    "what", "which", "with", "you", "can", "about", "any", "there", "their", "they", "thread",
];

/// Lowercased words, split on anything that is not alphanumeric.
pub(crate) fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect()
}

/// Search terms: words with stopwords and single characters removed.
pub(crate) fn terms(text: &str) -> Vec<String> {
    words(text)
        .into_iter()
        .filter(|w| w.chars().count() > 1 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Classify a prompt. Pure.
pub fn analyze_prompt(prompt: &str) -> QueryAnalysis {
    let tokens = words(prompt);
    let padded = format!(" {} ", tokens.join(" "));

    let analytical_intent: Vec<String> = INTENTS
        .iter()
        .filter(|(_, cues)| cues.iter().any(|cue| padded.contains(&format!(" {} ", cue))))
        .map(|(name, _)| name.to_string())
        .collect();

    let generic = GENERIC_PROMPTS
        .iter()
        .any(|g| padded.contains(&format!(" {} ", g)));
    let is_vague = analytical_intent.is_empty() && (tokens.len() <= 3 || generic);

    let mut context_hints = Vec::new();
    if is_vague {
        context_hints.push("Overview built from the opening post and the most-liked replies".to_string());
    }
    for intent in &analytical_intent {
        let hint = match intent.as_str() {
            "participants" => "Participant statistics cover every post in the thread",
            "statistics" => "Counts are computed over the whole thread",
            "temporal" => "Post dates are used to order events",
            _ => "Rankings use post counts and likes",
        };
        context_hints.push(hint.to_string());
    }

    QueryAnalysis {
        is_vague,
        analytical_intent,
        context_hints,
    }
}

// ============ Default engine ============

const MAX_POST_CHARS: usize = 1200;

/// In-memory engine over one thread's stored posts.
pub struct ThreadEngine {
    key: ThreadKey,
    title: Option<String>,
    posts: Vec<Post>,
    post_terms: Vec<HashMap<String, u32>>,
    doc_freq: HashMap<String, usize>,
    embeddings: Option<Vec<Vec<f32>>>,
    embedder: Arc<dyn EmbeddingProvider>,
    chat: Arc<dyn ChatModel>,
    retrieval: RetrievalConfig,
}

impl ThreadEngine {
    pub fn new(
        key: ThreadKey,
        title: Option<String>,
        posts: Vec<Post>,
        embeddings: Option<Vec<Vec<f32>>>,
        embedder: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatModel>,
        retrieval: RetrievalConfig,
    ) -> Self {
        let post_terms: Vec<HashMap<String, u32>> = posts
            .iter()
            .map(|p| {
                let mut tf = HashMap::new();
                for term in terms(&p.content) {
                    *tf.entry(term).or_insert(0) += 1;
                }
                tf
            })
            .collect();
        let mut doc_freq = HashMap::new();
        for tf in &post_terms {
            for term in tf.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
        }
        let embeddings = embeddings.filter(|e| e.len() == posts.len() && embedder.is_enabled());

        Self {
            key,
            title,
            posts,
            post_terms,
            doc_freq,
            embeddings,
            embedder,
            chat,
            retrieval,
        }
    }

    /// Load a thread's posts (and embeddings, when present) from disk.
    pub fn load(
        store: &ThreadStore,
        key: &ThreadKey,
        embedder: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatModel>,
        retrieval: RetrievalConfig,
    ) -> Result<Self> {
        let posts: Vec<Post> = store
            .read_json(key, POSTS_FILE)?
            .ok_or_else(|| anyhow::anyhow!("Thread '{}' has no processed posts", key))?;
        let metadata: Option<ThreadMetadata> = store.read_json(key, METADATA_FILE)?;
        let embeddings: Option<Vec<Vec<f32>>> = if embedder.is_enabled() {
            store.read_json(key, EMBEDDINGS_FILE)?
        } else {
            None
        };
        Ok(Self::new(
            key.clone(),
            metadata.and_then(|m| m.title),
            posts,
            embeddings,
            embedder,
            chat,
            retrieval,
        ))
    }

    fn keyword_scores(&self, query: &str) -> Vec<f64> {
        let query_terms: HashSet<String> = terms(query).into_iter().collect();
        let n = self.posts.len() as f64;
        let raw: Vec<f64> = self
            .post_terms
            .iter()
            .map(|tf| {
                query_terms
                    .iter()
                    .filter_map(|t| {
                        let count = *tf.get(t)?;
                        let df = *self.doc_freq.get(t)? as f64;
                        Some((1.0 + (count as f64).ln()) * (1.0 + n / df).ln())
                    })
                    .sum()
            })
            .collect();
        let max = raw.iter().cloned().fold(0.0, f64::max);
        if max <= 0.0 {
            return raw;
        }
        raw.into_iter().map(|s| s / max).collect()
    }

    /// Rank posts for `query`. Returns (post index, score) pairs, best first,
    /// and the retrieval mode used.
    async fn rank(&self, query: &str, top_k: usize) -> (Vec<(usize, f64)>, &'static str) {
        let mut scores = self.keyword_scores(query);
        let mut mode = "keyword";

        if let Some(vectors) = &self.embeddings {
            match embed_query(self.embedder.as_ref(), query).await {
                Ok(q) => {
                    let alpha = self.retrieval.hybrid_alpha;
                    for (score, v) in scores.iter_mut().zip(vectors) {
                        let semantic = cosine_similarity(&q, v).max(0.0) as f64;
                        *score = alpha * semantic + (1.0 - alpha) * *score;
                    }
                    mode = "hybrid";
                }
                Err(e) => {
                    tracing::warn!(thread_key = %self.key, error = %e, "query embedding failed, using keyword ranking");
                }
            }
        }

        let mut ranked: Vec<(usize, f64)> = scores
            .into_iter()
            .enumerate()
            .filter(|(_, s)| *s > 0.0)
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(self.posts[a.0].post_number.cmp(&self.posts[b.0].post_number))
        });
        ranked.truncate(top_k);
        (ranked, mode)
    }

    /// Opening post, most-liked replies, then an even spread, in thread order.
    fn overview_selection(&self, limit: usize) -> Vec<usize> {
        let mut picked: Vec<usize> = Vec::new();
        let push = |idx: usize, picked: &mut Vec<usize>| {
            if picked.len() < limit && !picked.contains(&idx) {
                picked.push(idx);
            }
        };
        if !self.posts.is_empty() {
            push(0, &mut picked);
        }

        let mut by_likes: Vec<usize> = (0..self.posts.len())
            .filter(|&i| self.posts[i].likes > 0)
            .collect();
        by_likes.sort_by(|&a, &b| self.posts[b].likes.cmp(&self.posts[a].likes).then(a.cmp(&b)));
        for idx in by_likes.into_iter().take(limit / 2) {
            push(idx, &mut picked);
        }

        let remaining = limit.saturating_sub(picked.len());
        if remaining > 0 && !self.posts.is_empty() {
            let step = (self.posts.len() / remaining).max(1);
            for idx in (0..self.posts.len()).step_by(step) {
                push(idx, &mut picked);
            }
            for idx in 0..self.posts.len() {
                push(idx, &mut picked);
            }
        }

        picked.sort_unstable();
        picked
    }

    fn analytical_result(&self) -> Value {
        let mut authors: Vec<(String, u64, u64)> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for post in &self.posts {
            match index.get(post.author.as_str()) {
                Some(&idx) => {
                    authors[idx].1 += 1;
                    authors[idx].2 += post.likes;
                }
                None => {
                    index.insert(post.author.as_str(), authors.len());
                    authors.push((post.author.clone(), 1, post.likes));
                }
            }
        }
        let total_participants = authors.len();
        // Stable sort keeps first-appearance order among equal counts.
        authors.sort_by(|a, b| b.1.cmp(&a.1));

        let mut liked: Vec<&Post> = self.posts.iter().filter(|p| p.likes > 0).collect();
        liked.sort_by(|a, b| b.likes.cmp(&a.likes).then(a.post_number.cmp(&b.post_number)));

        let dates: Vec<_> = self.posts.iter().filter_map(|p| p.created_at).collect();
        let pages = self.posts.iter().map(|p| p.page).max().unwrap_or(0);

        json!({
            "thread_stats": {
                "total_posts": self.posts.len(),
                "total_participants": total_participants,
                "total_pages": pages,
                "first_post_date": dates.iter().min(),
                "last_post_date": dates.iter().max(),
            },
            "top_authors": authors.iter().take(10).map(|(name, posts, likes)| json!({
                "author": name,
                "posts": posts,
                "likes": likes,
            })).collect::<Vec<_>>(),
            "most_liked_posts": liked.iter().take(5).map(|p| json!({
                "post_number": p.post_number,
                "author": p.author,
                "likes": p.likes,
            })).collect::<Vec<_>>(),
        })
    }

    fn build_messages(&self, prompt: &str, context: &[usize], stats: Option<&Value>) -> Vec<ChatMessage> {
        let title = self.title.as_deref().unwrap_or("untitled thread");
        let system = format!(
            "You answer questions about the forum thread \"{}\". Use only the posts and \
             statistics provided. Cite posts as [#number]. If the posts do not contain the \
             answer, say so.",
            title
        );

        let mut user = String::new();
        if let Some(stats) = stats {
            user.push_str("Thread statistics:\n");
            user.push_str(&serde_json::to_string_pretty(stats).unwrap_or_default());
            user.push_str("\n\n");
        }
        user.push_str("Posts:\n");
        for &idx in context {
            let post = &self.posts[idx];
            user.push_str(&format!(
                "[#{}] {} (page {}): {}\n\n",
                post.post_number,
                post.author,
                post.page,
                clip(&post.content, MAX_POST_CHARS)
            ));
        }
        user.push_str(&format!("Question: {}", prompt));

        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }
}

fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl QueryEngine for ThreadEngine {
    async fn query(&self, prompt: &str) -> Result<QueryAnswer> {
        let analysis = analyze_prompt(prompt);
        let top_k = self.retrieval.top_k;

        let (query_type, context, analytical_result) = if !analysis.analytical_intent.is_empty() {
            let (ranked, _) = self.rank(prompt, top_k / 2).await;
            let mut context: Vec<usize> = ranked.into_iter().map(|(i, _)| i).collect();
            context.sort_unstable();
            (QueryType::Analytical, context, Some(self.analytical_result()))
        } else if analysis.is_vague {
            (QueryType::Overview, self.overview_selection(top_k), None)
        } else {
            let (ranked, _) = self.rank(prompt, top_k).await;
            let context = if ranked.is_empty() {
                self.overview_selection(top_k)
            } else {
                ranked.into_iter().map(|(i, _)| i).collect()
            };
            (QueryType::Retrieval, context, None)
        };

        if self.posts.is_empty() {
            return Ok(QueryAnswer::failed(query_type, "No posts available for this thread"));
        }

        let messages = self.build_messages(prompt, &context, analytical_result.as_ref());
        let answer_stream = match self.chat.stream_chat(messages).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(thread_key = %self.key, error = %e, "chat model unavailable");
                let mut failed = QueryAnswer::failed(query_type, e.to_string());
                failed.analysis = Some(analysis);
                return Ok(failed);
            }
        };

        Ok(QueryAnswer {
            analysis: Some(analysis),
            context_posts: context.len(),
            query_type,
            analytical_result,
            error: None,
            answer_stream: Some(answer_stream),
        })
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<SearchOutput> {
        let started = Instant::now();
        let (ranked, mode) = self.rank(query, top_k).await;
        let results: Vec<SearchHit> = ranked
            .into_iter()
            .map(|(idx, score)| {
                let post = &self.posts[idx];
                SearchHit {
                    post_number: post.post_number,
                    author: post.author.clone(),
                    page: post.page,
                    score: (score * 1000.0).round() / 1000.0,
                    content: post.content.clone(),
                }
            })
            .collect();
        let metadata = json!({
            "mode": mode,
            "total_posts": self.posts.len(),
            "returned": results.len(),
            "elapsed_ms": started.elapsed().as_millis() as u64,
        });
        Ok(SearchOutput { results, metadata })
    }
}

/// Builds [`ThreadEngine`]s from the thread store.
pub struct ThreadEngineFactory {
    store: ThreadStore,
    embedder: Arc<dyn EmbeddingProvider>,
    chat: Arc<dyn ChatModel>,
    retrieval: RetrievalConfig,
}

impl ThreadEngineFactory {
    pub fn new(
        store: ThreadStore,
        embedder: Arc<dyn EmbeddingProvider>,
        chat: Arc<dyn ChatModel>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            chat,
            retrieval,
        }
    }
}

#[async_trait]
impl EngineFactory for ThreadEngineFactory {
    /// Reads and indexes the thread on the blocking pool; `embeddings.json`
    /// can be large.
    async fn build(&self, key: &ThreadKey) -> Result<Arc<dyn QueryEngine>> {
        let store = self.store.clone();
        let owned_key = key.clone();
        let embedder = self.embedder.clone();
        let chat = self.chat.clone();
        let retrieval = self.retrieval.clone();
        let engine = tokio::task::spawn_blocking(move || {
            ThreadEngine::load(&store, &owned_key, embedder, chat, retrieval)
        })
        .await
        .map_err(|e| anyhow::anyhow!("engine load for '{}' did not finish: {}", key, e))??;
        tracing::debug!(thread_key = %key, posts = engine.posts.len(), "query engine loaded");
        Ok(Arc::new(engine))
    }
}
