use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::topics::TopicDefinition;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub topics: Vec<TopicDefinition>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Defaults to `<base_dir>/threads`.
    #[serde(default)]
    pub threads_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            threads_dir: None,
        }
    }
}

impl StorageConfig {
    pub fn threads_dir(&self) -> PathBuf {
        self.threads_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("threads"))
    }
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Expose internal error messages in 500 responses.
    #[serde(default)]
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            debug: false,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

fn default_cache_capacity() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamingConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_channel_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            chat_model: default_chat_model(),
            timeout_secs: default_llm_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_chat_model() -> String {
    "llama3.2".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    300
}
fn default_temperature() -> f64 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Ollama base URL; falls back to `llm.base_url`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_embed_timeout_secs() -> u64 {
    60
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_max_pages() -> u32 {
    50
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    format!("forum-wisdom/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_search_top_k")]
    pub max_search_top_k: usize,
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_search_top_k: default_max_search_top_k(),
            hybrid_alpha: default_hybrid_alpha(),
        }
    }
}

fn default_top_k() -> usize {
    8
}
fn default_max_search_top_k() -> usize {
    100
}
fn default_hybrid_alpha() -> f64 {
    0.6
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_max_questions")]
    pub max_questions: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_questions: default_max_questions(),
        }
    }
}

fn default_max_questions() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone, serde::Serialize)]
pub struct FeatureFlags {
    #[serde(default = "enabled")]
    pub topic_index: bool,
    #[serde(default = "enabled")]
    pub question_history: bool,
    #[serde(default = "enabled")]
    pub summaries: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            topic_index: true,
            question_history: true,
            summaries: true,
        }
    }
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Append-mode log file. Defaults to `<base_dir>/app.log` when unset and
    /// `to_file` is true.
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default = "enabled")]
    pub to_file: bool,
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: None,
            to_file: true,
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Config {
    /// Resolved log file path, if file logging is on.
    pub fn log_file(&self) -> Option<PathBuf> {
        if !self.logging.to_file {
            return None;
        }
        Some(
            self.logging
                .file
                .clone()
                .unwrap_or_else(|| self.storage.base_dir.join("app.log")),
        )
    }

    /// Apply `PORT`, `OLLAMA_BASE_URL` and `WISDOM_DATA_DIR` overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("PORT must be a port number, got '{}'", port))?;
            self.server.bind = rebind_port(&self.server.bind, port);
        }
        if let Ok(url) = std::env::var("OLLAMA_BASE_URL") {
            if !url.trim().is_empty() {
                self.llm.base_url = url.trim().to_string();
            }
        }
        if let Ok(dir) = std::env::var("WISDOM_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.storage.base_dir = PathBuf::from(dir.trim());
            }
        }
        Ok(())
    }
}

fn rebind_port(bind: &str, port: u16) -> String {
    match bind.rsplit_once(':') {
        Some((host, _)) => format!("{}:{}", host, port),
        None => format!("{}:{}", bind, port),
    }
}

/// Load and validate a config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.cache.capacity == 0 {
        anyhow::bail!("cache.capacity must be >= 1");
    }

    if config.streaming.channel_capacity == 0 {
        anyhow::bail!("streaming.channel_capacity must be >= 1");
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    if config.retrieval.max_search_top_k == 0 {
        anyhow::bail!("retrieval.max_search_top_k must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }

    if config.ingest.max_pages == 0 {
        anyhow::bail!("ingest.max_pages must be >= 1");
    }

    if config.llm.chat_model.trim().is_empty() {
        anyhow::bail!("llm.chat_model must not be empty");
    }

    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or ollama.",
            other
        ),
    }

    for topic in &config.topics {
        if topic.id.trim().is_empty() || topic.keywords.is_empty() {
            anyhow::bail!("every [[topics]] entry needs an id and at least one keyword");
        }
    }

    Ok(())
}
