//! On-disk layout of ingested threads.
//!
//! Each thread lives in `<threads_dir>/<thread_key>/`. The existence of that
//! directory is what distinguishes an existing thread from a new one.
//!
//! ```text
//! <threads_dir>/<key>/
//!   pages/page_0001.json     raw pages as downloaded
//!   posts.json               extracted posts
//!   metadata.json            ThreadMetadata
//!   thread_analytics.json    analytics document
//!   thread_summary.json      stored summary
//!   topic_index.json         topic index (optional)
//!   embeddings.json          post embeddings (optional)
//!   question_history.json    question history (optional)
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::Result;
use crate::models::{ThreadListing, ThreadMetadata};
use crate::thread_key::{is_valid_thread_key, ThreadKey};

pub const PAGES_DIR: &str = "pages";
pub const POSTS_FILE: &str = "posts.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const ANALYTICS_FILE: &str = "thread_analytics.json";
pub const SUMMARY_FILE: &str = "thread_summary.json";
pub const TOPIC_INDEX_FILE: &str = "topic_index.json";
pub const EMBEDDINGS_FILE: &str = "embeddings.json";
pub const HISTORY_FILE: &str = "question_history.json";

#[derive(Debug, Clone)]
pub struct ThreadStore {
    root: PathBuf,
}

impl ThreadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn thread_dir(&self, key: &ThreadKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    pub fn pages_dir(&self, key: &ThreadKey) -> PathBuf {
        self.thread_dir(key).join(PAGES_DIR)
    }

    pub fn exists(&self, key: &ThreadKey) -> bool {
        self.thread_dir(key).is_dir()
    }

    /// Create the thread directory (and its `pages/`) if needed.
    pub fn ensure_dir(&self, key: &ThreadKey) -> Result<PathBuf> {
        let dir = self.thread_dir(key);
        fs::create_dir_all(dir.join(PAGES_DIR))?;
        Ok(dir)
    }

    /// Keys of all thread directories, sorted. Entries whose names are not
    /// valid keys are ignored.
    pub fn list_keys(&self) -> Result<Vec<ThreadKey>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if is_valid_thread_key(name) {
                keys.push(ThreadKey::parse(name)?);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Thread listings, most recently processed first. Threads without
    /// readable metadata sort last.
    pub fn list_threads(&self) -> Result<Vec<ThreadListing>> {
        let mut listings = Vec::new();
        for key in self.list_keys()? {
            let metadata: Option<ThreadMetadata> = self.read_json(&key, METADATA_FILE).ok().flatten();
            let analytics: Option<serde_json::Value> =
                self.read_json(&key, ANALYTICS_FILE).ok().flatten();
            let participants = analytics
                .as_ref()
                .and_then(|a| a.pointer("/participants/total_participants"))
                .and_then(|v| v.as_u64());
            listings.push(ThreadListing {
                title: metadata.as_ref().and_then(|m| m.title.clone()),
                url: metadata.as_ref().map(|m| m.url.clone()),
                posts_count: metadata.as_ref().map(|m| m.total_posts),
                pages: metadata.as_ref().map(|m| m.total_pages),
                processed_at: metadata.as_ref().map(|m| m.processed_at),
                participants,
                thread_key: key,
            });
        }
        listings.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        Ok(listings)
    }

    /// Remove a thread directory. Returns `false` when it did not exist.
    pub fn delete(&self, key: &ThreadKey) -> Result<bool> {
        let dir = self.thread_dir(key);
        if !dir.is_dir() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        Ok(true)
    }

    /// Read a JSON artifact. A missing file is `Ok(None)`.
    pub fn read_json<T: DeserializeOwned>(&self, key: &ThreadKey, file: &str) -> Result<Option<T>> {
        let path = self.thread_dir(key).join(file);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write a JSON artifact through a temp file and rename.
    pub fn write_json<T: Serialize>(&self, key: &ThreadKey, file: &str, value: &T) -> Result<()> {
        let dir = self.thread_dir(key);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!(".{}.tmp", file));
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, dir.join(file))?;
        Ok(())
    }

    /// Number of threads and total bytes under the threads directory.
    pub fn disk_usage(&self) -> Result<(usize, u64)> {
        let threads = self.list_keys()?.len();
        let bytes = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum();
        Ok((threads, bytes))
    }
}
