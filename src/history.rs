//! Per-thread question history.
//!
//! Questions that produced a complete answer are remembered in
//! `question_history.json` inside the thread directory, newest first.
//! Asking the same question again (ignoring case and surrounding whitespace)
//! moves it to the front and bumps its count.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::{ThreadStore, HISTORY_FILE};
use crate::thread_key::ThreadKey;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionEntry {
    pub question: String,
    pub asked_at: DateTime<Utc>,
    #[serde(default = "one")]
    pub times_asked: u32,
}

fn one() -> u32 {
    1
}

pub struct QuestionHistory {
    store: ThreadStore,
    max_questions: usize,
    enabled: bool,
    // Serializes read-modify-write cycles on the history files.
    write_lock: Mutex<()>,
}

impl QuestionHistory {
    pub fn new(store: ThreadStore, max_questions: usize, enabled: bool) -> Self {
        Self {
            store,
            max_questions: max_questions.max(1),
            enabled,
            write_lock: Mutex::new(()),
        }
    }

    /// Record a question. No-op when history is disabled or the thread
    /// directory no longer exists.
    pub fn record(&self, key: &ThreadKey, question: &str) -> Result<()> {
        let question = question.trim();
        if !self.enabled || question.is_empty() || !self.store.exists(key) {
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        let mut entries = self.load(key)?;
        let needle = question.to_lowercase();
        let times_asked = match entries
            .iter()
            .position(|e| e.question.to_lowercase() == needle)
        {
            Some(idx) => entries.remove(idx).times_asked + 1,
            None => 1,
        };
        entries.insert(
            0,
            QuestionEntry {
                question: question.to_string(),
                asked_at: Utc::now(),
                times_asked,
            },
        );
        entries.truncate(self.max_questions);
        self.store.write_json(key, HISTORY_FILE, &entries)
    }

    /// Newest first. A thread without history yields an empty list.
    pub fn questions(&self, key: &ThreadKey) -> Result<Vec<QuestionEntry>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        self.load(key)
    }

    pub fn clear(&self, key: &ThreadKey) -> Result<()> {
        let _guard = self.write_lock.lock();
        let path = self.store.thread_dir(key).join(HISTORY_FILE);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load(&self, key: &ThreadKey) -> Result<Vec<QuestionEntry>> {
        Ok(self.store.read_json(key, HISTORY_FILE)?.unwrap_or_default())
    }
}
