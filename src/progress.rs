//! Ingestion progress reporting.
//!
//! Ingestors describe what they are doing through a [`ProgressReporter`].
//! During an `/ask` request the reporter is a [`StreamSender`]: the write end
//! of the bounded channel the response stream drains, so every report becomes
//! a `PROGRESS: <message>` line on the wire in the order it was made.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// One line of text bound for the response stream.
#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub text: String,
    pub emitted_at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            emitted_at: Utc::now(),
        }
    }
}

/// Receives human-readable progress messages from a collaborator.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, message: &str);
}

/// No-op reporter for callers that run an ingestor without a response
/// channel, such as library users and tests.
pub struct NoProgress;

#[async_trait]
impl ProgressReporter for NoProgress {
    async fn report(&self, _message: &str) {}
}

/// Producer half of a request's response channel.
///
/// Sends wait for capacity, so a slow client applies backpressure to the
/// background task. Once the receiver is gone (client disconnected) sends
/// become no-ops and the producer keeps running.
#[derive(Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<ProgressEvent>,
}

impl StreamSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Send a line verbatim.
    pub async fn send(&self, text: impl Into<String>) {
        let _ = self.tx.send(ProgressEvent::new(text)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl ProgressReporter for StreamSender {
    async fn report(&self, message: &str) {
        self.send(format!("PROGRESS: {}\n", message)).await;
    }
}

/// Thousands separators for progress messages: `1234567` -> `1,234,567`.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}
