//! Chat model client.
//!
//! [`ChatModel`] is the seam between answer generation and the LLM backend.
//! [`OllamaChat`] talks to Ollama's streaming `/api/chat` endpoint, which
//! answers with newline-delimited JSON objects, one per generated fragment.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use std::time::Duration;

use crate::config::LlmConfig;

/// Lazy, finite, non-restartable sequence of answer fragments.
pub type AnswerStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Start a chat completion. Connection and HTTP status errors surface
    /// here; errors after the first fragment surface inside the stream.
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<AnswerStream>;

    /// Collect a full completion into one string.
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let mut stream = self.stream_chat(messages).await?;
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }
}

pub struct OllamaChat {
    base_url: String,
    model: String,
    temperature: f64,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.chat_model.clone(),
            temperature: config.temperature,
            client,
        })
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<AnswerStream> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "options": { "temperature": self.temperature },
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.base_url,
                    e
                )
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Ollama returned {status}: {body}");
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut buffer = String::new();
            let mut done = false;
            while !done {
                let Some(chunk) = bytes.next().await else { break };
                buffer.push_str(&String::from_utf8_lossy(&chunk?));
                for line in drain_lines(&mut buffer) {
                    let parsed = parse_chat_line(&line)?;
                    if !parsed.content.is_empty() {
                        yield parsed.content;
                    }
                    if parsed.done {
                        done = true;
                        break;
                    }
                }
            }
            if !done && !buffer.trim().is_empty() {
                let parsed = parse_chat_line(buffer.trim())?;
                if !parsed.content.is_empty() {
                    yield parsed.content;
                }
            }
        };
        Ok(stream.boxed())
    }
}

#[derive(Debug, PartialEq)]
struct ChatLine {
    content: String,
    done: bool,
}

/// Remove every complete line from `buffer`, leaving a trailing partial line.
fn drain_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line = buffer[..pos].trim().to_string();
        buffer.drain(..=pos);
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

fn parse_chat_line(line: &str) -> Result<ChatLine> {
    let data: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| anyhow::anyhow!("Invalid chat stream line: {}", e))?;
    if let Some(err) = data.get("error").and_then(|e| e.as_str()) {
        bail!("Ollama error: {}", err);
    }
    let content = data
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();
    let done = data.get("done").and_then(|d| d.as_bool()).unwrap_or(false);
    Ok(ChatLine { content, done })
}
