//! Forum page downloads.
//!
//! Threads are fetched through the forum's JSON view of a topic
//! (`<thread-url>.json?page=N`), one page per request. Transient failures
//! (429, 5xx, network errors) are retried with exponential backoff; a 404
//! means the page does not exist.

use anyhow::{bail, Result};
use reqwest::{StatusCode, Url};
use std::time::Duration;

use crate::config::IngestConfig;

pub struct PageFetcher {
    client: reqwest::Client,
    max_retries: u32,
}

impl PageFetcher {
    pub fn new(config: &IngestConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            max_retries: config.max_retries,
        })
    }

    /// Fetch one page of a thread. `Ok(None)` when the forum has no such page.
    pub async fn fetch_page(&self, thread_url: &str, page: u32) -> Result<Option<serde_json::Value>> {
        let url = page_url(thread_url, page)?;
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.client.get(url.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(Some(response.json().await?));
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!("{} returned {}", url, status));
                        continue;
                    }
                    bail!("{} returned {}", url, status);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!("Failed to fetch {}: {}", url, e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Failed to fetch {}", url)))
    }
}

/// `https://f.example/t/slug/1?u=2`, page 3 → `https://f.example/t/slug/1.json?u=2&page=3`.
pub fn page_url(thread_url: &str, page: u32) -> Result<Url> {
    let mut url = Url::parse(thread_url)?;
    let path = url.path().trim_end_matches('/').to_string();
    if path.is_empty() {
        bail!("{} does not point at a thread", thread_url);
    }
    if !path.ends_with(".json") {
        url.set_path(&format!("{}.json", path));
    }
    url.query_pairs_mut().append_pair("page", &page.to_string());
    Ok(url)
}
