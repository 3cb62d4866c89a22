//! # Forum Wisdom
//!
//! Turns web-forum threads into a local knowledge base and answers questions
//! about them as a streamed response.
//!
//! ## Architecture
//!
//! ```text
//!  POST /ask ──▶ validate ──▶ Orchestrator ── background task ──────────────┐
//!                                 │                                         │
//!                                 │   IngestionCoordinator                  │
//!                                 │     existing / reprocess / fresh        │
//!                                 │     └─▶ ThreadIngestor (pages → disk)   │
//!                                 │                                         │
//!                                 │   EngineCache (LRU, per-key builds)     │
//!                                 │     └─▶ QueryEngine ─▶ ChatModel        │
//!                                 ▼                                         │
//!                  text/plain body ◀══ bounded channel ◀════════════════════┘
//! ```
//!
//! Progress lines, query-analysis hints and answer fragments travel through
//! the same channel, so the client sees them in the order they happened.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`thread_key`] | Thread key validation and derivation from URLs |
//! | [`cache`] | Bounded LRU cache of query engines |
//! | [`coordinator`] | Ingestion request dispatch and processing stats |
//! | [`orchestrator`] | Streamed `/ask` responses |
//! | [`server`] | HTTP API |
//! | [`ingest`] | Thread ingestion (forum JSON pages) |
//! | [`fetch`] | Page downloads with retry |
//! | [`engine`] | Query engines: prompt analysis, retrieval, answers |
//! | [`llm`] | Chat model client (Ollama) |
//! | [`embedding`] | Embedding providers |
//! | [`analytics`] | Thread analytics and the preview lines built from them |
//! | [`summary`] | Stored and generated thread summaries |
//! | [`topics`] | Keyword topic indexes |
//! | [`history`] | Per-thread question history |
//! | [`store`] | On-disk thread layout |
//! | [`progress`] | Progress reporting and the response channel |
//! | [`models`] | Shared data types |
//! | [`config`] | TOML configuration |
//! | [`error`] | Error type |
//! | [`logging`] | Tracing setup |

pub mod analytics;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod history;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod server;
pub mod store;
pub mod summary;
pub mod thread_key;
pub mod topics;
