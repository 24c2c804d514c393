//! # jobtrail
//!
//! Local-first job-search email triage.
//!
//! jobtrail ingests exported mailboxes (Gmail API JSON, EML, MBOX),
//! classifies every message with a local model served by Ollama, and keeps
//! the result searchable through an embedded vector index.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ JSON/EML/MBOX│──▶│  normalize  │──▶│ EmailStore   │ SQLite rows
//! └──────────────┘   └─────────────┘   └──────┬───────┘
//!                                             │ background task
//!                         ┌───────────────────┤
//!                         ▼                   ▼
//!                  ┌─────────────┐     ┌──────────────┐
//!                  │ classify    │     │ index        │
//!                  │ (Ollama)    │     │ (embeddings) │
//!                  └─────────────┘     └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! jobtrail init
//! jobtrail ingest takeout.json --account me@example.com
//! jobtrail process
//! jobtrail query "which companies invited me to interview?"
//! jobtrail follow-ups
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed errors at component seams |
//! | [`clean`] | Content cleaning and header heuristics |
//! | [`parse_json`] | Gmail-style JSON export decoding |
//! | [`parse_eml`] | EML / MBOX decoding |
//! | [`normalize`] | Canonical records, dedup, relevance filter |
//! | [`inference`] | Ollama client, structured output, bounded batches |
//! | [`classify`] | Classification chain and keyword fallback |
//! | [`insights`] | Inbox summary, progress, follow-ups |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Vector store trait and backends |
//! | [`index`] | Retrieval index |
//! | [`export`] | Index archive format |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`email_store`] | Email rows and queries |
//! | [`pipeline`] | Ingest / classify / query orchestration |
//! | [`progress`] | Classification progress on stderr |
//! | [`stats`] | `jobtrail stats` output |
//! | [`get`] | `jobtrail get` output |

pub mod classify;
pub mod clean;
pub mod config;
pub mod db;
pub mod email_store;
pub mod embedding;
pub mod error;
pub mod export;
pub mod get;
pub mod index;
pub mod inference;
pub mod insights;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod parse_eml;
pub mod parse_json;
pub mod pipeline;
pub mod progress;
pub mod stats;
pub mod store;
