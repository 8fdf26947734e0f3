//! # Context Bundler
//!
//! Builds, caches and serves priority-ranked context bundles for
//! template-based document generation.
//!
//! A bundle is the set of reference documents for one
//! `(project, document_type)` pair that fits a model's context budget,
//! chosen greedily by a deterministic metadata score. Builds are debounced,
//! single-flight per key and persisted with a status that callers can poll.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌───────────────┐   ┌──────────────┐
//! │ Documents   │──▶│ BuildScheduler │──▶│ SQLite cache │
//! │ (fs corpus) │   │ score + budget │   │ context_cache│
//! └─────────────┘   └───────┬───────┘   └──────┬───────┘
//!                           │                  │
//!                           ▼                  ▼
//!                     ┌──────────────────────────┐
//!                     │      ContextService      │
//!                     └──────┬─────────────┬─────┘
//!                            ▼             ▼
//!                      ┌──────────┐  ┌──────────┐
//!                      │   CLI    │  │   HTTP   │
//!                      │  (ctxb)  │  │  (axum)  │
//!                      └──────────┘  └──────────┘
//! ```
//!
//! Scoring, assembly, overflow analysis and the cache trait live in
//! `context-bundler-core`.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_cache`] | SQLite build cache |
//! | [`source_fs`] | Filesystem document source |
//! | [`scheduler`] | Debounced, single-flight builds |
//! | [`service`] | The exposed operations |
//! | [`server`] | HTTP server |
//! | [`commands`] | CLI command handlers |

pub mod commands;
pub mod config;
pub mod db;
pub mod migrate;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod source_fs;
pub mod sqlite_cache;
