//! # Context Bundler Core
//!
//! Runtime-independent logic for Context Bundler: data models, token
//! estimation, priority scoring, bundle assembly, overflow analysis, the
//! build cache trait and the collaborator traits.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. Scheduling, persistence and the CLI live in
//! the `context-bundler` crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | `Document`, `ContextBundle`, `CacheEntry`, allocation and weights |
//! | [`tokens`] | Approximate token estimation |
//! | [`score`] | Deterministic priority scoring and ranking |
//! | [`builder`] | Greedy priority-first bundle assembly |
//! | [`overflow`] | Overflow reports and manual selection |
//! | [`cache`] | `BuildCache` trait and in-memory implementation |
//! | [`source`] | `DocumentSource` and `ConfigProvider` traits |
//! | [`error`] | `BundleError` taxonomy |

pub mod builder;
pub mod cache;
pub mod error;
pub mod models;
pub mod overflow;
pub mod score;
pub mod source;
pub mod tokens;

pub use error::{BundleError, Result};
