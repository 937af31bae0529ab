//! # otagon-core
//!
//! Core library for otagon - the state behind an AI gaming companion.
//!
//! This library provides:
//! - Domain types for users, tiers, conversations, messages and insights
//! - SQLite storage with schema migrations
//! - A cached conversation store with optimistic concurrency
//! - Monthly quota tracking per query kind
//! - Message routing from the general tab into per-game tabs
//! - Pro trial management
//! - Configuration and logging infrastructure
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use otagon_core::{Companion, Config, Database, QueryKind};
//!
//! let config = Config::load().expect("failed to load config");
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//!
//! let companion = Companion::new(Arc::new(db), &config);
//! let now = chrono::Utc::now();
//! let user = companion.user("auth-123").expect("unknown user");
//! let decision = companion
//!     .quota()
//!     .can_send_query(&user.id, QueryKind::Text, now)
//!     .expect("quota check failed");
//! println!("{}/{}", decision.used, decision.limit);
//! ```

// Re-export commonly used items at the crate root
pub use cache::{CacheStats, ConversationCache};
pub use companion::{Companion, Exchange, ExchangeOutcome, SessionStart};
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use quota::QuotaTracker;
pub use router::MessageRouter;
pub use store::ConversationStore;
pub use trial::TrialManager;
pub use types::*;

// Public modules
pub mod cache;
pub mod companion;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod quota;
pub mod router;
pub mod store;
pub mod trial;
pub mod types;
