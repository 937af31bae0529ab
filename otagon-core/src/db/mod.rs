//! Database layer for otagon
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository pattern for queries
//! - Transactional quota updates and message migration

pub mod repo;
pub mod schema;

pub use repo::Database;
