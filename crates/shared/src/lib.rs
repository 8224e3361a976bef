//! PrepStack Shared Types and Utilities
//!
//! This crate contains types, the cache store, and database utilities shared
//! across the PrepStack platform.

pub mod cache;
pub mod db;
pub mod types;

pub use cache::{CacheError, CacheResult, KvStore, MemoryStore, RedisStore};
pub use db::*;
pub use types::*;
