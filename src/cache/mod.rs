//! Offline-capable caching layer between a client and the network.
//!
//! This module provides:
//! - Versioned cache generations with an all-or-nothing pre-cached manifest
//! - Garbage collection of stale generations on activation
//! - Network-first request handling with opportunistic caching of static assets
//! - Offline fallback to cached snapshots, an offline page, or a synthesized 503

mod manager;
mod policy;
mod storage;
mod traits;

pub use manager::{ManagerSettings, OfflineCacheManager};
pub use policy::{AssetPolicy, DEFAULT_ASSET_EXTENSIONS};
pub use storage::{CacheStore, SqliteStorage};
pub use traits::{FetchResponse, Fetcher, Request, ResponseSnapshot, ResponseSource};
