//! Pull-through caching proxy for dependency artifacts.
//!
//! Requests for `/<prefix>/<path>` are answered from a durable object store
//! when possible. Misses are fetched once from the backend's origin, written
//! to the store, then served.

pub mod backend;
pub mod cache;
pub mod config;
pub mod logging;
pub mod server;
pub mod store;
