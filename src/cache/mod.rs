//! In-process caching machinery shared by every backend.
//!
//! - [`StatCache`] remembers validators so conditional requests can be
//!   answered without touching the store
//! - [`FetchCoordinator`] collapses concurrent misses on one resource into a
//!   single origin fetch

mod flight;
mod stat;

pub use flight::FetchCoordinator;
pub use stat::{ResourceStat, StatCache};
