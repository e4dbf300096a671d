//! Cache-aside caching with request coalescing and tiered storage.
//!
//! See the [`caching`] module for an overview of how the layers fit together.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod utils;
