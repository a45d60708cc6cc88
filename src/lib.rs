//! Floodgate - Sharded Rate Limiting Engine
//!
//! This crate implements an embeddable rate-limiting engine: per-key quotas
//! enforced by a token-bucket or fixed-window algorithm, with capacity split
//! across shards to reduce write contention, atomic check-and-consume,
//! reservation of future capacity, and a client-side estimator that predicts
//! limiter state between server round-trips while correcting for clock skew.
//! Storage and transport are abstracted behind the [`store::ShardStore`]
//! trait; an in-process adapter ships with the crate.

pub mod config;
pub mod error;
pub mod estimator;
pub mod ratelimit;
pub mod store;
pub mod time;

pub use config::LimitsConfig;
pub use error::{FloodgateError, Result};
pub use estimator::{AvailabilityWatch, ClientEstimator, Estimate};
pub use ratelimit::{
    ConsumeOptions, LimiterKind, RateLimitConfig, RateLimitStatus, RateLimiter, Snapshot,
};
pub use store::{MemoryStore, ShardState, ShardStore};
