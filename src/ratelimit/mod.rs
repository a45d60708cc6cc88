//! Rate limiting logic and state management.

mod config;
mod limiter;
mod math;

pub use config::{LimiterKind, RateLimitConfig, ResolvedConfig};
pub use limiter::{ConsumeOptions, RateLimitStatus, RateLimiter, Snapshot};
pub use math::{compute, RateMathResult};
