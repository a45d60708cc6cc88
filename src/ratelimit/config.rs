//! Limiter configuration and defaults resolution.
//!
//! Callers describe a limiter with [`RateLimitConfig`], a tagged sum over the
//! two supported algorithms. The engine never consumes it directly: a single
//! apply-defaults step produces a [`ResolvedConfig`], which is what the rate
//! math operates on.

use serde::{Deserialize, Serialize};

use crate::error::{FloodgateError, Result};
use crate::time::Timestamp;

/// The rate-limiting algorithm in effect for a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    /// Continuous refill at `rate` units per `period_ms`.
    TokenBucket,
    /// Full capacity granted per window of `period_ms`, reset at each
    /// boundary.
    FixedWindow,
}

/// Caller-supplied configuration for a named limiter.
///
/// Shared fields: `rate` is the number of units replenished per `period_ms`;
/// `capacity` caps the bucket (defaults to `rate`); `max_reserved` is the
/// deepest deficit a reserving consumption may create (defaults to 0);
/// `shards` splits capacity across independent sub-buckets to spread write
/// contention (defaults to 1). Fixed windows may additionally pin the window
/// grid to an explicit `start_ms` epoch; when absent, the grid is anchored to
/// the timestamp of first use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateLimitConfig {
    TokenBucket {
        rate: f64,
        period_ms: f64,
        #[serde(default)]
        capacity: Option<f64>,
        #[serde(default)]
        max_reserved: Option<f64>,
        #[serde(default)]
        shards: Option<u32>,
    },
    FixedWindow {
        rate: f64,
        period_ms: f64,
        #[serde(default)]
        capacity: Option<f64>,
        #[serde(default)]
        max_reserved: Option<f64>,
        #[serde(default)]
        shards: Option<u32>,
        #[serde(default)]
        start_ms: Option<Timestamp>,
    },
}

impl RateLimitConfig {
    /// The algorithm this configuration selects.
    pub fn kind(&self) -> LimiterKind {
        match self {
            RateLimitConfig::TokenBucket { .. } => LimiterKind::TokenBucket,
            RateLimitConfig::FixedWindow { .. } => LimiterKind::FixedWindow,
        }
    }

    /// Validate and apply defaults, producing the configuration the rate
    /// math consumes. Fails fast with a descriptive error before any storage
    /// I/O happens.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let (kind, rate, period_ms, capacity, max_reserved, shards, start_ms) = match *self {
            RateLimitConfig::TokenBucket {
                rate,
                period_ms,
                capacity,
                max_reserved,
                shards,
            } => (
                LimiterKind::TokenBucket,
                rate,
                period_ms,
                capacity,
                max_reserved,
                shards,
                None,
            ),
            RateLimitConfig::FixedWindow {
                rate,
                period_ms,
                capacity,
                max_reserved,
                shards,
                start_ms,
            } => (
                LimiterKind::FixedWindow,
                rate,
                period_ms,
                capacity,
                max_reserved,
                shards,
                start_ms,
            ),
        };

        if !rate.is_finite() || rate <= 0.0 {
            return Err(FloodgateError::Config(format!(
                "rate must be a positive number, got {rate}"
            )));
        }
        if !period_ms.is_finite() || period_ms <= 0.0 {
            return Err(FloodgateError::Config(format!(
                "period_ms must be a positive number, got {period_ms}"
            )));
        }
        let capacity = capacity.unwrap_or(rate);
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(FloodgateError::Config(format!(
                "capacity must be a positive number, got {capacity}"
            )));
        }
        let max_reserved = max_reserved.unwrap_or(0.0);
        if !max_reserved.is_finite() || max_reserved < 0.0 {
            return Err(FloodgateError::Config(format!(
                "max_reserved must be non-negative, got {max_reserved}"
            )));
        }
        let shards = shards.unwrap_or(1);
        if shards == 0 {
            return Err(FloodgateError::Config(
                "shards must be at least 1".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            kind,
            rate,
            period_ms,
            capacity,
            max_reserved,
            shards,
            start_ms,
        })
    }
}

/// A validated configuration with all defaults applied.
///
/// Capacity, rate, and the reservation budget are whole-limiter values;
/// per-shard portions come from the accessor methods, since a single
/// consumption only ever touches one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub kind: LimiterKind,
    pub rate: f64,
    pub period_ms: f64,
    pub capacity: f64,
    pub max_reserved: f64,
    pub shards: u32,
    /// Explicit window-alignment epoch, fixed windows only. Back-filled by
    /// `peek` from the observed window start when the caller left it unset.
    pub start_ms: Option<Timestamp>,
}

impl ResolvedConfig {
    /// Capacity apportioned to one shard.
    pub fn capacity_per_shard(&self) -> f64 {
        self.capacity / self.shards as f64
    }

    /// Refill rate apportioned to one shard.
    pub fn rate_per_shard(&self) -> f64 {
        self.rate / self.shards as f64
    }

    /// Reservation budget apportioned to one shard.
    pub fn max_reserved_per_shard(&self) -> f64 {
        self.max_reserved / self.shards as f64
    }

    /// A copy with the reservation budget zeroed, used for non-reserving
    /// consumption where state must never be driven negative.
    pub(crate) fn without_reservation(&self) -> ResolvedConfig {
        ResolvedConfig {
            max_reserved: 0.0,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_bucket(rate: f64, period_ms: f64) -> RateLimitConfig {
        RateLimitConfig::TokenBucket {
            rate,
            period_ms,
            capacity: None,
            max_reserved: None,
            shards: None,
        }
    }

    #[test]
    fn test_resolve_applies_defaults() {
        let resolved = token_bucket(10.0, 60_000.0).resolve().unwrap();
        assert_eq!(resolved.kind, LimiterKind::TokenBucket);
        assert_eq!(resolved.capacity, 10.0);
        assert_eq!(resolved.max_reserved, 0.0);
        assert_eq!(resolved.shards, 1);
        assert_eq!(resolved.start_ms, None);
    }

    #[test]
    fn test_resolve_per_shard_portions() {
        let config = RateLimitConfig::TokenBucket {
            rate: 10.0,
            period_ms: 60_000.0,
            capacity: Some(20.0),
            max_reserved: Some(4.0),
            shards: Some(4),
        };
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.capacity_per_shard(), 5.0);
        assert_eq!(resolved.rate_per_shard(), 2.5);
        assert_eq!(resolved.max_reserved_per_shard(), 1.0);
    }

    #[test]
    fn test_resolve_rejects_invalid_fields() {
        assert!(token_bucket(0.0, 60_000.0).resolve().is_err());
        assert!(token_bucket(-1.0, 60_000.0).resolve().is_err());
        assert!(token_bucket(10.0, 0.0).resolve().is_err());
        assert!(token_bucket(f64::NAN, 60_000.0).resolve().is_err());

        let negative_reservation = RateLimitConfig::TokenBucket {
            rate: 10.0,
            period_ms: 1000.0,
            capacity: None,
            max_reserved: Some(-1.0),
            shards: None,
        };
        assert!(negative_reservation.resolve().is_err());

        let zero_shards = RateLimitConfig::FixedWindow {
            rate: 10.0,
            period_ms: 1000.0,
            capacity: None,
            max_reserved: None,
            shards: Some(0),
            start_ms: None,
        };
        assert!(zero_shards.resolve().is_err());
    }

    #[test]
    fn test_without_reservation_zeroes_budget() {
        let config = RateLimitConfig::FixedWindow {
            rate: 10.0,
            period_ms: 1000.0,
            capacity: None,
            max_reserved: Some(5.0),
            shards: None,
            start_ms: Some(0),
        };
        let resolved = config.resolve().unwrap();
        let stripped = resolved.without_reservation();
        assert_eq!(stripped.max_reserved, 0.0);
        assert_eq!(stripped.rate, resolved.rate);
        assert_eq!(stripped.start_ms, resolved.start_ms);
    }

    #[test]
    fn test_tagged_config_parses_from_json() {
        let config: RateLimitConfig = serde_json::from_str(
            r#"{"kind": "token_bucket", "rate": 10.0, "period_ms": 60000.0, "shards": 2}"#,
        )
        .unwrap();
        assert_eq!(config.kind(), LimiterKind::TokenBucket);
        assert_eq!(config.resolve().unwrap().shards, 2);

        let config: RateLimitConfig = serde_json::from_str(
            r#"{"kind": "fixed_window", "rate": 5.0, "period_ms": 1000.0, "start_ms": 1700000000000}"#,
        )
        .unwrap();
        assert_eq!(config.kind(), LimiterKind::FixedWindow);
        assert_eq!(config.resolve().unwrap().start_ms, Some(1_700_000_000_000));
    }
}
