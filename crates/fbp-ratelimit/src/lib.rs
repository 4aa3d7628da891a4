// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-source-identity token buckets with bounded memory.
//!
//! Each source identity (remote address plus claimed device id, typically)
//! gets an independent bucket holding `capacity` tokens that refill
//! continuously over `window`. Idle buckets are evicted LRU-style, so
//! memory is bounded no matter how many distinct sources show up.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use fbp_error::{ErrorCode, FleetError, FleetResult};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default bound on tracked source identities.
const DEFAULT_MAX_SOURCES: usize = 8_192;

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// A keyed token-bucket rate limiter.
pub struct SourceRateLimiter {
    buckets: Mutex<LruCache<String, TokenBucket>>,
    capacity: u32,
    window: Duration,
}

impl SourceRateLimiter {
    /// Allow `capacity` acquisitions per `window` per source identity.
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self::with_max_sources(capacity, window, DEFAULT_MAX_SOURCES)
    }

    /// [`new`](Self::new) with an explicit bound on tracked sources.
    pub fn with_max_sources(capacity: u32, window: Duration, max_sources: usize) -> Self {
        let cap = NonZeroUsize::new(max_sources.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            buckets: Mutex::new(LruCache::new(cap)),
            capacity: capacity.max(1),
            window,
        }
    }

    /// Try to take one token for `source`. Returns `false` when exhausted.
    pub fn check(&self, source: &str) -> bool {
        self.check_at(source, Instant::now())
    }

    /// Error-typed variant of [`check`](Self::check).
    pub fn enforce(&self, source: &str) -> FleetResult<()> {
        if self.check(source) {
            Ok(())
        } else {
            Err(FleetError::new(
                ErrorCode::RateLimited,
                "too many attempts from this source",
            )
            .with_context("source", source))
        }
    }

    /// Number of currently tracked sources (bounded by the LRU capacity).
    pub fn tracked_sources(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn check_at(&self, source: &str, now: Instant) -> bool {
        let refill_per_sec = self.capacity as f64 / self.window.as_secs_f64().max(f64::MIN_POSITIVE);
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let bucket = buckets.get_or_insert_mut(source.to_string(), || TokenBucket {
            tokens: self.capacity as f64,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * refill_per_sec).min(self.capacity as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
