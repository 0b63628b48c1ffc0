// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Rate Limiting
//!
//! Token bucket per identity, refilled continuously.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32, now: Instant) -> Self {
        TokenBucket {
            tokens: per_minute as f64,
            capacity: per_minute as f64,
            refill_rate: per_minute as f64 / 60.0,
            last_update: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_update = now;
    }

    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rate limiter keyed by identity.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    per_minute: u32,
}

impl RateLimiter {
    /// Allows bursts of `per_minute` and refills at `per_minute` per minute.
    pub fn new(per_minute: u32) -> Self {
        RateLimiter {
            buckets: Mutex::new(HashMap::new()),
            per_minute,
        }
    }

    /// Takes a token for `key`. Returns false if the key is rate limited.
    pub fn consume(&self, key: &str) -> bool {
        self.consume_at(key, Instant::now())
    }

    fn consume_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.per_minute, now))
            .try_consume(now)
    }

    /// Drops buckets untouched for `max_idle`. Returns how many were removed.
    pub fn cleanup_inactive(&self, max_idle: Duration) -> usize {
        self.cleanup_at(max_idle, Instant::now())
    }

    fn cleanup_at(&self, max_idle: Duration, now: Instant) -> usize {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_update) < max_idle);
        before - buckets.len()
    }

    pub fn tracked(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
