// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Token-bucket bandwidth limiter.
//!
//! The bucket holds at most one second of tokens and may go into debt:
//! a chunk is always admitted whole and the reader then sleeps until the
//! debt is repaid. Sleeps are capped at one quantum so a new limit is
//! picked up quickly, including a switch to unlimited mid-wait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::locks::resilient_lock;

/// Longest uninterrupted sleep; limit changes apply within this bound.
pub const THROTTLE_QUANTUM: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn refill(&mut self, rate: u64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate as f64).min(rate as f64);
        self.refilled_at = now;
    }
}

#[derive(Debug)]
pub struct Throttle {
    rate: AtomicU64,
    bucket: Mutex<Bucket>,
}

impl Throttle {
    /// `bytes_per_sec == 0` disables throttling.
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            rate: AtomicU64::new(bytes_per_sec),
            bucket: Mutex::new(Bucket { tokens: 0.0, refilled_at: Instant::now() }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Acquire)
    }

    /// Change the limit. Waiters observe it at their next quantum.
    pub fn limit(&self, bytes_per_sec: u64) {
        {
            let mut bucket = resilient_lock(&self.bucket);
            // Outstanding debt survives a lower limit but never exceeds one
            // second's worth at the new rate.
            let floor = -(bytes_per_sec as f64);
            bucket.tokens = bucket.tokens.clamp(floor.min(0.0), bytes_per_sec as f64);
            bucket.refilled_at = Instant::now();
        }
        self.rate.store(bytes_per_sec, Ordering::Release);
        tracing::debug!(bytes_per_sec, "bandwidth limit changed");
    }

    /// Account for `bytes` just read, suspending until the bucket allows it.
    pub async fn consume(&self, bytes: usize) {
        if self.rate() == 0 || bytes == 0 {
            return;
        }

        {
            let mut bucket = resilient_lock(&self.bucket);
            bucket.refill(self.rate(), Instant::now());
            bucket.tokens -= bytes as f64;
        }

        loop {
            let wait = {
                let rate = self.rate();
                let mut bucket = resilient_lock(&self.bucket);
                if rate == 0 {
                    bucket.tokens = 0.0;
                    return;
                }
                bucket.refill(rate, Instant::now());
                if bucket.tokens >= 0.0 {
                    return;
                }
                Duration::from_secs_f64(-bucket.tokens / rate as f64)
            };
            tokio::time::sleep(wait.min(THROTTLE_QUANTUM)).await;
        }
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::unlimited()
    }
}
