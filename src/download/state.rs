// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Mutable per-session download state.
//!
//! A `DownloadState` is owned by exactly one session and mutated only on
//! that session's task. Everyone else sees [`DownloadSnapshot`]s.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::types::{DownloadSnapshot, DownloadStatus};

/// Weight of the newest sample in the smoothed speed.
const SPEED_SMOOTHING: f64 = 0.3;

/// Minimum interval between speed samples.
const SPEED_SAMPLE_WINDOW: Duration = Duration::from_millis(500);

/// Rejected state machine edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: DownloadStatus,
    pub to: DownloadStatus,
}

#[derive(Debug, Clone)]
pub struct DownloadState {
    pub id: String,
    status: DownloadStatus,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub rate_limit_bps: u64,
    pub speed_bps: f64,
    pub last_error: Option<String>,
}

impl DownloadState {
    pub fn new(id: impl Into<String>, max_retries: u32) -> Self {
        Self {
            id: id.into(),
            status: DownloadStatus::Queued,
            bytes_transferred: 0,
            total_bytes: None,
            started_at: None,
            last_progress_at: None,
            retry_count: 0,
            max_retries,
            rate_limit_bps: 0,
            speed_bps: 0.0,
            last_error: None,
        }
    }

    pub fn status(&self) -> DownloadStatus {
        self.status
    }

    /// Move along the state machine, returning the previous status.
    pub fn transition(&mut self, next: DownloadStatus) -> Result<DownloadStatus, InvalidTransition> {
        let from = self.status;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        if next == DownloadStatus::Active && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.status = next;
        Ok(from)
    }

    /// Whether another automatic attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        let speed = if self.status == DownloadStatus::Active { self.speed_bps } else { 0.0 };
        let eta = match self.total_bytes {
            Some(total) if speed > 0.0 => {
                let remaining = total.saturating_sub(self.bytes_transferred);
                Some(Duration::from_secs_f64(remaining as f64 / speed))
            }
            _ => None,
        };

        DownloadSnapshot {
            id: self.id.clone(),
            status: self.status,
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
            speed_bps: speed,
            eta,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            rate_limit_bps: self.rate_limit_bps,
            started_at: self.started_at,
            last_progress_at: self.last_progress_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Exponentially smoothed transfer rate.
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    rate: f64,
    sampled_at: Instant,
    sampled_bytes: u64,
}

impl SpeedMeter {
    pub fn new(now: Instant) -> Self {
        Self { rate: 0.0, sampled_at: now, sampled_bytes: 0 }
    }

    /// Restart the sampling window without forgetting the smoothed rate.
    ///
    /// Called when a transfer starts or resumes so idle time is not counted.
    pub fn rebase(&mut self, bytes: u64, now: Instant) {
        self.sampled_at = now;
        self.sampled_bytes = bytes;
    }

    pub fn observe(&mut self, bytes: u64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.sampled_at);
        if elapsed < SPEED_SAMPLE_WINDOW {
            return;
        }
        let delta = bytes.saturating_sub(self.sampled_bytes);
        let sample = delta as f64 / elapsed.as_secs_f64();
        self.rate = if self.rate == 0.0 {
            sample
        } else {
            SPEED_SMOOTHING * sample + (1.0 - SPEED_SMOOTHING) * self.rate
        };
        self.sampled_at = now;
        self.sampled_bytes = bytes;
    }

    pub fn bytes_per_sec(&self) -> f64 {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_new() {
        let state = DownloadState::new("m", 3);
        assert_eq!(state.status(), DownloadStatus::Queued);
        assert_eq!(state.bytes_transferred, 0);
        assert!(state.can_retry());
    }

    #[test]
    fn test_transition_sets_started_at_once() {
        let mut state = DownloadState::new("m", 3);
        assert_eq!(state.transition(DownloadStatus::Active), Ok(DownloadStatus::Queued));
        let started = state.started_at;
        assert!(started.is_some());

        state.transition(DownloadStatus::Paused).unwrap();
        state.transition(DownloadStatus::Active).unwrap();
        assert_eq!(state.started_at, started);
    }

    #[test]
    fn test_invalid_transition_leaves_state() {
        let mut state = DownloadState::new("m", 3);
        let err = state.transition(DownloadStatus::Completed).unwrap_err();
        assert_eq!(err.from, DownloadStatus::Queued);
        assert_eq!(state.status(), DownloadStatus::Queued);
    }

    #[test]
    fn test_eta_requires_speed() {
        let mut state = DownloadState::new("m", 3);
        state.transition(DownloadStatus::Active).unwrap();
        state.total_bytes = Some(1000);
        state.bytes_transferred = 400;
        assert_eq!(state.snapshot().eta, None);

        state.speed_bps = 100.0;
        assert_eq!(state.snapshot().eta, Some(Duration::from_secs(6)));

        // Not transferring: speed and ETA are reported as zero/undefined
        state.transition(DownloadStatus::Paused).unwrap();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.speed_bps, 0.0);
        assert_eq!(snapshot.eta, None);
    }

    #[test]
    fn test_speed_meter_smoothing() {
        let start = Instant::now();
        let mut meter = SpeedMeter::new(start);

        meter.observe(1000, start + Duration::from_millis(100));
        assert_eq!(meter.bytes_per_sec(), 0.0, "samples shorter than the window are ignored");

        meter.observe(1000, start + Duration::from_secs(1));
        assert!((meter.bytes_per_sec() - 1000.0).abs() < 1e-6);

        meter.observe(1000 + 2000, start + Duration::from_secs(2));
        // 0.3 * 2000 + 0.7 * 1000
        assert!((meter.bytes_per_sec() - 1300.0).abs() < 1e-6);
    }
}
