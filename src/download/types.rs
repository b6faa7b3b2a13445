// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types shared by sessions, the coordinator, and observers.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::{format_eta, format_speed};

/// Status of a download session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DownloadStatus {
    /// Waiting for the transfer slot (or for a retry backoff to elapse)
    Queued,
    /// Holding the slot and streaming bytes
    Active,
    /// Suspended by request; the slot is released
    Paused,
    /// All bytes received, checking size and hash
    Verifying,
    /// Verified artifact on disk
    Completed,
    /// Gave up; see the terminal reason
    Failed,
    /// Cancelled by request
    Cancelled,
}

impl DownloadStatus {
    /// Returns true once no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits `self -> next`.
    ///
    /// `Active -> Queued` and `Verifying -> Queued` are the retry edges.
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        matches!(
            (self, next),
            (Queued, Active)
                | (Queued, Cancelled)
                | (Active, Paused)
                | (Active, Verifying)
                | (Active, Queued)
                | (Active, Failed)
                | (Active, Cancelled)
                | (Paused, Active)
                | (Paused, Cancelled)
                | (Verifying, Completed)
                | (Verifying, Failed)
                | (Verifying, Queued)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Immutable view of a session's state, published to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadSnapshot {
    pub id: String,
    pub status: DownloadStatus,
    pub bytes_transferred: u64,
    /// Declared length, or the catalogue size when the origin omits it
    pub total_bytes: Option<u64>,
    /// Exponentially smoothed bytes per second (0 while not transferring)
    pub speed_bps: f64,
    /// `None` while the speed is zero or the total is unknown
    pub eta: Option<Duration>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub rate_limit_bps: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DownloadSnapshot {
    /// Get progress percentage (0-100) if the total is known.
    pub fn progress_percent(&self) -> Option<f64> {
        match self.status {
            DownloadStatus::Completed => Some(100.0),
            _ => self.total_bytes.map(|total| {
                if total == 0 {
                    0.0
                } else {
                    (self.bytes_transferred as f64 / total as f64 * 100.0).min(100.0)
                }
            }),
        }
    }

    /// Get formatted speed string.
    pub fn speed_string(&self) -> Option<String> {
        (self.speed_bps > 0.0).then(|| format_speed(self.speed_bps))
    }

    /// Get formatted ETA string.
    pub fn eta_string(&self) -> Option<String> {
        self.eta.map(format_eta)
    }
}
