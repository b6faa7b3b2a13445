// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background model downloads for modelyard
//!
//! This module provides non-blocking artifact transfers with:
//! - One active transfer at a time, the rest in a FIFO queue
//! - Pause, resume and cancel at chunk boundaries
//! - Automatic retries with exponential backoff
//! - A process-wide bandwidth limit
//! - Size and SHA-256 verification before completion
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐  spawn   ┌─────────────────┐  open   ┌───────────┐
//! │ DownloadCoordinator │────────▶│ DownloadSession │───────▶│ Transport │
//! │ (slot + queue)      │◀────────│ (tokio task)    │         └───────────┘
//! └──────────┬──────────┘ release  └───┬─────────┬───┘
//!            │                          │         │ consume
//!            ▼                          ▼         ▼
//! ┌─────────────────────┐     ┌────────────┐ ┌──────────┐
//! │ DownloadHandle      │◀────│ EventBus / │ │ Throttle │
//! │ (watch receiver)    │     │ watch      │ └──────────┘
//! └─────────────────────┘     └────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use modelyard::download::{
//!     DownloadCoordinator, DownloadSettings, HttpTransport, RequestOutcome,
//!     DEFAULT_CONNECT_TIMEOUT,
//! };
//! use modelyard::{EventBus, Registry};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let coordinator = DownloadCoordinator::new(
//!     Arc::new(Registry::builtin()),
//!     DownloadSettings::new("/var/lib/models"),
//!     Arc::new(HttpTransport::new(DEFAULT_CONNECT_TIMEOUT)?),
//!     EventBus::new(),
//! );
//!
//! if let RequestOutcome::Downloading(mut handle) = coordinator.request("tinyllama-1.1b-chat")? {
//!     let done = handle.wait().await;
//!     println!("Status: {}", done.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod session;
pub mod state;
pub mod throttle;
pub mod transport;
pub mod types;

// Re-export commonly used items
pub use coordinator::{DownloadCoordinator, DownloadHandle, RequestOutcome};
pub use session::{DownloadSettings, SessionControl, SlotRelease};
pub use state::{DownloadState, InvalidTransition, SpeedMeter};
pub use throttle::{Throttle, THROTTLE_QUANTUM};
pub use transport::{HttpTransport, TransferBody, Transport, DEFAULT_CONNECT_TIMEOUT, USER_AGENT};
pub use types::{DownloadSnapshot, DownloadStatus};
