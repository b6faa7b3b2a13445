// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lifecycle notifications for external observers.
//!
//! Each subscriber gets its own unbounded channel, so publishing never
//! blocks a session and a slow observer cannot cause another to miss
//! events. Events are pushed to every channel in publish order; because a
//! session publishes only from its own task, per-session order is kept.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::download::{DownloadSnapshot, DownloadStatus};
use crate::locks::{resilient_read, resilient_write};

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Position in the wait queue (1-based) out of `queue_len` waiting entries.
    QueuePosition { id: String, position: usize, queue_len: usize },
    /// Coalesced byte progress.
    Progress(DownloadSnapshot),
    StateChanged {
        id: String,
        from: DownloadStatus,
        to: DownloadStatus,
        snapshot: DownloadSnapshot,
    },
    RetryScheduled {
        id: String,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        reason: String,
    },
    /// Final event of a session. Never coalesced.
    Terminal { id: String, status: DownloadStatus, reason: String },
    ModelLoaded { id: String },
    LoadFailed { id: String, reason: String },
}

impl LifecycleEvent {
    /// Model id the event refers to.
    pub fn model_id(&self) -> &str {
        match self {
            Self::QueuePosition { id, .. }
            | Self::StateChanged { id, .. }
            | Self::RetryScheduled { id, .. }
            | Self::Terminal { id, .. }
            | Self::ModelLoaded { id }
            | Self::LoadFailed { id, .. } => id,
            Self::Progress(snapshot) => &snapshot.id,
        }
    }
}

/// Fan-out of [`LifecycleEvent`]s to registered observers.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<mpsc::UnboundedSender<LifecycleEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Dropping the receiver unsubscribes it.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        resilient_write(&self.subscribers).push(tx);
        rx
    }

    pub fn publish(&self, event: LifecycleEvent) {
        tracing::trace!(model = event.model_id(), ?event, "lifecycle event");

        let stale = {
            let subscribers = resilient_read(&self.subscribers);
            subscribers
                .iter()
                .filter(|tx| tx.send(event.clone()).is_err())
                .count()
        };

        if stale > 0 {
            resilient_write(&self.subscribers).retain(|tx| !tx.is_closed());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        resilient_read(&self.subscribers).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(id: &str) -> LifecycleEvent {
        LifecycleEvent::ModelLoaded { id: id.to_string() }
    }

    #[test]
    fn test_every_subscriber_receives_in_order() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(loaded("a"));
        bus.publish(loaded("b"));

        for rx in [&mut first, &mut second] {
            assert_eq!(rx.try_recv().unwrap().model_id(), "a");
            assert_eq!(rx.try_recv().unwrap().model_id(), "b");
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(loaded("a"));
        assert_eq!(bus.subscriber_count(), 1);
        drop(keep);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(LifecycleEvent::LoadFailed { id: "x".into(), reason: "boom".into() });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
