// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Admission control for downloads.
//!
//! The coordinator owns every live session. It grants a single transfer
//! slot, keeps waiting sessions in FIFO order, and republishes queue
//! positions whenever the queue changes. Public methods are synchronous
//! and return promptly; transfers run on tokio tasks spawned onto the
//! runtime the coordinator was created in.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use tokio::runtime::Handle;
use tokio::sync::watch;

use super::session::{
    DownloadSession, DownloadSettings, ReleaseFn, SessionContext, SessionControl, SlotRelease,
};
use super::throttle::Throttle;
use super::transport::Transport;
use super::types::{DownloadSnapshot, DownloadStatus};
use crate::error::ConfigurationError;
use crate::events::{EventBus, LifecycleEvent};
use crate::locks::resilient_lock;
use crate::registry::{ModelDescriptor, Registry};
use crate::verify;

/// Observer handle for one download.
///
/// Any number of handles may watch the same session; they all see the same
/// snapshots, ending with the terminal one.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    pub id: String,
    progress_rx: watch::Receiver<DownloadSnapshot>,
}

impl DownloadHandle {
    /// Latest snapshot.
    pub fn snapshot(&self) -> DownloadSnapshot {
        self.progress_rx.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.progress_rx.borrow().status.is_terminal()
    }

    /// Wait for the terminal snapshot.
    pub async fn wait(&mut self) -> DownloadSnapshot {
        loop {
            if self.progress_rx.borrow_and_update().status.is_terminal() {
                return self.progress_rx.borrow().clone();
            }
            if self.progress_rx.changed().await.is_err() {
                // Session gone; its last send is the terminal snapshot
                return self.progress_rx.borrow().clone();
            }
        }
    }
}

/// Result of [`DownloadCoordinator::request`].
#[derive(Debug)]
pub enum RequestOutcome {
    /// Already on disk; go straight to loading.
    Available(ModelDescriptor),
    /// Queued, active, or attached to an in-flight download.
    Downloading(DownloadHandle),
}

enum Pending {
    /// Never started; spawned when the slot is granted.
    Fresh(DownloadSession),
    /// Paused session waiting to reacquire the slot.
    Resume,
}

struct QueueEntry {
    id: String,
    generation: u64,
    pending: Pending,
}

struct SessionEntry {
    generation: u64,
    progress: watch::Receiver<DownloadSnapshot>,
    control: Arc<watch::Sender<SessionControl>>,
}

impl SessionEntry {
    fn status(&self) -> DownloadStatus {
        self.progress.borrow().status
    }
}

/// Holder of the transfer slot. The generation tells a finished session
/// apart from a newer one for the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    id: String,
    generation: u64,
}

#[derive(Default)]
struct CoordinatorState {
    queue: VecDeque<QueueEntry>,
    active: Option<Slot>,
    sessions: HashMap<String, SessionEntry>,
    next_generation: u64,
}

impl CoordinatorState {
    fn holds_slot(&self, id: &str) -> bool {
        match (&self.active, self.sessions.get(id)) {
            (Some(slot), Some(entry)) => slot.id == id && slot.generation == entry.generation,
            _ => false,
        }
    }

    fn queue_positions(&self) -> Vec<(String, usize)> {
        self.queue
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.id.clone(), i + 1))
            .collect()
    }

    fn is_queued(&self, id: &str) -> bool {
        self.queue.iter().any(|entry| entry.id == id)
    }
}

struct Inner {
    registry: Arc<Registry>,
    ctx: SessionContext,
    runtime: Handle,
    state: Mutex<CoordinatorState>,
}

/// Single-slot FIFO download scheduler.
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

impl DownloadCoordinator {
    /// Create a coordinator bound to the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(
        registry: Arc<Registry>,
        settings: DownloadSettings,
        transport: Arc<dyn Transport>,
        events: EventBus,
    ) -> Self {
        Self::with_runtime(registry, settings, transport, events, Handle::current())
    }

    pub fn with_runtime(
        registry: Arc<Registry>,
        settings: DownloadSettings,
        transport: Arc<dyn Transport>,
        events: EventBus,
        runtime: Handle,
    ) -> Self {
        let ctx = SessionContext {
            settings: Arc::new(settings),
            transport,
            throttle: Arc::new(Throttle::unlimited()),
            events,
        };
        Self {
            inner: Arc::new(Inner {
                registry,
                ctx,
                runtime,
                state: Mutex::new(CoordinatorState::default()),
            }),
        }
    }

    pub fn settings(&self) -> &DownloadSettings {
        &self.inner.ctx.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.ctx.events
    }

    /// Ask for a model to be present on disk.
    ///
    /// A model already on disk is reported available. That check compares
    /// the file size only; a wrong digest surfaces when the model is loaded,
    /// which discards the artifact.
    ///
    /// A model with a live session gets another observer attached. Anything
    /// else is enqueued.
    /// Unknown ids and missing credentials fail here, before any transfer.
    pub fn request(&self, id: &str) -> Result<RequestOutcome, ConfigurationError> {
        let descriptor = self.inner.registry.describe(id)?.clone();
        let credential = self.inner.registry.credential(id)?;

        let mut guard = resilient_lock(&self.inner.state);
        let state = &mut *guard;

        if let Some(entry) = state.sessions.get(id) {
            if !entry.status().is_terminal() {
                tracing::debug!(model = id, "attaching to in-flight download");
                return Ok(RequestOutcome::Downloading(DownloadHandle {
                    id: id.to_string(),
                    progress_rx: entry.progress.clone(),
                }));
            }
        }

        let path = descriptor.artifact_path(&self.inner.ctx.settings.models_dir);
        if verify::quick_check(&path, &descriptor) {
            tracing::info!(model = id, path = %path.display(), "model already available");
            return Ok(RequestOutcome::Available(descriptor));
        }

        let initial = DownloadSession::initial_snapshot(
            &descriptor,
            &self.inner.ctx.settings,
            self.inner.ctx.throttle.rate(),
        );
        let (progress_tx, progress_rx) = watch::channel(initial);
        let control = Arc::new(watch::Sender::new(SessionControl::Run));
        let generation = state.next_generation;
        state.next_generation += 1;

        let session = DownloadSession::new(
            descriptor,
            credential,
            self.inner.ctx.clone(),
            progress_tx,
            Arc::downgrade(&control),
            Inner::release_fn(&self.inner, generation),
        );

        state.sessions.insert(
            id.to_string(),
            SessionEntry { generation, progress: progress_rx.clone(), control },
        );
        state.queue.push_back(QueueEntry {
            id: id.to_string(),
            generation,
            pending: Pending::Fresh(session),
        });
        tracing::info!(model = id, position = state.queue.len(), "download queued");

        self.inner.pump(state);

        Ok(RequestOutcome::Downloading(DownloadHandle {
            id: id.to_string(),
            progress_rx,
        }))
    }

    /// Pause the active download at its next chunk boundary.
    ///
    /// Returns false (and does nothing) unless `id` is currently active.
    pub fn pause(&self, id: &str) -> bool {
        let state = resilient_lock(&self.inner.state);
        if !state.holds_slot(id) {
            return false;
        }
        match state.sessions.get(id) {
            Some(entry) if entry.status() == DownloadStatus::Active => {
                let changed = entry.control.send_if_modified(|control| {
                    if *control == SessionControl::Run {
                        *control = SessionControl::Pause;
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    tracing::info!(model = id, "pause requested");
                }
                changed
            }
            _ => false,
        }
    }

    /// Resume a paused download.
    ///
    /// The session restarts at once if the slot is free; otherwise it waits
    /// at the head of the queue. Returns false unless `id` is paused (or a
    /// pause is still pending).
    pub fn resume(&self, id: &str) -> bool {
        let mut guard = resilient_lock(&self.inner.state);
        let state = &mut *guard;
        let Some(entry) = state.sessions.get(id) else {
            return false;
        };
        let status = entry.status();
        let pausing = *entry.control.borrow() == SessionControl::Pause;
        if !(status == DownloadStatus::Paused || (status == DownloadStatus::Active && pausing)) {
            return false;
        }
        if state.is_queued(id) {
            return true;
        }

        let generation = entry.generation;
        if state.active.is_none() {
            entry.control.send_replace(SessionControl::Run);
            state.active = Some(Slot { id: id.to_string(), generation });
            tracing::info!(model = id, "download resumed");
        } else {
            // A pause that has not landed yet still owns the slot; it takes
            // this entry back as soon as it releases.
            state.queue.push_front(QueueEntry {
                id: id.to_string(),
                generation,
                pending: Pending::Resume,
            });
            tracing::info!(model = id, "resume waiting for the transfer slot");
            self.inner.publish_positions(state);
        }
        true
    }

    /// Cancel a download in any non-terminal state. Partial data is deleted.
    ///
    /// Returns false when no live session exists for `id`, or when its
    /// transfer has finished and the artifact is being verified; such a
    /// session runs to Completed or Failed and the call changes nothing.
    pub fn cancel(&self, id: &str) -> bool {
        let mut guard = resilient_lock(&self.inner.state);
        let state = &mut *guard;
        let Some(entry) = state.sessions.get(id) else {
            return false;
        };
        if entry.status().is_terminal() {
            return false;
        }
        let mut accepted = true;
        entry.control.send_if_modified(|control| match control {
            SessionControl::Finishing => {
                accepted = false;
                false
            }
            SessionControl::Cancel => false,
            _ => {
                *control = SessionControl::Cancel;
                true
            }
        });
        if !accepted {
            tracing::debug!(model = id, "cancel refused while verifying");
            return false;
        }
        tracing::info!(model = id, "cancel requested");

        let Some(index) = state.queue.iter().position(|entry| entry.id == id) else {
            // Running (or paused) sessions clean up on their own task.
            return true;
        };
        let removed = state.queue.remove(index);
        match removed {
            Some(QueueEntry { pending: Pending::Fresh(session), .. }) => {
                state.sessions.remove(id);
                self.inner.publish_positions(state);
                drop(guard);
                session.cancel_queued("cancelled before start");
            }
            _ => {
                // A paused session waiting to resume sees the control change.
                self.inner.publish_positions(state);
            }
        }
        true
    }

    /// Set the process-wide bandwidth limit; 0 removes it.
    pub fn set_bandwidth_limit(&self, bytes_per_sec: u64) {
        self.inner.ctx.throttle.limit(bytes_per_sec);
    }

    pub fn bandwidth_limit(&self) -> u64 {
        self.inner.ctx.throttle.rate()
    }

    /// Id of the session holding the transfer slot.
    pub fn active_id(&self) -> Option<String> {
        resilient_lock(&self.inner.state)
            .active
            .as_ref()
            .map(|slot| slot.id.clone())
    }

    /// Waiting ids with their 1-based positions.
    pub fn queue_positions(&self) -> Vec<(String, usize)> {
        resilient_lock(&self.inner.state).queue_positions()
    }

    /// Latest snapshot of a live session.
    pub fn snapshot(&self, id: &str) -> Option<DownloadSnapshot> {
        let state = resilient_lock(&self.inner.state);
        state.sessions.get(id).map(|entry| entry.progress.borrow().clone())
    }

    /// Cancel every live session.
    pub fn shutdown(&self) {
        let ids: Vec<String> = {
            let state = resilient_lock(&self.inner.state);
            state.sessions.keys().cloned().collect()
        };
        for id in ids {
            self.cancel(&id);
        }
        tracing::info!("download coordinator shut down");
    }
}

impl Inner {
    fn release_fn(this: &Arc<Inner>, generation: u64) -> ReleaseFn {
        let weak: Weak<Inner> = Arc::downgrade(this);
        Arc::new(move |id: &str, release: SlotRelease| {
            if let Some(inner) = weak.upgrade() {
                inner.on_release(id, generation, release);
            }
        })
    }

    fn on_release(&self, id: &str, generation: u64, release: SlotRelease) {
        let mut guard = resilient_lock(&self.state);
        let state = &mut *guard;
        let this_slot = Slot { id: id.to_string(), generation };
        if state.active.as_ref() == Some(&this_slot) {
            state.active = None;
        }
        if release == SlotRelease::Finished {
            if state.sessions.get(id).is_some_and(|entry| entry.generation == generation) {
                state.sessions.remove(id);
            }
            state
                .queue
                .retain(|entry| !(entry.id == id && entry.generation == generation));
        }
        tracing::debug!(model = id, ?release, "transfer slot released");
        self.pump(state);
    }

    /// Grant the slot to the queue head if it is free.
    fn pump(&self, state: &mut CoordinatorState) {
        if state.active.is_some() {
            self.publish_positions(state);
            return;
        }

        while let Some(entry) = state.queue.pop_front() {
            match entry.pending {
                Pending::Fresh(session) => {
                    tracing::debug!(model = %session.id(), "granting transfer slot");
                    state.active = Some(Slot { id: entry.id, generation: entry.generation });
                    self.runtime.spawn(session.run());
                    break;
                }
                Pending::Resume => {
                    let Some(session) = state.sessions.get(&entry.id) else {
                        continue;
                    };
                    let cancelled = *session.control.borrow() == SessionControl::Cancel;
                    if cancelled || session.status().is_terminal() || session.generation != entry.generation {
                        continue;
                    }
                    session.control.send_replace(SessionControl::Run);
                    tracing::info!(model = %entry.id, "download resumed");
                    state.active = Some(Slot { id: entry.id, generation: entry.generation });
                    break;
                }
            }
        }

        self.publish_positions(state);
    }

    fn publish_positions(&self, state: &CoordinatorState) {
        let queue_len = state.queue.len();
        for (id, position) in state.queue_positions() {
            self.ctx.events.publish(LifecycleEvent::QueuePosition { id, position, queue_len });
        }
    }
}
