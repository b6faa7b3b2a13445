// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One artifact's transfer, from slot grant to terminal state.
//!
//! A session runs on its own tokio task and is the only writer of its
//! artifact and its [`DownloadState`]. The coordinator steers it through a
//! `watch` channel of [`SessionControl`] values; the session reports back
//! through its progress channel, the event bus, and the release callback.
//!
//! Suspension points (opening the transfer, reading a chunk, throttling,
//! retry backoff) all observe cancellation. Pause is honored only between
//! chunks, after the chunk has been written and flushed.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::Instant;

use super::state::{DownloadState, SpeedMeter};
use super::throttle::Throttle;
use super::transport::Transport;
use super::types::{DownloadSnapshot, DownloadStatus};
use crate::error::{DownloadError, IntegrityError};
use crate::events::{EventBus, LifecycleEvent};
use crate::registry::ModelDescriptor;
use crate::verify;

/// Tunables shared by every session.
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub models_dir: PathBuf,
    /// Automatic retries after the first attempt.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// A read or connect that produces nothing for this long is a stall.
    pub inactivity_timeout: Duration,
    /// Largest unit written, throttled, and checked for pause.
    pub chunk_size: usize,
    /// Minimum spacing of progress events on the bus.
    pub progress_interval: Duration,
}

impl DownloadSettings {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(60),
            chunk_size: 64 * 1024,
            progress_interval: Duration::from_millis(250),
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_base_delay.saturating_mul(factor).min(self.retry_max_delay)
    }
}

/// Steering signal from the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Run,
    Pause,
    Cancel,
    /// Set by the session itself once the transfer is complete; pause and
    /// cancel are refused until it either finishes or retries.
    Finishing,
}

/// Why a session gave up the transfer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRelease {
    Paused,
    Finished,
}

pub(crate) type ReleaseFn = Arc<dyn Fn(&str, SlotRelease) + Send + Sync>;

/// Collaborators every session shares.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub settings: Arc<DownloadSettings>,
    pub transport: Arc<dyn Transport>,
    pub throttle: Arc<Throttle>,
    pub events: EventBus,
}

#[derive(Debug)]
enum Outcome {
    Completed,
    Failed(String),
    Cancelled(String),
}

#[derive(Debug)]
enum AttemptError {
    Cancelled,
    Failed(DownloadError),
}

impl From<DownloadError> for AttemptError {
    fn from(err: DownloadError) -> Self {
        Self::Failed(err)
    }
}

enum Interrupted {
    Cancelled,
    TimedOut,
}

pub(crate) struct DownloadSession {
    descriptor: ModelDescriptor,
    credential: Option<String>,
    ctx: SessionContext,
    state: DownloadState,
    path: PathBuf,
    meter: SpeedMeter,
    last_progress_event: Option<Instant>,
    progress_tx: watch::Sender<DownloadSnapshot>,
    control_rx: watch::Receiver<SessionControl>,
    control_tx: Weak<watch::Sender<SessionControl>>,
    release: ReleaseFn,
}

impl DownloadSession {
    pub(crate) fn new(
        descriptor: ModelDescriptor,
        credential: Option<String>,
        ctx: SessionContext,
        progress_tx: watch::Sender<DownloadSnapshot>,
        control_tx: Weak<watch::Sender<SessionControl>>,
        release: ReleaseFn,
    ) -> Self {
        let mut state = DownloadState::new(&descriptor.id, ctx.settings.max_retries);
        state.total_bytes = Some(descriptor.size_bytes);
        state.rate_limit_bps = ctx.throttle.rate();
        let path = descriptor.artifact_path(&ctx.settings.models_dir);

        Self {
            descriptor,
            credential,
            ctx,
            state,
            path,
            meter: SpeedMeter::new(Instant::now()),
            last_progress_event: None,
            progress_tx,
            control_rx: control_tx
                .upgrade()
                .map(|tx| tx.subscribe())
                .unwrap_or_else(|| watch::channel(SessionControl::Cancel).1),
            control_tx,
            release,
        }
    }

    /// Snapshot used to seed the progress channel.
    pub(crate) fn initial_snapshot(descriptor: &ModelDescriptor, settings: &DownloadSettings, rate: u64) -> DownloadSnapshot {
        let mut state = DownloadState::new(&descriptor.id, settings.max_retries);
        state.total_bytes = Some(descriptor.size_bytes);
        state.rate_limit_bps = rate;
        state.snapshot()
    }

    pub(crate) fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Drive the session to a terminal state. Called once the slot is granted.
    pub(crate) async fn run(mut self) {
        let outcome = self.drive().await;
        self.conclude(outcome);
        (self.release)(&self.descriptor.id, SlotRelease::Finished);
    }

    /// Terminate a session that never received the slot.
    ///
    /// The caller has already removed it from the queue, so the slot is not
    /// released.
    pub(crate) fn cancel_queued(mut self, reason: &str) {
        self.conclude(Outcome::Cancelled(reason.to_string()));
    }

    async fn drive(&mut self) -> Outcome {
        self.set_status(DownloadStatus::Active);
        tracing::info!(model = %self.descriptor.id, url = %self.descriptor.url, "download started");

        let _writer = match WriterLock::acquire(&self.path) {
            Ok(lock) => lock,
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        loop {
            let err = match self.attempt().await {
                Ok(()) => {
                    if !self.seal() {
                        self.remove_partial().await;
                        return Outcome::Cancelled("cancelled by request".to_string());
                    }
                    self.set_status(DownloadStatus::Verifying);
                    match self.verify_artifact().await {
                        Ok(()) => return Outcome::Completed,
                        Err(e) => {
                            self.unseal();
                            DownloadError::Integrity(e)
                        }
                    }
                }
                Err(AttemptError::Cancelled) => {
                    self.remove_partial().await;
                    return Outcome::Cancelled("cancelled by request".to_string());
                }
                Err(AttemptError::Failed(e)) => e,
            };

            // Every failed attempt starts the next one from an empty file.
            self.remove_partial().await;
            self.state.last_error = Some(err.to_string());

            if !err.is_retryable() {
                return Outcome::Failed(err.to_string());
            }
            if !self.state.can_retry() {
                return Outcome::Failed(format!(
                    "{} (gave up after {} retries)",
                    err, self.state.retry_count
                ));
            }

            self.state.retry_count += 1;
            let delay = self.ctx.settings.backoff(self.state.retry_count);
            tracing::warn!(
                model = %self.descriptor.id,
                attempt = self.state.retry_count,
                max = self.state.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "download attempt failed, retrying"
            );
            self.ctx.events.publish(LifecycleEvent::RetryScheduled {
                id: self.descriptor.id.clone(),
                attempt: self.state.retry_count,
                max_attempts: self.state.max_retries,
                delay,
                reason: err.to_string(),
            });

            self.state.bytes_transferred = 0;
            self.set_status(DownloadStatus::Queued);
            let sleep = tokio::time::sleep(delay);
            if let Err(Interrupted::Cancelled) = until_cancelled(&mut self.control_rx, None, sleep).await {
                return Outcome::Cancelled("cancelled by request".to_string());
            }
            self.set_status(DownloadStatus::Active);
        }
    }

    /// Stream the artifact once into a freshly truncated file.
    async fn attempt(&mut self) -> Result<(), AttemptError> {
        let inactivity = self.ctx.settings.inactivity_timeout;
        let chunk_size = self.ctx.settings.chunk_size.max(1);

        let open = self.ctx.transport.open(&self.descriptor, self.credential.as_deref());
        let mut body = match until_cancelled(&mut self.control_rx, Some(inactivity), open).await {
            Ok(result) => result?,
            Err(Interrupted::Cancelled) => return Err(AttemptError::Cancelled),
            Err(Interrupted::TimedOut) => return Err(DownloadError::Stalled(inactivity).into()),
        };

        let declared = body.content_length;
        let mut total = declared.unwrap_or(self.descriptor.size_bytes);
        tracing::debug!(model = %self.descriptor.id, ?declared, total, "transfer opened");

        let mut file = tokio::fs::File::create(&self.path)
            .await
            .map_err(|e| DownloadError::io(&self.path, e))?;

        self.state.bytes_transferred = 0;
        self.state.total_bytes = Some(total);
        self.state.rate_limit_bps = self.ctx.throttle.rate();
        self.meter.rebase(0, Instant::now());

        loop {
            let next = match until_cancelled(&mut self.control_rx, Some(inactivity), body.chunks.next()).await {
                Ok(next) => next,
                Err(Interrupted::Cancelled) => return Err(AttemptError::Cancelled),
                Err(Interrupted::TimedOut) => return Err(DownloadError::Stalled(inactivity).into()),
            };
            let data = match next {
                Some(Ok(data)) => data,
                Some(Err(e)) => return Err(e.into()),
                None => break,
            };

            for piece in data.chunks(chunk_size) {
                let after = self.state.bytes_transferred + piece.len() as u64;
                if after > total {
                    if declared.is_some() {
                        return Err(DownloadError::Network(format!(
                            "origin sent more than the declared {total} bytes"
                        ))
                        .into());
                    }
                    total = after;
                    self.state.total_bytes = Some(total);
                }

                if let Err(Interrupted::Cancelled) =
                    until_cancelled(&mut self.control_rx, None, self.ctx.throttle.consume(piece.len())).await
                {
                    return Err(AttemptError::Cancelled);
                }

                file.write_all(piece).await.map_err(|e| DownloadError::io(&self.path, e))?;
                self.record_bytes(piece.len() as u64);
                self.checkpoint(&mut file).await?;
            }
        }

        if let Some(expected) = declared {
            if self.state.bytes_transferred < expected {
                return Err(DownloadError::Network(format!(
                    "connection closed after {} of {} bytes",
                    self.state.bytes_transferred, expected
                ))
                .into());
            }
        }

        file.flush().await.map_err(|e| DownloadError::io(&self.path, e))?;
        file.sync_all().await.map_err(|e| DownloadError::io(&self.path, e))?;
        self.publish_progress(true);
        Ok(())
    }

    fn record_bytes(&mut self, n: u64) {
        let now = Instant::now();
        self.state.bytes_transferred += n;
        self.state.last_progress_at = Some(Utc::now());
        self.state.rate_limit_bps = self.ctx.throttle.rate();
        self.meter.observe(self.state.bytes_transferred, now);
        self.state.speed_bps = self.meter.bytes_per_sec();
        self.publish_progress(false);
    }

    /// Chunk boundary: honor pause and cancel.
    async fn checkpoint(&mut self, file: &mut tokio::fs::File) -> Result<(), AttemptError> {
        let control = *self.control_rx.borrow_and_update();
        match control {
            SessionControl::Run | SessionControl::Finishing => Ok(()),
            SessionControl::Cancel => Err(AttemptError::Cancelled),
            SessionControl::Pause => {
                file.flush().await.map_err(|e| DownloadError::io(&self.path, e))?;
                self.pause().await
            }
        }
    }

    async fn pause(&mut self) -> Result<(), AttemptError> {
        self.set_status(DownloadStatus::Paused);
        tracing::info!(
            model = %self.descriptor.id,
            bytes = self.state.bytes_transferred,
            "download paused"
        );
        (self.release)(&self.descriptor.id, SlotRelease::Paused);

        loop {
            if self.control_rx.changed().await.is_err() {
                return Err(AttemptError::Cancelled);
            }
            let control = *self.control_rx.borrow_and_update();
            match control {
                SessionControl::Run => break,
                SessionControl::Cancel => return Err(AttemptError::Cancelled),
                SessionControl::Pause | SessionControl::Finishing => continue,
            }
        }

        self.set_status(DownloadStatus::Active);
        self.meter.rebase(self.state.bytes_transferred, Instant::now());
        tracing::info!(model = %self.descriptor.id, "download resumed");
        Ok(())
    }

    /// Claim the finished transfer for verification. Fails when a cancel
    /// landed after the last chunk, or the coordinator is gone.
    fn seal(&self) -> bool {
        let Some(control) = self.control_tx.upgrade() else {
            return false;
        };
        control.send_if_modified(|control| match control {
            SessionControl::Cancel => false,
            _ => {
                *control = SessionControl::Finishing;
                true
            }
        })
    }

    /// Reopen the session to pause and cancel before a retry.
    fn unseal(&self) {
        if let Some(control) = self.control_tx.upgrade() {
            control.send_if_modified(|control| {
                if *control == SessionControl::Finishing {
                    *control = SessionControl::Run;
                    true
                } else {
                    false
                }
            });
        }
    }

    async fn verify_artifact(&self) -> Result<(), IntegrityError> {
        let path = self.path.clone();
        let descriptor = self.descriptor.clone();
        tokio::task::spawn_blocking(move || verify::verify(&path, &descriptor))
            .await
            .unwrap_or_else(|e| {
                Err(IntegrityError::Unreadable {
                    path: self.path.clone(),
                    reason: format!("verification task failed: {e}"),
                })
            })
    }

    async fn remove_partial(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed partial artifact"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove partial artifact"
            ),
        }
    }

    fn set_status(&mut self, next: DownloadStatus) {
        let from = match self.state.transition(next) {
            Ok(from) => from,
            Err(e) => {
                tracing::error!(model = %self.descriptor.id, from = %e.from, to = %e.to, "rejected state transition");
                return;
            }
        };
        if next != DownloadStatus::Active {
            self.state.speed_bps = 0.0;
        }

        let snapshot = self.state.snapshot();
        tracing::debug!(model = %self.descriptor.id, %from, to = %next, "state changed");
        self.ctx.events.publish(LifecycleEvent::StateChanged {
            id: self.descriptor.id.clone(),
            from,
            to: next,
            snapshot: snapshot.clone(),
        });
        if !next.is_terminal() {
            self.progress_tx.send_replace(snapshot);
        }
    }

    /// Update the watch channel every time; the bus at most once per interval.
    fn publish_progress(&mut self, force: bool) {
        let snapshot = self.state.snapshot();
        self.progress_tx.send_replace(snapshot.clone());

        let now = Instant::now();
        let due = match self.last_progress_event {
            Some(at) => now.saturating_duration_since(at) >= self.ctx.settings.progress_interval,
            None => true,
        };
        if due || force {
            self.last_progress_event = Some(now);
            self.ctx.events.publish(LifecycleEvent::Progress(snapshot));
        }
    }

    /// Enter the terminal state and publish it: state change, terminal
    /// event, then the final snapshot for handles.
    fn conclude(&mut self, outcome: Outcome) {
        let (status, reason) = match outcome {
            Outcome::Completed => (
                DownloadStatus::Completed,
                format!("verified at {}", self.path.display()),
            ),
            Outcome::Failed(reason) => (DownloadStatus::Failed, reason),
            Outcome::Cancelled(reason) => (DownloadStatus::Cancelled, reason),
        };
        if status != DownloadStatus::Completed {
            self.state.last_error = Some(reason.clone());
        }

        self.set_status(status);
        match status {
            DownloadStatus::Completed => tracing::info!(
                model = %self.descriptor.id,
                bytes = self.state.bytes_transferred,
                retries = self.state.retry_count,
                "download completed"
            ),
            DownloadStatus::Failed => {
                tracing::error!(model = %self.descriptor.id, %reason, "download failed")
            }
            _ => tracing::info!(model = %self.descriptor.id, %reason, "download cancelled"),
        }

        self.ctx.events.publish(LifecycleEvent::Terminal {
            id: self.descriptor.id.clone(),
            status,
            reason,
        });
        self.progress_tx.send_replace(self.state.snapshot());
    }
}

/// Await `fut` unless the session is cancelled or `limit` elapses first.
async fn until_cancelled<F: Future>(
    control: &mut watch::Receiver<SessionControl>,
    limit: Option<Duration>,
    fut: F,
) -> Result<F::Output, Interrupted> {
    let deadline = async move {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(fut);
    tokio::pin!(deadline);

    loop {
        if *control.borrow_and_update() == SessionControl::Cancel {
            return Err(Interrupted::Cancelled);
        }
        tokio::select! {
            output = &mut fut => return Ok(output),
            _ = &mut deadline => return Err(Interrupted::TimedOut),
            changed = control.changed() => {
                // The coordinator is gone; nobody can resume or observe us.
                if changed.is_err() {
                    return Err(Interrupted::Cancelled);
                }
            }
        }
    }
}

/// Exclusive advisory lock on `<artifact>.lock`, held while a session owns
/// the artifact. Released and removed on drop.
struct WriterLock {
    file: File,
    path: PathBuf,
}

impl WriterLock {
    fn acquire(artifact: &Path) -> Result<Self, DownloadError> {
        if let Some(dir) = artifact.parent() {
            std::fs::create_dir_all(dir).map_err(|e| DownloadError::io(dir, e))?;
        }

        let mut lock_name = artifact.as_os_str().to_os_string();
        lock_name.push(".lock");
        let path = PathBuf::from(lock_name);

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| DownloadError::io(&path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(DownloadError::Locked { path: artifact.to_path_buf() })
            }
            Err(e) => Err(DownloadError::io(&path, e)),
        }
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release writer lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut settings = DownloadSettings::new("/tmp/models");
        settings.retry_base_delay = Duration::from_secs(1);
        settings.retry_max_delay = Duration::from_secs(5);

        assert_eq!(settings.backoff(1), Duration::from_secs(1));
        assert_eq!(settings.backoff(2), Duration::from_secs(2));
        assert_eq!(settings.backoff(3), Duration::from_secs(4));
        assert_eq!(settings.backoff(4), Duration::from_secs(5));
        assert_eq!(settings.backoff(64), Duration::from_secs(5));
    }

    #[test]
    fn test_writer_lock_is_exclusive() {
        let dir = tempfile::TempDir::new().unwrap();
        let artifact = dir.path().join("nested").join("m.gguf");

        let first = WriterLock::acquire(&artifact).unwrap();
        assert!(dir.path().join("nested").join("m.gguf.lock").exists());
        assert!(matches!(
            WriterLock::acquire(&artifact),
            Err(DownloadError::Locked { .. })
        ));

        drop(first);
        assert!(!dir.path().join("nested").join("m.gguf.lock").exists());
        assert!(WriterLock::acquire(&artifact).is_ok());
    }
}
