// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-wide model context.
//!
//! `ModelHub` bundles the registry, the download coordinator, the loader
//! and the current-model slot. Build one at start-up and pass it (or a
//! clone) to whoever needs models; clones share all state.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::download::{
    DownloadCoordinator, DownloadSettings, DownloadSnapshot, DownloadStatus, HttpTransport,
    RequestOutcome, Transport,
};
use crate::error::{AcquireError, ConfigurationError, LoadError};
use crate::events::{EventBus, LifecycleEvent};
use crate::loader::{LoadedModel, ModelLoader, ModelRuntime, OllamaRuntime};
use crate::locks::resilient_lock;
use crate::registry::{ModelDescriptor, Registry};
use crate::verify;

/// Point-in-time description of one catalogue entry.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub descriptor: ModelDescriptor,
    pub path: PathBuf,
    /// On disk and within the size tolerance.
    pub downloaded: bool,
    /// Installed in the current-model slot.
    pub is_current: bool,
    /// Live download, if any.
    pub download: Option<DownloadSnapshot>,
}

#[derive(Clone)]
pub struct ModelHub {
    coordinator: DownloadCoordinator,
    loader: ModelLoader,
    events: EventBus,
    current: Arc<Mutex<Option<Arc<LoadedModel>>>>,
    load_timeout: Duration,
}

impl ModelHub {
    /// Assemble a hub from its parts. Must be called inside a tokio runtime.
    pub fn with_parts(
        registry: Registry,
        settings: DownloadSettings,
        transport: Arc<dyn Transport>,
        runtime: Arc<dyn ModelRuntime>,
        load_timeout: Duration,
    ) -> Self {
        let events = EventBus::new();
        let models_dir = settings.models_dir.clone();
        let coordinator =
            DownloadCoordinator::new(Arc::new(registry), settings, transport, events.clone());
        Self {
            coordinator,
            loader: ModelLoader::new(runtime, models_dir),
            events,
            current: Arc::new(Mutex::new(None)),
            load_timeout,
        }
    }

    /// Production wiring: HTTP transport and the Ollama runtime.
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = config.registry()?;
        let models_dir = config.resolve_models_dir()?;
        let settings = config.download_settings(models_dir)?;
        let transport = HttpTransport::new(config.connect_timeout())
            .context("Failed to initialise HTTP transport")?;
        let runtime = OllamaRuntime::with_url(&config.ollama_url);

        let hub = Self::with_parts(
            registry,
            settings,
            Arc::new(transport),
            Arc::new(runtime),
            config.load_timeout(),
        );
        if config.bandwidth_limit_bps > 0 {
            hub.set_bandwidth_limit(config.bandwidth_limit_bps);
        }
        Ok(hub)
    }

    pub fn registry(&self) -> &Registry {
        self.coordinator.registry()
    }

    pub fn coordinator(&self) -> &DownloadCoordinator {
        &self.coordinator
    }

    pub fn models_dir(&self) -> &std::path::Path {
        self.loader.models_dir()
    }

    /// Register a lifecycle observer.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Request a model (the default model when `id` is `None`).
    pub fn request(&self, id: Option<&str>) -> Result<RequestOutcome, ConfigurationError> {
        let id = self.registry().resolve(id)?.id.clone();
        self.coordinator.request(&id)
    }

    pub fn pause(&self, id: &str) -> bool {
        self.coordinator.pause(id)
    }

    pub fn resume(&self, id: &str) -> bool {
        self.coordinator.resume(id)
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.coordinator.cancel(id)
    }

    pub fn set_bandwidth_limit(&self, bytes_per_sec: u64) {
        self.coordinator.set_bandwidth_limit(bytes_per_sec);
    }

    /// Load a downloaded model without touching the current slot.
    ///
    /// Refuses while a download for `id` is live; the artifact is not read
    /// until its writer has finished.
    pub async fn load(&self, id: &str) -> Result<LoadedModel, LoadError> {
        let descriptor = self.registry().describe(id)?.clone();

        let result = match self.coordinator.snapshot(id).filter(|s| !s.status.is_terminal()) {
            Some(live) => Err(LoadError::DownloadInProgress {
                model: id.to_string(),
                status: live.status,
            }),
            None => self.load_verified(descriptor).await,
        };

        match &result {
            Ok(_) => self.events.publish(LifecycleEvent::ModelLoaded { id: id.to_string() }),
            Err(e) => self.events.publish(LifecycleEvent::LoadFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
        result
    }

    async fn load_verified(&self, descriptor: ModelDescriptor) -> Result<LoadedModel, LoadError> {
        let id = descriptor.id.clone();
        let loader = self.loader.clone();
        let task = tokio::task::spawn_blocking(move || loader.load(&descriptor));

        match tokio::time::timeout(self.load_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(LoadError::RuntimeFailure {
                model: id.clone(),
                detail: format!("load task failed: {join_err}"),
            }),
            Err(_) => Err(LoadError::RuntimeFailure {
                model: id,
                detail: format!("load timed out after {}s", self.load_timeout.as_secs()),
            }),
        }
    }

    /// Request, wait for the download if needed, then load.
    ///
    /// Returns the current model unchanged when it already is `id`. The
    /// result is not installed; use [`ModelHub::swap_current`].
    pub async fn ensure_loaded(&self, id: Option<&str>) -> Result<Arc<LoadedModel>, AcquireError> {
        let id = self.registry().resolve(id)?.id.clone();
        if let Some(current) = self.current().filter(|model| model.id() == id) {
            return Ok(current);
        }

        if let RequestOutcome::Downloading(mut handle) = self.coordinator.request(&id)? {
            let last = handle.wait().await;
            if last.status != DownloadStatus::Completed {
                return Err(AcquireError::Download {
                    model: id,
                    status: last.status,
                    reason: last.last_error.unwrap_or_else(|| last.status.to_string()),
                });
            }
        }

        Ok(Arc::new(self.load(&id).await?))
    }

    pub fn current(&self) -> Option<Arc<LoadedModel>> {
        resilient_lock(&self.current).clone()
    }

    /// Install `model` as current, returning the previous one (still loaded).
    pub fn swap_current(&self, model: Arc<LoadedModel>) -> Option<Arc<LoadedModel>> {
        tracing::info!(model = model.id(), "current model set");
        resilient_lock(&self.current).replace(model)
    }

    pub fn take_current(&self) -> Option<Arc<LoadedModel>> {
        resilient_lock(&self.current).take()
    }

    /// Generate with the current model.
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        let model = self.current().ok_or_else(|| anyhow!("No model is loaded"))?;
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || model.generate(&prompt))
            .await
            .context("generation task failed")?
    }

    pub fn model_info(&self, id: &str) -> Result<ModelInfo, ConfigurationError> {
        let descriptor = self.registry().describe(id)?.clone();
        let path = descriptor.artifact_path(self.models_dir());
        let download = self
            .coordinator
            .snapshot(id)
            .filter(|snapshot| !snapshot.status.is_terminal());
        // A file that is still being written is not downloaded yet.
        let downloaded = download.is_none() && verify::quick_check(&path, &descriptor);
        let is_current = self.current().is_some_and(|model| model.id() == id);

        Ok(ModelInfo { descriptor, path, downloaded, is_current, download })
    }

    /// Delete a model's artifact. Cancels a live download first and refuses
    /// while the model is current or its download is being verified. Returns whether a file was removed.
    pub fn remove_artifact(&self, id: &str) -> Result<bool> {
        let descriptor = self.registry().describe(id)?.clone();
        if self.current().is_some_and(|model| model.id() == id) {
            return Err(anyhow!("Model '{}' is currently loaded; unload it first", id));
        }
        if self.coordinator.cancel(id) {
            tracing::info!(model = id, "cancelled download before removal");
        } else if let Some(live) = self.coordinator.snapshot(id).filter(|s| !s.status.is_terminal()) {
            return Err(anyhow!("Model '{}' is {}; try again once it finishes", id, live.status));
        }

        let path = descriptor.artifact_path(self.models_dir());
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(model = id, path = %path.display(), "artifact removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    /// Cancel every download. Loaded models are left to the caller.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }
}
