// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scripted transports and runtimes shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};

use modelyard::download::{TransferBody, Transport};
use modelyard::{
    DownloadError, DownloadHandle, DownloadSettings, LifecycleEvent, ModelDescriptor, ModelHub,
    ModelInstance, ModelRuntime, Registry,
};

pub const CHUNK: usize = 1024;

/// Deterministic artifact contents.
pub fn artifact_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn descriptor(id: &str, data: &[u8]) -> ModelDescriptor {
    ModelDescriptor::new(
        id,
        id,
        format!("https://models.test/{id}.bin"),
        format!("{id}.bin"),
        data.len() as u64,
    )
    .with_sha256(sha256_hex(data))
}

pub fn fast_settings(dir: &Path) -> DownloadSettings {
    let mut settings = DownloadSettings::new(dir);
    settings.max_retries = 3;
    settings.retry_base_delay = Duration::from_millis(10);
    settings.retry_max_delay = Duration::from_millis(40);
    settings.inactivity_timeout = Duration::from_secs(1);
    settings.chunk_size = CHUNK;
    settings.progress_interval = Duration::ZERO;
    settings
}

/// One scripted response to `Transport::open`.
pub enum Script {
    /// Serve all bytes with a correct content-length.
    Serve(Vec<u8>),
    /// Serve all bytes without a content-length.
    ServeUndeclared(Vec<u8>),
    /// Serve one `CHUNK` per permit taken from `gate`.
    Gated { data: Vec<u8>, gate: Arc<Semaphore> },
    /// Send `sent` bytes, then fail with a connection reset.
    FailAfter { data: Vec<u8>, sent: usize },
    /// Send `sent` bytes, then go silent.
    Stall { data: Vec<u8>, sent: usize },
    /// Refuse with an HTTP status.
    Status(u16),
}

fn chunks_of(data: &[u8]) -> Vec<Vec<u8>> {
    data.chunks(CHUNK).map(<[u8]>::to_vec).collect()
}

#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    opens: Mutex<HashMap<String, usize>>,
    credentials: Mutex<Vec<Option<String>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, id: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn opens(&self, id: &str) -> usize {
        self.opens.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn credentials(&self) -> Vec<Option<String>> {
        self.credentials.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn open<'a>(
        &'a self,
        descriptor: &'a ModelDescriptor,
        credential: Option<&'a str>,
    ) -> BoxFuture<'a, Result<TransferBody, DownloadError>> {
        *self.opens.lock().unwrap().entry(descriptor.id.clone()).or_default() += 1;
        self.credentials.lock().unwrap().push(credential.map(str::to_string));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&descriptor.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Script::Status(404));

        Box::pin(async move {
            let body = match script {
                Script::Status(status) => return Err(DownloadError::Http { status }),
                Script::Serve(data) => TransferBody {
                    content_length: Some(data.len() as u64),
                    chunks: stream::iter(chunks_of(&data).into_iter().map(Ok::<_, DownloadError>)).boxed(),
                },
                Script::ServeUndeclared(data) => TransferBody {
                    content_length: None,
                    chunks: stream::iter(chunks_of(&data).into_iter().map(Ok::<_, DownloadError>)).boxed(),
                },
                Script::Gated { data, gate } => TransferBody {
                    content_length: Some(data.len() as u64),
                    chunks: stream::iter(chunks_of(&data))
                        .then(move |chunk| {
                            let gate = Arc::clone(&gate);
                            async move {
                                if let Ok(permit) = gate.acquire().await {
                                    permit.forget();
                                }
                                Ok::<_, DownloadError>(chunk)
                            }
                        })
                        .boxed(),
                },
                Script::FailAfter { data, sent } => TransferBody {
                    content_length: Some(data.len() as u64),
                    chunks: stream::iter(vec![
                        Ok(data[..sent].to_vec()),
                        Err(DownloadError::Network("connection reset by peer".into())),
                    ])
                    .boxed(),
                },
                Script::Stall { data, sent } => TransferBody {
                    content_length: Some(data.len() as u64),
                    chunks: stream::iter(vec![Ok::<_, DownloadError>(data[..sent].to_vec())])
                        .chain(stream::pending())
                        .boxed(),
                },
            };
            Ok(body)
        })
    }
}

pub struct EchoInstance;

impl ModelInstance for EchoInstance {
    fn generate(&self, prompt: &str, _max_tokens: u32) -> anyhow::Result<String> {
        Ok(format!("echo: {prompt}"))
    }

    fn unload(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Runtime whose next instantiations can be made to fail.
#[derive(Default)]
pub struct MockRuntime {
    failures: Mutex<VecDeque<String>>,
    pub instantiations: AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, message: &str) {
        self.failures.lock().unwrap().push_back(message.to_string());
    }

    pub fn instantiations(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }
}

impl ModelRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    fn instantiate(
        &self,
        _path: &Path,
        _descriptor: &ModelDescriptor,
    ) -> anyhow::Result<Box<dyn ModelInstance>> {
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        match self.failures.lock().unwrap().pop_front() {
            Some(message) => Err(anyhow!(message)),
            None => Ok(Box::new(EchoInstance)),
        }
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub hub: ModelHub,
    pub transport: Arc<MockTransport>,
    pub runtime: Arc<MockRuntime>,
    pub events: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl Harness {
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        Self::with(models, |_| {}, |registry| registry)
    }

    pub fn with(
        models: Vec<ModelDescriptor>,
        tune: impl FnOnce(&mut DownloadSettings),
        registry_hook: impl FnOnce(Registry) -> Registry,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let default_id = models[0].id.clone();
        let registry = registry_hook(Registry::new(models, default_id).unwrap());
        let mut settings = fast_settings(dir.path());
        tune(&mut settings);

        let transport = MockTransport::new();
        let runtime = MockRuntime::new();
        let hub = ModelHub::with_parts(
            registry,
            settings,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&runtime) as Arc<dyn ModelRuntime>,
            Duration::from_secs(10),
        );
        let events = hub.subscribe();
        Self { dir, hub, transport, runtime, events }
    }

    pub fn path(&self, id: &str) -> std::path::PathBuf {
        self.hub.registry().describe(id).unwrap().artifact_path(self.dir.path())
    }

    /// Everything published so far.
    pub fn drain(&mut self) -> Vec<LifecycleEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Poll `check` until it holds, failing the test after ten seconds.
pub async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_bytes(handle: &DownloadHandle, bytes: u64) {
    wait_until(&format!("{} to reach {bytes} bytes", handle.id), || {
        handle.snapshot().bytes_transferred >= bytes
    })
    .await;
}
