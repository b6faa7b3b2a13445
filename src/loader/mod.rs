// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Turning a verified artifact into a usable model.
//!
//! The loader is synchronous: runtimes do blocking I/O and the hub calls
//! [`ModelLoader::load`] on `spawn_blocking`.
//!
//! Loading is verify, header check, instantiate, then a one-token smoke
//! test. A failure whose message matches a corruption signature removes
//! the artifact so the next request downloads it again; any other failure
//! keeps it on disk.

pub mod ollama;

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::{IntegrityError, LoadError};
use crate::registry::ModelDescriptor;
use crate::verify;

pub use ollama::OllamaRuntime;

/// Leading bytes of every GGUF file.
pub const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// Prompt used for the post-load smoke test.
const SMOKE_TEST_PROMPT: &str = "Hello";

static CORRUPTION_SIGNATURES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)corrupt|invalid magic|bad magic|truncat|unexpected (eof|end of file)|(invalid|unsupported|unknown) (file )?format|not a valid gguf",
    )
    .unwrap_or_else(|e| unreachable!("corruption pattern is valid: {e}"))
});

/// Whether a runtime error message indicates a damaged artifact.
pub fn is_corruption(detail: &str) -> bool {
    CORRUPTION_SIGNATURES.is_match(detail)
}

/// Backend that can host a model from a local artifact.
pub trait ModelRuntime: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    fn instantiate(
        &self,
        path: &Path,
        descriptor: &ModelDescriptor,
    ) -> anyhow::Result<Box<dyn ModelInstance>>;
}

/// A model hosted by a [`ModelRuntime`].
pub trait ModelInstance: Send + Sync {
    fn generate(&self, prompt: &str, max_tokens: u32) -> anyhow::Result<String>;

    /// Release runtime resources. The artifact stays on disk.
    fn unload(&self) -> anyhow::Result<()>;
}

/// A smoke-tested model, ready to serve.
pub struct LoadedModel {
    pub descriptor: ModelDescriptor,
    pub path: PathBuf,
    instance: Box<dyn ModelInstance>,
    verified: bool,
    pub loaded_at: DateTime<Utc>,
}

impl LoadedModel {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// True once the smoke test passed. Always true for models returned by
    /// [`ModelLoader::load`].
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Generate with the descriptor's default token budget.
    pub fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        self.instance.generate(prompt, self.descriptor.runtime.max_tokens)
    }

    pub fn generate_with_budget(&self, prompt: &str, max_tokens: u32) -> anyhow::Result<String> {
        self.instance.generate(prompt, max_tokens)
    }

    pub fn unload(&self) -> anyhow::Result<()> {
        tracing::info!(model = %self.descriptor.id, "unloading model");
        self.instance.unload()
    }
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("id", &self.descriptor.id)
            .field("path", &self.path)
            .field("verified", &self.verified)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

#[derive(Clone)]
pub struct ModelLoader {
    runtime: Arc<dyn ModelRuntime>,
    models_dir: PathBuf,
}

impl ModelLoader {
    pub fn new(runtime: Arc<dyn ModelRuntime>, models_dir: impl Into<PathBuf>) -> Self {
        Self { runtime, models_dir: models_dir.into() }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Verify, instantiate and smoke-test the artifact for `descriptor`.
    pub fn load(&self, descriptor: &ModelDescriptor) -> Result<LoadedModel, LoadError> {
        let path = descriptor.artifact_path(&self.models_dir);
        tracing::info!(
            model = %descriptor.id,
            runtime = self.runtime.name(),
            path = %path.display(),
            "loading model"
        );

        if let Err(source) = verify::verify(&path, descriptor) {
            // A wrong digest means the bytes are bad; drop them so the next
            // request fetches a fresh copy. An undersized file only counts as
            // absent and is left alone.
            if matches!(source, IntegrityError::HashMismatch { .. }) {
                remove_artifact(&path);
            }
            return Err(LoadError::NotVerified { model: descriptor.id.clone(), source });
        }

        if is_gguf(&path) {
            if let Err(detail) = check_gguf_header(&path) {
                return Err(self.classify(descriptor, &path, detail));
            }
        }

        let instance = self
            .runtime
            .instantiate(&path, descriptor)
            .map_err(|e| self.classify(descriptor, &path, format!("{e:#}")))?;

        if let Err(e) = instance.generate(SMOKE_TEST_PROMPT, 1) {
            if let Err(unload_err) = instance.unload() {
                tracing::warn!(model = %descriptor.id, error = %unload_err, "unload after failed smoke test");
            }
            return Err(self.classify(descriptor, &path, format!("smoke test failed: {e:#}")));
        }

        tracing::info!(model = %descriptor.id, "model loaded and smoke-tested");
        Ok(LoadedModel {
            descriptor: descriptor.clone(),
            path,
            instance,
            verified: true,
            loaded_at: Utc::now(),
        })
    }

    fn classify(&self, descriptor: &ModelDescriptor, path: &Path, detail: String) -> LoadError {
        if is_corruption(&detail) {
            tracing::warn!(model = %descriptor.id, %detail, "artifact is corrupted, removing it");
            remove_artifact(path);
            LoadError::Corrupted { model: descriptor.id.clone(), detail }
        } else {
            tracing::error!(model = %descriptor.id, %detail, "model failed to start");
            LoadError::RuntimeFailure { model: descriptor.id.clone(), detail }
        }
    }
}

fn is_gguf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"))
}

fn check_gguf_header(path: &Path) -> Result<(), String> {
    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|mut file| file.read_exact(&mut magic))
        .map_err(|e| format!("unexpected EOF reading GGUF header: {e}"))?;
    if &magic != GGUF_MAGIC {
        return Err(format!("invalid magic {:02x?}, not a valid GGUF file", magic));
    }
    Ok(())
}

fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!(path = %path.display(), "removed artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove artifact"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct EchoInstance;

    impl ModelInstance for EchoInstance {
        fn generate(&self, prompt: &str, max_tokens: u32) -> anyhow::Result<String> {
            Ok(prompt.chars().take(max_tokens as usize).collect())
        }

        fn unload(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct BrokenSmokeTest;

    impl ModelInstance for BrokenSmokeTest {
        fn generate(&self, _: &str, _: u32) -> anyhow::Result<String> {
            Err(anyhow!("llama_decode returned -3"))
        }

        fn unload(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Fails instantiation with a fixed message, or succeeds when `None`.
    struct ScriptedRuntime {
        failure: Option<&'static str>,
        broken_smoke_test: bool,
        calls: AtomicUsize,
    }

    impl ScriptedRuntime {
        fn ok() -> Self {
            Self { failure: None, broken_smoke_test: false, calls: AtomicUsize::new(0) }
        }

        fn failing(message: &'static str) -> Self {
            Self { failure: Some(message), ..Self::ok() }
        }
    }

    impl ModelRuntime for ScriptedRuntime {
        fn name(&self) -> &str {
            "scripted"
        }

        fn instantiate(&self, _: &Path, _: &ModelDescriptor) -> anyhow::Result<Box<dyn ModelInstance>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.failure {
                Some(message) => Err(anyhow!(message)),
                None if self.broken_smoke_test => Ok(Box::new(BrokenSmokeTest)),
                None => Ok(Box::new(EchoInstance)),
            }
        }
    }

    fn setup(contents: &[u8]) -> (TempDir, ModelDescriptor) {
        let dir = TempDir::new().unwrap();
        let descriptor = ModelDescriptor::new(
            "tiny",
            "Tiny",
            "https://example.com/tiny.gguf",
            "tiny.gguf",
            contents.len() as u64,
        );
        std::fs::write(descriptor.artifact_path(dir.path()), contents).unwrap();
        (dir, descriptor)
    }

    fn gguf_bytes() -> Vec<u8> {
        let mut bytes = GGUF_MAGIC.to_vec();
        bytes.extend_from_slice(&[3, 0, 0, 0, 0, 0, 0, 0]);
        bytes
    }

    #[test]
    fn test_corruption_signatures() {
        assert!(is_corruption("gguf_init: file is corrupted"));
        assert!(is_corruption("Invalid magic number"));
        assert!(is_corruption("tensor data is truncated"));
        assert!(is_corruption("Unexpected EOF while reading"));
        assert!(is_corruption("unsupported file format version 99"));
        assert!(is_corruption("invalid format"));
        assert!(!is_corruption("out of memory"));
        assert!(!is_corruption("connection refused"));
    }

    #[test]
    fn test_load_success() {
        let (dir, descriptor) = setup(&gguf_bytes());
        let loader = ModelLoader::new(Arc::new(ScriptedRuntime::ok()), dir.path());

        let model = loader.load(&descriptor).unwrap();
        assert!(model.is_verified());
        assert_eq!(model.id(), "tiny");
        assert_eq!(model.generate_with_budget("abc", 2).unwrap(), "ab");
    }

    #[test]
    fn test_corrupted_artifact_is_deleted() {
        let (dir, descriptor) = setup(&gguf_bytes());
        let runtime = Arc::new(ScriptedRuntime::failing("failed to load model: file is corrupted"));
        let loader = ModelLoader::new(runtime, dir.path());

        let err = loader.load(&descriptor).unwrap_err();
        assert!(matches!(err, LoadError::Corrupted { .. }), "got {err:?}");
        assert!(!descriptor.artifact_path(dir.path()).exists());
    }

    #[test]
    fn test_runtime_failure_keeps_artifact() {
        let (dir, descriptor) = setup(&gguf_bytes());
        let runtime = Arc::new(ScriptedRuntime::failing("CUDA out of memory"));
        let loader = ModelLoader::new(runtime, dir.path());

        match loader.load(&descriptor).unwrap_err() {
            LoadError::RuntimeFailure { detail, .. } => assert!(detail.contains("out of memory")),
            other => panic!("expected runtime failure, got {other:?}"),
        }
        assert!(descriptor.artifact_path(dir.path()).exists());
    }

    #[test]
    fn test_failed_smoke_test_is_runtime_failure() {
        let (dir, descriptor) = setup(&gguf_bytes());
        let runtime = Arc::new(ScriptedRuntime { broken_smoke_test: true, ..ScriptedRuntime::ok() });
        let loader = ModelLoader::new(runtime, dir.path());

        match loader.load(&descriptor).unwrap_err() {
            LoadError::RuntimeFailure { detail, .. } => assert!(detail.starts_with("smoke test failed")),
            other => panic!("expected runtime failure, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_magic_never_reaches_runtime() {
        let (dir, descriptor) = setup(b"NOPE0000");
        let runtime = Arc::new(ScriptedRuntime::ok());
        let loader = ModelLoader::new(Arc::clone(&runtime) as Arc<dyn ModelRuntime>, dir.path());

        assert!(matches!(loader.load(&descriptor), Err(LoadError::Corrupted { .. })));
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 0);
        assert!(!descriptor.artifact_path(dir.path()).exists());
    }

    #[test]
    fn test_missing_artifact_is_not_verified() {
        let dir = TempDir::new().unwrap();
        let descriptor = ModelDescriptor::new("gone", "Gone", "https://example.com/g.gguf", "g.gguf", 10);
        let loader = ModelLoader::new(Arc::new(ScriptedRuntime::ok()), dir.path());

        assert!(matches!(
            loader.load(&descriptor),
            Err(LoadError::NotVerified { source: IntegrityError::Missing { .. }, .. })
        ));
    }

    #[test]
    fn test_undersized_artifact_is_kept() {
        let (dir, mut descriptor) = setup(&gguf_bytes());
        descriptor.size_bytes = 4 * 1024 * 1024;
        let loader = ModelLoader::new(Arc::new(ScriptedRuntime::ok()), dir.path());

        assert!(matches!(
            loader.load(&descriptor),
            Err(LoadError::NotVerified { source: IntegrityError::SizeMismatch { .. }, .. })
        ));
        assert!(descriptor.artifact_path(dir.path()).exists());
    }

    #[test]
    fn test_hash_mismatch_discards_artifact() {
        let (dir, descriptor) = setup(&gguf_bytes());
        let descriptor = descriptor.with_sha256("f".repeat(64));
        let loader = ModelLoader::new(Arc::new(ScriptedRuntime::ok()), dir.path());

        assert!(matches!(
            loader.load(&descriptor),
            Err(LoadError::NotVerified { source: IntegrityError::HashMismatch { .. }, .. })
        ));
        assert!(!descriptor.artifact_path(dir.path()).exists());
    }
}
