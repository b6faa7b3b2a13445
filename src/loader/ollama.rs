// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ollama-backed model runtime.
//!
//! A downloaded GGUF is registered with a locally running Ollama server via
//! `/api/create` (a one-line Modelfile pointing at the artifact) and then
//! queried through `/api/generate`. Unloading asks the server to evict the
//! model with `keep_alive: 0`.
//!
//! All calls use reqwest's blocking client and must run off the async
//! executor (the hub uses `spawn_blocking`).

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use super::{ModelInstance, ModelRuntime};
use crate::registry::ModelDescriptor;

/// Default Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Default timeout for connection checks (in seconds).
const CONNECTION_TIMEOUT_SECS: u64 = 5;

/// Default timeout for generation requests (in seconds).
const GENERATION_TIMEOUT_SECS: u64 = 300;

/// Creating a model copies the blob into Ollama's store.
const CREATE_TIMEOUT_SECS: u64 = 1800;

/// Prefix for model names registered with Ollama.
const MODEL_NAME_PREFIX: &str = "modelyard-";

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Runtime that hosts models in a local Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaRuntime {
    base_url: String,
    generation_timeout: Duration,
    create_timeout: Duration,
}

impl Default for OllamaRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl OllamaRuntime {
    /// Connects to `http://localhost:11434`.
    pub fn new() -> Self {
        Self::with_url(DEFAULT_OLLAMA_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            base_url: url.into().trim_end_matches('/').to_string(),
            generation_timeout: Duration::from_secs(GENERATION_TIMEOUT_SECS),
            create_timeout: Duration::from_secs(CREATE_TIMEOUT_SECS),
        }
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Name under which a model is registered with Ollama.
    pub fn model_name(descriptor: &ModelDescriptor) -> String {
        format!("{}{}", MODEL_NAME_PREFIX, descriptor.id)
    }

    /// Modelfile that points Ollama at the local artifact.
    pub fn modelfile(path: &Path, descriptor: &ModelDescriptor) -> String {
        format!(
            "FROM {}\nPARAMETER num_ctx {}\n",
            path.display(),
            descriptor.runtime.context_length
        )
    }

    fn client(&self) -> Result<reqwest::blocking::Client> {
        reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")
    }

    fn connect_error(&self, err: reqwest::Error, timeout: Duration) -> anyhow::Error {
        if err.is_connect() {
            anyhow!(
                "Cannot connect to Ollama at {}. Please ensure Ollama is running with: ollama serve",
                self.base_url
            )
        } else if err.is_timeout() {
            anyhow!("Ollama request timed out after {} seconds", timeout.as_secs())
        } else {
            anyhow!("Network error talking to Ollama: {}", err)
        }
    }
}

impl ModelRuntime for OllamaRuntime {
    fn name(&self) -> &str {
        "ollama"
    }

    fn instantiate(&self, path: &Path, descriptor: &ModelDescriptor) -> Result<Box<dyn ModelInstance>> {
        let absolute = std::fs::canonicalize(path)
            .with_context(|| format!("Failed to resolve {}", path.display()))?;
        let name = Self::model_name(descriptor);
        let body = serde_json::json!({
            "model": name,
            "modelfile": Self::modelfile(&absolute, descriptor),
            "stream": false,
        });

        tracing::debug!(model = %name, url = %self.base_url, "registering model with ollama");
        let response = self
            .client()?
            .post(format!("{}/api/create", self.base_url))
            .json(&body)
            .timeout(self.create_timeout)
            .send()
            .map_err(|e| self.connect_error(e, self.create_timeout))?;

        let status = response.status();
        let text = response.text().unwrap_or_default();
        let parsed: StatusResponse = serde_json::from_str(&text).unwrap_or(StatusResponse { error: None });
        if let Some(error) = parsed.error {
            return Err(anyhow!("Ollama rejected the model: {}", error));
        }
        if !status.is_success() {
            return Err(anyhow!("Model creation failed: HTTP {} - {}", status, text));
        }

        Ok(Box::new(OllamaInstance {
            runtime: self.clone(),
            name,
            context_length: descriptor.runtime.context_length,
        }))
    }
}

/// A model registered with an Ollama server.
#[derive(Debug)]
pub struct OllamaInstance {
    runtime: OllamaRuntime,
    name: String,
    context_length: u32,
}

impl ModelInstance for OllamaInstance {
    fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let body = serde_json::json!({
            "model": self.name,
            "prompt": prompt,
            "stream": false,
            "options": {
                "num_predict": max_tokens,
                "num_ctx": self.context_length,
            },
        });

        let timeout = self.runtime.generation_timeout;
        let response = self
            .runtime
            .client()?
            .post(format!("{}/api/generate", self.runtime.base_url))
            .json(&body)
            .timeout(timeout)
            .send()
            .map_err(|e| self.runtime.connect_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!("Generation failed: HTTP {} - {}", status, error_text));
        }

        let parsed: GenerateResponse = response
            .json()
            .context("Failed to parse generation response")?;
        if let Some(error) = parsed.error {
            return Err(anyhow!("Ollama API error: {}", error));
        }
        Ok(parsed.response.unwrap_or_default())
    }

    fn unload(&self) -> Result<()> {
        let body = serde_json::json!({ "model": self.name, "keep_alive": 0 });
        let timeout = Duration::from_secs(CONNECTION_TIMEOUT_SECS * 6);
        let response = self
            .runtime
            .client()?
            .post(format!("{}/api/generate", self.runtime.base_url))
            .json(&body)
            .timeout(timeout)
            .send()
            .map_err(|e| self.runtime.connect_error(e, timeout))?;

        if !response.status().is_success() {
            return Err(anyhow!("Unload of {} failed: HTTP {}", self.name, response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::new("tiny", "Tiny", "https://example.com/t.gguf", "t.gguf", 10)
            .with_runtime("llama", 2048)
    }

    #[test]
    fn test_url_normalization() {
        let runtime = OllamaRuntime::with_url("http://localhost:11434/");
        assert_eq!(runtime.base_url(), "http://localhost:11434");
        assert_eq!(OllamaRuntime::new().base_url(), DEFAULT_OLLAMA_URL);
    }

    #[test]
    fn test_modelfile_carries_context_window() {
        let file = OllamaRuntime::modelfile(&PathBuf::from("/models/t.gguf"), &descriptor());
        assert_eq!(file, "FROM /models/t.gguf\nPARAMETER num_ctx 2048\n");
    }

    #[test]
    fn test_model_name_is_namespaced() {
        assert_eq!(OllamaRuntime::model_name(&descriptor()), "modelyard-tiny");
    }

    #[test]
    fn test_instantiate_missing_file_fails_before_network() {
        let runtime = OllamaRuntime::with_url("http://127.0.0.1:9");
        let err = runtime
            .instantiate(Path::new("/nonexistent/t.gguf"), &descriptor())
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to resolve"));
    }
}
