// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Catalogue of known model artifacts.
//!
//! The registry is built once at start-up (built-in entries plus any
//! configured additions) and is read-only afterwards, so it can be shared
//! behind an `Arc` without locking.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Runtime parameters handed to the model runtime at load time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeParams {
    /// Architecture family (e.g. "mistral", "llama").
    pub model_type: String,
    /// Context window in tokens.
    pub context_length: u32,
    /// Default token budget for generation on a loaded model.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Free-form parameter count label, e.g. "7B".
    #[serde(default)]
    pub parameters: Option<String>,
}

fn default_max_tokens() -> u32 {
    512
}

/// Immutable description of one downloadable model artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Origin URL of the artifact.
    pub url: String,
    /// File name under the models directory.
    pub file_name: String,
    /// Expected artifact size in bytes.
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the artifact, if known.
    #[serde(default)]
    pub sha256: Option<String>,
    /// Environment variable that may hold a bearer token for the origin.
    #[serde(default)]
    pub auth_env: Option<String>,
    /// Refuse to download without a token.
    #[serde(default)]
    pub requires_auth: bool,
    pub runtime: RuntimeParams,
}

impl ModelDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        file_name: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            url: url.into(),
            file_name: file_name.into(),
            size_bytes,
            sha256: None,
            auth_env: None,
            requires_auth: false,
            runtime: RuntimeParams {
                model_type: "llama".to_string(),
                context_length: 4096,
                max_tokens: default_max_tokens(),
                parameters: None,
            },
        }
    }

    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into().to_ascii_lowercase());
        self
    }

    pub fn with_auth(mut self, env_var: impl Into<String>, required: bool) -> Self {
        self.auth_env = Some(env_var.into());
        self.requires_auth = required;
        self
    }

    pub fn with_runtime(mut self, model_type: impl Into<String>, context_length: u32) -> Self {
        self.runtime.model_type = model_type.into();
        self.runtime.context_length = context_length;
        self
    }

    /// Well-known local path of this artifact.
    pub fn artifact_path(&self, models_dir: &Path) -> PathBuf {
        models_dir.join(&self.file_name)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |what: &str| {
            Err(ConfigurationError::Invalid(format!("model '{}': {}", self.id, what)))
        };

        if self.id.trim().is_empty() {
            return Err(ConfigurationError::Invalid("model id must not be empty".into()));
        }
        if self.size_bytes == 0 {
            return invalid("size_bytes must be greater than zero");
        }
        if !(self.url.starts_with("https://") || self.url.starts_with("http://")) {
            return invalid("url must be http(s)");
        }
        if self.file_name.is_empty()
            || self.file_name.contains(|c| c == '/' || c == '\\')
            || self.file_name == "."
            || self.file_name == ".."
        {
            return invalid("file_name must be a plain file name");
        }
        if let Some(digest) = &self.sha256 {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return invalid("sha256 must be 64 hex characters");
            }
        }
        if self.requires_auth && self.auth_env.is_none() {
            return invalid("requires_auth is set but auth_env is missing");
        }
        Ok(())
    }
}

/// Fixed catalogue with an explicit default entry.
#[derive(Debug, Clone)]
pub struct Registry {
    models: IndexMap<String, ModelDescriptor>,
    default_id: String,
    tokens: HashMap<String, String>,
}

impl Registry {
    /// Build a registry. Ids must be unique and `default_id` must exist.
    pub fn new(
        models: Vec<ModelDescriptor>,
        default_id: impl Into<String>,
    ) -> Result<Self, ConfigurationError> {
        let default_id = default_id.into();
        let mut catalogue = IndexMap::with_capacity(models.len());

        for descriptor in models {
            descriptor.validate()?;
            if catalogue.contains_key(&descriptor.id) {
                return Err(ConfigurationError::Invalid(format!(
                    "duplicate model id '{}'",
                    descriptor.id
                )));
            }
            catalogue.insert(descriptor.id.clone(), descriptor);
        }

        if !catalogue.contains_key(&default_id) {
            return Err(ConfigurationError::Invalid(format!(
                "default model '{}' is not in the catalogue",
                default_id
            )));
        }

        Ok(Self {
            models: catalogue,
            default_id,
            tokens: HashMap::new(),
        })
    }

    /// The built-in catalogue.
    pub fn builtin() -> Self {
        Self::new(builtin_models(), BUILTIN_DEFAULT)
            .unwrap_or_else(|e| unreachable!("built-in catalogue is valid: {e}"))
    }

    /// Attach a bearer token for one model (from configuration).
    pub fn with_token(mut self, id: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(id.into(), token.into());
        self
    }

    pub fn describe(&self, id: &str) -> Result<&ModelDescriptor, ConfigurationError> {
        self.models
            .get(id)
            .ok_or_else(|| ConfigurationError::UnknownModel(id.to_string()))
    }

    /// Model ids in catalogue order.
    pub fn list_ids(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.values()
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    pub fn default_descriptor(&self) -> &ModelDescriptor {
        &self.models[self.default_id.as_str()]
    }

    /// Resolve `id`, falling back to the default model.
    pub fn resolve(&self, id: Option<&str>) -> Result<&ModelDescriptor, ConfigurationError> {
        self.describe(id.unwrap_or(&self.default_id))
    }

    /// Bearer token for a model's origin.
    ///
    /// The descriptor's environment variable wins over a configured token.
    /// A model that requires auth without any token is a configuration error.
    pub fn credential(&self, id: &str) -> Result<Option<String>, ConfigurationError> {
        let descriptor = self.describe(id)?;

        let from_env = descriptor
            .auth_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|value| !value.trim().is_empty());
        let token = from_env.or_else(|| self.tokens.get(id).cloned());

        match token {
            Some(token) => Ok(Some(token)),
            None if descriptor.requires_auth => Err(ConfigurationError::MissingCredential {
                model: id.to_string(),
                source_hint: descriptor
                    .auth_env
                    .clone()
                    .unwrap_or_else(|| "an auth token".to_string()),
            }),
            None => Ok(None),
        }
    }
}

const BUILTIN_DEFAULT: &str = "mistral-7b-instruct";

fn builtin_models() -> Vec<ModelDescriptor> {
    let mut mistral = ModelDescriptor::new(
        "mistral-7b-instruct",
        "Mistral 7B Instruct",
        "https://huggingface.co/TheBloke/Mistral-7B-Instruct-v0.1-GGUF/resolve/main/mistral-7b-instruct-v0.1.Q4_0.gguf",
        "mistral-7b-instruct-v0.1.Q4_0.gguf",
        4_108_916_384,
    )
    .with_auth("HF_TOKEN", false)
    .with_runtime("mistral", 8192);
    mistral.description = "A powerful instruction-following language model".to_string();
    mistral.runtime.parameters = Some("7B".to_string());

    let mut tinyllama = ModelDescriptor::new(
        "tinyllama-1.1b-chat",
        "TinyLlama 1.1B Chat",
        "https://huggingface.co/TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF/resolve/main/tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf",
        "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf",
        668_788_096,
    )
    .with_auth("HF_TOKEN", false)
    .with_runtime("llama", 2048);
    tinyllama.description = "Small chat model for low-memory machines".to_string();
    tinyllama.runtime.parameters = Some("1.1B".to_string());

    vec![mistral, tinyllama]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> ModelDescriptor {
        ModelDescriptor::new(id, id, "https://example.com/m.bin", format!("{id}.bin"), 1000)
    }

    #[test]
    fn test_builtin_default_is_explicit() {
        let registry = Registry::builtin();
        assert_eq!(registry.default_id(), "mistral-7b-instruct");
        assert_eq!(registry.default_descriptor().runtime.context_length, 8192);
        assert_eq!(registry.list_ids(), vec!["mistral-7b-instruct", "tinyllama-1.1b-chat"]);
    }

    #[test]
    fn test_default_need_not_be_first() {
        let registry = Registry::new(vec![descriptor("a"), descriptor("b")], "b").unwrap();
        assert_eq!(registry.default_id(), "b");
        assert_eq!(registry.resolve(None).unwrap().id, "b");
        assert_eq!(registry.resolve(Some("a")).unwrap().id, "a");
    }

    #[test]
    fn test_describe_unknown() {
        let registry = Registry::builtin();
        assert_eq!(
            registry.describe("nope"),
            Err(ConfigurationError::UnknownModel("nope".to_string()))
        );
    }

    #[test]
    fn test_rejects_bad_catalogue() {
        assert!(Registry::new(vec![descriptor("a"), descriptor("a")], "a").is_err());
        assert!(Registry::new(vec![descriptor("a")], "missing").is_err());

        let mut traversal = descriptor("t");
        traversal.file_name = "../evil.bin".to_string();
        assert!(Registry::new(vec![traversal], "t").is_err());

        let bad_hash = descriptor("h").with_sha256("abc");
        assert!(Registry::new(vec![bad_hash], "h").is_err());
    }

    #[test]
    fn test_credential_resolution() {
        let required = descriptor("gated").with_auth("MODELYARD_TEST_UNSET_TOKEN_VAR", true);
        let optional = descriptor("open").with_auth("MODELYARD_TEST_UNSET_TOKEN_VAR", false);
        let registry = Registry::new(vec![required, optional], "open").unwrap();

        assert_eq!(registry.credential("open"), Ok(None));
        assert!(matches!(
            registry.credential("gated"),
            Err(ConfigurationError::MissingCredential { .. })
        ));

        let registry = registry.with_token("gated", "hf_configured");
        assert_eq!(registry.credential("gated"), Ok(Some("hf_configured".to_string())));
    }

    #[test]
    fn test_artifact_path() {
        let d = descriptor("x");
        assert_eq!(d.artifact_path(Path::new("/models")), PathBuf::from("/models/x.bin"));
    }
}
