// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for model acquisition.
//!
//! | Class                | Retried?                      | Artifact     |
//! |----------------------|-------------------------------|--------------|
//! | [`DownloadError`]    | transient kinds, with backoff | deleted      |
//! | [`IntegrityError`]   | while attempts remain         | deleted      |
//! | [`LoadError::Corrupted`] | never (re-request)        | deleted      |
//! | [`LoadError::RuntimeFailure`] | never                | kept         |
//! | [`ConfigurationError`] | never, reported synchronously | untouched |

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::download::DownloadStatus;

/// Problems with the request itself. These fail fast and are never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("unknown model id '{0}'")]
    UnknownModel(String),

    #[error("model '{model}' requires a credential: set {source_hint}")]
    MissingCredential { model: String, source_hint: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Outcome of an integrity check that did not pass.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("artifact not found at {}", path.display())]
    Missing { path: PathBuf },

    #[error("size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("sha256 mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("artifact at {} could not be read: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },
}

/// Failure of a single transfer attempt.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("no data received for {}s", .0.as_secs())]
    Stalled(Duration),

    #[error("origin returned HTTP {status}")]
    Http { status: u16 },

    #[error("verification failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is locked by another writer", path.display())]
    Locked { path: PathBuf },
}

impl DownloadError {
    /// Whether another attempt may succeed.
    ///
    /// Network faults, stalls, server-side HTTP errors and integrity
    /// mismatches are retried; client errors, disk errors and lock
    /// contention are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Stalled(_) | Self::Integrity(_) => true,
            Self::Http { status } => *status >= 500 || *status == 408 || *status == 429,
            Self::Io { .. } | Self::Locked { .. } => false,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// Failure to turn a verified artifact into a working model.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("artifact for '{model}' is not ready: {source}")]
    NotVerified {
        model: String,
        #[source]
        source: IntegrityError,
    },

    #[error("download of '{model}' is still {status}; load it once the download completes")]
    DownloadInProgress { model: String, status: DownloadStatus },

    #[error("artifact for '{model}' is corrupted and was removed: {detail}")]
    Corrupted { model: String, detail: String },

    #[error("model '{model}' failed to start: {detail}")]
    RuntimeFailure { model: String, detail: String },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Failure of the combined request → download → load flow.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("download of '{model}' ended {status}: {reason}")]
    Download {
        model: String,
        status: DownloadStatus,
        reason: String,
    },

    #[error(transparent)]
    Load(#[from] LoadError),
}
