// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! modelyard - local model acquisition and lifecycle management
//!
//! Fetches multi-gigabyte model artifacts, verifies them, and promotes them
//! into loaded, query-able models without blocking the caller:
//!
//! **describe** -> **download** -> **verify** -> **load** -> **serve**
//!
//! # Core Modules
//!
//! - [`registry`] - Catalogue of known artifacts with an explicit default
//! - [`download`] - Single-slot download queue with pause, resume, retry and throttling
//! - [`verify`] - Size and SHA-256 integrity checks
//! - [`loader`] - Runtime instantiation, smoke test, corruption handling
//! - [`events`] - Lifecycle notifications for observers
//! - [`hub`] - The `ModelHub` context object tying it all together
//! - [`config`] - Persistent settings at `~/.modelyard/config.json`
//! - [`error`] - Error taxonomy

pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod hub;
pub mod loader;
pub mod locks;
pub mod registry;
pub mod utils;
pub mod verify;

pub use config::Config;
pub use download::{
    DownloadCoordinator, DownloadHandle, DownloadSettings, DownloadSnapshot, DownloadStatus,
    RequestOutcome,
};
pub use error::{AcquireError, ConfigurationError, DownloadError, IntegrityError, LoadError};
pub use events::{EventBus, LifecycleEvent};
pub use hub::{ModelHub, ModelInfo};
pub use loader::{LoadedModel, ModelInstance, ModelLoader, ModelRuntime};
pub use registry::{ModelDescriptor, Registry, RuntimeParams};
pub use utils::mask_sensitive;
