// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Byte source for download sessions.
//!
//! [`Transport`] is the seam between the session state machine and the
//! network. The production implementation streams an HTTP(S) GET with
//! reqwest; tests substitute scripted in-memory sources.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, StreamExt};

use crate::error::DownloadError;
use crate::registry::ModelDescriptor;
use crate::utils::mask_sensitive;

/// User agent sent with every transfer.
pub const USER_AGENT: &str = concat!("modelyard/", env!("CARGO_PKG_VERSION"));

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// An opened transfer: declared length plus a stream of body chunks.
pub struct TransferBody {
    /// `Content-Length` if the origin sent one.
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, Result<Vec<u8>, DownloadError>>,
}

impl std::fmt::Debug for TransferBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

pub trait Transport: Send + Sync {
    /// Start a sequential transfer of the artifact from its origin.
    fn open<'a>(
        &'a self,
        descriptor: &'a ModelDescriptor,
        credential: Option<&'a str>,
    ) -> BoxFuture<'a, Result<TransferBody, DownloadError>>;
}

/// reqwest-backed HTTP(S) transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DownloadError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn open<'a>(
        &'a self,
        descriptor: &'a ModelDescriptor,
        credential: Option<&'a str>,
    ) -> BoxFuture<'a, Result<TransferBody, DownloadError>> {
        Box::pin(async move {
            let mut request = self.client.get(&descriptor.url);
            if let Some(token) = credential {
                tracing::debug!(
                    model = %descriptor.id,
                    token = %mask_sensitive(token, 5),
                    "using bearer credential"
                );
                request = request.bearer_auth(token);
            }

            let response = request.send().await.map_err(network_error)?;
            let status = response.status();
            if !status.is_success() {
                return Err(DownloadError::Http { status: status.as_u16() });
            }

            let content_length = response.content_length();
            let chunks = response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(network_error))
                .boxed();

            Ok(TransferBody { content_length, chunks })
        })
    }
}

fn network_error(err: reqwest::Error) -> DownloadError {
    if let Some(status) = err.status() {
        return DownloadError::Http { status: status.as_u16() };
    }
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else if err.is_body() || err.is_decode() {
        "body interrupted"
    } else {
        "request failed"
    };
    DownloadError::Network(format!("{kind}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_names_crate() {
        assert!(USER_AGENT.starts_with("modelyard/"));
    }

    #[test]
    fn test_http_transport_builds() {
        assert!(HttpTransport::new(DEFAULT_CONNECT_TIMEOUT).is_ok());
    }
}
