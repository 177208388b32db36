//! Metadata/stream provider contract and the generic HTTP adapter.
//!
//! The orchestration core never speaks a service-specific wire protocol.
//! It depends on [`MediaProvider`]: resolve an identifier to playable
//! metadata, run a lightweight availability probe, and open a byte stream
//! for a chosen format variant. [`HttpProvider`] is the bundled
//! implementation for services exposing that contract as JSON over HTTP;
//! deployments with richer backends supply their own impl.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use reqwest::header::RANGE;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::ident::TrackId;

/// Connect timeout for provider requests.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Per-request timeout for metadata and probe calls. Stream requests get
/// no total deadline; they are bounded by chunk progress instead.
const METADATA_TIMEOUT_SECS: u64 = 30;

/// Errors reported by the metadata/stream collaborator.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network-level failure (DNS, connection refused, TLS, mid-stream).
    #[error("provider network error for {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("provider timeout for {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The provider answered with an error status.
    #[error("provider returned HTTP {status} for {url}")]
    HttpStatus {
        /// The URL that was requested.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The content exists but is not currently retrievable.
    #[error("track {id} is not available for retrieval")]
    Unavailable {
        /// The identifier that is unavailable.
        id: String,
    },

    /// The provider's answer could not be interpreted.
    #[error("invalid provider response from {url}: {detail}")]
    InvalidResponse {
        /// The URL that was requested.
        url: String,
        /// What was wrong with the response.
        detail: String,
    },

    /// The metadata carries no audio-only variant to select.
    #[error("no audio-only format available for track {id}")]
    NoAudioFormat {
        /// The identifier whose format list was empty.
        id: String,
    },
}

impl ProviderError {
    pub(crate) fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    pub(crate) fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub(crate) fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    pub(crate) fn invalid_response(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidResponse {
            url: url.into(),
            detail: detail.into(),
        }
    }

    /// True for failures of the transport rather than of the content.
    /// These are the cases where serving stale cached metadata beats
    /// failing outright.
    #[must_use]
    pub fn is_network_failure(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }
}

/// One downloadable stream variant from the provider's format list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioFormat {
    /// Provider-scoped variant identifier.
    pub format_id: String,
    /// Container the stream is muxed in ("webm", "m4a", ...).
    pub container: String,
    /// Whether the variant carries audio without a video track.
    pub audio_only: bool,
    /// Audio bitrate in kbit/s.
    pub bitrate_kbps: u32,
    /// Retrieval URL for the variant.
    pub url: String,
    /// Total size in bytes when the provider knows it.
    #[serde(default)]
    pub content_length: Option<u64>,
}

/// Provider-reported metadata for one track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackMetadata {
    /// The track identifier.
    pub id: String,
    /// Display title, used to derive the output filename.
    pub title: String,
    /// Primary artist, when known.
    #[serde(default)]
    pub artist: Option<String>,
    /// Expected media duration in seconds.
    pub duration_seconds: f64,
    /// Whether the content is currently retrievable. Unplayable metadata
    /// is never cached.
    pub playable: bool,
    /// Available stream variants.
    pub formats: Vec<AudioFormat>,
}

/// Byte stream for one format variant.
pub type MediaByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ProviderError>> + Send>>;

/// External metadata/stream collaborator.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Resolves an identifier to its metadata record.
    async fn fetch_metadata(&self, id: &TrackId) -> Result<TrackMetadata, ProviderError>;

    /// Lightweight availability check, used to revalidate expired cache
    /// entries without paying for a full metadata fetch.
    async fn probe_available(&self, id: &TrackId) -> Result<bool, ProviderError>;

    /// Opens the byte stream for a chosen format, optionally starting at
    /// a byte offset for resumed writes.
    async fn open_stream(
        &self,
        metadata: &TrackMetadata,
        format: &AudioFormat,
        resume_from: Option<u64>,
    ) -> Result<MediaByteStream, ProviderError>;
}

/// Static selection rule: best available audio-only variant, highest
/// audio bitrate first.
///
/// # Errors
///
/// Returns [`ProviderError::NoAudioFormat`] when the format list has no
/// audio-only entry.
pub fn choose_audio_format(metadata: &TrackMetadata) -> Result<&AudioFormat, ProviderError> {
    metadata
        .formats
        .iter()
        .filter(|format| format.audio_only)
        .max_by_key(|format| format.bitrate_kbps)
        .ok_or_else(|| ProviderError::NoAudioFormat {
            id: metadata.id.clone(),
        })
}

/// JSON-over-HTTP provider adapter.
///
/// Expects `GET {base}/tracks/{id}` to answer a [`TrackMetadata`]
/// document, `HEAD {base}/tracks/{id}` to answer the availability probe,
/// and each format's `url` to serve bytes with `Range` support.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    base_url: Url,
    client: Client,
}

impl HttpProvider {
    /// Creates a provider against the given service base URL.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new(base_url: Url) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .gzip(true)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { base_url, client }
    }

    fn track_url(&self, id: &TrackId) -> Result<Url, ProviderError> {
        self.base_url
            .join(&format!("tracks/{id}"))
            .map_err(|e| ProviderError::invalid_response(self.base_url.as_str(), e.to_string()))
    }
}

#[async_trait]
impl MediaProvider for HttpProvider {
    async fn fetch_metadata(&self, id: &TrackId) -> Result<TrackMetadata, ProviderError> {
        let url = self.track_url(id)?;
        debug!(%url, "fetching metadata");

        let response = self
            .client
            .get(url.clone())
            .timeout(Duration::from_secs(METADATA_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| classify_request_error(url.as_str(), e))?;

        let status = response.status();
        if matches!(status.as_u16(), 404 | 410) {
            return Err(ProviderError::Unavailable {
                id: id.as_str().to_string(),
            });
        }
        if !status.is_success() {
            return Err(ProviderError::http_status(url.as_str(), status.as_u16()));
        }

        response
            .json::<TrackMetadata>()
            .await
            .map_err(|e| ProviderError::invalid_response(url.as_str(), e.to_string()))
    }

    async fn probe_available(&self, id: &TrackId) -> Result<bool, ProviderError> {
        let url = self.track_url(id)?;
        let response = self
            .client
            .head(url.clone())
            .timeout(Duration::from_secs(METADATA_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| classify_request_error(url.as_str(), e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if matches!(status.as_u16(), 403 | 404 | 410) {
            return Ok(false);
        }
        Err(ProviderError::http_status(url.as_str(), status.as_u16()))
    }

    async fn open_stream(
        &self,
        _metadata: &TrackMetadata,
        format: &AudioFormat,
        resume_from: Option<u64>,
    ) -> Result<MediaByteStream, ProviderError> {
        let mut request = self.client.get(&format.url);
        if let Some(start) = resume_from.filter(|start| *start > 0) {
            request = request.header(RANGE, format!("bytes={start}-"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_request_error(&format.url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::http_status(&format.url, status.as_u16()));
        }
        if resume_from.is_some_and(|start| start > 0) && status.as_u16() != 206 {
            return Err(ProviderError::invalid_response(
                &format.url,
                format!("server ignored range request (HTTP {status})"),
            ));
        }

        let url = format.url.clone();
        let stream = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => Ok(bytes.to_vec()),
                Err(e) => Err(ProviderError::network(url.clone(), e)),
            });
        Ok(Box::pin(stream))
    }
}

fn classify_request_error(url: &str, error: reqwest::Error) -> ProviderError {
    if error.is_timeout() {
        ProviderError::timeout(url)
    } else {
        ProviderError::network(url, error)
    }
}
