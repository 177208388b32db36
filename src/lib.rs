//! tunedl Core Library
//!
//! Cache-aware download orchestration for audio tracks named by watch
//! URLs or raw ids, singly or in batches.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`ident`] - Identifier validation (watch URLs, short links, raw ids)
//! - [`options`] - Four-layer option resolution into one immutable config
//! - [`cache`] - Metadata caching with TTL expiry and revalidation support
//! - [`provider`] - Metadata/stream collaborator contract and HTTP adapter
//! - [`transcode`] - Audio conversion collaborator (ffmpeg)
//! - [`download`] - The single-item download state machine
//! - [`batch`] - Sequential batch orchestration with failure isolation
//! - [`exit`] - Process exit contract

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batch;
pub mod cache;
pub mod download;
pub mod exit;
pub mod ident;
pub mod options;
pub mod provider;
pub mod transcode;

// Re-export commonly used types
pub use batch::{BatchError, BatchOutcome, TargetOutcome, download_batch, parse_manifest};
pub use cache::{CACHE_TTL, CacheEntry, FileStore, MemoryStore, MetadataStore};
pub use download::{DownloadError, DownloadResult, DownloadTarget, Downloader, ProgressUpdate};
pub use exit::ProcessExit;
pub use ident::{IdentifierError, TrackId};
pub use options::{ConfigError, OptionLayer, ResolvedOptions, Verbosity, resolve};
pub use provider::{
    AudioFormat, HttpProvider, MediaProvider, ProviderError, TrackMetadata, choose_audio_format,
};
pub use transcode::{ConversionError, ConvertOptions, FfmpegTranscoder, Transcoder};
