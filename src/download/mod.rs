//! Single-item download orchestration.
//!
//! One pass drives an identifier through validate, resolve-metadata
//! (cache or fetch), format choice, resumable streaming to disk, and
//! optional conversion. The pass is a state machine with typed failures
//! at every step; batch mode reuses the same pass with per-target error
//! recording.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use tunedl_core::cache::MemoryStore;
//! use tunedl_core::download::{DownloadTarget, Downloader};
//! use tunedl_core::ident::TrackId;
//! use tunedl_core::options::{OptionLayer, resolve};
//! use tunedl_core::provider::HttpProvider;
//! use tunedl_core::transcode::FfmpegTranscoder;
//! use url::Url;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let provider = Arc::new(HttpProvider::new(Url::parse("https://api.example/")?));
//! let store = Arc::new(MemoryStore::new());
//! let transcoder = Arc::new(FfmpegTranscoder::discover()?);
//! let downloader = Downloader::new(provider, store, transcoder);
//!
//! let empty = OptionLayer::default();
//! let options = resolve(
//!     &OptionLayer::builtin(PathBuf::from("/tmp")),
//!     &empty,
//!     &empty,
//!     &empty,
//! )?;
//! let target = DownloadTarget::new(TrackId::parse("dQw4w9WgXcQ")?);
//! let result = downloader.download(&target, &options).await?;
//! println!("saved {}", result.output_path.display());
//! # Ok(())
//! # }
//! ```

mod error;
mod filename;
mod progress;
mod single;

use std::path::PathBuf;

pub use error::DownloadError;
pub use progress::{ProgressSender, ProgressUpdate};
pub use single::Downloader;

use crate::ident::TrackId;

/// One item to download, created by the orchestrator per pass and
/// dropped when the pass completes.
#[derive(Debug, Clone)]
pub struct DownloadTarget {
    /// The validated identifier.
    pub id: TrackId,
    /// Explicit output file stem; `None` derives one from the title.
    pub output_stem: Option<String>,
    /// Whether a matching partial file on disk may be continued instead
    /// of truncated.
    pub resume: bool,
}

impl DownloadTarget {
    /// Creates a fresh-write target with a title-derived filename.
    #[must_use]
    pub fn new(id: TrackId) -> Self {
        Self {
            id,
            output_stem: None,
            resume: false,
        }
    }

    /// Requests resuming a verified partial file instead of truncating.
    #[must_use]
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Sets an explicit output file stem.
    #[must_use]
    pub fn with_output_stem(mut self, stem: impl Into<String>) -> Self {
        self.output_stem = Some(stem.into());
        self
    }
}

/// Conversion artifact attached to a result when `convert_audio` ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionResult {
    /// Path of the converted file.
    pub output_path: PathBuf,
}

/// Outcome of one successful download pass. Immutable once returned.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    /// The target's identifier.
    pub id: TrackId,
    /// Path of the downloaded stream file.
    pub output_path: PathBuf,
    /// Whether metadata came from the cache rather than a fresh fetch.
    pub used_cache: bool,
    /// Display title from metadata.
    pub title: String,
    /// Primary artist from metadata, when known.
    pub artist: Option<String>,
    /// Expected media duration in seconds, from metadata.
    pub duration_seconds: f64,
    /// Bytes written during this pass, excluding any resumed prefix.
    pub bytes_written: u64,
    /// Byte offset the stream started at (non-zero for resumed writes).
    pub resumed_from: u64,
    /// Conversion artifact, present only when conversion ran.
    pub conversion: Option<ConversionResult>,
}
