//! Umbrella error for a single download pass.

use std::path::PathBuf;

use thiserror::Error;

use crate::ident::IdentifierError;
use crate::provider::ProviderError;
use crate::transcode::ConversionError;

/// Everything that can fail one download pass. Single-item callers get
/// this directly; batch mode records it per target instead of failing
/// the run.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The input named no valid target.
    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    /// The metadata/stream collaborator failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Local file system failure.
    #[error("I/O error at '{path}': {source}")]
    Io {
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The conversion collaborator failed after a completed download.
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// The run was cancelled at a suspension point.
    #[error("interrupted")]
    Interrupted,
}

impl DownloadError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the pass stopped because of cancellation rather than a
    /// failure of its own.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}
