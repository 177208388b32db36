//! Progress events emitted by a download pass.
//!
//! Consumers receive a finite sequence per pass over a channel; a pass
//! with no registered sender emits nothing. Send failures are ignored so
//! a dropped consumer never stalls a download.

use std::path::PathBuf;

use tokio::sync::mpsc::UnboundedSender;

/// One progress event for one target.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// Streaming is about to begin.
    Started {
        /// Track identifier.
        id: String,
        /// Display title.
        title: String,
        /// Expected total size in bytes, when the provider knows it.
        total_bytes: Option<u64>,
        /// Byte offset streaming starts at (non-zero for resumed writes).
        resumed_from: u64,
    },
    /// More bytes landed on disk.
    Advanced {
        /// Track identifier.
        id: String,
        /// Total bytes written so far, including any resumed prefix.
        written: u64,
    },
    /// Conversion is about to begin.
    Converting {
        /// Track identifier.
        id: String,
    },
    /// The pass finished.
    Finished {
        /// Track identifier.
        id: String,
        /// Final artifact path.
        output_path: PathBuf,
    },
}

/// Sender half handed to a download pass.
pub type ProgressSender = UnboundedSender<ProgressUpdate>;
