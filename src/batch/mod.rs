//! Batch download orchestration.
//!
//! A batch manifest is a UTF-8 text resource with one target per line;
//! `#` and `//` lines are comments. Targets are validated and
//! deduplicated up front, metadata is prefetched for every target before
//! any file I/O, and then each target streams and converts sequentially.
//! One target's download or conversion failure is recorded against that
//! target and never aborts its siblings; only manifest validation
//! failures and cancellation stop the whole run.

use std::collections::HashSet;

use thiserror::Error;
use tracing::{info, warn};

use crate::download::{
    DownloadError, DownloadResult, DownloadTarget, Downloader,
};
use crate::ident::{IdentifierError, TrackId};
use crate::options::ResolvedOptions;
use crate::provider::TrackMetadata;
use crate::transcode::ConversionError;

/// Errors that fail a whole batch before any target is attempted.
#[derive(Debug, Error)]
pub enum BatchError {
    /// A manifest line named no valid target.
    #[error("invalid target on line {line}: {source}")]
    InvalidLine {
        /// 1-based line number in the manifest.
        line: usize,
        /// Why the line was rejected.
        #[source]
        source: IdentifierError,
    },

    /// No valid, non-duplicate targets remained after parsing.
    #[error("batch contains no targets")]
    Empty,
}

/// Per-target outcome inside a [`BatchOutcome`].
///
/// `result` and `download_error` are mutually exclusive; a conversion
/// error can accompany a present result, since the stream completed
/// before conversion failed.
#[derive(Debug)]
pub struct TargetOutcome {
    /// The completed download, when streaming succeeded.
    pub result: Option<DownloadResult>,
    /// The recorded download failure, when streaming did not succeed.
    pub download_error: Option<DownloadError>,
    /// The recorded conversion failure, when conversion ran and failed.
    pub conversion_error: Option<ConversionError>,
}

impl TargetOutcome {
    /// True when both the download and any requested conversion worked.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.download_error.is_none() && self.conversion_error.is_none()
    }

    fn success(result: DownloadResult) -> Self {
        Self {
            result: Some(result),
            download_error: None,
            conversion_error: None,
        }
    }

    fn failed_download(error: DownloadError) -> Self {
        Self {
            result: None,
            download_error: Some(error),
            conversion_error: None,
        }
    }

    fn failed_conversion(result: DownloadResult, error: ConversionError) -> Self {
        Self {
            result: Some(result),
            download_error: None,
            conversion_error: Some(error),
        }
    }
}

/// Aggregated result of one batch run, frozen once returned. Outcomes
/// appear in iteration order; each identifier appears at most once.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Per-target outcomes in the order targets were iterated.
    pub outcomes: Vec<(TrackId, TargetOutcome)>,
    /// Number of targets whose download failed.
    pub failed_downloads: usize,
    /// Number of targets whose conversion failed.
    pub failed_conversions: usize,
    /// Whether the run stopped early on cancellation. Targets after the
    /// interruption point carry no outcome.
    pub interrupted: bool,
}

impl BatchOutcome {
    /// Looks up the outcome recorded for an identifier.
    #[must_use]
    pub fn get(&self, id: &TrackId) -> Option<&TargetOutcome> {
        self.outcomes
            .iter()
            .find(|(outcome_id, _)| outcome_id == id)
            .map(|(_, outcome)| outcome)
    }

    /// True when every attempted target succeeded and nothing was
    /// interrupted.
    #[must_use]
    pub fn is_complete_success(&self) -> bool {
        !self.interrupted && self.failed_downloads == 0 && self.failed_conversions == 0
    }

    fn record(&mut self, id: TrackId, outcome: TargetOutcome) {
        if outcome.download_error.is_some() {
            self.failed_downloads += 1;
        }
        if outcome.conversion_error.is_some() {
            self.failed_conversions += 1;
        }
        self.outcomes.push((id, outcome));
    }
}

/// Parses a manifest into a deduplicated target list.
///
/// Lines are trimmed; blank lines and lines starting with `#` or `//`
/// are skipped. With `allow_raw_ids` set, bare fixed-length tokens are
/// accepted alongside full watch URLs; otherwise URLs are required.
/// Duplicates collapse to the first occurrence.
///
/// # Errors
///
/// Returns [`BatchError::InvalidLine`] naming the first offending line,
/// or [`BatchError::Empty`] when nothing valid remains.
pub fn parse_manifest(text: &str, allow_raw_ids: bool) -> Result<Vec<TrackId>, BatchError> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        let id = if allow_raw_ids {
            TrackId::parse(line)
        } else {
            TrackId::from_url(line)
        }
        .map_err(|source| BatchError::InvalidLine {
            line: index + 1,
            source,
        })?;

        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }

    if ids.is_empty() {
        return Err(BatchError::Empty);
    }
    Ok(ids)
}

/// Runs a whole batch: parse, prefetch metadata, then stream and convert
/// each target sequentially with isolated failure accounting.
///
/// # Errors
///
/// Returns [`BatchError`] only for manifest validation failures; every
/// per-target failure is recorded in the returned [`BatchOutcome`]
/// instead.
pub async fn download_batch(
    downloader: &Downloader,
    manifest: &str,
    allow_raw_ids: bool,
    options: &ResolvedOptions,
) -> Result<BatchOutcome, BatchError> {
    let ids = parse_manifest(manifest, allow_raw_ids)?;
    info!(targets = ids.len(), "starting batch");

    let mut outcome = BatchOutcome::default();

    // Metadata for every target resolves before any file I/O so naming
    // and duration checks are settled up front. A prefetch failure is
    // recorded as that target's download error.
    let mut prefetched: Vec<(TrackId, Result<(TrackMetadata, bool), DownloadError>)> =
        Vec::with_capacity(ids.len());
    for id in ids {
        if downloader.is_cancelled() {
            outcome.interrupted = true;
            return Ok(outcome);
        }
        let resolved = downloader.resolve_metadata(&id, options).await;
        if matches!(resolved, Err(DownloadError::Interrupted)) {
            outcome.interrupted = true;
            return Ok(outcome);
        }
        prefetched.push((id, resolved));
    }

    for (id, resolved) in prefetched {
        if downloader.is_cancelled() {
            outcome.interrupted = true;
            break;
        }
        let (metadata, used_cache) = match resolved {
            Ok(resolved) => resolved,
            Err(error) => {
                warn!(id = %id, error = %error, "metadata resolution failed");
                outcome.record(id, TargetOutcome::failed_download(error));
                continue;
            }
        };

        let target = DownloadTarget::new(id.clone());
        let result = match downloader
            .stream_target(&target, &metadata, used_cache, options)
            .await
        {
            Ok(result) => result,
            Err(DownloadError::Interrupted) => {
                outcome.interrupted = true;
                outcome.record(id, TargetOutcome::failed_download(DownloadError::Interrupted));
                break;
            }
            Err(error) => {
                warn!(id = %id, error = %error, "download failed");
                outcome.record(id, TargetOutcome::failed_download(error));
                continue;
            }
        };

        if options.convert_audio {
            match downloader.convert(&result, options).await {
                Ok(conversion) => {
                    let mut result = result;
                    result.conversion = Some(conversion);
                    downloader.notify_finished(&result);
                    outcome.record(id, TargetOutcome::success(result));
                }
                Err(DownloadError::Interrupted) => {
                    outcome.interrupted = true;
                    outcome.record(id, TargetOutcome::success(result));
                    break;
                }
                Err(DownloadError::Conversion(error)) => {
                    warn!(id = %id, error = %error, "conversion failed");
                    outcome.record(id, TargetOutcome::failed_conversion(result, error));
                }
                Err(error) => {
                    warn!(id = %id, error = %error, "conversion failed");
                    outcome.record(id, TargetOutcome::failed_download(error));
                }
            }
        } else {
            downloader.notify_finished(&result);
            outcome.record(id, TargetOutcome::success(result));
        }
    }

    info!(
        targets = outcome.outcomes.len(),
        failed_downloads = outcome.failed_downloads,
        failed_conversions = outcome.failed_conversions,
        "batch finished"
    );
    Ok(outcome)
}
