//! Audio conversion collaborator.
//!
//! Conversion is always delegated through the [`Transcoder`] trait so the
//! orchestration layers never shell out directly. The production
//! implementation drives `ffmpeg` and `ffprobe` as child processes.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors from the conversion collaborator.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The required external tool is not installed or not on `PATH`.
    #[error("'{tool}' not found on PATH")]
    ToolMissing {
        /// The tool that could not be located.
        tool: String,
    },

    /// The tool could not be started.
    #[error("failed to start '{tool}': {source}")]
    Spawn {
        /// The tool that failed to start.
        tool: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The tool ran but exited with a failure status.
    #[error("'{tool}' exited with {status}: {stderr_tail}")]
    Failed {
        /// The tool that failed.
        tool: String,
        /// The exit status as reported by the OS.
        status: String,
        /// The last portion of the tool's stderr output.
        stderr_tail: String,
    },

    /// The tool produced output we could not interpret.
    #[error("unreadable output from '{tool}': {detail}")]
    BadOutput {
        /// The tool whose output was unreadable.
        tool: String,
        /// What was wrong with the output.
        detail: String,
    },
}

/// Conversion parameters carried from resolved options. Optional fields
/// fall through to the encoder's own defaults when unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertOptions {
    /// Target container format, e.g. `mp3`.
    pub format: String,
    /// Explicit audio codec, when the format default is not wanted.
    pub codec: Option<String>,
    /// Channel count override.
    pub channels: Option<u8>,
    /// Bitrate override in kbit/s.
    pub bitrate_kbps: Option<u32>,
}

/// Audio conversion and probing, injected into the downloaders.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Converts `input` into `output` according to the options. The output
    /// file is replaced if it already exists.
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        options: &ConvertOptions,
    ) -> Result<(), ConversionError>;

    /// Returns the playable duration of a media file in seconds.
    ///
    /// Used to decide whether a partial file on disk is worth resuming.
    async fn probe_duration(&self, path: &Path) -> Result<f64, ConversionError>;
}

/// Production transcoder shelling out to `ffmpeg` and `ffprobe`.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegTranscoder {
    /// Locates both tools on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::ToolMissing`] when either tool is absent.
    pub fn discover() -> Result<Self, ConversionError> {
        Ok(Self {
            ffmpeg: locate("ffmpeg")?,
            ffprobe: locate("ffprobe")?,
        })
    }

    /// Uses explicit tool paths, bypassing `PATH` lookup.
    #[must_use]
    pub fn with_paths(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }
}

fn locate(tool: &str) -> Result<PathBuf, ConversionError> {
    which::which(tool).map_err(|_| ConversionError::ToolMissing {
        tool: tool.to_string(),
    })
}

/// Builds the ffmpeg argument list for one conversion.
fn ffmpeg_args(input: &Path, output: &Path, options: &ConvertOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        input.as_os_str().to_owned(),
        "-vn".into(),
    ];
    if let Some(codec) = &options.codec {
        args.push("-acodec".into());
        args.push(codec.into());
    }
    if let Some(channels) = options.channels {
        args.push("-ac".into());
        args.push(channels.to_string().into());
    }
    if let Some(bitrate) = options.bitrate_kbps {
        args.push("-b:a".into());
        args.push(format!("{bitrate}k").into());
    }
    args.push(output.as_os_str().to_owned());
    args
}

fn parse_probe_duration(stdout: &str) -> Result<f64, ConversionError> {
    stdout
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d >= 0.0)
        .ok_or_else(|| ConversionError::BadOutput {
            tool: "ffprobe".to_string(),
            detail: format!("expected a duration in seconds, got '{}'", stdout.trim()),
        })
}

fn stderr_tail(stderr: &[u8]) -> String {
    const TAIL_CHARS: usize = 400;
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(TAIL_CHARS.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    text[start..].to_string()
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        options: &ConvertOptions,
    ) -> Result<(), ConversionError> {
        debug!(input = %input.display(), output = %output.display(), "running ffmpeg");
        let result = Command::new(&self.ffmpeg)
            .args(ffmpeg_args(input, output, options))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // Cancellation drops the future; the child must not outlive it.
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ConversionError::Spawn {
                tool: "ffmpeg".to_string(),
                source,
            })?;

        if result.status.success() {
            Ok(())
        } else {
            Err(ConversionError::Failed {
                tool: "ffmpeg".to_string(),
                status: result.status.to_string(),
                stderr_tail: stderr_tail(&result.stderr),
            })
        }
    }

    async fn probe_duration(&self, path: &Path) -> Result<f64, ConversionError> {
        let result = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ConversionError::Spawn {
                tool: "ffprobe".to_string(),
                source,
            })?;

        if !result.status.success() {
            return Err(ConversionError::Failed {
                tool: "ffprobe".to_string(),
                status: result.status.to_string(),
                stderr_tail: stderr_tail(&result.stderr),
            });
        }

        parse_probe_duration(&String::from_utf8_lossy(&result.stdout))
    }
}

/// Fallback used when ffmpeg is not installed and conversion was not
/// requested. Probing always fails, which downgrades resume checks to a
/// fresh write; transcoding always fails loudly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTranscoder;

#[async_trait]
impl Transcoder for NullTranscoder {
    async fn transcode(
        &self,
        _input: &Path,
        _output: &Path,
        _options: &ConvertOptions,
    ) -> Result<(), ConversionError> {
        Err(ConversionError::ToolMissing {
            tool: "ffmpeg".to_string(),
        })
    }

    async fn probe_duration(&self, _path: &Path) -> Result<f64, ConversionError> {
        Err(ConversionError::ToolMissing {
            tool: "ffprobe".to_string(),
        })
    }
}
