//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;
use url::Url;

use tunedl_core::options::OptionLayer;

/// Download audio tracks by watch URL or id, singly or in batches.
///
/// tunedl resolves each target's metadata (cache-aware), streams the best
/// audio-only variant to disk with resume support, and can hand the
/// result to ffmpeg for conversion.
#[derive(Parser, Debug)]
#[command(name = "tunedl")]
#[command(author, version, about)]
pub struct Args {
    /// Watch URL or 11-character track id to download
    #[arg(conflicts_with = "batch", required_unless_present = "batch")]
    pub target: Option<String>,

    /// Batch manifest file: one target per line, `#`/`//` comments
    #[arg(short, long, value_name = "FILE")]
    pub batch: Option<PathBuf>,

    /// Per-invocation JSON config file (between global config and flags)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory to write downloads into
    #[arg(short, long, value_name = "DIR")]
    pub out_dir: Option<PathBuf>,

    /// Target format for conversion (e.g. mp3, ogg)
    #[arg(short, long)]
    pub format: Option<String>,

    /// Explicit audio codec for conversion
    #[arg(long)]
    pub codec: Option<String>,

    /// Audio channel count for conversion (1-8)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=8))]
    pub channels: Option<u8>,

    /// Audio bitrate in kbit/s for conversion (8-1024)
    #[arg(long, value_name = "KBPS", value_parser = clap::value_parser!(u32).range(8..=1024))]
    pub bitrate: Option<u32>,

    /// Convert the download with ffmpeg after streaming
    #[arg(short = 'x', long)]
    pub convert: bool,

    /// Skip the metadata cache for this run
    #[arg(long)]
    pub no_cache: bool,

    /// Continue a verified partial file instead of restarting
    #[arg(long)]
    pub resume: bool,

    /// Accept bare 11-character ids in batch manifests
    #[arg(long)]
    pub allow_raw_ids: bool,

    /// Explicit output file name (without extension), single mode only
    #[arg(long, value_name = "NAME", conflicts_with = "batch")]
    pub output_name: Option<String>,

    /// Metadata provider base URL (overrides TUNEDL_PROVIDER_URL)
    #[arg(long, value_name = "URL")]
    pub provider_url: Option<Url>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Maps the flags the user actually passed onto the highest-precedence
    /// option layer. Unset flags stay absent so they never shadow config
    /// file values.
    #[must_use]
    pub fn overrides_layer(&self) -> OptionLayer {
        OptionLayer {
            cwd: None,
            out_dir: self.out_dir.clone(),
            format: self.format.clone(),
            codec: self.codec.clone(),
            channels: self.channels,
            bitrate_kbps: self.bitrate,
            convert_audio: self.convert.then_some(true),
            quiet: self.quiet.then_some(true),
            verbose: (self.verbose > 0).then_some(u64::from(self.verbose)),
            use_cache: self.no_cache.then_some(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_single_target_parses() {
        let args = Args::try_parse_from(["tunedl", "dQw4w9WgXcQ"]).unwrap();
        assert_eq!(args.target.as_deref(), Some("dQw4w9WgXcQ"));
        assert!(args.batch.is_none());
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(!args.convert);
    }

    #[test]
    fn test_cli_batch_without_target_parses() {
        let args = Args::try_parse_from(["tunedl", "--batch", "list.txt"]).unwrap();
        assert!(args.target.is_none());
        assert_eq!(args.batch, Some(PathBuf::from("list.txt")));
    }

    #[test]
    fn test_cli_requires_target_or_batch() {
        let result = Args::try_parse_from(["tunedl"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_target_conflicts_with_batch() {
        let result = Args::try_parse_from(["tunedl", "dQw4w9WgXcQ", "--batch", "list.txt"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["tunedl", "-vv", "dQw4w9WgXcQ"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_channels_out_of_range_rejected() {
        let result = Args::try_parse_from(["tunedl", "dQw4w9WgXcQ", "--channels", "9"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_bitrate_out_of_range_rejected() {
        let result = Args::try_parse_from(["tunedl", "dQw4w9WgXcQ", "--bitrate", "4"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let result = Args::try_parse_from(["tunedl", "--help"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_version_flag_shows_version() {
        let result = Args::try_parse_from(["tunedl", "--version"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_cli_invalid_flag_returns_error() {
        let result = Args::try_parse_from(["tunedl", "dQw4w9WgXcQ", "--invalid-flag"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_overrides_layer_leaves_unset_flags_absent() {
        let args = Args::try_parse_from(["tunedl", "dQw4w9WgXcQ"]).unwrap();
        let layer = args.overrides_layer();
        assert!(layer.out_dir.is_none());
        assert!(layer.format.is_none());
        assert!(layer.convert_audio.is_none());
        assert!(layer.quiet.is_none());
        assert!(layer.verbose.is_none());
        assert!(layer.use_cache.is_none());
    }

    #[test]
    fn test_overrides_layer_maps_set_flags() {
        let args = Args::try_parse_from([
            "tunedl",
            "dQw4w9WgXcQ",
            "--out-dir",
            "/music",
            "--format",
            "ogg",
            "-x",
            "--no-cache",
            "-v",
        ])
        .unwrap();
        let layer = args.overrides_layer();
        assert_eq!(layer.out_dir, Some(PathBuf::from("/music")));
        assert_eq!(layer.format, Some("ogg".to_string()));
        assert_eq!(layer.convert_audio, Some(true));
        assert_eq!(layer.use_cache, Some(false));
        assert_eq!(layer.verbose, Some(1));
    }

    #[test]
    fn test_cli_provider_url_parses() {
        let args = Args::try_parse_from([
            "tunedl",
            "dQw4w9WgXcQ",
            "--provider-url",
            "https://api.example/",
        ])
        .unwrap();
        assert_eq!(
            args.provider_url.unwrap().as_str(),
            "https://api.example/"
        );
    }
}
