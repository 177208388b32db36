//! Option resolution across four precedence layers.
//!
//! Configuration arrives from built-in defaults, the global user config
//! file, a per-invocation config file, and CLI overrides, in ascending
//! precedence. Each layer only carries the fields it explicitly
//! set (`Option` per field, absence is not an explicit null), and merging
//! replaces fields one at a time, never whole objects.
//!
//! Two fields get special treatment: a layer's relative `out_dir` resolves
//! against that same layer's `cwd`, not against the final merged working
//! directory, and the unset sentinels `"."` and `""` never override a more
//! specific earlier value.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

/// Errors produced while loading or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field is present with the wrong JSON type.
    #[error("invalid type for `{field}`: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Name of the offending field.
        field: &'static str,
        /// The type the field requires.
        expected: &'static str,
        /// The type actually found.
        actual: &'static str,
    },

    /// A numeric field is out of its accepted range.
    #[error("invalid value for `{field}`: {value} (expected {expected})")]
    OutOfRange {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value.
        value: i64,
        /// Human-readable accepted range.
        expected: &'static str,
    },

    /// The config document contains a key this tool does not know.
    #[error("unknown configuration key: `{field}`")]
    UnknownField {
        /// The unrecognized key.
        field: String,
    },

    /// The config document root is not a JSON object.
    #[error("configuration root must be a JSON object, got {actual}")]
    NotAnObject {
        /// The type actually found at the root.
        actual: &'static str,
    },

    /// A required field is absent after merging all layers.
    #[error("missing required configuration field `{field}`")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// Reading a config file from disk failed.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// The file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A config file is not valid JSON.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// The file that could not be parsed.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Output noise level, derived from `quiet`/`verbose` settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    /// Standard progress output.
    #[default]
    Normal,
    /// Per-step detail.
    Verbose,
    /// Everything, including wire-level traces.
    Debug,
}

impl Verbosity {
    /// Maps a `-v` counter onto a level (0 → normal, 1 → verbose, 2+ → debug).
    #[must_use]
    pub fn from_counter(count: u64) -> Self {
        match count {
            0 => Self::Normal,
            1 => Self::Verbose,
            _ => Self::Debug,
        }
    }

    /// Default tracing filter directive for this level.
    #[must_use]
    pub fn log_directive(self) -> &'static str {
        match self {
            Self::Quiet => "error",
            Self::Normal => "info",
            Self::Verbose => "debug",
            Self::Debug => "trace",
        }
    }
}

/// One configuration layer. Every field is optional: `None` means the
/// layer did not mention the field at all.
#[derive(Debug, Clone, Default)]
pub struct OptionLayer {
    /// Working directory for this layer.
    pub cwd: Option<PathBuf>,
    /// Output directory; relative values resolve against this layer's cwd.
    pub out_dir: Option<PathBuf>,
    /// Target container/format for conversion (e.g. "mp3").
    pub format: Option<String>,
    /// Explicit codec handed to the transcoder.
    pub codec: Option<String>,
    /// Audio channel count for conversion.
    pub channels: Option<u8>,
    /// Audio bitrate in kbit/s for conversion.
    pub bitrate_kbps: Option<u32>,
    /// Whether to transcode after downloading.
    pub convert_audio: Option<bool>,
    /// Explicit quiet flag; wins over `verbose` within the same layer.
    pub quiet: Option<bool>,
    /// Verbosity counter (0/1/2+), coerced onto the quiet level.
    pub verbose: Option<u64>,
    /// Whether the metadata cache participates in this run.
    pub use_cache: Option<bool>,
}

impl OptionLayer {
    /// Built-in lowest-precedence defaults.
    ///
    /// `cwd` anchors both directory fields so later layers with relative
    /// overrides always have something concrete to compose against.
    #[must_use]
    pub fn builtin(cwd: PathBuf) -> Self {
        Self {
            out_dir: Some(cwd.clone()),
            cwd: Some(cwd),
            format: Some("mp3".to_string()),
            codec: None,
            channels: None,
            bitrate_kbps: None,
            convert_audio: Some(false),
            quiet: None,
            verbose: Some(0),
            use_cache: Some(true),
        }
    }

    /// Builds a layer from a parsed JSON document, with strict per-field
    /// type validation and rejection of unknown keys.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the offending field on any type or
    /// range mismatch.
    pub fn from_json(value: &Value) -> Result<Self, ConfigError> {
        let Some(object) = value.as_object() else {
            return Err(ConfigError::NotAnObject {
                actual: json_type_name(value),
            });
        };

        let mut layer = Self::default();
        for (key, field_value) in object {
            match key.as_str() {
                "cwd" => layer.cwd = Some(expect_path("cwd", field_value)?),
                "out_dir" => layer.out_dir = Some(expect_path("out_dir", field_value)?),
                "format" => layer.format = Some(expect_string("format", field_value)?),
                "codec" => layer.codec = Some(expect_string("codec", field_value)?),
                "channels" => {
                    let raw = expect_integer("channels", field_value)?;
                    let channels =
                        u8::try_from(raw).map_err(|_| ConfigError::OutOfRange {
                            field: "channels",
                            value: raw,
                            expected: "1..=8",
                        })?;
                    if !(1..=8).contains(&channels) {
                        return Err(ConfigError::OutOfRange {
                            field: "channels",
                            value: raw,
                            expected: "1..=8",
                        });
                    }
                    layer.channels = Some(channels);
                }
                "bitrate_kbps" => {
                    let raw = expect_integer("bitrate_kbps", field_value)?;
                    let bitrate =
                        u32::try_from(raw).map_err(|_| ConfigError::OutOfRange {
                            field: "bitrate_kbps",
                            value: raw,
                            expected: "8..=1024",
                        })?;
                    if !(8..=1024).contains(&bitrate) {
                        return Err(ConfigError::OutOfRange {
                            field: "bitrate_kbps",
                            value: raw,
                            expected: "8..=1024",
                        });
                    }
                    layer.bitrate_kbps = Some(bitrate);
                }
                "convert_audio" => {
                    layer.convert_audio = Some(expect_bool("convert_audio", field_value)?);
                }
                "quiet" => layer.quiet = Some(expect_bool("quiet", field_value)?),
                "verbose" => {
                    let raw = expect_integer("verbose", field_value)?;
                    let counter =
                        u64::try_from(raw).map_err(|_| ConfigError::OutOfRange {
                            field: "verbose",
                            value: raw,
                            expected: "0 or greater",
                        })?;
                    layer.verbose = Some(counter);
                }
                "use_cache" => layer.use_cache = Some(expect_bool("use_cache", field_value)?),
                unknown => {
                    return Err(ConfigError::UnknownField {
                        field: unknown.to_string(),
                    });
                }
            }
        }
        Ok(layer)
    }

    /// Loads a layer from a JSON file on disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on read, parse, or validation failure.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&value)
    }
}

/// Immutable configuration for one invocation. Built once by
/// [`resolve`], then shared read-only with every download pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOptions {
    /// Working directory for the run.
    pub cwd: PathBuf,
    /// Directory downloads are written into.
    pub out_dir: PathBuf,
    /// Target container/format for conversion.
    pub format: String,
    /// Explicit codec for the transcoder, when set.
    pub codec: Option<String>,
    /// Audio channel count for conversion, when set.
    pub channels: Option<u8>,
    /// Audio bitrate in kbit/s for conversion, when set.
    pub bitrate_kbps: Option<u32>,
    /// Whether to transcode after downloading.
    pub convert_audio: bool,
    /// Output noise level.
    pub verbosity: Verbosity,
    /// Whether the metadata cache participates in this run.
    pub use_cache: bool,
}

impl ResolvedOptions {
    /// True when only errors should reach the terminal.
    #[must_use]
    pub fn quiet(&self) -> bool {
        self.verbosity == Verbosity::Quiet
    }
}

/// Merges the four layers, lowest to highest precedence, into a fresh
/// [`ResolvedOptions`]. Inputs are never mutated.
///
/// # Errors
///
/// Returns [`ConfigError::MissingField`] when a required field is set by
/// no layer (cannot happen when `defaults` comes from
/// [`OptionLayer::builtin`]).
pub fn resolve(
    defaults: &OptionLayer,
    global: &OptionLayer,
    invocation: &OptionLayer,
    cli: &OptionLayer,
) -> Result<ResolvedOptions, ConfigError> {
    let mut merged = Merged::default();
    for layer in [defaults, global, invocation, cli] {
        merged.apply(layer);
    }
    merged.finish()
}

/// Accumulator for the per-field reducer.
#[derive(Debug, Default)]
struct Merged {
    cwd: Option<PathBuf>,
    out_dir: Option<PathBuf>,
    format: Option<String>,
    codec: Option<String>,
    channels: Option<u8>,
    bitrate_kbps: Option<u32>,
    convert_audio: Option<bool>,
    verbosity: Option<Verbosity>,
    use_cache: Option<bool>,
}

impl Merged {
    fn apply(&mut self, layer: &OptionLayer) {
        if let Some(cwd) = &layer.cwd
            && !is_unset_sentinel(cwd)
        {
            self.cwd = Some(cwd.clone());
        }

        if let Some(out_dir) = &layer.out_dir
            && !is_unset_sentinel(out_dir)
        {
            self.out_dir = Some(compose_out_dir(layer, out_dir, self.cwd.as_deref()));
        }

        if let Some(format) = &layer.format {
            self.format = Some(format.clone());
        }
        if let Some(codec) = &layer.codec {
            self.codec = Some(codec.clone());
        }
        if let Some(channels) = layer.channels {
            self.channels = Some(channels);
        }
        if let Some(bitrate) = layer.bitrate_kbps {
            self.bitrate_kbps = Some(bitrate);
        }
        if let Some(convert) = layer.convert_audio {
            self.convert_audio = Some(convert);
        }
        if let Some(use_cache) = layer.use_cache {
            self.use_cache = Some(use_cache);
        }

        // Explicit quiet wins over the verbose counter within one layer.
        if layer.quiet == Some(true) {
            self.verbosity = Some(Verbosity::Quiet);
        } else if let Some(counter) = layer.verbose {
            self.verbosity = Some(Verbosity::from_counter(counter));
        } else if layer.quiet == Some(false) && self.verbosity == Some(Verbosity::Quiet) {
            self.verbosity = Some(Verbosity::Normal);
        }
    }

    fn finish(self) -> Result<ResolvedOptions, ConfigError> {
        let cwd = self
            .cwd
            .ok_or(ConfigError::MissingField { field: "cwd" })?;
        let out_dir = self
            .out_dir
            .ok_or(ConfigError::MissingField { field: "out_dir" })?;
        let format = self
            .format
            .ok_or(ConfigError::MissingField { field: "format" })?;
        Ok(ResolvedOptions {
            cwd,
            out_dir,
            format,
            codec: self.codec,
            channels: self.channels,
            bitrate_kbps: self.bitrate_kbps,
            convert_audio: self.convert_audio.unwrap_or(false),
            verbosity: self.verbosity.unwrap_or_default(),
            use_cache: self.use_cache.unwrap_or(true),
        })
    }
}

/// Composes a layer's `out_dir` override. Relative paths resolve against
/// that layer's own cwd when it set one; only layers without a cwd of
/// their own fall back to the cwd merged so far.
fn compose_out_dir(layer: &OptionLayer, out_dir: &Path, merged_cwd: Option<&Path>) -> PathBuf {
    if out_dir.is_absolute() {
        return out_dir.to_path_buf();
    }
    let layer_cwd = layer.cwd.as_deref().filter(|cwd| !is_unset_sentinel(cwd));
    match layer_cwd.or(merged_cwd) {
        Some(base) => base.join(out_dir),
        None => out_dir.to_path_buf(),
    }
}

/// `"."` and `""` are textual placeholders for "not configured" and never
/// override a more specific earlier value.
fn is_unset_sentinel(path: &Path) -> bool {
    let text = path.as_os_str();
    text.is_empty() || text == "."
}

/// Default global config path: `$XDG_CONFIG_HOME/tunedl/config.json`,
/// falling back to `$HOME/.config/tunedl/config.json`.
#[must_use]
pub fn default_global_config_path() -> Option<PathBuf> {
    if let Some(xdg) = env_var_non_empty("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("tunedl").join("config.json"));
    }
    let home = env_var_non_empty("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("tunedl")
            .join("config.json"),
    )
}

/// Loads the global config layer, returning an empty layer when no file
/// exists at the default path.
///
/// # Errors
///
/// Returns [`ConfigError`] when a file exists but fails to load.
pub fn load_global_layer() -> Result<OptionLayer, ConfigError> {
    match default_global_config_path() {
        Some(path) if path.exists() => OptionLayer::from_file(&path),
        _ => Ok(OptionLayer::default()),
    }
}

fn env_var_non_empty(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn expect_string(field: &'static str, value: &Value) -> Result<String, ConfigError> {
    value
        .as_str()
        .map(std::string::ToString::to_string)
        .ok_or(ConfigError::TypeMismatch {
            field,
            expected: "string",
            actual: json_type_name(value),
        })
}

fn expect_path(field: &'static str, value: &Value) -> Result<PathBuf, ConfigError> {
    expect_string(field, value).map(PathBuf::from)
}

fn expect_bool(field: &'static str, value: &Value) -> Result<bool, ConfigError> {
    value.as_bool().ok_or(ConfigError::TypeMismatch {
        field,
        expected: "boolean",
        actual: json_type_name(value),
    })
}

fn expect_integer(field: &'static str, value: &Value) -> Result<i64, ConfigError> {
    value.as_i64().ok_or(ConfigError::TypeMismatch {
        field,
        expected: "integer",
        actual: json_type_name(value),
    })
}
