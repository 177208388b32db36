//! Identifier validation for download targets.
//!
//! A target is named either by a full watch URL on a supported host or by a
//! bare fixed-length track id. Validation happens before any network
//! activity so malformed input never costs a round-trip.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use url::Url;

/// Length of a raw track identifier.
pub const TRACK_ID_LEN: usize = 11;

/// Hosts whose watch URLs we accept (`?v=` query carries the id).
const WATCH_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
];

/// Short-link host whose first path segment is the id.
const SHORT_HOST: &str = "youtu.be";

static TRACK_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("static track id pattern is valid")
});

/// Errors produced while validating an identifier.
#[derive(Debug, Error)]
pub enum IdentifierError {
    /// The input is a URL but not for a supported host.
    #[error("unsupported host '{host}' in '{input}'")]
    UnsupportedHost {
        /// The original input text.
        input: String,
        /// The host that was rejected.
        host: String,
    },

    /// The input is a supported URL but carries no valid track id.
    #[error("no valid track id in '{input}'")]
    MissingId {
        /// The original input text.
        input: String,
    },

    /// The input is neither a supported URL nor a valid raw id.
    #[error("malformed identifier: '{input}' (expected a watch URL or an 11-character id)")]
    Malformed {
        /// The original input text.
        input: String,
    },
}

/// Validated track identifier. At most one cache entry and one batch
/// outcome exist per `TrackId` regardless of the input form it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(String);

impl TrackId {
    /// Parses either a full watch URL or a raw fixed-length id.
    ///
    /// # Errors
    ///
    /// Returns [`IdentifierError`] when the input matches neither form.
    pub fn parse(input: &str) -> Result<Self, IdentifierError> {
        let trimmed = input.trim();
        if TRACK_ID_PATTERN.is_match(trimmed) {
            return Ok(Self(trimmed.to_string()));
        }
        Self::from_url(trimmed)
    }

    /// Parses a full watch URL only; raw tokens are rejected.
    ///
    /// Batch manifests use this form unless bare ids were explicitly
    /// enabled.
    ///
    /// # Errors
    ///
    /// Returns [`IdentifierError`] for non-URLs, unsupported hosts, and
    /// URLs that carry no valid id.
    pub fn from_url(input: &str) -> Result<Self, IdentifierError> {
        let trimmed = input.trim();
        let parsed = Url::parse(trimmed).map_err(|_| IdentifierError::Malformed {
            input: trimmed.to_string(),
        })?;

        let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();

        if host == SHORT_HOST {
            let candidate = parsed
                .path_segments()
                .and_then(|mut segments| segments.next())
                .unwrap_or_default();
            return Self::from_candidate(candidate, trimmed);
        }

        if WATCH_HOSTS.contains(&host.as_str()) {
            let candidate = parsed
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned())
                .unwrap_or_default();
            return Self::from_candidate(&candidate, trimmed);
        }

        Err(IdentifierError::UnsupportedHost {
            input: trimmed.to_string(),
            host,
        })
    }

    fn from_candidate(candidate: &str, input: &str) -> Result<Self, IdentifierError> {
        if TRACK_ID_PATTERN.is_match(candidate) {
            Ok(Self(candidate.to_string()))
        } else {
            Err(IdentifierError::MissingId {
                input: input.to_string(),
            })
        }
    }

    /// Returns the raw 11-character id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the canonical watch URL for this id.
    #[must_use]
    pub fn watch_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.0)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_id() {
        let id = TrackId::parse("dQw4w9WgXcQ").unwrap();
        assert_eq!(id.as_str(), "dQw4w9WgXcQ");
    }

    #[test]
    fn test_parse_watch_url() {
        let id = TrackId::parse("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap();
        assert_eq!(id.as_str(), "dQw4w9WgXcQ");
    }

    #[test]
    fn test_parse_watch_url_with_extra_params() {
        let id = TrackId::parse("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42s").unwrap();
        assert_eq!(id.as_str(), "dQw4w9WgXcQ");
    }

    #[test]
    fn test_parse_short_url() {
        let id = TrackId::parse("https://youtu.be/dQw4w9WgXcQ").unwrap();
        assert_eq!(id.as_str(), "dQw4w9WgXcQ");
    }

    #[test]
    fn test_parse_music_host() {
        let id = TrackId::parse("https://music.youtube.com/watch?v=dQw4w9WgXcQ").unwrap();
        assert_eq!(id.as_str(), "dQw4w9WgXcQ");
    }

    #[test]
    fn test_parse_rejects_wrong_length_token() {
        let result = TrackId::parse("short");
        assert!(matches!(result, Err(IdentifierError::Malformed { .. })));
    }

    #[test]
    fn test_parse_rejects_unsupported_host() {
        let result = TrackId::parse("https://vimeo.com/watch?v=dQw4w9WgXcQ");
        assert!(matches!(
            result,
            Err(IdentifierError::UnsupportedHost { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_watch_url_without_id() {
        let result = TrackId::parse("https://www.youtube.com/watch?list=PL123");
        assert!(matches!(result, Err(IdentifierError::MissingId { .. })));
    }

    #[test]
    fn test_parse_rejects_short_url_with_bad_id() {
        let result = TrackId::parse("https://youtu.be/nope");
        assert!(matches!(result, Err(IdentifierError::MissingId { .. })));
    }

    #[test]
    fn test_from_url_rejects_raw_token() {
        let result = TrackId::from_url("dQw4w9WgXcQ");
        assert!(matches!(result, Err(IdentifierError::Malformed { .. })));
    }

    #[test]
    fn test_same_id_from_all_accepted_forms() {
        let a = TrackId::parse("dQw4w9WgXcQ").unwrap();
        let b = TrackId::parse("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap();
        let c = TrackId::parse("https://youtu.be/dQw4w9WgXcQ?t=10").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_watch_url_round_trip() {
        let id = TrackId::parse("dQw4w9WgXcQ").unwrap();
        let again = TrackId::parse(&id.watch_url()).unwrap();
        assert_eq!(id, again);
    }
}
