//! Output filename derivation from track titles.

/// Longest file stem we will produce, in characters.
const MAX_STEM_CHARS: usize = 150;

/// Characters that are unsafe in filenames on at least one supported
/// platform.
const INVALID_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Turns a display title into a safe file stem, falling back to the track
/// id when sanitizing leaves nothing usable.
pub(crate) fn sanitize_stem(title: &str, fallback: &str) -> String {
    let mut stem: String = title
        .chars()
        .map(|c| {
            if c.is_control() || INVALID_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .take(MAX_STEM_CHARS)
        .collect();

    // Trailing dots and spaces are rejected by Windows file systems.
    stem = stem.trim().trim_end_matches(['.', ' ']).to_string();

    if stem.is_empty() {
        fallback.to_string()
    } else {
        stem
    }
}
