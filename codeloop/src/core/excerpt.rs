//! Rendering policy for execution output excerpts.
//!
//! Every place that shows or prompts with captured output goes through
//! [`truncate_excerpt`], so the character budget lives in one spot.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// Maximum characters of an output excerpt before truncation.
pub const EXCERPT_CHAR_LIMIT: usize = 1024;

/// Appended to an excerpt that was cut short.
pub const TRUNCATION_MARKER: &str = "\n\n...(output is too long)";

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)")
        .expect("ansi pattern is valid")
});

/// Cut `output` to [`EXCERPT_CHAR_LIMIT`] characters and mark the cut.
///
/// Counts Unicode scalar values, not bytes. Returns the input unchanged when
/// it fits.
pub fn truncate_excerpt(output: &str) -> Cow<'_, str> {
    match output.char_indices().nth(EXCERPT_CHAR_LIMIT) {
        None => Cow::Borrowed(output),
        Some((cut, _)) => {
            let mut excerpt = String::with_capacity(cut + TRUNCATION_MARKER.len());
            excerpt.push_str(&output[..cut]);
            excerpt.push_str(TRUNCATION_MARKER);
            Cow::Owned(excerpt)
        }
    }
}

/// Remove terminal control sequences (CSI and OSC) from captured output.
pub fn strip_ansi(output: &str) -> Cow<'_, str> {
    ANSI_RE.replace_all(output, "")
}
