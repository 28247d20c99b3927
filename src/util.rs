//! Small helpers shared across modules.

use std::borrow::Cow;

/// Expand a leading `~` to `$HOME` (config and device paths).
///
/// - `"~"` → `"/home/user"`
/// - `"~/simcomd.toml"` → `"/home/user/simcomd.toml"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// At most `max` chars of `s`, for log lines. Never splits a char.
pub fn truncate_for_log(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
