use std::ascii;

use chrono::Utc;

/// Longest payload prefix rendered by [`preview`].
const PREVIEW_LEN: usize = 64;

/// Current time as seconds since the Unix epoch, the unit every timestamp in
/// the jobs table uses.
pub fn now() -> i64 {
    Utc::now().timestamp()
}

/// Renders a payload for logging: ASCII-escaped and cut to a short prefix.
pub fn preview(input: &str) -> String {
    let escaped: String = input
        .bytes()
        .take(PREVIEW_LEN)
        .flat_map(ascii::escape_default)
        .map(char::from)
        .collect();

    if input.len() > PREVIEW_LEN {
        format!("{escaped}...")
    } else {
        escaped
    }
}
