//! Small shared helpers.

use chrono::Utc;

/// Current wall-clock time as epoch milliseconds.
pub fn epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Rough token estimate used when a provider omits usage: 4 chars ≈ 1 token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
