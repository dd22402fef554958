use std::time::Duration;

use rand::Rng;

/// Default exponential back-off schedule: 200ms → 400ms → 800ms → 1600ms,
/// with ±20% jitter.
pub(crate) fn backoff(attempt: u64) -> Duration {
    let base_delay_ms = 200u64 * (1u64 << (attempt - 1));
    let jitter = rand::rng().random_range(0.8..1.2);
    let delay_ms = (base_delay_ms as f64 * jitter) as u64;
    Duration::from_millis(delay_ms)
}

/// Character-count heuristic used for all token estimates. The value only
/// feeds UI hints, so precision is traded for provider independence.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Line-ending normalization applied before any content comparison:
/// `\r\n` and bare `\r` both become `\n`.
pub fn normalize_line_endings(text: &str) -> String {
    if !text.contains('\r') {
        return text.to_string();
    }
    text.replace("\r\n", "\n").replace('\r', "\n")
}
