//! Overflow-guarded Unix timestamps.
//!
//! Record timestamps ultimately come from remote server responses and
//! from a cache file that is attacker-influenceable in principle, so
//! every value is clamped into a range where `created + max_age` cannot
//! overflow a signed 64-bit integer.

/// Upper bound for timestamps and durations. Values at or above this are
/// treated as invalid so the sum of two clamped values stays in range.
pub const MAX_EPOCH: i64 = i64::MAX / 2;

/// Current Unix time in seconds.
pub fn now() -> i64 {
    clamp_epoch(chrono::Utc::now().timestamp())
}

/// Clamp a timestamp or duration: negative or overflow-prone values
/// become 0 (invalid).
pub fn clamp_epoch(t: i64) -> i64 {
    if t < 0 || t >= MAX_EPOCH { 0 } else { t }
}

/// Expiry time for a record: `created + max_age`, or 0 when the record
/// carries no validity window. Inputs must already be clamped.
pub fn expiry(created: i64, max_age: i64) -> i64 {
    if max_age == 0 { 0 } else { created + max_age }
}
