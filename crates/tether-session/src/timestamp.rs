//! Canonical epoch-millisecond timestamps.
//!
//! Clients send timestamps as seconds or milliseconds, as JSON numbers or
//! numeric strings. One magnitude rule decides the unit:
//!
//! | value `v`            | read as      | result          |
//! |----------------------|--------------|-----------------|
//! | `v < 1e8`            | milliseconds | `v`             |
//! | `1e8 <= v < 1e11`    | seconds      | `v * 1000`      |
//! | `v >= 1e11`          | milliseconds | `v`             |
//!
//! Fractions are truncated after scaling. Every output lies outside the
//! seconds band, which makes normalization idempotent.

use serde_json::Value;

/// Smallest value read as seconds (1973-03-03 when taken as seconds).
pub const SECONDS_BAND_START: i64 = 100_000_000;

/// First value past the seconds band (5138-11-16 when taken as seconds).
pub const SECONDS_BAND_END: i64 = 100_000_000_000;

/// Normalize a JSON timestamp to epoch milliseconds.
///
/// Returns `None` for anything that is not a non-negative finite number
/// (or a string holding one), and for values that overflow `i64`.
pub fn normalize_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                normalize_millis(i)
            } else if n.is_u64() {
                // Above i64::MAX.
                None
            } else {
                n.as_f64().and_then(normalize_float)
            }
        }
        Value::String(s) => normalize_str(s),
        _ => None,
    }
}

/// Integer form of [`normalize_timestamp`].
pub fn normalize_millis(v: i64) -> Option<i64> {
    if v < 0 {
        None
    } else if in_seconds_band(v) {
        v.checked_mul(1000)
    } else {
        Some(v)
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn normalize_float(v: f64) -> Option<i64> {
    if !v.is_finite() || v < 0.0 {
        return None;
    }
    let scaled = if v >= SECONDS_BAND_START as f64 && v < SECONDS_BAND_END as f64 {
        v * 1000.0
    } else {
        v
    };
    let truncated = scaled.trunc();
    // i64::MAX is not representable; 2^63 is the first float past it.
    if truncated >= i64::MAX as f64 {
        return None;
    }
    Some(truncated as i64)
}

fn normalize_str(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(i) = s.parse::<i64>() {
        return normalize_millis(i);
    }
    // `f64::from_str` accepts "inf" and "NaN"; normalize_float rejects them.
    s.parse::<f64>().ok().and_then(normalize_float)
}

fn in_seconds_band(v: i64) -> bool {
    (SECONDS_BAND_START..SECONDS_BAND_END).contains(&v)
}
