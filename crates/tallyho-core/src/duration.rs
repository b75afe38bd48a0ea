//! Human-entered poll durations such as `"1d12h30m"` or `"45m"`.

use crate::error::CoreError;
use chrono::Duration;

/// Duration used when a poll is created without one.
pub const DEFAULT_POLL_DURATION: &str = "5d";

/// Parse a compact duration made of `<number><unit>` parts, where unit is one
/// of `d`, `h`, `m` or `s` (case-insensitive). Each unit may appear at most
/// once and the total must be positive.
pub fn parse_duration(input: &str) -> Result<Duration, CoreError> {
    let invalid = || CoreError::Validation(format!("invalid duration '{input}', expected e.g. 1d12h30m"));
    let text = input.trim().to_ascii_lowercase();
    if text.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::zero();
    let mut seen = Vec::with_capacity(4);
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() || seen.contains(&ch) {
            return Err(invalid());
        }
        let amount: i64 = digits.parse().map_err(|_| invalid())?;
        let part = match ch {
            'd' => Duration::try_days(amount),
            'h' => Duration::try_hours(amount),
            'm' => Duration::try_minutes(amount),
            's' => Duration::try_seconds(amount),
            _ => None,
        }
        .ok_or_else(invalid)?;
        total = total.checked_add(&part).ok_or_else(invalid)?;
        seen.push(ch);
        digits.clear();
    }

    if !digits.is_empty() || total <= Duration::zero() {
        return Err(invalid());
    }
    Ok(total)
}
