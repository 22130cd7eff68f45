use chrono::{DateTime, Utc};

/// Replacement nickname after a collision: the base nickname plus a suffix
/// derived from the clock. Never equal to `previous`.
pub fn next_candidate(base: &str, previous: &str, now: DateTime<Utc>) -> String {
    let mut suffix = now.timestamp().rem_euclid(10_000);
    let mut candidate = format!("{}{}", base, suffix);
    if candidate.eq_ignore_ascii_case(previous) {
        suffix = (suffix + 1) % 10_000;
        candidate = format!("{}{}", base, suffix);
    }
    candidate
}
