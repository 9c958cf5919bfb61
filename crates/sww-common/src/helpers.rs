//! Common helper functions.

/// Performs a constant-time comparison of two byte strings.
/// Used when checking a peer key against the one already accepted.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

/// Milliseconds to whole seconds, rounding down.
pub fn ms_to_secs(ms: u64) -> u64 {
    ms / 1000
}
