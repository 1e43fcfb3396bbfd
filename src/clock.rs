//! Monotonic millisecond clock for timers and TTLs.

use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds since the first call in this process. Monotonic, never
/// affected by wall-clock adjustments; all deadlines in the server are
/// expressed on this timeline.
pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_decreases() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }
}
