use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic milliseconds since the first call in this process.
///
/// Bandwidth accounting passes timestamps explicitly so tests can drive the
/// clock; a zero timestamp means "read the platform clock".
pub fn now_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Substitute the platform clock for a zero timestamp.
pub(crate) fn or_now(now_ms_arg: u64) -> u64 {
    if now_ms_arg == 0 {
        now_ms()
    } else {
        now_ms_arg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn zero_is_substituted() {
        assert_eq!(or_now(42), 42);
        // after the first now_ms() call above the clock has started
        let _ = or_now(0);
    }
}
