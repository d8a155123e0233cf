//! Exponential backoff helper

use std::time::Duration;

/// Delay for the given attempt: `base * 2^attempt`, capped at `max`
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);

        assert_eq!(backoff_delay(0, base, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, base, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, base, max), Duration::from_secs(8));
        assert_eq!(backoff_delay(5, base, max), Duration::from_secs(30));
        assert_eq!(backoff_delay(30, base, max), Duration::from_secs(30));
    }
}
