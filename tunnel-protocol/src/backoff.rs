//! Reconnection backoff policy shared by the agent's driver loop and the
//! gateway's own reconnect-aware callers.
//!
//! The delay is a pure function of the attempt count and an injected
//! jitter source, so it can be unit-tested without mocking the clock.

use rand::Rng;
use std::time::Duration;

/// Compute the delay before reconnection attempt `attempt` (1-indexed).
///
/// `min(2^attempt * base, ceiling) + uniform_random[0, 1) seconds` so
/// that many agents reconnecting at once do not thunder against the
/// gateway in lockstep, while the delay is always within one second of
/// the capped exponential value.
pub fn next_delay(attempt: u32, base: Duration, ceiling: Duration, rng: &mut impl Rng) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let scaled = base
        .checked_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
        .unwrap_or(ceiling);
    let capped = scaled.min(ceiling);

    let jitter = Duration::from_secs_f64(rng.gen_range(0.0..1.0));
    capped.saturating_add(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn first_attempt_is_roughly_base() {
        let mut rng = StepRng::new(0, 1);
        let delay = next_delay(1, Duration::from_secs(1), Duration::from_secs(60), &mut rng);
        assert!(delay >= Duration::from_secs(1));
        assert!(delay < Duration::from_secs(2));
    }

    #[test]
    fn delay_grows_with_attempt_count() {
        let mut rng = StepRng::new(0, 1);
        let early = next_delay(1, Duration::from_millis(100), Duration::from_secs(30), &mut rng);
        let later = next_delay(5, Duration::from_millis(100), Duration::from_secs(30), &mut rng);
        assert!(later > early);
    }

    #[test]
    fn delay_never_exceeds_ceiling_plus_one_second() {
        let mut rng = StepRng::new(u64::MAX / 2, 7);
        for attempt in 1..40 {
            let delay = next_delay(attempt, Duration::from_millis(50), Duration::from_secs(10), &mut rng);
            assert!(delay <= Duration::from_secs(11));
        }
    }

    #[test]
    fn zero_attempt_does_not_panic() {
        let mut rng = StepRng::new(0, 1);
        let delay = next_delay(0, Duration::from_millis(10), Duration::from_secs(5), &mut rng);
        assert!(delay >= Duration::from_millis(10));
    }
}
