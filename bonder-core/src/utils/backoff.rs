use rand::Rng;
use std::time::Duration;

/// Doublings after which the delay stops growing.
pub const MAX_RETRY_EXPONENT: u32 = 16;

/// Exponential backoff: `base * 2^attempts`, capped at `max`.
pub fn calculate_retry_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.pow(attempts.min(MAX_RETRY_EXPONENT));
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Spread `delay` by up to a quarter in either direction so that loops
/// failing together do not retry together.
pub fn with_jitter(delay: Duration) -> Duration {
    let quarter = delay / 4;
    if quarter.is_zero() {
        return delay;
    }
    let spread = rand::rng().random_range(Duration::ZERO..=quarter * 2);
    delay - quarter + spread
}
