//! Redelivery backoff calculation.

use std::time::Duration;

/// Calculate the redelivery delay for the given delivery attempt count.
///
/// The delay grows exponentially from `base` and is capped at `max`:
/// `min(base * 2^attempt, max)`. Arithmetic saturates, so arbitrarily large
/// attempt counts return `max` rather than overflowing.
pub fn delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    match base.checked_mul(factor) {
        Some(delay) => delay.min(max),
        None => max,
    }
}
