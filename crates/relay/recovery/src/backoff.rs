//! Retry delays.

use std::time::Duration;

use rand::Rng;

use relay_types::RetryPolicy;

/// Delay before the attempt that follows `failed_attempt` (1-based).
///
/// With jitter enabled the delay is drawn uniformly from the upper half of
/// the exponential backoff, so it never exceeds `max_delay`.
pub fn retry_delay(policy: &RetryPolicy, failed_attempt: u32) -> Duration {
    let delay = policy.backoff(failed_attempt);
    if !policy.jitter || delay.is_zero() {
        return delay;
    }
    let max_ms = delay.as_millis() as u64;
    let jittered = rand::thread_rng().gen_range(max_ms / 2..=max_ms);
    Duration::from_millis(jittered)
}
