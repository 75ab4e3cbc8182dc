// Reconnect backoff schedule

use std::time::Duration;

use rand::Rng;

/// Delay before retry `attempt` (0-based): exponential from `base`, capped at
/// `max`, with 0-25% jitter to avoid reconnect stampedes across hosts.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, jitter: bool) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt);
    let delay_ms = (base.as_millis() as u64).saturating_mul(multiplier);
    let delay = Duration::from_millis(delay_ms.min(max.as_millis() as u64));

    if jitter {
        let jitter_ms = rand::thread_rng().gen_range(0..=(delay.as_millis() as u64 / 4).max(1));
        delay + Duration::from_millis(jitter_ms)
    } else {
        delay
    }
}
