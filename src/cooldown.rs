//! Loop damping between successive probes of one endpoint.
//!
//! Customers whose endpoint flaps would otherwise drive a tight
//! probe/republish/fail loop. The damping counter on the health entry grows
//! with every failed probe and every completed republish cycle, and the delay
//! before the next probe grows exponentially with it, capped at one hour.

use std::time::Duration;

/// Ceiling for the damped delay.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(60 * 60);

/// Delay before the next probe for a damping counter of `n`.
///
/// `n = 0` probes immediately; afterwards the delay is `min(2^n, 60)` minutes.
pub fn probe_delay(n: u32) -> Duration {
    if n == 0 {
        return Duration::ZERO;
    }
    let minutes = 2u64.checked_pow(n).unwrap_or(u64::MAX).min(60);
    Duration::from_secs(minutes * 60)
}
