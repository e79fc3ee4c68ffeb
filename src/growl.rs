//! Growl handler contract (component G): the out-of-band notification
//! side-channel a room fires when a peer addresses a `growl` message to a
//! predefined user. The room engine only needs `notify` to exist and to
//! enforce its own rate limit — the actual delivery mechanism (push
//! notification, desktop toast, email) is a collaborator's concern and sits
//! outside this crate.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use tracing::info;

/// Implemented by whatever delivers the out-of-band notification. Called
/// asynchronously by the room loop; failures are the implementation's
/// problem and must not be surfaced back into the room.
#[async_trait]
pub trait GrowlHandler: Send + Sync {
    async fn notify(&self, msg: &str, from_handle: &str, token: &str);
}

/// Reference implementation: logs the notification via `tracing` and
/// applies the documented 3-per-2-minutes/burst-3 rate limit, silently
/// suppressing anything over the limit. Stands in for a real push/desktop
/// bridge so the crate is exercisable standalone.
pub struct LoggingGrowlHandler {
    limiter: RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl LoggingGrowlHandler {
    pub fn new() -> Self {
        // Replenish one cell every 40s (120s / 3) so the steady-state rate is
        // 3 per 2 minutes, with bursts up to 3 when the limiter has been idle.
        let quota = Quota::with_period(Duration::from_secs(40))
            .expect("40s period is nonzero")
            .allow_burst(NonZeroU32::new(3).unwrap());
        Self {
            limiter: RateLimiter::direct(quota),
        }
    }
}

impl Default for LoggingGrowlHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GrowlHandler for LoggingGrowlHandler {
    async fn notify(&self, msg: &str, from_handle: &str, token: &str) {
        if self.limiter.check().is_err() {
            info!(from = from_handle, "growl suppressed: rate limit exceeded");
            return;
        }
        info!(from = from_handle, %token, "growl: {msg}");
    }
}
