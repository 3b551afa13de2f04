use std::time::Duration;

use tokio::time::Instant;

/// About 30 years, treated as "never"
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The instant `duration` after `now`.
///
/// Durations too large to represent, such as [`Duration::MAX`], end at a far
/// future instant instead of overflowing.
pub(crate) fn after(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration.min(FAR_FUTURE)).unwrap_or(now)
}
