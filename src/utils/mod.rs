//! Small ambient helpers shared across modules.

use once_cell::sync::Lazy;

static CLOCK: Lazy<quanta::Clock> = Lazy::new(quanta::Clock::new);

/// A precise timestamp, suitable for `created_at`/`last_used_at` bookkeeping.
pub fn now() -> quanta::Instant {
    CLOCK.now()
}

/// Human-readable duration for log lines, e.g. "3m12s".
pub fn format_duration(d: std::time::Duration) -> String {
    let chrono_duration = chrono::Duration::from_std(d).unwrap_or_default();
    let total_secs = chrono_duration.num_seconds();
    let (h, rem) = (total_secs / 3600, total_secs % 3600);
    let (m, s) = (rem / 60, rem % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}
