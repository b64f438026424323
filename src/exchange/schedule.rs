//! Pure scheduling logic for the exchanger
//!
//! Everything here is a function of its arguments so the timing rules can be
//! tested without a runtime or a clock.

use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

/// Where the exchanger is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    Idle,
    Pinging,
    Exchanging,
}

/// Exchange cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    pub exchange: Duration,
    pub urgent: Duration,
}

/// Delay before the next cycle
///
/// An urgent request shortens the wait, except straight after a failed
/// cycle: failures always back off to the normal cadence.
pub fn next_delay(intervals: Intervals, urgent: bool, last_cycle_failed: bool) -> Duration {
    if urgent && !last_cycle_failed {
        intervals.urgent
    } else {
        intervals.exchange
    }
}

/// Deadline after a wakeup: never later than the one already armed
pub fn collapse_deadline(armed: Instant, now: Instant, delay: Duration) -> Instant {
    armed.min(now + delay)
}

/// Whether a merged request should run another cycle
///
/// Only a completed cycle is followed up; after a failure the next attempt
/// waits for the normal cadence.
pub fn should_rerun(rerun_requested: bool, cycle_completed: bool, stopped: bool) -> bool {
    rerun_requested && cycle_completed && !stopped
}

/// Whether more messages are waiting than one exchange carried
pub fn has_backlog(total_messages: usize, sent: usize) -> bool {
    total_messages > sent
}

/// Acceptance changes between two type sets, in sorted order
///
/// Each entry is `(type, now_accepted)`.
pub fn acceptance_changes(
    old: &BTreeSet<String>,
    new: &BTreeSet<String>,
) -> Vec<(String, bool)> {
    old.symmetric_difference(new)
        .map(|t| (t.clone(), new.contains(t)))
        .collect()
}

/// Parse a `set-intervals` value in seconds, ignoring non-positive numbers
pub fn interval_from_secs(value: Option<&serde_json::Value>) -> Option<Duration> {
    value
        .and_then(serde_json::Value::as_u64)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}
