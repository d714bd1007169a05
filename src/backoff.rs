//! Quartic retry backoff: `floor(tries^4 / 3)` seconds, optionally capped.
use crate::model::QueueEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Upper bound for a single delay in seconds; 0 means uncapped.
    pub max_delay_secs: u64,
}

impl Backoff {
    pub fn new(max_delay_secs: u64) -> Self {
        Self { max_delay_secs }
    }

    pub fn uncapped() -> Self {
        Self { max_delay_secs: 0 }
    }

    /// Seconds an entry with `tries` completed attempts waits before the next.
    ///
    /// tries 0..=5 give 0, 0, 5, 27, 85, 208.
    pub fn delay(&self, tries: u32) -> u64 {
        let secs = u64::from(tries).saturating_pow(4) / 3;
        if self.max_delay_secs == 0 {
            secs
        } else {
            secs.min(self.max_delay_secs)
        }
    }

    /// Due once `now - delay` has reached the last attempt.
    pub fn is_due(&self, entry: &QueueEntry, now: i64) -> bool {
        let delay = i64::try_from(self.delay(entry.tries)).unwrap_or(i64::MAX);
        entry.last <= now.saturating_sub(delay)
    }
}
