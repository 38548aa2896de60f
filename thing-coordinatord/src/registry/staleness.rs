use std::time::Duration;
use chrono::{DateTime, Utc};

/// Decides whether a Thing that has gone quiet should be reported as stale.
///
/// The registry never removes anything; a policy only affects reporting.
pub trait StalenessPolicy: Send {
    fn is_stale(&self, last_heard: DateTime<Utc>, now: DateTime<Utc>) -> bool;
}

/// Every Thing stays live forever
pub struct NeverStale;

impl StalenessPolicy for NeverStale {
    fn is_stale(&self, _last_heard: DateTime<Utc>, _now: DateTime<Utc>) -> bool {
        false
    }
}

/// Stale once no announcement has been heard for the given duration
pub struct SilentFor(pub Duration);

impl StalenessPolicy for SilentFor {
    fn is_stale(&self, last_heard: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.0) {
            Ok(limit) => now - last_heard > limit,
            Err(_) => false,
        }
    }
}

/// Policy from `stale_after_secs`; zero disables staleness
pub fn from_secs(stale_after_secs: u64) -> Box<dyn StalenessPolicy> {
    if stale_after_secs == 0 {
        Box::new(NeverStale)
    } else {
        Box::new(SilentFor(Duration::from_secs(stale_after_secs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_for() {
        let now = Utc::now();
        let policy = SilentFor(Duration::from_secs(300));

        assert!(!policy.is_stale(now - chrono::Duration::seconds(299), now));
        assert!(policy.is_stale(now - chrono::Duration::seconds(301), now));
    }

    #[test]
    fn test_zero_means_never() {
        let now = Utc::now();
        let policy = from_secs(0);
        assert!(!policy.is_stale(now - chrono::Duration::days(365), now));
    }
}
