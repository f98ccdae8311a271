//! Consecutive poll failure tracking

/// Failures tolerated before published data is marked stale
pub const COUNTLOST: u32 = 10;

/// What a recorded poll result means for the published data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// Success with no outstanding loss
    Ok,
    /// Failure below the limit (or repeated after it was reached)
    Failed(u32),
    /// The limit was just reached
    BecameStale,
    /// First success after the data went stale
    Recovered,
}

/// Bounded counter of consecutive failed status polls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollFailureCounter {
    limit: u32,
    count: u32,
}

impl Default for PollFailureCounter {
    fn default() -> Self {
        Self::new(COUNTLOST)
    }
}

impl PollFailureCounter {
    /// `limit` is raised to 1 if zero
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            count: 0,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn is_stale(&self) -> bool {
        self.count >= self.limit
    }

    /// Count one failure; reports [`PollEvent::BecameStale`] exactly once
    pub fn record_failure(&mut self) -> PollEvent {
        if self.count >= self.limit {
            return PollEvent::Failed(self.count);
        }
        self.count += 1;
        if self.count == self.limit {
            PollEvent::BecameStale
        } else {
            PollEvent::Failed(self.count)
        }
    }

    /// Reset after a successful poll
    pub fn record_success(&mut self) -> PollEvent {
        let was_stale = self.is_stale();
        self.count = 0;
        if was_stale {
            PollEvent::Recovered
        } else {
            PollEvent::Ok
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nine_failures_not_stale() {
        let mut counter = PollFailureCounter::default();
        for n in 1..=9 {
            assert_eq!(counter.record_failure(), PollEvent::Failed(n));
        }
        assert!(!counter.is_stale());
    }

    #[test]
    fn test_tenth_failure_marks_stale_once() {
        let mut counter = PollFailureCounter::default();
        for _ in 0..9 {
            counter.record_failure();
        }
        assert_eq!(counter.record_failure(), PollEvent::BecameStale);
        assert!(counter.is_stale());

        // Further failures stay capped and do not repeat the event
        assert_eq!(counter.record_failure(), PollEvent::Failed(COUNTLOST));
        assert_eq!(counter.record_failure(), PollEvent::Failed(COUNTLOST));
        assert_eq!(counter.count(), COUNTLOST);
    }

    #[test]
    fn test_success_after_stale_recovers_and_resets() {
        let mut counter = PollFailureCounter::default();
        for _ in 0..COUNTLOST {
            counter.record_failure();
        }
        assert_eq!(counter.record_success(), PollEvent::Recovered);
        assert_eq!(counter.count(), 0);
        assert!(!counter.is_stale());
        assert_eq!(counter.record_success(), PollEvent::Ok);
    }

    #[test]
    fn test_success_before_limit_resets_quietly() {
        let mut counter = PollFailureCounter::default();
        counter.record_failure();
        counter.record_failure();
        assert_eq!(counter.record_success(), PollEvent::Ok);
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn test_zero_limit_raised() {
        let mut counter = PollFailureCounter::new(0);
        assert_eq!(counter.limit(), 1);
        assert_eq!(counter.record_failure(), PollEvent::BecameStale);
    }
}
