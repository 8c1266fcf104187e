use std::time::Duration;

use photogram_backup_core::{SyncOutcome, SyncRequest};
use tokio::time::Instant;

pub(crate) const RETRY_BACKOFF_STEP: Duration = Duration::from_secs(30);

/// When the next run is due and which attempt it is.
///
/// `Retry` bumps the attempt counter and re-runs after `30s × attempt`, never later than one
/// interval. A metered deferral spent no attempt: the counter stays and the run is re-checked
/// after one backoff step. `Success` and `Failure` reset the counter and wait a full interval.
#[derive(Debug)]
pub(crate) struct Scheduler {
    interval: Duration,
    next_due: Instant,
    attempt: u32,
    retry_manual: bool,
}

impl Scheduler {
    /// First run is due immediately.
    pub(crate) fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next_due: now,
            attempt: 0,
            retry_manual: false,
        }
    }

    pub(crate) fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    pub(crate) fn next_due(&self) -> Instant {
        self.next_due
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// A manual trigger starts a fresh job; otherwise continue the pending one.
    pub(crate) fn next_request(&self, manual_trigger: bool) -> SyncRequest {
        if manual_trigger {
            SyncRequest {
                is_manual: true,
                run_attempt: 0,
            }
        } else {
            SyncRequest {
                is_manual: self.retry_manual,
                run_attempt: self.attempt,
            }
        }
    }

    pub(crate) fn record(&mut self, request: SyncRequest, outcome: &SyncOutcome, now: Instant) {
        match outcome {
            SyncOutcome::Retry { .. } if outcome.is_deferred() => {
                self.attempt = request.run_attempt;
                self.retry_manual = request.is_manual;
                self.next_due = now + RETRY_BACKOFF_STEP.min(self.interval);
            }
            SyncOutcome::Retry { .. } => {
                self.attempt = request.run_attempt + 1;
                self.retry_manual = request.is_manual;
                self.next_due = now + (RETRY_BACKOFF_STEP * self.attempt).min(self.interval);
            }
            SyncOutcome::Success(_) | SyncOutcome::Failure { .. } => {
                self.attempt = 0;
                self.retry_manual = false;
                self.next_due = now + self.interval;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use photogram_backup_core::SyncReport;
    use photogram_backup_core::sync::METERED_DEFERRAL_CODE;

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn retry() -> SyncOutcome {
        SyncOutcome::Retry {
            code: "network.transient",
            reason: "connect timeout".to_string(),
        }
    }

    #[test]
    fn first_run_is_due_immediately() {
        let now = Instant::now();
        let s = Scheduler::new(HOUR, now);
        assert!(s.is_due(now));
        assert_eq!(s.next_request(false).run_attempt, 0);
    }

    #[test]
    fn retries_back_off_linearly_and_count_attempts() {
        let now = Instant::now();
        let mut s = Scheduler::new(HOUR, now);

        let r0 = s.next_request(false);
        s.record(r0, &retry(), now);
        assert_eq!(s.attempt(), 1);
        assert_eq!(s.next_due(), now + Duration::from_secs(30));

        let r1 = s.next_request(false);
        assert_eq!(r1.run_attempt, 1);
        s.record(r1, &retry(), now);
        assert_eq!(s.attempt(), 2);
        assert_eq!(s.next_due(), now + Duration::from_secs(60));
    }

    #[test]
    fn retry_backoff_never_exceeds_the_interval() {
        let now = Instant::now();
        let interval = Duration::from_secs(15 * 60);
        let mut s = Scheduler::new(interval, now);

        for _ in 0..100 {
            let r = s.next_request(false);
            s.record(r, &retry(), now);
        }
        assert_eq!(s.attempt(), 100);
        assert_eq!(s.next_due(), now + interval);
    }

    #[test]
    fn metered_deferrals_do_not_spend_attempts() {
        let now = Instant::now();
        let mut s = Scheduler::new(HOUR, now);
        s.record(s.next_request(false), &retry(), now);
        assert_eq!(s.attempt(), 1);

        let deferred = SyncOutcome::Retry {
            code: METERED_DEFERRAL_CODE,
            reason: "waiting for unmetered network".to_string(),
        };
        for _ in 0..50 {
            let r = s.next_request(false);
            s.record(r, &deferred, now);
        }
        assert_eq!(s.attempt(), 1);
        assert_eq!(s.next_request(false).run_attempt, 1);
        assert_eq!(s.next_due(), now + RETRY_BACKOFF_STEP);
    }

    #[test]
    fn terminal_outcomes_reset_the_counter() {
        let now = Instant::now();
        let mut s = Scheduler::new(HOUR, now);
        s.record(s.next_request(false), &retry(), now);

        let r = s.next_request(false);
        s.record(
            r,
            &SyncOutcome::Failure {
                code: "network.transient",
                reason: "gave up".to_string(),
            },
            now,
        );
        assert_eq!(s.attempt(), 0);
        assert_eq!(s.next_due(), now + HOUR);

        s.record(
            s.next_request(false),
            &SyncOutcome::Success(SyncReport::default()),
            now,
        );
        assert_eq!(s.attempt(), 0);
    }

    #[test]
    fn retried_manual_run_stays_manual() {
        let now = Instant::now();
        let mut s = Scheduler::new(HOUR, now);
        let manual = s.next_request(true);
        assert!(manual.is_manual);

        s.record(manual, &retry(), now);
        let again = s.next_request(false);
        assert!(again.is_manual);
        assert_eq!(again.run_attempt, 1);
    }
}
