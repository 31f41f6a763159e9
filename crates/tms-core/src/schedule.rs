/// Poll loop state machine with fixed spacing between requests.
///
/// The next fetch is scheduled only once the current one settles, so at most
/// one fetch is in flight. Time is passed in as milliseconds, which lets the
/// schedule run against a virtual clock.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    interval_ms: u64,
    running: bool,
    in_flight: bool,
    next_due: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settled {
    /// False when `stop()` ran while the fetch was in flight; the response
    /// should then be dropped.
    pub apply: bool,
    pub next_due: Option<i64>,
}

impl PollSchedule {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms: interval_ms.max(1),
            running: false,
            in_flight: false,
            next_due: None,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn next_due(&self) -> Option<i64> {
        self.next_due
    }

    /// Returns false when already running. A fresh start is due immediately
    /// unless a fetch from before a `stop()` is still outstanding, in which
    /// case the next fetch follows its settlement.
    pub fn start(&mut self, now_ms: i64) -> bool {
        if self.running {
            return false;
        }
        self.running = true;
        if !self.in_flight {
            self.next_due = Some(now_ms);
        }
        true
    }

    /// Cancels the pending fetch. An in-flight request is left alone.
    pub fn stop(&mut self) -> bool {
        if !self.running {
            return false;
        }
        self.running = false;
        self.next_due = None;
        true
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.running
            && !self.in_flight
            && self.next_due.map(|due| now_ms >= due).unwrap_or(false)
    }

    pub fn begin_fetch(&mut self, now_ms: i64) -> bool {
        if !self.is_due(now_ms) {
            return false;
        }
        self.in_flight = true;
        self.next_due = None;
        true
    }

    pub fn settle(&mut self, now_ms: i64) -> Settled {
        self.in_flight = false;
        if self.running {
            self.next_due = Some(now_ms.saturating_add(self.interval_ms as i64));
        }
        Settled {
            apply: self.running,
            next_due: self.next_due,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_idempotent_and_due_immediately() {
        let mut schedule = PollSchedule::new(2_000);
        assert!(schedule.start(100));
        assert!(!schedule.start(150));
        assert_eq!(schedule.next_due(), Some(100));
        assert!(schedule.is_due(100));
    }

    #[test]
    fn only_one_fetch_in_flight() {
        let mut schedule = PollSchedule::new(2_000);
        schedule.start(0);
        assert!(schedule.begin_fetch(0));
        assert!(!schedule.begin_fetch(0));
        assert!(!schedule.begin_fetch(10_000));
        schedule.start(10_000);
        assert!(!schedule.begin_fetch(10_000));
    }

    #[test]
    fn spacing_is_measured_from_settlement() {
        let mut schedule = PollSchedule::new(2_000);
        schedule.start(0);
        schedule.begin_fetch(0);
        let settled = schedule.settle(1_500);
        assert!(settled.apply);
        assert_eq!(settled.next_due, Some(3_500));
        assert!(!schedule.is_due(3_499));
        assert!(schedule.is_due(3_500));
    }

    #[test]
    fn failed_tick_still_schedules_the_next_one() {
        let mut schedule = PollSchedule::new(500);
        schedule.start(0);
        schedule.begin_fetch(0);
        // settle is outcome-agnostic; failures reschedule the same way
        schedule.settle(50);
        assert_eq!(schedule.next_due(), Some(550));
    }

    #[test]
    fn stop_cancels_pending_tick_and_discards_late_response() {
        let mut schedule = PollSchedule::new(1_000);
        schedule.start(0);
        schedule.begin_fetch(0);
        assert!(schedule.stop());
        assert!(!schedule.stop());
        let settled = schedule.settle(200);
        assert!(!settled.apply);
        assert_eq!(settled.next_due, None);
        assert!(!schedule.is_due(5_000));
    }

    #[test]
    fn restart_while_in_flight_waits_for_settlement() {
        let mut schedule = PollSchedule::new(1_000);
        schedule.start(0);
        schedule.begin_fetch(0);
        schedule.stop();
        assert!(schedule.start(100));
        assert_eq!(schedule.next_due(), None);
        let settled = schedule.settle(300);
        assert!(settled.apply);
        assert_eq!(settled.next_due, Some(1_300));
    }
}
