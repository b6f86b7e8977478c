//! Bounded retry counter shared by link acquisition and broker reconnects.
//!
//! Both loops retry forever at a fixed 500 ms spacing. The counter only
//! decides when the device hooks should be told that things look bad:
//! - past `fast_disconnect_after` attempts, when fast-disconnect mode is on
//! - at and beyond `max_reconnect` attempts, always (terminal escalation)
//!
//! Escalation is advisory. Nothing here stops the retry loop.

use std::time::Duration;

/// Retry spacing and escalation thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait between two attempts.
    pub wait_quantum: Duration,
    /// Attempts after which fast-disconnect escalation fires.
    pub fast_disconnect_after: u32,
    /// Attempts at which terminal escalation starts firing.
    pub max_reconnect: u32,
    /// Counter value past which the counter wraps to 0.
    pub overflow_guard: u32,
    /// Escalate early, after `fast_disconnect_after` attempts.
    pub fast_disconnect: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            wait_quantum: Duration::from_millis(500),
            fast_disconnect_after: 10,
            max_reconnect: 500,
            overflow_guard: 10_000,
            fast_disconnect: false,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_reconnect(mut self, max_reconnect: u32) -> Self {
        self.max_reconnect = max_reconnect;
        self
    }

    pub fn with_fast_disconnect(mut self, enabled: bool) -> Self {
        self.fast_disconnect = enabled;
        self
    }
}

/// What the device hooks are told when a threshold is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// More than `fast_disconnect_after` failures in fast-disconnect mode.
    FastDisconnect,
    /// `max_reconnect` failures or more. Peripherals should be powered off.
    Terminal,
}

/// Failure counter for one retry loop.
#[derive(Debug, Clone, Default)]
pub struct RetryCounter {
    attempt: u32,
    fast_fired: bool,
    wrapped: bool,
}

impl RetryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failures since the last success (or wrap).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the counter wrapped during the current failure run.
    pub fn has_wrapped(&self) -> bool {
        self.wrapped
    }

    /// Count one failed attempt and report the escalation it triggers, if any.
    ///
    /// Terminal escalation takes precedence over fast-disconnect and fires on
    /// every attempt at or past the threshold. Fast-disconnect fires once per
    /// crossing. Once the counter has wrapped, nothing fires again until the
    /// next [`reset`](Self::reset).
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> Option<Escalation> {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt > policy.overflow_guard {
            self.attempt = 0;
            self.wrapped = true;
            return None;
        }
        if self.wrapped {
            return None;
        }

        if self.attempt >= policy.max_reconnect {
            return Some(Escalation::Terminal);
        }
        if policy.fast_disconnect && self.attempt > policy.fast_disconnect_after && !self.fast_fired
        {
            self.fast_fired = true;
            return Some(Escalation::FastDisconnect);
        }
        None
    }

    /// Success: back to a clean slate.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(counter: &mut RetryCounter, policy: &RetryPolicy, n: u32) -> Vec<(u32, Escalation)> {
        (0..n)
            .filter_map(|_| {
                counter
                    .record_failure(policy)
                    .map(|e| (counter.attempt(), e))
            })
            .collect()
    }

    #[test]
    fn test_counter_increases_monotonically() {
        let policy = RetryPolicy::default();
        let mut counter = RetryCounter::new();
        for expected in 1..=50 {
            counter.record_failure(&policy);
            assert_eq!(counter.attempt(), expected);
        }
        counter.reset();
        assert_eq!(counter.attempt(), 0);
    }

    #[test]
    fn test_no_escalation_below_thresholds() {
        let policy = RetryPolicy::default().with_max_reconnect(500);
        let mut counter = RetryCounter::new();
        assert!(run(&mut counter, &policy, 499).is_empty());
    }

    #[test]
    fn test_fast_disconnect_fires_once_per_crossing() {
        let policy = RetryPolicy::default().with_fast_disconnect(true);
        let mut counter = RetryCounter::new();
        let fired = run(&mut counter, &policy, 40);
        assert_eq!(fired, vec![(11, Escalation::FastDisconnect)]);

        // A success re-arms it
        counter.reset();
        let fired = run(&mut counter, &policy, 11);
        assert_eq!(fired, vec![(11, Escalation::FastDisconnect)]);
    }

    #[test]
    fn test_terminal_fires_every_attempt_past_threshold() {
        let policy = RetryPolicy::default().with_max_reconnect(20);
        let mut counter = RetryCounter::new();
        let fired = run(&mut counter, &policy, 23);
        assert_eq!(
            fired,
            vec![
                (20, Escalation::Terminal),
                (21, Escalation::Terminal),
                (22, Escalation::Terminal),
                (23, Escalation::Terminal),
            ]
        );
    }

    #[test]
    fn test_terminal_takes_precedence() {
        let policy = RetryPolicy::default()
            .with_fast_disconnect(true)
            .with_max_reconnect(5);
        let mut counter = RetryCounter::new();
        let fired = run(&mut counter, &policy, 12);
        assert!(fired.iter().all(|(_, e)| *e == Escalation::Terminal));
        assert_eq!(fired.len(), 8);
    }

    #[test]
    fn test_wrap_silences_escalation_until_reset() {
        let policy = RetryPolicy {
            max_reconnect: 5,
            overflow_guard: 8,
            ..RetryPolicy::default()
        };
        let mut counter = RetryCounter::new();
        let fired = run(&mut counter, &policy, 8);
        assert_eq!(fired.len(), 4);

        // Attempt 9 wraps to 0
        assert_eq!(counter.record_failure(&policy), None);
        assert_eq!(counter.attempt(), 0);
        assert!(counter.has_wrapped());

        // Past the threshold again, still silent
        assert!(run(&mut counter, &policy, 8).is_empty());

        counter.reset();
        assert!(!counter.has_wrapped());
        assert_eq!(run(&mut counter, &policy, 5).len(), 1);
    }
}
