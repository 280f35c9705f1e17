use std::{fmt, time::Duration};

use tracing::{info, warn};

pub const DEFAULT_BACKOFF_S: [u64; 5] = [1, 2, 5, 10, 20];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    /// Attempts are exhausted; the caller decides what escalation means.
    Escalate,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff_s: Vec<u64>,
    max_attempts: u32,
    attempt: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&DEFAULT_BACKOFF_S, DEFAULT_BACKOFF_S.len() as u32)
    }
}

impl RetryPolicy {
    pub fn new(backoff_s: &[u64], max_attempts: u32) -> Self {
        let backoff_s = if backoff_s.is_empty() {
            DEFAULT_BACKOFF_S.to_vec()
        } else {
            backoff_s.to_vec()
        };
        Self {
            backoff_s,
            max_attempts: max_attempts.max(1),
            attempt: 0,
        }
    }

    /// Delay before the next attempt; the last step repeats until attempts
    /// run out. Escalating restarts the count.
    pub fn next(&mut self) -> RetryDecision {
        if self.attempt >= self.max_attempts {
            self.attempt = 0;
            return RetryDecision::Escalate;
        }
        let step = (self.attempt as usize).min(self.backoff_s.len() - 1);
        self.attempt += 1;
        RetryDecision::RetryAfter(Duration::from_secs(self.backoff_s[step]))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkReport {
    pub connected: bool,
    pub connects: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub escalations: u64,
    pub success_rate: u8,
}

impl fmt::Display for LinkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} connects={} failures={} streak={} escalations={} success={}%",
            if self.connected { "up" } else { "down" },
            self.connects,
            self.failures,
            self.consecutive_failures,
            self.escalations,
            self.success_rate
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinkMonitor {
    connected: bool,
    connects: u64,
    failures: u64,
    consecutive_failures: u32,
    escalations: u64,
    escalated: bool,
    policy: RetryPolicy,
}

impl LinkMonitor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Set after attempts ran out, cleared by the next successful connect.
    pub fn escalated(&self) -> bool {
        self.escalated
    }

    pub fn on_connected(&mut self) {
        if !self.connected {
            info!(
                "link up after {} failed attempt(s)",
                self.consecutive_failures
            );
        }
        self.connected = true;
        self.connects += 1;
        self.consecutive_failures = 0;
        self.escalated = false;
        self.policy.reset();
    }

    /// A clean disconnect; no retry bookkeeping.
    pub fn on_disconnected(&mut self) {
        if self.connected {
            warn!("link down");
        }
        self.connected = false;
    }

    pub fn on_failure(&mut self) -> RetryDecision {
        self.on_disconnected();
        self.failures += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let decision = self.policy.next();
        if decision == RetryDecision::Escalate {
            self.escalated = true;
            self.escalations += 1;
        }
        decision
    }

    pub fn report(&self) -> LinkReport {
        let attempts = self.connects + self.failures;
        let success_rate = if attempts == 0 {
            0
        } else {
            (self.connects * 100 / attempts) as u8
        };
        LinkReport {
            connected: self.connected,
            connects: self.connects,
            failures: self.failures,
            consecutive_failures: self.consecutive_failures,
            escalations: self.escalations,
            success_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn backoff_walks_the_schedule_then_escalates() {
        let mut policy = RetryPolicy::new(&[1, 2, 5], 4);
        let delays: Vec<RetryDecision> = (0..5).map(|_| policy.next()).collect();
        assert_eq!(
            delays,
            vec![
                RetryDecision::RetryAfter(Duration::from_secs(1)),
                RetryDecision::RetryAfter(Duration::from_secs(2)),
                RetryDecision::RetryAfter(Duration::from_secs(5)),
                RetryDecision::RetryAfter(Duration::from_secs(5)),
                RetryDecision::Escalate,
            ]
        );
        assert_eq!(
            policy.next(),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
    }

    #[test]
    fn connect_resets_the_failure_streak() {
        let mut monitor = LinkMonitor::new(RetryPolicy::new(&[1], 2));
        monitor.on_failure();
        monitor.on_failure();
        assert_eq!(monitor.on_failure(), RetryDecision::Escalate);
        assert!(monitor.escalated());

        monitor.on_connected();
        assert!(!monitor.escalated());
        assert!(monitor.is_connected());

        let report = monitor.report();
        assert_eq!(report.consecutive_failures, 0);
        assert_eq!(report.failures, 3);
        assert_eq!(report.escalations, 1);
        assert_eq!(report.success_rate, 25);
    }

    #[test]
    fn fresh_monitor_reports_down() {
        let report = LinkMonitor::default().report();
        assert!(!report.connected);
        assert_eq!(report.success_rate, 0);
        assert_eq!(report.to_string(), "down connects=0 failures=0 streak=0 escalations=0 success=0%");
    }
}
