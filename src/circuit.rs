//! Per-channel circuit breaker (spec §4.1 "Circuit breaker").
//!
//! States: `Closed -> Open -> HalfOpen -> Closed`. Opens after `threshold`
//! consecutive terminal non-`Stale` failures within `window`; `Open` rejects
//! sends for `cooldown`; `HalfOpen` permits exactly one probe send.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    window_start: Instant,
    opened_at: Option<Instant>,
    /// Set while a single `HalfOpen` probe is outstanding, so concurrent
    /// callers don't all believe they hold the probe slot.
    probe_in_flight: bool,
}

impl Breaker {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            window_start: now,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Sharded per-channel breaker registry (spec §5 "one per channel-id bucket
/// is acceptable; global is not" — realized here with `DashMap`'s internal
/// sharding rather than a single mutex).
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Breaker>,
    threshold: u32,
    window: Duration,
    cooldown: Duration,
}

/// What the caller should do for a channel, as decided by [`CircuitBreakerRegistry::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed with a normal send.
    Allowed,
    /// Proceed, but this is the single permitted `HalfOpen` probe.
    Probe,
    /// Reject immediately with `CircuitOpen`.
    Rejected,
}

impl CircuitBreakerRegistry {
    pub fn new(threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            threshold,
            window,
            cooldown,
        }
    }

    pub fn admit(&self, channel_id: &str) -> Admission {
        self.admit_at(channel_id, Instant::now())
    }

    fn admit_at(&self, channel_id: &str, now: Instant) -> Admission {
        let mut entry = self
            .breakers
            .entry(channel_id.to_string())
            .or_insert_with(|| Breaker::new(now));

        match entry.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let opened_at = entry.opened_at.unwrap_or(now);
                if now.duration_since(opened_at) >= self.cooldown {
                    entry.state = CircuitState::HalfOpen;
                    entry.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if entry.probe_in_flight {
                    Admission::Rejected
                } else {
                    entry.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Record a terminal send outcome. `is_stale` sends never count toward
    /// opening the breaker (spec §4.1/§7: `Stale` is not a breaker failure).
    pub fn record(&self, channel_id: &str, success: bool, is_stale: bool) {
        self.record_at(channel_id, success, is_stale, Instant::now())
    }

    fn record_at(&self, channel_id: &str, success: bool, is_stale: bool, now: Instant) {
        let mut entry = self
            .breakers
            .entry(channel_id.to_string())
            .or_insert_with(|| Breaker::new(now));

        match entry.state {
            CircuitState::HalfOpen => {
                entry.probe_in_flight = false;
                if success {
                    entry.state = CircuitState::Closed;
                    entry.consecutive_failures = 0;
                    entry.window_start = now;
                    entry.opened_at = None;
                } else if !is_stale {
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(now);
                }
            }
            CircuitState::Closed => {
                if success {
                    entry.consecutive_failures = 0;
                    entry.window_start = now;
                    return;
                }
                if is_stale {
                    return;
                }

                if now.duration_since(entry.window_start) > self.window {
                    entry.consecutive_failures = 0;
                    entry.window_start = now;
                }

                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.threshold {
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(now);
                }
            }
            CircuitState::Open => {
                // A send slipped through while already open (e.g. an
                // in-flight send that started before the breaker opened);
                // ignore its outcome, the state transition already happened.
            }
        }
    }

    pub fn state(&self, channel_id: &str) -> CircuitState {
        self.breakers
            .get(channel_id)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn remove(&self, channel_id: &str) {
        self.breakers.remove(channel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let reg = CircuitBreakerRegistry::new(5, Duration::from_secs(30), Duration::from_secs(15));
        let now = Instant::now();
        for _ in 0..4 {
            assert_eq!(reg.admit_at("c1", now), Admission::Allowed);
            reg.record_at("c1", false, false, now);
        }
        assert_eq!(reg.state("c1"), CircuitState::Closed);

        assert_eq!(reg.admit_at("c1", now), Admission::Allowed);
        reg.record_at("c1", false, false, now);
        assert_eq!(reg.state("c1"), CircuitState::Open);

        assert_eq!(reg.admit_at("c1", now), Admission::Rejected);
    }

    #[test]
    fn stale_failures_never_open_the_breaker() {
        let reg = CircuitBreakerRegistry::new(5, Duration::from_secs(30), Duration::from_secs(15));
        let now = Instant::now();
        for _ in 0..20 {
            reg.record_at("c1", false, true, now);
        }
        assert_eq!(reg.state("c1"), CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_success_closes_and_failure_reopens() {
        let reg = CircuitBreakerRegistry::new(1, Duration::from_secs(30), Duration::from_secs(15));
        let now = Instant::now();
        reg.record_at("c1", false, false, now);
        assert_eq!(reg.state("c1"), CircuitState::Open);

        let after_cooldown = now + Duration::from_secs(16);
        assert_eq!(reg.admit_at("c1", after_cooldown), Admission::Probe);
        reg.record_at("c1", true, false, after_cooldown);
        assert_eq!(reg.state("c1"), CircuitState::Closed);

        reg.record_at("c1", false, false, after_cooldown);
        assert_eq!(reg.state("c1"), CircuitState::Open);
    }
}
