//! Connection state and reconnect backoff.
//!
//! The supervisor owns every [`ConnectionState`] transition. Backoff is
//! explicit state (attempt counter and next deadline) advanced one step per
//! failed attempt; the engine decides when to act on it.

use std::fmt;
use std::time::{Duration, Instant};

use log::debug;

use crate::config::BackoffConfig;

/// Link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No link.
    #[default]
    Disconnected,
    /// Opening the link and negotiating.
    Connecting,
    /// Ready for requests.
    Connected,
    /// Link lost, reopening with backoff.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting => f.write_str("reconnecting"),
        }
    }
}

/// A state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// State before.
    pub old: ConnectionState,
    /// State after.
    pub new: ConnectionState,
}

/// Exponential backoff with a bounded delay and unbounded attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    next_attempt: Option<Instant>,
}

impl Backoff {
    /// Backoff with no attempt scheduled.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            next_attempt: None,
        }
    }

    /// Delay before attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .config
            .multiplier
            .powi(attempt.min(i32::MAX as u32) as i32);
        let delay = self.config.initial.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.config.max.as_secs_f64() {
            self.config.max
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// Schedule the next attempt relative to `now` and advance the counter.
    pub fn schedule(&mut self, now: Instant) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.next_attempt = Some(now + delay);
        delay
    }

    /// Forget all attempts.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_attempt = None;
    }

    /// Attempts scheduled so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// When the next attempt is due.
    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    /// Whether an attempt is scheduled at or before `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_attempt
            .is_some_and(|at| now >= at)
    }
}

/// Owner of the connection state machine.
#[derive(Debug)]
pub struct Supervisor {
    state: ConnectionState,
    backoff: Backoff,
}

impl Supervisor {
    /// Disconnected supervisor.
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(backoff),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Backoff state.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Whether a reconnect attempt is due.
    pub fn attempt_due(&self, now: Instant) -> bool {
        self.state == ConnectionState::Reconnecting && self.backoff.is_due(now)
    }

    pub(crate) fn connecting(&mut self) -> Option<StateChange> {
        self.transition(ConnectionState::Connecting)
    }

    pub(crate) fn connected(&mut self) -> Option<StateChange> {
        self.backoff.reset();
        self.transition(ConnectionState::Connected)
    }

    pub(crate) fn link_lost(&mut self, now: Instant) -> Option<StateChange> {
        self.backoff.reset();
        let delay = self.backoff.schedule(now);
        debug!("First reconnect attempt in {delay:?}");
        self.transition(ConnectionState::Reconnecting)
    }

    pub(crate) fn attempt_failed(&mut self, now: Instant) -> Duration {
        let delay = self.backoff.schedule(now);
        debug!(
            "Reconnect attempt {} failed, next in {delay:?}",
            self.backoff.attempt() - 1
        );
        delay
    }

    pub(crate) fn disconnected(&mut self) -> Option<StateChange> {
        self.backoff.reset();
        self.transition(ConnectionState::Disconnected)
    }

    fn transition(&mut self, new: ConnectionState) -> Option<StateChange> {
        let old = std::mem::replace(&mut self.state, new);
        (old != new).then(|| {
            debug!("Connection state {old} -> {new}");
            StateChange { old, new }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff::new(config());
        let delays: Vec<u128> = (0..6)
            .map(|n| backoff.delay_for(n).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_schedule_advances_in_steps() {
        let mut backoff = Backoff::new(config());
        let now = Instant::now();
        assert!(!backoff.is_due(now));

        assert_eq!(backoff.schedule(now), Duration::from_millis(100));
        assert_eq!(backoff.attempt(), 1);
        assert!(!backoff.is_due(now));
        assert!(backoff.is_due(now + Duration::from_millis(100)));

        assert_eq!(backoff.schedule(now), Duration::from_millis(200));
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_attempt(), None);
    }

    #[test]
    fn test_state_transitions_report_changes() {
        let mut supervisor = Supervisor::new(config());
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);

        let change = supervisor.connecting().unwrap();
        assert_eq!(change.old, ConnectionState::Disconnected);
        assert!(supervisor.connected().is_some());
        assert!(supervisor.connected().is_none());

        let now = Instant::now();
        assert!(supervisor.link_lost(now).is_some());
        assert!(!supervisor.attempt_due(now));
        assert!(supervisor.attempt_due(now + Duration::from_millis(100)));

        supervisor.attempt_failed(now);
        assert!(!supervisor.attempt_due(now + Duration::from_millis(100)));
        assert!(supervisor.attempt_due(now + Duration::from_millis(200)));

        assert!(supervisor.disconnected().is_some());
        assert!(!supervisor.attempt_due(now + Duration::from_secs(10)));
    }
}
