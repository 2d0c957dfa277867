//! Minimum spacing between bus operations.
//!
//! Simulators behind a session cannot keep up with back-to-back bus traffic.
//! In simulation mode every send, receive and serial poll is timestamped,
//! and the next operation is delayed until the interval required after the
//! most recent of those events has passed. Against real hardware the
//! coordinator is inert.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::LinkMode;

/// Bus operations the coordinator spaces out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusOp {
    Send,
    Receive,
    SerialPoll,
}

/// Required gap, in milliseconds, between the most recent bus event and the
/// next operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayTable {
    pub send_after_send_ms: u64,
    pub send_after_receive_ms: u64,
    pub send_after_srq_ms: u64,
    pub receive_after_send_ms: u64,
    pub receive_after_receive_ms: u64,
    pub receive_after_srq_ms: u64,
    pub poll_after_send_ms: u64,
    pub poll_after_receive_ms: u64,
    pub poll_after_srq_ms: u64,
}

impl Default for DelayTable {
    fn default() -> Self {
        Self {
            send_after_send_ms: 100,
            send_after_receive_ms: 20,
            send_after_srq_ms: 20,
            receive_after_send_ms: 20,
            receive_after_receive_ms: 20,
            receive_after_srq_ms: 20,
            poll_after_send_ms: 2,
            poll_after_receive_ms: 2,
            poll_after_srq_ms: 20,
        }
    }
}

impl DelayTable {
    pub fn interval(&self, next: BusOp, previous: BusOp) -> Duration {
        let ms = match (next, previous) {
            (BusOp::Send, BusOp::Send) => self.send_after_send_ms,
            (BusOp::Send, BusOp::Receive) => self.send_after_receive_ms,
            (BusOp::Send, BusOp::SerialPoll) => self.send_after_srq_ms,
            (BusOp::Receive, BusOp::Send) => self.receive_after_send_ms,
            (BusOp::Receive, BusOp::Receive) => self.receive_after_receive_ms,
            (BusOp::Receive, BusOp::SerialPoll) => self.receive_after_srq_ms,
            (BusOp::SerialPoll, BusOp::Send) => self.poll_after_send_ms,
            (BusOp::SerialPoll, BusOp::Receive) => self.poll_after_receive_ms,
            (BusOp::SerialPoll, BusOp::SerialPoll) => self.poll_after_srq_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Tracks the last bus events of one session.
#[derive(Debug, Clone)]
pub struct DelayCoordinator {
    enabled: bool,
    table: DelayTable,
    last_sent: Option<Instant>,
    last_received: Option<Instant>,
    last_srq: Option<Instant>,
}

impl DelayCoordinator {
    pub fn new(table: DelayTable, enabled: bool) -> Self {
        Self {
            enabled,
            table,
            last_sent: None,
            last_received: None,
            last_srq: None,
        }
    }

    /// Coordinator that never delays.
    pub fn disabled() -> Self {
        Self::new(DelayTable::default(), false)
    }

    /// Enabled exactly when the session runs against a simulator.
    pub fn for_mode(mode: LinkMode, table: DelayTable) -> Self {
        Self::new(table, matches!(mode, LinkMode::Simulation))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Time still to wait at `now` before `next` may start.
    pub fn required_wait(&self, next: BusOp, now: Instant) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }

        let latest = [
            (BusOp::Send, self.last_sent),
            (BusOp::Receive, self.last_received),
            (BusOp::SerialPoll, self.last_srq),
        ]
        .into_iter()
        .filter_map(|(op, at)| at.map(|at| (op, at)))
        .max_by_key(|(_, at)| *at);

        match latest {
            Some((previous, at)) => self
                .table
                .interval(next, previous)
                .saturating_sub(now.saturating_duration_since(at)),
            None => Duration::ZERO,
        }
    }

    /// Sleep until `next` is allowed to start.
    pub fn pause_before(&self, next: BusOp) {
        let wait = self.required_wait(next, Instant::now());
        if !wait.is_zero() {
            trace!(?next, ?wait, "delaying bus operation for simulator");
            thread::sleep(wait);
        }
    }

    /// Record that `op` just completed.
    pub fn record(&mut self, op: BusOp) {
        self.record_at(op, Instant::now());
    }

    pub fn record_at(&mut self, op: BusOp, at: Instant) {
        if !self.enabled {
            return;
        }
        let slot = match op {
            BusOp::Send => &mut self.last_sent,
            BusOp::Receive => &mut self.last_received,
            BusOp::SerialPoll => &mut self.last_srq,
        };
        *slot = Some(at);
    }

    /// Forget all recorded events.
    pub fn reset(&mut self) {
        self.last_sent = None;
        self.last_received = None;
        self.last_srq = None;
    }
}

impl Default for DelayCoordinator {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_coordinator_never_waits() {
        let mut timing = DelayCoordinator::disabled();
        let now = Instant::now();
        timing.record_at(BusOp::Send, now);
        assert_eq!(timing.required_wait(BusOp::Send, now), Duration::ZERO);
    }

    #[test]
    fn online_mode_is_inert() {
        let timing = DelayCoordinator::for_mode(LinkMode::Online, DelayTable::default());
        assert!(!timing.is_enabled());
        let timing = DelayCoordinator::for_mode(LinkMode::Simulation, DelayTable::default());
        assert!(timing.is_enabled());
    }

    #[test]
    fn no_history_means_no_wait() {
        let timing = DelayCoordinator::new(DelayTable::default(), true);
        assert_eq!(
            timing.required_wait(BusOp::Send, Instant::now()),
            Duration::ZERO
        );
    }

    #[test]
    fn waits_for_remainder_of_interval() {
        let mut timing = DelayCoordinator::new(DelayTable::default(), true);
        let sent = Instant::now();
        timing.record_at(BusOp::Send, sent);

        let later = sent + Duration::from_millis(30);
        assert_eq!(
            timing.required_wait(BusOp::Send, later),
            Duration::from_millis(70)
        );
        assert_eq!(
            timing.required_wait(BusOp::Receive, later),
            Duration::ZERO
        );
        assert_eq!(
            timing.required_wait(BusOp::Receive, sent + Duration::from_millis(5)),
            Duration::from_millis(15)
        );
    }

    #[test]
    fn most_recent_event_selects_interval() {
        let mut timing = DelayCoordinator::new(DelayTable::default(), true);
        let base = Instant::now();
        timing.record_at(BusOp::Send, base);
        timing.record_at(BusOp::SerialPoll, base + Duration::from_millis(10));

        // The srq is newer than the send, so the poll-after-srq gap applies.
        let at = base + Duration::from_millis(12);
        assert_eq!(
            timing.required_wait(BusOp::SerialPoll, at),
            Duration::from_millis(18)
        );
        assert_eq!(
            timing.required_wait(BusOp::Send, at),
            Duration::from_millis(18)
        );
    }

    #[test]
    fn pause_before_sleeps_in_simulation() {
        let table = DelayTable {
            send_after_send_ms: 40,
            ..DelayTable::default()
        };
        let mut timing = DelayCoordinator::new(table, true);
        timing.record(BusOp::Send);

        let started = Instant::now();
        timing.pause_before(BusOp::Send);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn reset_clears_history() {
        let mut timing = DelayCoordinator::new(DelayTable::default(), true);
        let now = Instant::now();
        timing.record_at(BusOp::Send, now);
        timing.reset();
        assert_eq!(timing.required_wait(BusOp::Send, now), Duration::ZERO);
    }
}
