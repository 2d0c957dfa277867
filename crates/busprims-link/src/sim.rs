//! In-memory GPIB bus.
//!
//! [`SimulatedGpib`] is a [`GpibConnector`] whose instruments are scripted
//! from the test (or diagnostic) side through [`SimInstrument`] handles:
//! queue replies, raise service requests, and inspect what the session did
//! to the bus.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::{LinkError, Result};
use crate::gpib::{GpibBus, GpibConnector, SrqLine};

#[derive(Debug)]
struct SimState {
    present: bool,
    closed: bool,
    replies: VecDeque<Bytes>,
    status: VecDeque<u8>,
    written: Vec<Bytes>,
    atn: Vec<bool>,
    clears: usize,
    polls: usize,
    failing_polls: usize,
    timeout: Option<Duration>,
    term_char: Option<u8>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            present: true,
            closed: false,
            replies: VecDeque::new(),
            status: VecDeque::new(),
            written: Vec::new(),
            atn: Vec::new(),
            clears: 0,
            polls: 0,
            failing_polls: 0,
            timeout: None,
            term_char: None,
        }
    }
}

#[derive(Debug, Default)]
struct SimShared {
    state: Mutex<SimState>,
    changed: Condvar,
}

impl SimShared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until `ready` holds or `timeout` elapses.
    fn wait_until(
        &self,
        timeout: Duration,
        ready: impl Fn(&SimState) -> bool,
    ) -> (MutexGuard<'_, SimState>, bool) {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            if ready(&state) {
                return (state, true);
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::from_secs(u64::from(u32::MAX)),
            };
            if remaining.is_zero() {
                return (state, false);
            }
            state = self
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Scripting handle for one simulated instrument.
#[derive(Clone, Default)]
pub struct SimInstrument {
    shared: Arc<SimShared>,
}

impl SimInstrument {
    /// Queue a message for the next bus read.
    pub fn queue_reply(&self, reply: impl Into<Bytes>) {
        self.shared.lock().replies.push_back(reply.into());
        self.shared.changed.notify_all();
    }

    /// Assert SRQ. The next serial poll returns `status` and releases the
    /// line once no further status bytes are pending.
    pub fn raise_srq(&self, status: u8) {
        self.shared.lock().status.push_back(status);
        self.shared.changed.notify_all();
    }

    /// Make the next `count` serial polls fail.
    pub fn fail_next_polls(&self, count: usize) {
        self.shared.lock().failing_polls = count;
    }

    /// Simulate a missing instrument: connects fail while not present.
    pub fn set_present(&self, present: bool) {
        self.shared.lock().present = present;
    }

    pub fn written(&self) -> Vec<Bytes> {
        self.shared.lock().written.clone()
    }

    /// Every ATN transition, oldest first (`true` = asserted).
    pub fn atn_history(&self) -> Vec<bool> {
        self.shared.lock().atn.clone()
    }

    pub fn clear_count(&self) -> usize {
        self.shared.lock().clears
    }

    pub fn poll_count(&self) -> usize {
        self.shared.lock().polls
    }

    pub fn last_timeout(&self) -> Option<Duration> {
        self.shared.lock().timeout
    }

    pub fn term_char(&self) -> Option<u8> {
        self.shared.lock().term_char
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn srq_pending(&self) -> bool {
        !self.shared.lock().status.is_empty()
    }
}

impl fmt::Debug for SimInstrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("SimInstrument")
            .field("replies", &state.replies.len())
            .field("status", &state.status)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Connector for scripted instruments, keyed by `(card, address)`.
#[derive(Clone, Default)]
pub struct SimulatedGpib {
    instruments: Arc<Mutex<HashMap<(String, u8), SimInstrument>>>,
}

impl SimulatedGpib {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for the instrument at `(card, address)`, created on first use.
    pub fn instrument(&self, card: &str, address: u8) -> SimInstrument {
        self.instruments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((card.to_string(), address))
            .or_default()
            .clone()
    }
}

impl fmt::Debug for SimulatedGpib {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .instruments
            .lock()
            .map(|instruments| instruments.len())
            .unwrap_or_default();
        f.debug_struct("SimulatedGpib")
            .field("instruments", &count)
            .finish()
    }
}

impl GpibConnector for SimulatedGpib {
    fn connect(&self, card: &str, address: u8) -> Result<Box<dyn GpibBus>> {
        let instrument = self.instrument(card, address);
        {
            let mut state = instrument.shared.lock();
            if !state.present {
                return Err(LinkError::Bus(format!(
                    "no listener at {card}/{address}"
                )));
            }
            state.closed = false;
        }
        Ok(Box::new(SimBus {
            shared: instrument.shared,
            timeout: Duration::from_secs(5),
        }))
    }
}

struct SimBus {
    shared: Arc<SimShared>,
    timeout: Duration,
}

impl SimBus {
    fn check_open(state: &SimState) -> Result<()> {
        if state.closed {
            return Err(LinkError::Bus("bus released".to_string()));
        }
        Ok(())
    }
}

impl GpibBus for SimBus {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        self.shared.lock().timeout = Some(timeout);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        Self::check_open(&state)?;
        state.clears += 1;
        Ok(())
    }

    fn set_atn(&mut self, asserted: bool) -> Result<()> {
        let mut state = self.shared.lock();
        Self::check_open(&state)?;
        state.atn.push(asserted);
        Ok(())
    }

    fn set_term_char(&mut self, term: Option<u8>) -> Result<()> {
        self.shared.lock().term_char = term;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.shared.lock();
        Self::check_open(&state)?;
        state.written.push(Bytes::copy_from_slice(data));
        Ok(data.len())
    }

    fn read(&mut self, max_len: usize) -> Result<Bytes> {
        let timeout = self.timeout;
        let (mut state, ready) = self
            .shared
            .wait_until(timeout, |state| state.closed || !state.replies.is_empty());
        Self::check_open(&state)?;
        if !ready {
            return Err(LinkError::Timeout(timeout));
        }
        match state.replies.pop_front() {
            Some(mut reply) => {
                if reply.len() > max_len {
                    let rest = reply.split_off(max_len);
                    state.replies.push_front(rest);
                }
                Ok(reply)
            }
            None => Err(LinkError::Timeout(timeout)),
        }
    }

    fn read_status_byte(&mut self) -> Result<u8> {
        let mut state = self.shared.lock();
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(LinkError::Bus("serial poll failed".to_string()));
        }
        Self::check_open(&state)?;
        state.polls += 1;
        Ok(state.status.pop_front().unwrap_or(0))
    }

    fn srq_line(&self) -> Arc<dyn SrqLine> {
        Arc::new(SimSrqLine {
            shared: self.shared.clone(),
        })
    }

    fn close(&mut self) -> Result<()> {
        self.shared.lock().closed = true;
        self.shared.changed.notify_all();
        Ok(())
    }
}

struct SimSrqLine {
    shared: Arc<SimShared>,
}

impl SrqLine for SimSrqLine {
    fn wait_asserted(&self, timeout: Duration) -> bool {
        let (_state, asserted) = self
            .shared
            .wait_until(timeout, |state| !state.closed && !state.status.is_empty());
        asserted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instrument_handles_share_state() {
        let sim = SimulatedGpib::new();
        let a = sim.instrument("hpib", 1);
        let b = sim.instrument("hpib", 1);
        a.raise_srq(0x41);
        assert!(b.srq_pending());
        assert!(!sim.instrument("hpib", 2).srq_pending());
    }

    #[test]
    fn read_splits_long_replies() {
        let sim = SimulatedGpib::new();
        let instrument = sim.instrument("c", 3);
        let mut bus = sim.connect("c", 3).unwrap();

        instrument.queue_reply(&b"ABCDEF"[..]);
        assert_eq!(bus.read(4).unwrap().as_ref(), b"ABCD");
        assert_eq!(bus.read(4).unwrap().as_ref(), b"EF");
    }

    #[test]
    fn srq_line_tracks_pending_status() {
        let sim = SimulatedGpib::new();
        let instrument = sim.instrument("c", 3);
        let mut bus = sim.connect("c", 3).unwrap();
        let line = bus.srq_line();

        assert!(!line.wait_asserted(Duration::from_millis(5)));
        instrument.raise_srq(0x42);
        assert!(line.wait_asserted(Duration::ZERO));
        assert_eq!(bus.read_status_byte().unwrap(), 0x42);
        assert!(!line.wait_asserted(Duration::ZERO));
        assert_eq!(bus.read_status_byte().unwrap(), 0x00);
    }

    #[test]
    fn closed_bus_rejects_io() {
        let sim = SimulatedGpib::new();
        let mut bus = sim.connect("c", 3).unwrap();
        bus.close().unwrap();
        assert!(bus.write(b"x").is_err());
        assert!(bus.read(8).is_err());
    }
}
