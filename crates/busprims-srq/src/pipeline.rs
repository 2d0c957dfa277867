use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::callback::{CallbackTable, SrqCallback};
use crate::status::is_srq_asserted;

/// Outcome of a timed wait on the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrqWait {
    /// A status byte was taken from the queue.
    Ready(u8),
    /// The timeout elapsed with nothing suitable queued.
    TimedOut,
}

impl SrqWait {
    /// The status byte, if one was taken.
    pub fn status(self) -> Option<u8> {
        match self {
            SrqWait::Ready(status) => Some(status),
            SrqWait::TimedOut => None,
        }
    }

    pub fn is_timed_out(self) -> bool {
        matches!(self, SrqWait::TimedOut)
    }
}

/// What happened to a delivered status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Appended to the queue.
    Queued,
    /// Handled by a callback registered without `keep_in_fifo`.
    Consumed,
    /// Dropped because the SRQ bit was not set.
    Ignored,
}

#[derive(Debug, Default)]
struct State {
    fifo: VecDeque<u8>,
    callbacks: CallbackTable,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    arrived: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, status: u8) -> Delivery {
        let matched = {
            let state = self.lock();
            state
                .callbacks
                .lookup(status)
                .map(|entry| (entry.callback.clone(), entry.keep_in_fifo))
        };

        // Callbacks run without the queue lock so they may use the pipeline.
        let keep = match matched {
            Some((callback, keep_in_fifo)) => {
                trace!(stb = format_args!("0x{status:02x}"), "srq callback fired");
                callback(status);
                keep_in_fifo
            }
            None => true,
        };

        if !keep {
            debug!(
                stb = format_args!("0x{status:02x}"),
                "status byte consumed by callback"
            );
            return Delivery::Consumed;
        }

        if !is_srq_asserted(status) {
            debug!(
                stb = format_args!("0x{status:02x}"),
                "empty status byte (ignored)"
            );
            return Delivery::Ignored;
        }

        let depth = {
            let mut state = self.lock();
            state.fifo.push_back(status);
            state.fifo.len()
        };
        self.arrived.notify_all();
        debug!(stb = format_args!("0x{status:02x}"), depth, "srq queued");
        Delivery::Queued
    }
}

/// FIFO of pending SRQ status bytes plus the callback table.
///
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone, Default)]
pub struct SrqPipeline {
    shared: Arc<Shared>,
}

/// Delivery-only handle for the context that performs serial polls.
#[derive(Debug, Clone)]
pub struct SrqProducer {
    shared: Arc<Shared>,
}

impl SrqProducer {
    /// Route a freshly polled status byte through the callback table and
    /// into the queue.
    pub fn deliver(&self, status: u8) -> Delivery {
        self.shared.deliver(status)
    }
}

impl SrqPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a producer handle bound to this pipeline.
    pub fn producer(&self) -> SrqProducer {
        SrqProducer {
            shared: self.shared.clone(),
        }
    }

    /// Deliver a status byte as if it came from a serial poll.
    pub fn deliver(&self, status: u8) -> Delivery {
        self.shared.deliver(status)
    }

    /// Take the oldest queued status byte.
    ///
    /// With an empty queue and a zero timeout this returns
    /// [`SrqWait::TimedOut`] immediately. Otherwise it waits up to `timeout`
    /// for the producer.
    pub fn get_event(&self, timeout: Duration) -> SrqWait {
        self.take_first(timeout, |_| true)
    }

    /// Take the first queued status byte contained in `expected`.
    ///
    /// The queue is scanned in arrival order and only the matching byte is
    /// removed. Non-matching bytes stay queued in their original order. An
    /// empty `expected` set accepts any byte.
    pub fn get_expected_event(&self, expected: &[u8], timeout: Duration) -> SrqWait {
        if expected.is_empty() {
            return self.get_event(timeout);
        }
        self.take_first(timeout, |status| expected.contains(&status))
    }

    /// Report the first queued byte contained in `candidates` without
    /// removing it.
    pub fn check_for_srqs(&self, candidates: &[u8]) -> Option<u8> {
        let state = self.shared.lock();
        let found = state
            .fifo
            .iter()
            .copied()
            .find(|status| candidates.contains(status));
        if let Some(status) = found {
            debug!(stb = format_args!("0x{status:02x}"), "matched srq in fifo");
        }
        found
    }

    /// Register a callback for `status`.
    ///
    /// The newest registration is consulted first. With `keep_in_fifo` the
    /// byte is queued after the callback fires, otherwise the callback
    /// consumes it.
    pub fn register_callback<F>(&self, status: u8, callback: F, keep_in_fifo: bool)
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let callback: SrqCallback = Arc::new(callback);
        self.shared
            .lock()
            .callbacks
            .register(status, callback, keep_in_fifo);
        debug!(
            stb = format_args!("0x{status:02x}"),
            keep_in_fifo, "srq callback registered"
        );
    }

    /// Drop every registered callback.
    pub fn clear_callbacks(&self) {
        self.shared.lock().callbacks.clear();
    }

    /// Number of registered callbacks.
    pub fn callback_count(&self) -> usize {
        self.shared.lock().callbacks.len()
    }

    /// Number of queued status bytes.
    pub fn pending(&self) -> usize {
        self.shared.lock().fifo.len()
    }

    /// Copy of the queue, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        self.shared.lock().fifo.iter().copied().collect()
    }

    /// Discard every queued status byte.
    pub fn clear(&self) {
        let mut state = self.shared.lock();
        if !state.fifo.is_empty() {
            debug!(discarded = state.fifo.len(), "srq fifo cleared");
        }
        state.fifo.clear();
    }

    fn take_first(&self, timeout: Duration, accept: impl Fn(u8) -> bool) -> SrqWait {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.lock();

        loop {
            if let Some(index) = state.fifo.iter().position(|&status| accept(status)) {
                if let Some(status) = state.fifo.remove(index) {
                    trace!(
                        stb = format_args!("0x{status:02x}"),
                        remaining = state.fifo.len(),
                        "srq taken"
                    );
                    return SrqWait::Ready(status);
                }
            }

            state = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return SrqWait::TimedOut;
                    }
                    self.shared
                        .arrived
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .shared
                    .arrived
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn events_come_out_in_arrival_order() {
        let pipeline = SrqPipeline::new();
        for status in [0x41, 0x42, 0x43] {
            assert_eq!(pipeline.deliver(status), Delivery::Queued);
        }

        assert_eq!(pipeline.get_event(Duration::ZERO), SrqWait::Ready(0x41));
        assert_eq!(pipeline.get_event(Duration::ZERO), SrqWait::Ready(0x42));
        assert_eq!(pipeline.get_event(Duration::ZERO), SrqWait::Ready(0x43));
        assert_eq!(pipeline.get_event(Duration::ZERO), SrqWait::TimedOut);
    }

    #[test]
    fn expected_event_is_extracted_selectively() {
        let pipeline = SrqPipeline::new();
        for status in [0x41, 0x50, 0x42] {
            pipeline.deliver(status);
        }

        let got = pipeline.get_expected_event(&[0x50], Duration::ZERO);
        assert_eq!(got, SrqWait::Ready(0x50));
        assert_eq!(pipeline.snapshot(), vec![0x41, 0x42]);
    }

    #[test]
    fn expected_event_scans_in_fifo_order() {
        let pipeline = SrqPipeline::new();
        for status in [0x41, 0x52, 0x51] {
            pipeline.deliver(status);
        }

        let got = pipeline.get_expected_event(&[0x51, 0x52], Duration::ZERO);
        assert_eq!(got, SrqWait::Ready(0x52));
        assert_eq!(pipeline.snapshot(), vec![0x41, 0x51]);
    }

    #[test]
    fn empty_expected_set_accepts_first_byte() {
        let pipeline = SrqPipeline::new();
        pipeline.deliver(0x44);
        pipeline.deliver(0x45);

        assert_eq!(
            pipeline.get_expected_event(&[], Duration::ZERO),
            SrqWait::Ready(0x44)
        );
    }

    #[test]
    fn expected_event_times_out_without_touching_queue() {
        let pipeline = SrqPipeline::new();
        pipeline.deliver(0x41);

        let started = Instant::now();
        let got = pipeline.get_expected_event(&[0x50], Duration::from_millis(50));
        assert!(got.is_timed_out());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(pipeline.snapshot(), vec![0x41]);
    }

    #[test]
    fn zero_timeout_on_empty_queue_returns_immediately() {
        let pipeline = SrqPipeline::new();
        let started = Instant::now();
        assert_eq!(pipeline.get_event(Duration::ZERO), SrqWait::TimedOut);
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(pipeline.pending(), 0);
    }

    #[test]
    fn bytes_without_srq_bit_are_dropped() {
        let pipeline = SrqPipeline::new();
        assert_eq!(pipeline.deliver(0x01), Delivery::Ignored);
        assert_eq!(pipeline.deliver(0x00), Delivery::Ignored);
        assert_eq!(pipeline.pending(), 0);
    }

    #[test]
    fn callback_without_keep_consumes_byte() {
        let pipeline = SrqPipeline::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        pipeline.register_callback(
            0x48,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        assert_eq!(pipeline.deliver(0x48), Delivery::Consumed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.pending(), 0);
    }

    #[test]
    fn callback_with_keep_also_queues() {
        let pipeline = SrqPipeline::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        pipeline.register_callback(
            0x48,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );

        assert_eq!(pipeline.deliver(0x48), Delivery::Queued);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.snapshot(), vec![0x48]);
    }

    #[test]
    fn newest_callback_shadows_older_one() {
        let pipeline = SrqPipeline::new();
        let old_hits = Arc::new(AtomicUsize::new(0));
        let new_hits = Arc::new(AtomicUsize::new(0));

        let counter = old_hits.clone();
        pipeline.register_callback(
            0x48,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        let counter = new_hits.clone();
        pipeline.register_callback(
            0x48,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        assert_eq!(pipeline.deliver(0x48), Delivery::Consumed);
        assert_eq!(old_hits.load(Ordering::SeqCst), 0);
        assert_eq!(new_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn check_for_srqs_only_peeks() {
        let pipeline = SrqPipeline::new();
        pipeline.deliver(0x41);
        pipeline.deliver(0x50);

        assert_eq!(pipeline.check_for_srqs(&[0x50, 0x41]), Some(0x41));
        assert_eq!(pipeline.check_for_srqs(&[0x60]), None);
        assert_eq!(pipeline.pending(), 2);
    }

    #[test]
    fn waiter_wakes_on_delivery_from_other_thread() {
        let pipeline = SrqPipeline::new();
        let producer = pipeline.producer();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            producer.deliver(0x41)
        });

        let got = pipeline.get_event(Duration::from_secs(5));
        assert_eq!(got, SrqWait::Ready(0x41));
        assert_eq!(handle.join().unwrap(), Delivery::Queued);
    }

    #[test]
    fn expected_waiter_ignores_unrelated_deliveries() {
        let pipeline = SrqPipeline::new();
        let producer = pipeline.producer();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.deliver(0x41);
            thread::sleep(Duration::from_millis(20));
            producer.deliver(0x50);
        });

        let got = pipeline.get_expected_event(&[0x50], Duration::from_secs(5));
        assert_eq!(got, SrqWait::Ready(0x50));
        handle.join().unwrap();
        assert_eq!(pipeline.snapshot(), vec![0x41]);
    }

    #[test]
    fn clear_discards_queue_but_keeps_callbacks() {
        let pipeline = SrqPipeline::new();
        pipeline.register_callback(0x48, |_| {}, true);
        pipeline.deliver(0x41);
        pipeline.clear();

        assert_eq!(pipeline.pending(), 0);
        assert_eq!(pipeline.callback_count(), 1);

        pipeline.clear_callbacks();
        assert_eq!(pipeline.callback_count(), 0);
    }
}
