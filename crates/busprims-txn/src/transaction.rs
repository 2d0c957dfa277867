//! Step counters for re-entrant driver calls.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use tracing::{debug, error, trace};

use crate::error::{Result, TxnError};

/// Identity of a host operation ("device start", "bin device", ...).
pub trait CallId: Copy + Eq + fmt::Debug {}

impl<T: Copy + Eq + fmt::Debug> CallId for T {}

/// Handler for one SRQ value. Runs when a received SRQ is not otherwise
/// accepted by the step that received it.
pub type SrqHandler = Box<dyn FnMut(u8) -> Result<()> + Send>;

/// Answer of [`Transaction::check_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepGate {
    /// The step has not completed yet; perform it.
    Run,
    /// Completed during an earlier invocation of the same call.
    Skip,
    /// An abort is pending; do no I/O.
    Aborted,
}

/// Saved `(step, steps_done)` position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepMark {
    pub step: u32,
    pub steps_done: u32,
}

/// Result kept for a completed step so that a replay can return it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepRecord {
    Reply(Bytes),
    Srq(u8),
}

struct Frame<C> {
    last_call: Option<C>,
    current_call: Option<C>,
    step: u32,
    steps_done: u32,
    mark: Option<StepMark>,
    aborted: bool,
    handlers: Vec<(u8, SrqHandler)>,
    journal: BTreeMap<u32, StepRecord>,
}

impl<C> Frame<C> {
    fn empty() -> Self {
        Self {
            last_call: None,
            current_call: None,
            step: 0,
            steps_done: 0,
            mark: None,
            aborted: false,
            handlers: Vec::new(),
            journal: BTreeMap::new(),
        }
    }

    fn restart(&mut self) {
        self.step = 0;
        self.steps_done = 0;
        self.aborted = false;
        self.mark = None;
        self.journal.clear();
    }
}

/// Progress of one plugin call across repeated host invocations.
///
/// The host calls a plugin function again and again until it stops
/// reporting [`TxnError::Waiting`]. Every invocation walks the same list of
/// steps; [`check_step`](Self::check_step) answers `Skip` for the steps that
/// completed in an earlier invocation so only the first outstanding step
/// touches the link.
///
/// ```
/// use busprims_txn::{StepGate, Transaction};
///
/// let mut ta = Transaction::new();
/// ta.set_call("start");
/// ta.start().unwrap();
/// assert_eq!(ta.check_step(), StepGate::Run);
/// ta.mark_step_done();
///
/// // Next invocation of the same call.
/// ta.set_call("start");
/// ta.start().unwrap();
/// assert_eq!(ta.check_step(), StepGate::Skip);
/// assert_eq!(ta.check_step(), StepGate::Run);
/// ```
pub struct Transaction<C> {
    frame: Frame<C>,
    pushed: Vec<Frame<C>>,
    push_scheduled: bool,
}

impl<C: CallId> Default for Transaction<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: CallId> Transaction<C> {
    pub fn new() -> Self {
        Self {
            frame: Frame::empty(),
            pushed: Vec::new(),
            push_scheduled: false,
        }
    }

    /// Record the operation the host asked for and restart the walk over
    /// its steps. Completed steps are kept only if `call` repeats the
    /// previous call.
    pub fn set_call(&mut self, call: C) {
        let frame = &mut self.frame;
        frame.last_call = frame.current_call;
        frame.current_call = Some(call);
        if frame.last_call == frame.current_call {
            frame.step = 0;
            trace!(?call, "transaction reset for repeated call");
        } else {
            frame.restart();
            trace!(?call, "transaction reset for new call");
        }
    }

    /// Record a one-shot operation. It always starts from its first step.
    pub fn set_special_call(&mut self, call: C) {
        let frame = &mut self.frame;
        frame.last_call = Some(call);
        frame.current_call = Some(call);
        frame.restart();
        trace!(?call, "transaction reset for special call");
    }

    pub fn last_call(&self) -> Option<C> {
        self.frame.last_call
    }

    pub fn current_call(&self) -> Option<C> {
        self.frame.current_call
    }

    /// Begin an invocation. Performs a push scheduled with
    /// [`schedule_push`](Self::schedule_push).
    pub fn start(&mut self) -> Result<()> {
        if self.frame.current_call.is_none() {
            return Err(TxnError::Inconsistent("no call set".to_string()));
        }
        if let Some(mark) = self.frame.mark {
            if mark.steps_done > mark.step || mark.steps_done > self.frame.steps_done {
                return Err(TxnError::Inconsistent(format!(
                    "mark {}/{} outside steps done {}",
                    mark.step, mark.steps_done, self.frame.steps_done
                )));
            }
        }
        if self.push_scheduled {
            self.push_scheduled = false;
            self.push();
        }
        self.frame.step = 0;
        trace!(steps_done = self.frame.steps_done, "transaction started");
        Ok(())
    }

    pub fn stop(&mut self) {
        trace!(
            step = self.frame.step,
            steps_done = self.frame.steps_done,
            "transaction stopped"
        );
    }

    pub fn ask_abort(&self) -> bool {
        self.frame.aborted
    }

    /// Request an abort. Every later step check answers
    /// [`StepGate::Aborted`] until [`do_reset`](Self::do_reset) or a new call.
    pub fn do_abort(&mut self) {
        debug!("transaction abort requested");
        self.frame.aborted = true;
    }

    pub fn do_reset(&mut self) {
        trace!("transaction reset");
        let frame = &mut self.frame;
        frame.step = 0;
        frame.steps_done = 0;
        frame.aborted = false;
        frame.mark = None;
        frame.journal.clear();
    }

    pub fn step(&self) -> u32 {
        self.frame.step
    }

    pub fn steps_done(&self) -> u32 {
        self.frame.steps_done
    }

    /// Advance to the next step and tell the caller what to do with it.
    pub fn check_step(&mut self) -> StepGate {
        let frame = &mut self.frame;
        if frame.aborted {
            trace!(step = frame.step, "step skipped, transaction aborted");
            return StepGate::Aborted;
        }
        frame.step += 1;
        if frame.step > frame.steps_done {
            StepGate::Run
        } else {
            trace!(step = frame.step, "step already done");
            StepGate::Skip
        }
    }

    /// `true` when the next step has to run.
    pub fn should_run_step(&mut self) -> bool {
        self.check_step() == StepGate::Run
    }

    /// The current step completed.
    pub fn mark_step_done(&mut self) {
        self.frame.steps_done = self.frame.step;
    }

    /// Store the result of the current step for later replays.
    pub fn record(&mut self, record: StepRecord) {
        self.frame.journal.insert(self.frame.step, record);
    }

    /// Result stored for the current step.
    pub fn recorded(&self) -> Option<&StepRecord> {
        self.frame.journal.get(&self.frame.step)
    }

    /// A checkpoint step. The first time it runs it completes and saves the
    /// position before it. Replays leave the saved position alone.
    pub fn mark(&mut self) {
        if self.check_step() != StepGate::Run {
            return;
        }
        let frame = &mut self.frame;
        frame.mark = Some(StepMark {
            step: frame.step - 1,
            steps_done: frame.steps_done,
        });
        frame.steps_done = frame.step;
        trace!(step = frame.step, "transaction step marked");
    }

    pub fn mark_position(&self) -> Option<StepMark> {
        self.frame.mark
    }

    /// Rewind to the saved checkpoint so the marked sub-sequence runs again.
    pub fn remove_to_mark(&mut self) -> Result<()> {
        let frame = &mut self.frame;
        let Some(mark) = frame.mark else {
            error!("remove_to_mark called without a mark");
            return Err(TxnError::NoMark);
        };
        frame.step = mark.step;
        frame.steps_done = mark.steps_done;
        frame.journal.retain(|step, _| *step <= mark.step);
        trace!(step = mark.step, "transaction rewound to mark");
        Ok(())
    }

    /// Undo the last completed step.
    pub fn remove_step(&mut self) {
        let frame = &mut self.frame;
        frame.journal.remove(&frame.step);
        frame.step = frame.step.saturating_sub(1);
        frame.steps_done = frame.steps_done.saturating_sub(1);
        // The mark step itself was undone; it sets a fresh mark when it runs again.
        if frame.mark.is_some_and(|mark| mark.step >= frame.steps_done) {
            frame.mark = None;
        }
        trace!(step = frame.step, "transaction removed last step");
    }

    /// Register `handler` for `srq`. Handlers registered later take
    /// precedence.
    pub fn add_srq_handler<F>(&mut self, srq: u8, handler: F)
    where
        F: FnMut(u8) -> Result<()> + Send + 'static,
    {
        self.frame.handlers.insert(0, (srq, Box::new(handler)));
    }

    /// Run the newest handler for `srq`. `None` when no handler matches.
    pub fn call_srq_handler(&mut self, srq: u8) -> Option<Result<()>> {
        let (_, handler) = self
            .frame
            .handlers
            .iter_mut()
            .find(|(value, _)| *value == srq)?;
        debug!(srq = format_args!("0x{srq:02x}"), "calling srq handler");
        Some(handler(srq))
    }

    pub fn handler_count(&self) -> usize {
        self.frame.handlers.len()
    }

    /// Save the whole state and continue with fresh counters, no mark, no
    /// journal and no handlers. Call identities and a pending abort carry
    /// over.
    pub fn push(&mut self) {
        let mut nested = Frame::empty();
        nested.last_call = self.frame.last_call;
        nested.current_call = self.frame.current_call;
        nested.aborted = self.frame.aborted;
        let outer = std::mem::replace(&mut self.frame, nested);
        self.pushed.push(outer);
        trace!(depth = self.pushed.len(), "transaction pushed");
    }

    /// Push at the next [`start`](Self::start).
    pub fn schedule_push(&mut self) {
        self.push_scheduled = true;
    }

    /// Restore the state saved by the matching [`push`](Self::push). An
    /// abort requested inside the nested state stays requested.
    pub fn pop(&mut self) -> Result<()> {
        let Some(outer) = self.pushed.pop() else {
            error!("pop called without a pushed transaction");
            return Err(TxnError::NothingPushed);
        };
        let nested = std::mem::replace(&mut self.frame, outer);
        self.frame.aborted |= nested.aborted;
        trace!(depth = self.pushed.len(), "transaction popped");
        Ok(())
    }

    /// Number of pushed states.
    pub fn depth(&self) -> usize {
        self.pushed.len()
    }

    /// Run `op` as one step. Returns `Ok(None)` when the step already
    /// completed. A failed `op` leaves the step outstanding.
    pub fn run_step<T, F>(&mut self, op: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        match self.check_step() {
            StepGate::Skip => Ok(None),
            StepGate::Aborted => Err(TxnError::Aborted),
            StepGate::Run => {
                let value = op()?;
                self.mark_step_done();
                Ok(Some(value))
            }
        }
    }
}

impl<C: CallId> fmt::Debug for Transaction<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("last_call", &self.frame.last_call)
            .field("current_call", &self.frame.current_call)
            .field("step", &self.frame.step)
            .field("steps_done", &self.frame.steps_done)
            .field("mark", &self.frame.mark)
            .field("aborted", &self.frame.aborted)
            .field("handlers", &self.frame.handlers.len())
            .field("depth", &self.pushed.len())
            .finish()
    }
}
