//! One link operation per step.
//!
//! Each helper checks the step first and touches the link only when the
//! step is outstanding. Link timeouts become [`TxnError::Waiting`] and leave
//! the step outstanding for the next invocation.

use std::time::Duration;

use busprims_link::{Link, LinkError};
use busprims_srq::SrqWait;
use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use crate::error::{Result, TxnError};
use crate::transaction::{CallId, StepGate, StepRecord, Transaction};

fn link_failure(err: LinkError, what: &str) -> TxnError {
    if err.is_timeout() {
        debug!(what, "timed out, still waiting");
        TxnError::Waiting
    } else {
        error!(%err, what, "link operation failed");
        TxnError::Link(err)
    }
}

/// Gate the step. `Ok(true)` means run it.
fn enter<C: CallId>(ta: &mut Transaction<C>, what: &str) -> Result<bool> {
    match ta.check_step() {
        StepGate::Run => Ok(true),
        StepGate::Skip => {
            trace!(what, "not repeated, already done");
            Ok(false)
        }
        StepGate::Aborted => Err(TxnError::Aborted),
    }
}

fn recorded_srq<C: CallId>(ta: &Transaction<C>) -> Option<u8> {
    match ta.recorded() {
        Some(StepRecord::Srq(srq)) => Some(*srq),
        _ => None,
    }
}

pub fn send_step<C: CallId>(
    ta: &mut Transaction<C>,
    link: &mut Link,
    message: &[u8],
    timeout: Duration,
) -> Result<()> {
    if !enter(ta, "send")? {
        return Ok(());
    }
    let report = link
        .send(message, timeout)
        .map_err(|err| link_failure(err, "send"))?;
    if !report.is_complete() {
        warn!(
            written = report.written,
            expected = report.expected,
            "message only partially sent"
        );
    }
    ta.mark_step_done();
    Ok(())
}

/// Receive one message. A replay returns the message received the first
/// time.
pub fn receive_step<C: CallId>(
    ta: &mut Transaction<C>,
    link: &mut Link,
    timeout: Duration,
) -> Result<Bytes> {
    if !enter(ta, "receive")? {
        return match ta.recorded() {
            Some(StepRecord::Reply(reply)) => Ok(reply.clone()),
            _ => Ok(Bytes::new()),
        };
    }
    let reply = link
        .receive(timeout)
        .map_err(|err| link_failure(err, "receive"))?;
    ta.record(StepRecord::Reply(reply.clone()));
    ta.mark_step_done();
    Ok(reply)
}

/// Wait for the next SRQ.
///
/// A byte listed in `accepted` is returned as is. Anything else goes to the
/// SRQ handlers; a handler error is returned. An SRQ no handler claims is
/// [`TxnError::UnexpectedSrq`] unless `accepted` is empty. The step counts
/// as done once a byte was received, whatever the outcome.
pub fn get_srq_step<C: CallId>(
    ta: &mut Transaction<C>,
    link: &Link,
    accepted: &[u8],
    timeout: Duration,
) -> Result<u8> {
    if !enter(ta, "srq")? {
        return recorded_srq(ta)
            .ok_or_else(|| TxnError::Inconsistent("no srq recorded for completed step".into()));
    }
    let srq = match link
        .get_event(timeout)
        .map_err(|err| link_failure(err, "srq"))?
    {
        SrqWait::Ready(srq) => srq,
        SrqWait::TimedOut => {
            debug!("no srq yet, still waiting");
            return Err(TxnError::Waiting);
        }
    };
    ta.record(StepRecord::Srq(srq));
    ta.mark_step_done();
    debug!(srq = format_args!("0x{srq:02x}"), "srq received");

    if accepted.contains(&srq) {
        return Ok(srq);
    }
    if let Some(handled) = ta.call_srq_handler(srq) {
        return handled.map(|()| srq);
    }
    if !accepted.is_empty() {
        error!(
            srq = format_args!("0x{srq:02x}"),
            ?accepted,
            "srq not understood"
        );
        return Err(TxnError::UnexpectedSrq(srq));
    }
    Ok(srq)
}

/// Wait for the first queued SRQ in `expected`; others stay queued.
pub fn expect_srq_step<C: CallId>(
    ta: &mut Transaction<C>,
    link: &Link,
    expected: &[u8],
    timeout: Duration,
) -> Result<u8> {
    if !enter(ta, "expected srq")? {
        return recorded_srq(ta)
            .ok_or_else(|| TxnError::Inconsistent("no srq recorded for completed step".into()));
    }
    match link
        .get_expected_event(expected, timeout)
        .map_err(|err| link_failure(err, "expected srq"))?
    {
        SrqWait::Ready(srq) => {
            ta.record(StepRecord::Srq(srq));
            ta.mark_step_done();
            debug!(srq = format_args!("0x{srq:02x}"), "expected srq received");
            Ok(srq)
        }
        SrqWait::TimedOut => {
            debug!(?expected, "expected srq not there yet");
            Err(TxnError::Waiting)
        }
    }
}

/// Look for an optional SRQ. `Ok(None)` when none arrived; the step then
/// stays outstanding. A received byte is offered to the SRQ handlers.
pub fn test_srq_step<C: CallId>(
    ta: &mut Transaction<C>,
    link: &Link,
    timeout: Duration,
) -> Result<Option<u8>> {
    if !enter(ta, "optional srq")? {
        return Ok(recorded_srq(ta));
    }
    match link
        .get_event(timeout)
        .map_err(|err| link_failure(err, "optional srq"))?
    {
        SrqWait::Ready(srq) => {
            ta.record(StepRecord::Srq(srq));
            ta.mark_step_done();
            debug!(srq = format_args!("0x{srq:02x}"), "additional srq received");
            if let Some(handled) = ta.call_srq_handler(srq) {
                handled?;
            }
            Ok(Some(srq))
        }
        SrqWait::TimedOut => {
            trace!("no additional srq");
            Ok(None)
        }
    }
}

/// GPIB device clear.
pub fn clear_step<C: CallId>(ta: &mut Transaction<C>, link: &mut Link) -> Result<()> {
    if !enter(ta, "device clear")? {
        return Ok(());
    }
    link.clear().map_err(|err| link_failure(err, "device clear"))?;
    ta.mark_step_done();
    Ok(())
}
