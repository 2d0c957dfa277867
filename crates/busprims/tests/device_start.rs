use std::sync::Arc;
use std::time::Duration;

use busprims::link::{
    GpibConfig, Link, LinkConfig, LinkMode, LinkOpener, SimInstrument, SimulatedGpib,
};
use busprims::txn::{get_srq_step, receive_step, send_step, Result, Transaction, TxnError};
use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    DeviceStart,
    Reprobe,
}

const REPLY_TIMEOUT: Duration = Duration::from_millis(50);
const SRQ_TIMEOUT: Duration = Duration::from_secs(2);

fn open_handler() -> (SimInstrument, Link) {
    let sim = SimulatedGpib::new();
    let instrument = sim.instrument("hpib", 5);
    let config = LinkConfig::default().with_gpib(GpibConfig {
        srq_watch_interval_us: 2_000,
        ..GpibConfig::default()
    });
    let link = LinkOpener::new(config)
        .with_gpib_connector(Arc::new(sim))
        .open_str("gpib/hpib/5")
        .expect("simulated handler should open");
    (instrument, link)
}

/// Send the start command, read the acknowledge, then wait for the
/// "test started" service request.
fn device_start(ta: &mut Transaction<Call>, link: &mut Link) -> Result<u8> {
    ta.set_call(Call::DeviceStart);
    ta.start()?;
    send_step(ta, link, b"START\n", REPLY_TIMEOUT)?;
    let ack = receive_step(ta, link, REPLY_TIMEOUT)?;
    if ack.as_ref() != b"ACK\n" {
        return Err(TxnError::Answer(String::from_utf8_lossy(&ack).into_owned()));
    }
    let srq = get_srq_step(ta, link, &[0x41], SRQ_TIMEOUT)?;
    ta.stop();
    Ok(srq)
}

#[test]
fn device_start_resumes_after_timeout() {
    let (instrument, mut link) = open_handler();
    let mut ta = Transaction::new();

    let first = device_start(&mut ta, &mut link);
    assert!(matches!(first, Err(TxnError::Waiting)));
    assert_eq!(ta.steps_done(), 1);
    assert_eq!(instrument.written(), vec![Bytes::from_static(b"START\n")]);

    instrument.queue_reply(&b"ACK\n"[..]);
    instrument.raise_srq(0x41);
    let second = device_start(&mut ta, &mut link).expect("second call should finish");
    assert_eq!(second, 0x41);
    assert_eq!(ta.steps_done(), 3);
    assert_eq!(instrument.written().len(), 1, "send must not repeat");

    // A completed call replays without touching the bus.
    let polls = instrument.poll_count();
    assert_eq!(device_start(&mut ta, &mut link).unwrap(), 0x41);
    assert_eq!(instrument.written().len(), 1);
    assert_eq!(instrument.poll_count(), polls);
}

#[test]
fn unexpected_srq_is_reported_once_received() {
    let (instrument, mut link) = open_handler();
    let mut ta = Transaction::new();

    instrument.queue_reply(&b"ACK\n"[..]);
    instrument.raise_srq(0x4e);
    let err = device_start(&mut ta, &mut link).unwrap_err();
    assert!(matches!(err, TxnError::UnexpectedSrq(0x4e)));
    assert_eq!(ta.steps_done(), 3);
}

#[test]
fn srq_handler_claims_jam_signal() {
    let (instrument, mut link) = open_handler();
    let mut ta = Transaction::new();
    ta.add_srq_handler(0x4e, |_| {
        Err(TxnError::Answer("handler jammed".to_string()))
    });

    instrument.queue_reply(&b"ACK\n"[..]);
    instrument.raise_srq(0x4e);
    let err = device_start(&mut ta, &mut link).unwrap_err();
    assert!(matches!(err, TxnError::Answer(msg) if msg == "handler jammed"));
}

#[test]
fn abort_stops_the_sequence_without_io() {
    let (instrument, mut link) = open_handler();
    let mut ta = Transaction::new();

    assert!(device_start(&mut ta, &mut link).is_err());
    ta.do_abort();

    let err = device_start(&mut ta, &mut link).unwrap_err();
    assert!(matches!(err, TxnError::Aborted));
    assert_eq!(instrument.written().len(), 1);

    ta.do_reset();
    instrument.queue_reply(&b"ACK\n"[..]);
    instrument.raise_srq(0x41);
    assert_eq!(device_start(&mut ta, &mut link).unwrap(), 0x41);
    assert_eq!(instrument.written().len(), 2);
}

/// Repeat the marked exchange until the prober stops answering "NAK".
fn reprobe(ta: &mut Transaction<Call>, link: &mut Link) -> Result<Bytes> {
    ta.set_call(Call::Reprobe);
    ta.start()?;
    send_step(ta, link, b"Z\n", REPLY_TIMEOUT)?;
    ta.mark();
    send_step(ta, link, b"REPROBE\n", REPLY_TIMEOUT)?;
    let reply = receive_step(ta, link, REPLY_TIMEOUT)?;
    if reply.as_ref() == b"NAK\n" {
        ta.remove_to_mark()?;
        return Err(TxnError::Waiting);
    }
    ta.stop();
    Ok(reply)
}

#[test]
fn rewind_to_mark_repeats_only_the_marked_part() {
    let (instrument, mut link) = open_handler();
    let mut ta = Transaction::new();

    instrument.queue_reply(&b"NAK\n"[..]);
    assert!(matches!(reprobe(&mut ta, &mut link), Err(TxnError::Waiting)));

    instrument.queue_reply(&b"OK\n"[..]);
    let reply = reprobe(&mut ta, &mut link).expect("second attempt should pass");
    assert_eq!(reply.as_ref(), b"OK\n");

    let written = instrument.written();
    assert_eq!(
        written,
        vec![
            Bytes::from_static(b"Z\n"),
            Bytes::from_static(b"REPROBE\n"),
            Bytes::from_static(b"REPROBE\n"),
        ]
    );
}

#[test]
fn offline_handler_never_reports_srq() {
    let mut link = LinkOpener::new(LinkConfig::default())
        .with_mode(LinkMode::Offline)
        .open_str("gpib/hpib/5")
        .expect("offline link should open");
    let mut ta = Transaction::new();

    ta.set_call(Call::DeviceStart);
    ta.start().unwrap();
    send_step(&mut ta, &mut link, b"START\n", REPLY_TIMEOUT).unwrap();
    assert!(receive_step(&mut ta, &mut link, REPLY_TIMEOUT).unwrap().is_empty());
    let err = get_srq_step(&mut ta, &link, &[0x41], SRQ_TIMEOUT).unwrap_err();
    assert!(matches!(err, TxnError::Waiting));
}
