//! GPIB sessions.
//!
//! Vendor drivers are reached through the [`GpibBus`] trait. A session owns
//! one bus behind a mutex, which plays the role of "interrupts off": the
//! background SRQ watcher and foreground send/receive never touch the bus at
//! the same time. The watcher serial-polls whenever the SRQ line asserts and
//! feeds the status byte into the session's [`SrqPipeline`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use busprims_srq::{Delivery, SrqPipeline, SrqProducer};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::config::{LinkConfig, LinkMode};
use crate::error::{LinkError, Result};
use crate::timing::{BusOp, DelayCoordinator};

/// Access to one instrument on a GPIB bus.
///
/// Implementations block for at most the timeout last set with
/// [`GpibBus::set_timeout`] and report an elapsed timeout as
/// [`LinkError::Timeout`].
pub trait GpibBus: Send {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Selected device clear.
    fn clear(&mut self) -> Result<()>;

    /// Assert or release the ATN line.
    fn set_atn(&mut self, asserted: bool) -> Result<()>;

    fn set_term_char(&mut self, term: Option<u8>) -> Result<()>;

    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Read one message, up to `max_len` bytes, ending at EOI or the
    /// termination character.
    fn read(&mut self, max_len: usize) -> Result<Bytes>;

    /// Serial poll.
    fn read_status_byte(&mut self) -> Result<u8>;

    /// Handle for waiting on the SRQ line without holding the bus.
    fn srq_line(&self) -> Arc<dyn SrqLine>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The bus's SRQ line.
pub trait SrqLine: Send + Sync {
    /// Block until SRQ is asserted or `timeout` elapses. Returns whether the
    /// line is asserted.
    fn wait_asserted(&self, timeout: Duration) -> bool;
}

/// Opens buses for a `(card, address)` pair.
pub trait GpibConnector: Send + Sync {
    fn connect(&self, card: &str, address: u8) -> Result<Box<dyn GpibBus>>;
}

/// Bus action performed after every send to release a stuck EOI line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EomAction {
    #[default]
    None,
    /// Assert and release ATN.
    ToggleAtn,
    /// One serial poll. The byte is delivered like any polled status byte.
    SerialPoll,
}

/// Bus access handed to a [`PostSendHook`].
pub struct PostSendContext<'a> {
    core: &'a mut GpibCore,
    producer: &'a SrqProducer,
}

impl PostSendContext<'_> {
    pub fn bus(&mut self) -> &mut dyn GpibBus {
        self.core.bus.as_mut()
    }

    /// Serial poll with normal SRQ delivery.
    pub fn serial_poll(&mut self) -> Result<u8> {
        service_srq(self.core, self.producer)
    }
}

/// Extension point run after each successful GPIB send.
pub trait PostSendHook: Send {
    fn after_send(&mut self, ctx: &mut PostSendContext<'_>) -> Result<()>;
}

impl PostSendHook for EomAction {
    fn after_send(&mut self, ctx: &mut PostSendContext<'_>) -> Result<()> {
        match self {
            EomAction::None => Ok(()),
            EomAction::ToggleAtn => {
                trace!("eom: toggling ATN");
                ctx.bus().set_atn(true)?;
                ctx.bus().set_atn(false)
            }
            EomAction::SerialPoll => {
                trace!("eom: serial poll");
                ctx.serial_poll().map(|_| ())
            }
        }
    }
}

/// Bus plus timing state; everything the bus mutex protects.
pub(crate) struct GpibCore {
    bus: Box<dyn GpibBus>,
    timing: DelayCoordinator,
}

fn lock_core(core: &Mutex<GpibCore>) -> MutexGuard<'_, GpibCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serial poll, deliver the byte, release ATN and record the SRQ time.
/// A failed poll leaves the pipeline untouched.
fn service_srq(core: &mut GpibCore, producer: &SrqProducer) -> Result<u8> {
    core.timing.pause_before(BusOp::SerialPoll);
    let status = core.bus.read_status_byte().inspect_err(|err| {
        error!(%err, "serial poll failed");
    })?;

    match producer.deliver(status) {
        Delivery::Queued | Delivery::Consumed => {
            debug!(stb = format_args!("0x{status:02x}"), "serial poll")
        }
        Delivery::Ignored => {}
    }

    if let Err(err) = core.bus.set_atn(false) {
        warn!(%err, "failed to release ATN after serial poll");
    }
    core.timing.record(BusOp::SerialPoll);
    Ok(status)
}

/// Background thread standing in for the SRQ interrupt.
struct SrqWatcher {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SrqWatcher {
    fn spawn(
        core: Arc<Mutex<GpibCore>>,
        line: Arc<dyn SrqLine>,
        producer: SrqProducer,
        interval: Duration,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();

        let handle = thread::Builder::new()
            .name("busprims-srq".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    if !line.wait_asserted(interval) {
                        continue;
                    }
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let result = service_srq(&mut lock_core(&core), &producer);
                    if result.is_err() {
                        thread::sleep(interval);
                    }
                }
                trace!("srq watcher stopped");
            })
            .map_err(LinkError::Resource)?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("srq watcher panicked");
            }
        }
    }
}

impl Drop for SrqWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// An open GPIB instrument session.
pub struct GpibSession {
    card: String,
    address: u8,
    core: Arc<Mutex<GpibCore>>,
    pipeline: SrqPipeline,
    producer: SrqProducer,
    hook: Box<dyn PostSendHook>,
    watcher: Option<SrqWatcher>,
    max_len: usize,
}

impl GpibSession {
    /// Connect, reset the instrument interface and start SRQ watching.
    ///
    /// The bus gets the configured I/O timeout, a device clear, ATN
    /// released and the termination character. Any status bytes left in
    /// `pipeline` are discarded.
    pub fn open(
        connector: &dyn GpibConnector,
        card: &str,
        address: u8,
        link_config: &LinkConfig,
        mode: LinkMode,
        pipeline: SrqPipeline,
    ) -> Result<Self> {
        let config = &link_config.gpib;
        let mut bus = connector.connect(card, address)?;
        bus.set_timeout(config.io_timeout())?;
        bus.clear()?;
        bus.set_atn(false)?;
        bus.set_term_char(config.term_char)?;

        let line = bus.srq_line();
        let core = Arc::new(Mutex::new(GpibCore {
            bus,
            timing: DelayCoordinator::for_mode(mode, link_config.delays),
        }));

        pipeline.clear();
        let producer = pipeline.producer();
        let watcher = SrqWatcher::spawn(
            core.clone(),
            line,
            producer.clone(),
            config.srq_watch_interval(),
        )?;

        info!(card, address, %mode, "gpib session opened");

        Ok(Self {
            card: card.to_string(),
            address,
            core,
            pipeline,
            producer,
            hook: Box::new(config.eom_action),
            watcher: Some(watcher),
            max_len: link_config.max_message_len,
        })
    }

    pub fn card(&self) -> &str {
        &self.card
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn pipeline(&self) -> &SrqPipeline {
        &self.pipeline
    }

    /// Replace the action run after every send.
    pub fn set_post_send_hook(&mut self, hook: Box<dyn PostSendHook>) {
        self.hook = hook;
    }

    pub fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        let mut core = lock_core(&self.core);
        core.timing.pause_before(BusOp::Send);
        core.bus.set_timeout(timeout)?;
        let written = core.bus.write(data)?;
        core.timing.record(BusOp::Send);
        trace!(written, "gpib send");

        let mut ctx = PostSendContext {
            core: &mut *core,
            producer: &self.producer,
        };
        if let Err(err) = self.hook.after_send(&mut ctx) {
            warn!(%err, "post-send bus action failed");
        }
        Ok(written)
    }

    pub fn receive(&mut self, timeout: Duration) -> Result<Bytes> {
        let mut core = lock_core(&self.core);
        core.timing.pause_before(BusOp::Receive);
        core.bus.set_timeout(timeout)?;
        let message = core.bus.read(self.max_len)?;
        core.timing.record(BusOp::Receive);
        trace!(len = message.len(), "gpib receive");
        Ok(message)
    }

    /// One serial poll, routed through the callback table and the queue.
    pub fn poll_serial_status(&mut self) -> Result<u8> {
        service_srq(&mut lock_core(&self.core), &self.producer)
    }

    pub fn clear(&mut self) -> Result<()> {
        debug!(card = %self.card, address = self.address, "device clear");
        lock_core(&self.core).bus.clear()
    }

    /// Stop the watcher, release the bus and drop registered callbacks.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        self.pipeline.clear_callbacks();
        let result = lock_core(&self.core).bus.close();
        info!(card = %self.card, address = self.address, "gpib session closed");
        result
    }
}

impl fmt::Debug for GpibSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpibSession")
            .field("card", &self.card)
            .field("address", &self.address)
            .field("watching", &self.watcher.is_some())
            .finish()
    }
}

impl Drop for GpibSession {
    fn drop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
    }
}
