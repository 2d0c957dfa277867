use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use busprims_srq::{SrqPipeline, SrqWait};
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::address::{Interface, LinkAddress};
use crate::config::{LinkConfig, LinkMode};
use crate::error::{LinkError, Result};
use crate::gpib::{GpibConnector, GpibSession, PostSendHook};
use crate::timing::{BusOp, DelayCoordinator};

#[cfg(unix)]
use crate::lan::{LanClient, LanServer};
#[cfg(unix)]
use crate::rs232::SerialPort;

/// Outcome of [`Link::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub written: usize,
    pub expected: usize,
}

impl SendReport {
    pub fn is_complete(&self) -> bool {
        self.written == self.expected
    }
}

enum LinkInner {
    Gpib(GpibSession),
    #[cfg(unix)]
    Lan(LanClient),
    #[cfg(unix)]
    LanServer(LanServer),
    #[cfg(unix)]
    Rs232(SerialPort),
}

enum LinkState {
    Open(LinkInner),
    /// Offline null session: accepts everything, touches nothing.
    Offline,
    Closed,
}

/// Opens [`Link`]s with a shared configuration.
#[derive(Clone, Default)]
pub struct LinkOpener {
    config: LinkConfig,
    connector: Option<Arc<dyn GpibConnector>>,
}

impl LinkOpener {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            connector: None,
        }
    }

    pub fn with_mode(mut self, mode: LinkMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// GPIB driver used for `gpib/...` addresses.
    pub fn with_gpib_connector(mut self, connector: Arc<dyn GpibConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn open_str(&self, address: &str) -> Result<Link> {
        self.open(address.parse()?)
    }

    /// Open a session. Offline sessions are created without touching any
    /// resource.
    pub fn open(&self, address: LinkAddress) -> Result<Link> {
        let mode = self.config.mode.effective();
        let pipeline = SrqPipeline::new();

        let state = if mode.performs_io() {
            LinkState::Open(open_inner(
                &address,
                &self.config,
                mode,
                self.connector.as_deref(),
                &pipeline,
            )?)
        } else {
            info!(%address, "link opened offline");
            LinkState::Offline
        };

        Ok(Link {
            address,
            mode,
            config: self.config.clone(),
            connector: self.connector.clone(),
            pipeline,
            timing: DelayCoordinator::for_mode(mode, self.config.delays),
            state,
        })
    }
}

impl fmt::Debug for LinkOpener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkOpener")
            .field("config", &self.config)
            .field("gpib_connector", &self.connector.is_some())
            .finish()
    }
}

fn open_inner(
    address: &LinkAddress,
    config: &LinkConfig,
    mode: LinkMode,
    connector: Option<&dyn GpibConnector>,
    pipeline: &SrqPipeline,
) -> Result<LinkInner> {
    match address {
        LinkAddress::Gpib { card, address } => {
            let connector = connector.ok_or(LinkError::Unsupported {
                operation: "open without a gpib driver",
                interface: Interface::Gpib.as_str(),
            })?;
            Ok(LinkInner::Gpib(GpibSession::open(
                connector,
                card,
                *address,
                config,
                mode,
                pipeline.clone(),
            )?))
        }
        #[cfg(unix)]
        LinkAddress::Lan {
            protocol,
            host,
            port,
        } => Ok(LinkInner::Lan(LanClient::connect(
            *protocol,
            host,
            *port,
            config.terminator.clone(),
            config.max_message_len,
        )?)),
        #[cfg(unix)]
        LinkAddress::Server { port } => {
            let mut server =
                LanServer::bind(*port, config.terminator.clone(), config.max_message_len)?;
            match server.accept(config.accept_timeout()) {
                Ok(_) => {}
                Err(err) if err.is_timeout() => {
                    info!(port, "no handler connected yet; still listening");
                }
                Err(err) => return Err(err),
            }
            Ok(LinkInner::LanServer(server))
        }
        #[cfg(unix)]
        LinkAddress::Rs232 { device } => Ok(LinkInner::Rs232(SerialPort::open(
            device,
            config.serial,
            config.terminator.clone(),
            config.max_message_len,
        )?)),
        #[cfg(not(unix))]
        other => Err(LinkError::Unsupported {
            operation: "open",
            interface: other.interface().as_str(),
        }),
    }
}

/// One instrument link session.
///
/// All operations fail with [`LinkError::Closed`] once the session is
/// closed. In offline mode nothing reaches the wire: sends report full
/// success, receives return an empty message and SRQ waits time out.
pub struct Link {
    address: LinkAddress,
    mode: LinkMode,
    config: LinkConfig,
    connector: Option<Arc<dyn GpibConnector>>,
    pipeline: SrqPipeline,
    timing: DelayCoordinator,
    state: LinkState,
}

impl Link {
    /// Open `address` with `config` and no GPIB driver.
    pub fn open(address: &str, config: LinkConfig) -> Result<Self> {
        LinkOpener::new(config).open_str(address)
    }

    pub fn address(&self) -> &LinkAddress {
        &self.address
    }

    pub fn interface(&self) -> Interface {
        self.address.interface()
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.state, LinkState::Closed)
    }

    /// The session's SRQ queue.
    pub fn pipeline(&self) -> &SrqPipeline {
        &self.pipeline
    }

    pub fn send(&mut self, data: &[u8], timeout: Duration) -> Result<SendReport> {
        let expected = data.len();
        let written = match &mut self.state {
            LinkState::Closed => return Err(LinkError::Closed),
            LinkState::Offline => expected,
            LinkState::Open(LinkInner::Gpib(session)) => session.send(data, timeout)?,
            #[cfg(unix)]
            LinkState::Open(LinkInner::Lan(client)) => {
                paced(&mut self.timing, BusOp::Send, || client.send(data, timeout))?
            }
            #[cfg(unix)]
            LinkState::Open(LinkInner::LanServer(server)) => {
                paced(&mut self.timing, BusOp::Send, || server.send(data, timeout))?
            }
            #[cfg(unix)]
            LinkState::Open(LinkInner::Rs232(port)) => {
                paced(&mut self.timing, BusOp::Send, || port.send(data, timeout))?
            }
        };

        let report = SendReport { written, expected };
        if report.is_complete() {
            debug!(address = %self.address, written, "message sent");
        } else {
            warn!(address = %self.address, written, expected, "message sent partially");
        }
        Ok(report)
    }

    pub fn receive(&mut self, timeout: Duration) -> Result<Bytes> {
        let message = match &mut self.state {
            LinkState::Closed => return Err(LinkError::Closed),
            LinkState::Offline => Bytes::new(),
            LinkState::Open(LinkInner::Gpib(session)) => session.receive(timeout)?,
            #[cfg(unix)]
            LinkState::Open(LinkInner::Lan(client)) => {
                paced(&mut self.timing, BusOp::Receive, || client.receive(timeout))?
            }
            #[cfg(unix)]
            LinkState::Open(LinkInner::LanServer(server)) => {
                paced(&mut self.timing, BusOp::Receive, || server.receive(timeout))?
            }
            #[cfg(unix)]
            LinkState::Open(LinkInner::Rs232(port)) => {
                paced(&mut self.timing, BusOp::Receive, || port.receive(timeout))?
            }
        };
        debug!(address = %self.address, len = message.len(), "message received");
        Ok(message)
    }

    /// Release the OS resources. The session is unusable afterwards.
    pub fn close(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, LinkState::Closed);
        let result = match state {
            LinkState::Closed => return Err(LinkError::Closed),
            LinkState::Offline => Ok(()),
            LinkState::Open(inner) => close_inner(inner),
        };
        self.pipeline.clear();
        self.pipeline.clear_callbacks();
        info!(address = %self.address, "link closed");
        result
    }

    /// Close and reopen a GPIB session, optionally at another address on the
    /// same card. Registered SRQ callbacks and queued events are dropped.
    pub fn reopen(&mut self, address: Option<u8>) -> Result<()> {
        let LinkAddress::Gpib {
            card,
            address: current,
        } = &self.address
        else {
            return Err(unsupported(&self.address, "reopen"));
        };
        let target = LinkAddress::Gpib {
            card: card.clone(),
            address: address.unwrap_or(*current),
        };

        if self.is_open() {
            self.close()?;
        }
        if self.mode.performs_io() {
            thread::sleep(self.config.gpib.reopen_settle());
        }

        self.pipeline.clear();
        self.state = if self.mode.performs_io() {
            LinkState::Open(open_inner(
                &target,
                &self.config,
                self.mode,
                self.connector.as_deref(),
                &self.pipeline,
            )?)
        } else {
            LinkState::Offline
        };
        self.address = target;
        info!(address = %self.address, "link reopened");
        Ok(())
    }

    /// GPIB device clear.
    pub fn clear(&mut self) -> Result<()> {
        match &mut self.state {
            LinkState::Closed => Err(LinkError::Closed),
            LinkState::Offline if self.address.interface() == Interface::Gpib => Ok(()),
            LinkState::Open(LinkInner::Gpib(session)) => session.clear(),
            _ => Err(unsupported(&self.address, "device clear")),
        }
    }

    /// One explicit serial poll. The byte passes through the callback table
    /// and, with the SRQ bit set, the event queue.
    pub fn poll_serial_status(&mut self) -> Result<u8> {
        match &mut self.state {
            LinkState::Closed => Err(LinkError::Closed),
            LinkState::Offline if self.address.interface() == Interface::Gpib => Ok(0),
            LinkState::Open(LinkInner::Gpib(session)) => session.poll_serial_status(),
            _ => Err(unsupported(&self.address, "serial poll")),
        }
    }

    /// Replace the GPIB post-send action.
    pub fn set_post_send_hook(&mut self, hook: Box<dyn PostSendHook>) -> Result<()> {
        match &mut self.state {
            LinkState::Closed => Err(LinkError::Closed),
            LinkState::Open(LinkInner::Gpib(session)) => {
                session.set_post_send_hook(hook);
                Ok(())
            }
            LinkState::Offline if self.address.interface() == Interface::Gpib => Ok(()),
            _ => Err(unsupported(&self.address, "post-send hook")),
        }
    }

    /// Next SRQ status byte, waiting up to `timeout`.
    pub fn get_event(&self, timeout: Duration) -> Result<SrqWait> {
        if self.srq_source()? {
            Ok(self.pipeline.get_event(timeout))
        } else {
            Ok(SrqWait::TimedOut)
        }
    }

    /// First queued SRQ status byte in `expected`, waiting up to `timeout`.
    pub fn get_expected_event(&self, expected: &[u8], timeout: Duration) -> Result<SrqWait> {
        if self.srq_source()? {
            Ok(self.pipeline.get_expected_event(expected, timeout))
        } else {
            Ok(SrqWait::TimedOut)
        }
    }

    /// Peek for any of `candidates` in the SRQ queue.
    pub fn check_for_srqs(&self, candidates: &[u8]) -> Result<Option<u8>> {
        if self.srq_source()? {
            Ok(self.pipeline.check_for_srqs(candidates))
        } else {
            Ok(None)
        }
    }

    pub fn register_srq_callback<F>(
        &self,
        status: u8,
        callback: F,
        keep_in_fifo: bool,
    ) -> Result<()>
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        self.srq_source()?;
        self.pipeline.register_callback(status, callback, keep_in_fifo);
        Ok(())
    }

    /// Wait for the handler to connect to a LAN server session.
    pub fn accept(&mut self, timeout: Duration) -> Result<std::net::SocketAddr> {
        match &mut self.state {
            LinkState::Closed => Err(LinkError::Closed),
            #[cfg(unix)]
            LinkState::Open(LinkInner::LanServer(server)) => server.accept(timeout),
            LinkState::Offline if self.address.interface() == Interface::LanServer => {
                Err(LinkError::Timeout(timeout))
            }
            _ => Err(unsupported(&self.address, "accept")),
        }
    }

    /// Whether SRQ operations apply: `Ok(true)` for a live GPIB session,
    /// `Ok(false)` for an offline one.
    fn srq_source(&self) -> Result<bool> {
        match &self.state {
            LinkState::Closed => Err(LinkError::Closed),
            _ if self.address.interface() != Interface::Gpib => {
                Err(unsupported(&self.address, "srq"))
            }
            LinkState::Offline => Ok(false),
            LinkState::Open(_) => Ok(true),
        }
    }
}

fn unsupported(address: &LinkAddress, operation: &'static str) -> LinkError {
    LinkError::Unsupported {
        operation,
        interface: address.interface().as_str(),
    }
}

/// Run one bus operation inside the coordinator's pacing window.
#[cfg(unix)]
fn paced<T>(
    timing: &mut DelayCoordinator,
    op: BusOp,
    io: impl FnOnce() -> Result<T>,
) -> Result<T> {
    timing.pause_before(op);
    let out = io()?;
    timing.record(op);
    Ok(out)
}

fn close_inner(inner: LinkInner) -> Result<()> {
    match inner {
        LinkInner::Gpib(mut session) => session.close(),
        #[cfg(unix)]
        LinkInner::Lan(mut client) => {
            client.shutdown();
            Ok(())
        }
        #[cfg(unix)]
        LinkInner::LanServer(mut server) => {
            server.disconnect();
            Ok(())
        }
        #[cfg(unix)]
        LinkInner::Rs232(_) => Ok(()),
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            LinkState::Open(_) => "open",
            LinkState::Offline => "offline",
            LinkState::Closed => "closed",
        };
        f.debug_struct("Link")
            .field("address", &self.address)
            .field("mode", &self.mode)
            .field("state", &state)
            .finish()
    }
}
