//! Instrument link transport.
//!
//! One [`Link`] is a session with a handler or prober over one of:
//! - GPIB, through a [`GpibConnector`] driver seam
//! - LAN, as a TCP/UDP client or a single-client TCP server
//! - RS232, in raw mode
//!
//! Sends and receives carry an explicit timeout. GPIB sessions additionally
//! watch the SRQ line and feed polled status bytes into an
//! [`SrqPipeline`](busprims_srq::SrqPipeline).
//!
//! A session opened in [`LinkMode::Offline`] touches no hardware at all,
//! which is how drivers run without a handler attached.

pub mod address;
pub mod config;
pub mod error;
pub mod framing;
pub mod gpib;
pub mod session;
pub mod sim;
pub mod timing;

#[cfg(unix)]
pub mod lan;
#[cfg(unix)]
mod readiness;
#[cfg(unix)]
pub mod rs232;

pub use address::{Interface, LanProtocol, LinkAddress, MAX_GPIB_ADDRESS};
pub use config::{
    FlowControl, GpibConfig, LinkConfig, LinkMode, Parity, SerialSettings, SIMULATION_ENV,
};
pub use error::{LinkError, Result};
pub use framing::Terminator;
pub use gpib::{
    EomAction, GpibBus, GpibConnector, GpibSession, PostSendContext, PostSendHook, SrqLine,
};
pub use session::{Link, LinkOpener, SendReport};
pub use sim::{SimInstrument, SimulatedGpib};
pub use timing::{BusOp, DelayCoordinator, DelayTable};

#[cfg(unix)]
pub use readiness::{wait_ready, Interest};
