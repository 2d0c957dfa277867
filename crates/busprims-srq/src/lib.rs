//! Service-request event pipeline.
//!
//! Instruments on a GPIB bus signal "I have something for you" by asserting
//! SRQ. The controller answers with a serial poll and receives a status byte.
//! This crate holds those status bytes between the moment they are polled
//! (usually on a background watcher thread) and the moment foreground code
//! asks for them:
//! - [`SrqPipeline`]: FIFO of pending status bytes with timed waits
//! - [`SrqProducer`]: the delivery side handed to the polling context
//! - callback bypass for specific status byte values
//!
//! Timeouts are not errors here. A wait that elapses returns
//! [`SrqWait::TimedOut`] and leaves the queue untouched.

pub mod callback;
pub mod pipeline;
pub mod status;

pub use callback::SrqCallback;
pub use pipeline::{Delivery, SrqPipeline, SrqProducer, SrqWait};
pub use status::{is_srq_asserted, SRQ_BIT};
