//! Driver primitives for GPIB, LAN and RS232 attached test handlers and
//! probers.
//!
//! # Crate Structure
//!
//! - [`srq`]: service-request event queue and callbacks
//! - [`link`]: timed send/receive sessions over GPIB, LAN and RS232
//! - [`txn`]: resumable step counters for re-entrant driver calls

/// Re-export SRQ pipeline types.
pub mod srq {
    pub use busprims_srq::*;
}

/// Re-export link types.
pub mod link {
    pub use busprims_link::*;
}

/// Re-export transaction types.
pub mod txn {
    pub use busprims_txn::*;
}
