//! Resumable transactions for handler and prober driver calls.
//!
//! A host scheduler calls a driver operation repeatedly instead of blocking
//! on it. [`Transaction`] remembers how many of the operation's steps
//! already completed so a repeated invocation picks up at the first
//! outstanding step. The [`steps`] module wraps single link operations in
//! that check.

pub mod error;
pub mod steps;
pub mod transaction;

pub use error::{Result, TxnError};
pub use steps::{
    clear_step, expect_srq_step, get_srq_step, receive_step, send_step, test_srq_step,
};
pub use transaction::{CallId, SrqHandler, StepGate, StepMark, StepRecord, Transaction};
