use std::fmt;
use std::io;

use busprims_link::LinkError;
use busprims_txn::TxnError;

// Exit codes follow sysexits-style groupings.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn link_error(context: &str, err: LinkError) -> CliError {
    match err {
        LinkError::Io(source)
        | LinkError::Connect { source, .. }
        | LinkError::Open { source, .. } => io_error(context, source),
        LinkError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        LinkError::Address { .. }
        | LinkError::InvalidSetting(_)
        | LinkError::Unsupported { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        LinkError::MessageTooLong { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        LinkError::ConnectionClosed | LinkError::NotConnected => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        LinkError::Bus(_) | LinkError::Closed => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn txn_error(context: &str, err: TxnError) -> CliError {
    match err {
        TxnError::Link(err) => link_error(context, err),
        TxnError::Waiting => CliError::new(TIMEOUT, format!("{context}: {err}")),
        TxnError::Aborted => CliError::new(FAILURE, format!("{context}: {err}")),
        TxnError::UnexpectedSrq(_) | TxnError::Answer(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}
