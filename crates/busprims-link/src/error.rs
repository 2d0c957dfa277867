use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur on an instrument link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The symbolic address could not be parsed.
    #[error("invalid link address {address:?}: {reason}")]
    Address { address: String, reason: String },

    /// Failed to reach a LAN peer.
    #[error("failed to connect to {address}: {source}")]
    Connect { address: String, source: io::Error },

    /// Failed to open or configure a device node.
    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    /// The operation did not become ready within the timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An I/O error occurred on the link.
    #[error("link I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A LAN server session has no client yet.
    #[error("no client connected")]
    NotConnected,

    /// A received message exceeded the buffer limit before a terminator.
    #[error("message too long ({size} bytes, max {max})")]
    MessageTooLong { size: usize, max: usize },

    /// A serial or bus setting is outside the supported range.
    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    /// The operation does not exist for this kind of link.
    #[error("{operation} is not supported on {interface} links")]
    Unsupported {
        operation: &'static str,
        interface: &'static str,
    },

    /// The operating system ran out of memory or descriptors.
    #[error("resource exhausted: {0}")]
    Resource(io::Error),

    /// The GPIB driver reported a failure.
    #[error("gpib bus error: {0}")]
    Bus(String),

    /// The session was closed and may no longer be used.
    #[error("link closed")]
    Closed,
}

impl LinkError {
    /// Whether this is a timeout the caller may retry later.
    pub fn is_timeout(&self) -> bool {
        match self {
            LinkError::Timeout(_) => true,
            LinkError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Map an error from opening an OS resource, separating resource
    /// exhaustion from ordinary failures.
    pub(crate) fn open(path: impl Into<PathBuf>, source: io::Error) -> Self {
        if is_exhaustion(&source) {
            return LinkError::Resource(source);
        }
        LinkError::Open {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn connect(address: impl Into<String>, source: io::Error) -> Self {
        if is_exhaustion(&source) {
            return LinkError::Resource(source);
        }
        LinkError::Connect {
            address: address.into(),
            source,
        }
    }

    pub(crate) fn address(address: &str, reason: impl Into<String>) -> Self {
        LinkError::Address {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}

fn is_exhaustion(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(
            err.raw_os_error(),
            Some(libc::ENOMEM) | Some(libc::ENFILE) | Some(libc::EMFILE)
        )
    }

    #[cfg(not(unix))]
    {
        err.kind() == io::ErrorKind::OutOfMemory
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_classification() {
        assert!(LinkError::Timeout(Duration::from_millis(5)).is_timeout());
        assert!(LinkError::Io(io::Error::from(io::ErrorKind::TimedOut)).is_timeout());
        assert!(!LinkError::ConnectionClosed.is_timeout());
        assert!(!LinkError::Closed.is_timeout());
    }

    #[cfg(unix)]
    #[test]
    fn descriptor_exhaustion_maps_to_resource() {
        let err = LinkError::open("/dev/null", io::Error::from_raw_os_error(libc::EMFILE));
        assert!(matches!(err, LinkError::Resource(_)));

        let err = LinkError::open("/dev/null", io::Error::from_raw_os_error(libc::ENOENT));
        assert!(matches!(err, LinkError::Open { .. }));
    }
}
