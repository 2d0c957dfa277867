use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

use crate::error::{LinkError, Result};
use crate::framing::MessageBuffer;

const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Readiness a caller waits for before touching a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn events(self) -> libc::c_short {
        match self {
            Interest::Readable => libc::POLLIN,
            Interest::Writable => libc::POLLOUT,
        }
    }
}

/// Convert a timeout to `poll(2)` milliseconds. Sub-millisecond remainders
/// round up so a non-zero timeout never turns into a non-blocking poll.
pub fn poll_timeout_ms(timeout: Duration) -> libc::c_int {
    let ms = timeout.as_micros().div_ceil(1_000);
    libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
}

/// Block until `fd` is ready for `interest` or `timeout` elapses.
///
/// Returns [`LinkError::Timeout`] when nothing happened in time. A hangup
/// without the requested readiness is reported as
/// [`LinkError::ConnectionClosed`].
pub fn wait_ready(fd: RawFd, interest: Interest, timeout: Duration) -> Result<()> {
    let deadline = Instant::now().checked_add(timeout);

    loop {
        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => timeout,
        };

        let mut pollfd = libc::pollfd {
            fd,
            events: interest.events(),
            revents: 0,
        };

        // SAFETY: `pollfd` is a valid, writable pollfd array of length 1 that
        // lives for the duration of the call.
        let rc = unsafe { libc::poll(&mut pollfd, 1, poll_timeout_ms(remaining)) };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(LinkError::Io(err));
        }

        if rc == 0 {
            return Err(LinkError::Timeout(timeout));
        }

        let revents = pollfd.revents;
        if revents & interest.events() != 0 {
            return Ok(());
        }
        if revents & libc::POLLNVAL != 0 {
            return Err(LinkError::Io(io::Error::from_raw_os_error(libc::EBADF)));
        }
        if revents & libc::POLLERR != 0 {
            return Err(LinkError::Io(io::Error::other(
                "descriptor reported POLLERR",
            )));
        }
        if revents & libc::POLLHUP != 0 {
            return Err(LinkError::ConnectionClosed);
        }
    }
}

/// Read from `fd` until `buffer` yields a complete message.
///
/// Each read is preceded by a readiness wait bounded by what is left of
/// `timeout`. A read of zero bytes means the peer closed the link.
pub(crate) fn read_message<F>(
    fd: RawFd,
    buffer: &mut MessageBuffer,
    timeout: Duration,
    mut read: F,
) -> Result<Bytes>
where
    F: FnMut(&mut [u8]) -> io::Result<usize>,
{
    let deadline = Instant::now().checked_add(timeout);

    loop {
        if let Some(message) = buffer.take_message()? {
            return Ok(message);
        }

        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => timeout,
        };
        wait_ready(fd, Interest::Readable, remaining).map_err(|err| match err {
            LinkError::Timeout(_) => LinkError::Timeout(timeout),
            other => other,
        })?;

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let read = match read(&mut chunk) {
            Ok(n) => n,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) =>
            {
                continue
            }
            Err(err) => return Err(LinkError::Io(err)),
        };

        if read == 0 {
            return Err(LinkError::ConnectionClosed);
        }

        trace!(read, pending = buffer.pending(), "link read");
        buffer.extend(&chunk[..read]);
    }
}

/// Write `data` to `fd`, waiting for writability before every chunk.
///
/// Returns the number of bytes written. That is less than `data.len()` only
/// when the timeout expired after part of the message went out. A timeout
/// before the first byte is [`LinkError::Timeout`].
pub(crate) fn write_timed<F>(
    fd: RawFd,
    data: &[u8],
    timeout: Duration,
    mut write: F,
) -> Result<usize>
where
    F: FnMut(&[u8]) -> io::Result<usize>,
{
    let deadline = Instant::now().checked_add(timeout);
    let mut written = 0usize;

    while written < data.len() {
        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => timeout,
        };
        match wait_ready(fd, Interest::Writable, remaining) {
            Ok(()) => {}
            Err(LinkError::Timeout(_)) if written > 0 => return Ok(written),
            Err(LinkError::Timeout(_)) => return Err(LinkError::Timeout(timeout)),
            Err(err) => return Err(err),
        }

        match write(&data[written..]) {
            Ok(0) => return Err(LinkError::ConnectionClosed),
            Ok(n) => written += n,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => {}
            Err(err) => return Err(LinkError::Io(err)),
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn timeout_conversion_rounds_up() {
        assert_eq!(poll_timeout_ms(Duration::ZERO), 0);
        assert_eq!(poll_timeout_ms(Duration::from_micros(1)), 1);
        assert_eq!(poll_timeout_ms(Duration::from_micros(1_500)), 2);
        assert_eq!(poll_timeout_ms(Duration::from_secs(2)), 2_000);
        assert_eq!(poll_timeout_ms(Duration::MAX), libc::c_int::MAX);
    }

    #[test]
    fn readable_times_out_without_data() {
        let (left, _right) = UnixStream::pair().unwrap();
        let started = Instant::now();
        let timeout = Duration::from_millis(30);
        let err = wait_ready(left.as_raw_fd(), Interest::Readable, timeout).unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn readable_once_peer_writes() {
        let (left, mut right) = UnixStream::pair().unwrap();
        right.write_all(b"x").unwrap();
        wait_ready(left.as_raw_fd(), Interest::Readable, Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn read_message_collects_across_reads() {
        use std::io::Read;

        use crate::framing::Terminator;

        let (mut left, mut right) = UnixStream::pair().unwrap();
        let writer = std::thread::spawn(move || {
            right.write_all(b"PART").unwrap();
            std::thread::sleep(Duration::from_millis(20));
            right.write_all(b"IAL\r\nNEXT").unwrap();
            right
        });

        let fd = left.as_raw_fd();
        let mut buffer = MessageBuffer::new(Terminator::default(), 128);
        let timeout = Duration::from_secs(2);
        let message = read_message(fd, &mut buffer, timeout, |buf| left.read(buf)).unwrap();
        assert_eq!(message.as_ref(), b"PARTIAL\r\n");
        let _right = writer.join().unwrap();
        assert_eq!(buffer.pending(), 4);
    }

    #[test]
    fn read_message_reports_peer_close() {
        use std::io::Read;

        use crate::framing::Terminator;

        let (mut left, right) = UnixStream::pair().unwrap();
        drop(right);
        let fd = left.as_raw_fd();
        let mut buffer = MessageBuffer::new(Terminator::default(), 128);
        let timeout = Duration::from_secs(1);
        let err = read_message(fd, &mut buffer, timeout, |buf| left.read(buf)).unwrap_err();
        assert!(matches!(err, LinkError::ConnectionClosed));
    }

    #[test]
    fn write_timed_writes_everything() {
        use std::io::Read;

        let (mut left, mut right) = UnixStream::pair().unwrap();
        let fd = left.as_raw_fd();
        let written =
            write_timed(fd, b"hello", Duration::from_secs(1), |buf| left.write(buf)).unwrap();
        assert_eq!(written, 5);

        let mut out = [0u8; 5];
        right.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn fresh_socket_is_writable() {
        let (left, _right) = UnixStream::pair().unwrap();
        wait_ready(left.as_raw_fd(), Interest::Writable, Duration::ZERO).unwrap();
    }
}
