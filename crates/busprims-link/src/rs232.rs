use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use serialport::{ClearBuffer, SerialPort as _, TTYPort};
use tracing::{debug, info};

use crate::config::{FlowControl, Parity, SerialSettings};
use crate::error::{LinkError, Result};
use crate::framing::{MessageBuffer, Terminator};
use crate::readiness::{read_message, write_timed};

/// Bound on the port's own read/write wait. Readiness is already checked
/// with `poll(2)` before every call, so this only covers a lost race.
const PORT_IO_TIMEOUT: Duration = Duration::from_millis(10);

/// An RS232 device in raw mode.
pub struct SerialPort {
    port: TTYPort,
    device: PathBuf,
    settings: SerialSettings,
    buffer: MessageBuffer,
}

impl SerialPort {
    /// Open `device` in raw mode and apply `settings`.
    pub fn open(
        device: &Path,
        settings: SerialSettings,
        terminator: Terminator,
        max_len: usize,
    ) -> Result<Self> {
        settings.validate()?;

        let port = serialport::new(device.to_string_lossy(), settings.baud_rate)
            .data_bits(data_bits(settings.data_bits))
            .stop_bits(stop_bits(settings.stop_bits))
            .parity(parity(settings.parity))
            .flow_control(flow_control(settings.flow_control))
            .timeout(PORT_IO_TIMEOUT)
            .open_native()
            .map_err(|err| LinkError::open(device, io::Error::from(err)))?;

        if matches!(settings.parity, Parity::Mark | Parity::Space) {
            stick_parity(&port, settings.parity).map_err(|err| match err {
                LinkError::Io(source) => LinkError::open(device, source),
                other => other,
            })?;
        }

        info!(
            device = %device.display(),
            baud = settings.baud_rate,
            "serial port opened"
        );

        Ok(Self {
            port,
            device: device.to_path_buf(),
            settings,
            buffer: MessageBuffer::new(terminator, max_len),
        })
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    pub fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        let fd = self.port.as_raw_fd();
        let port = &mut self.port;
        write_timed(fd, data, timeout, |buf| port.write(buf))
    }

    pub fn receive(&mut self, timeout: Duration) -> Result<Bytes> {
        let fd = self.port.as_raw_fd();
        let port = &mut self.port;
        read_message(fd, &mut self.buffer, timeout, |buf| port.read(buf))
    }

    /// Discard unread input and unsent output.
    pub fn flush_buffers(&mut self) -> Result<()> {
        self.buffer.clear();
        self.port
            .clear(ClearBuffer::All)
            .map_err(|err| LinkError::Io(err.into()))?;
        debug!(device = %self.device.display(), "serial buffers flushed");
        Ok(())
    }
}

impl std::fmt::Debug for SerialPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPort")
            .field("device", &self.device)
            .field("settings", &self.settings)
            .finish()
    }
}

fn data_bits(bits: u8) -> serialport::DataBits {
    match bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    }
}

fn stop_bits(bits: u8) -> serialport::StopBits {
    if bits == 2 {
        serialport::StopBits::Two
    } else {
        serialport::StopBits::One
    }
}

/// Mark and space parity are applied on top of the port afterwards.
fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::Even => serialport::Parity::Even,
        Parity::Odd => serialport::Parity::Odd,
        Parity::None | Parity::Mark | Parity::Space => serialport::Parity::None,
    }
}

fn flow_control(flow: FlowControl) -> serialport::FlowControl {
    match flow {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::XonXoff => serialport::FlowControl::Software,
        FlowControl::RtsCts => serialport::FlowControl::Hardware,
    }
}

/// Switch the line to mark or space parity (`CMSPAR`).
#[cfg(any(target_os = "linux", target_os = "android"))]
fn stick_parity(port: &TTYPort, parity: Parity) -> Result<()> {
    let fd = port.as_raw_fd();
    // SAFETY: termios is a plain C struct; all-zero is a valid bit pattern and
    // it is fully overwritten by tcgetattr below.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };

    // SAFETY: `fd` is owned by `port` and open; `tio` is valid and writable.
    if unsafe { libc::tcgetattr(fd, &mut tio) } != 0 {
        return Err(LinkError::Io(io::Error::last_os_error()));
    }
    tio.c_cflag |= libc::PARENB | libc::CMSPAR;
    if parity == Parity::Mark {
        tio.c_cflag |= libc::PARODD;
    } else {
        tio.c_cflag &= !libc::PARODD;
    }
    // SAFETY: `fd` is open and `tio` came from tcgetattr.
    if unsafe { libc::tcsetattr(fd, libc::TCSADRAIN, &tio) } != 0 {
        return Err(LinkError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn stick_parity(_port: &TTYPort, _parity: Parity) -> Result<()> {
    Err(LinkError::InvalidSetting(
        "mark/space parity is not available on this platform".to_string(),
    ))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::ffi::CStr;
    use std::fs::File;
    use std::os::fd::FromRawFd;

    use super::*;

    /// Open a pseudo-terminal pair; returns the master and the slave path.
    fn open_pty() -> (File, PathBuf) {
        // SAFETY: plain libc calls on a descriptor we own; the name buffer is
        // large enough for ptsname_r and NUL-terminated on success.
        unsafe {
            let master = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
            assert!(master >= 0, "posix_openpt failed");
            assert_eq!(libc::grantpt(master), 0);
            assert_eq!(libc::unlockpt(master), 0);
            let mut name = [0 as libc::c_char; 128];
            assert_eq!(libc::ptsname_r(master, name.as_mut_ptr(), name.len()), 0);
            let path = CStr::from_ptr(name.as_ptr()).to_string_lossy().into_owned();
            (File::from_raw_fd(master), PathBuf::from(path))
        }
    }

    #[test]
    fn raw_mode_round_trip_over_pty() {
        let (mut master, slave) = open_pty();
        let mut port = SerialPort::open(
            &slave,
            SerialSettings::default().with_baud_rate(19200),
            Terminator::default(),
            256,
        )
        .unwrap();

        master.write_all(b"READY\r\nEXTRA").unwrap();
        let msg = port.receive(Duration::from_secs(2)).unwrap();
        assert_eq!(msg.as_ref(), b"READY\r\n");

        port.send(b"START\n", Duration::from_secs(1)).unwrap();
        let mut buf = [0u8; 6];
        master.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"START\n");
    }

    #[test]
    fn receive_times_out_on_silent_line() {
        let (_master, slave) = open_pty();
        let mut port = SerialPort::open(
            &slave,
            SerialSettings::default(),
            Terminator::default(),
            256,
        )
        .unwrap();
        let err = port.receive(Duration::from_millis(30)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn invalid_settings_fail_before_open() {
        let err = SerialPort::open(
            Path::new("/nonexistent/tty"),
            SerialSettings::default().with_data_bits(9),
            Terminator::default(),
            256,
        )
        .unwrap_err();
        assert!(matches!(err, LinkError::InvalidSetting(_)));
    }

    #[test]
    fn missing_device_is_open_error() {
        let err = SerialPort::open(
            Path::new("/nonexistent/tty"),
            SerialSettings::default(),
            Terminator::default(),
            256,
        )
        .unwrap_err();
        assert!(matches!(err, LinkError::Open { .. }));
    }

    #[test]
    fn mark_parity_sets_stick_bits() {
        let (_master, slave) = open_pty();
        let port = SerialPort::open(
            &slave,
            SerialSettings::default()
                .with_parity(Parity::Mark)
                .with_data_bits(7),
            Terminator::default(),
            256,
        )
        .unwrap();

        // SAFETY: all-zero is a valid termios; tcgetattr overwrites it.
        let mut tio: libc::termios = unsafe { std::mem::zeroed() };
        // SAFETY: the descriptor is owned by `port` and open.
        let rc = unsafe { libc::tcgetattr(port.port.as_raw_fd(), &mut tio) };
        assert_eq!(rc, 0);
        assert_ne!(tio.c_cflag & libc::CMSPAR, 0);
        assert_ne!(tio.c_cflag & libc::PARODD, 0);
        assert_eq!(tio.c_cflag & libc::CSIZE, libc::CS7);
    }

    #[test]
    fn settings_map_onto_port_builder() {
        assert_eq!(data_bits(7), serialport::DataBits::Seven);
        assert_eq!(stop_bits(2), serialport::StopBits::Two);
        assert_eq!(parity(Parity::Space), serialport::Parity::None);
        assert_eq!(
            flow_control(FlowControl::XonXoff),
            serialport::FlowControl::Software
        );
    }
}
