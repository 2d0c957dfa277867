use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};
use crate::framing::Terminator;
use crate::gpib::EomAction;
use crate::timing::DelayTable;

/// Environment flag that switches online sessions to simulator timing.
pub const SIMULATION_ENV: &str = "BUSPRIMS_SIMULATION";

/// Default receive buffer limit, matching the largest handler message.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 10 * 1024;

/// How a session talks to the outside world.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Real I/O.
    #[default]
    Online,
    /// No I/O at all. Every operation succeeds trivially.
    Offline,
    /// Real I/O against a timing-sensitive simulator.
    Simulation,
}

impl LinkMode {
    /// Resolve the mode a session actually runs in, honouring
    /// [`SIMULATION_ENV`] for online sessions.
    pub fn effective(self) -> Self {
        self.with_simulation_flag(std::env::var(SIMULATION_ENV).ok().as_deref())
    }

    /// Apply a value of [`SIMULATION_ENV`]. Only online sessions switch.
    pub fn with_simulation_flag(self, flag: Option<&str>) -> Self {
        match self {
            LinkMode::Online if flag.is_some_and(flag_set) => LinkMode::Simulation,
            other => other,
        }
    }

    pub fn performs_io(self) -> bool {
        !matches!(self, LinkMode::Offline)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkMode::Online => "online",
            LinkMode::Offline => "offline",
            LinkMode::Simulation => "simulation",
        }
    }
}

fn flag_set(value: &str) -> bool {
    !matches!(value.trim(), "" | "0" | "false" | "no")
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkMode {
    type Err = LinkError;

    fn from_str(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(LinkMode::Online),
            "offline" => Ok(LinkMode::Offline),
            "simulation" | "sim" => Ok(LinkMode::Simulation),
            other => Err(LinkError::InvalidSetting(format!(
                "unknown link mode {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    #[default]
    None,
    XonXoff,
    RtsCts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
    Mark,
    Space,
}

/// Line settings applied to an RS232 device on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    pub flow_control: FlowControl,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialSettings {
    pub const SUPPORTED_BAUD_RATES: [u32; 19] = [
        0, 50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600,
        115200, 230400,
    ];

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    pub fn with_data_bits(mut self, data_bits: u8) -> Self {
        self.data_bits = data_bits;
        self
    }

    pub fn with_stop_bits(mut self, stop_bits: u8) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    /// Reject settings the line discipline cannot express.
    pub fn validate(&self) -> Result<()> {
        if !Self::SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            return Err(LinkError::InvalidSetting(format!(
                "unsupported baud rate {}",
                self.baud_rate
            )));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(LinkError::InvalidSetting(format!(
                "data bits must be 5..=8, got {}",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(LinkError::InvalidSetting(format!(
                "stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        Ok(())
    }
}

/// GPIB session parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpibConfig {
    /// Bus-level I/O timeout programmed into the driver.
    pub io_timeout_us: u64,
    /// Read termination character, if any.
    pub term_char: Option<u8>,
    /// Extra bus action after every send.
    pub eom_action: EomAction,
    /// Pause between close and open during a reopen.
    pub reopen_settle_us: u64,
    /// Granularity of the SRQ watcher's line wait.
    pub srq_watch_interval_us: u64,
}

impl Default for GpibConfig {
    fn default() -> Self {
        Self {
            io_timeout_us: 5_000_000,
            term_char: Some(b'\n'),
            eom_action: EomAction::None,
            reopen_settle_us: 1_000_000,
            srq_watch_interval_us: 50_000,
        }
    }
}

impl GpibConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_micros(self.io_timeout_us)
    }

    pub fn reopen_settle(&self) -> Duration {
        Duration::from_micros(self.reopen_settle_us)
    }

    pub fn srq_watch_interval(&self) -> Duration {
        Duration::from_micros(self.srq_watch_interval_us.max(1_000))
    }
}

/// Everything needed to open a session besides its address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub mode: LinkMode,
    pub terminator: Terminator,
    pub max_message_len: usize,
    pub serial: SerialSettings,
    pub gpib: GpibConfig,
    /// How long a LAN server waits for its single client when opened.
    pub accept_timeout_us: u64,
    pub delays: DelayTable,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mode: LinkMode::Online,
            terminator: Terminator::default(),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            serial: SerialSettings::default(),
            gpib: GpibConfig::default(),
            accept_timeout_us: 4_000_000,
            delays: DelayTable::default(),
        }
    }
}

impl LinkConfig {
    pub fn with_mode(mut self, mode: LinkMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn with_serial(mut self, serial: SerialSettings) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_gpib(mut self, gpib: GpibConfig) -> Self {
        self.gpib = gpib;
        self
    }

    pub fn with_eom_action(mut self, action: EomAction) -> Self {
        self.gpib.eom_action = action;
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout_us = duration_to_us(timeout);
        self
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_micros(self.accept_timeout_us)
    }
}

/// Convert to whole microseconds, saturating.
pub fn duration_to_us(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
