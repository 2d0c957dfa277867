use std::path::{Path, PathBuf};
use std::time::Duration;

use busprims_link::{Link, LinkConfig, LinkMode, LinkOpener};
use clap::{Args, Subcommand, ValueEnum};

use crate::exit::{io_error, link_error, CliError, CliResult, DATA_INVALID, USAGE};
use crate::output::OutputFormat;

pub mod doctor;
pub mod envinfo;
pub mod receive;
pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one message over a link.
    Send(SendArgs),
    /// Receive and print messages from a link.
    Receive(ReceiveArgs),
    /// Listen on a LAN port for a handler and print what it sends.
    Serve(ServeArgs),
    /// Show version information.
    Version(VersionArgs),
    /// Run local environment and link self-checks.
    Doctor(DoctorArgs),
    /// Print build and environment diagnostics.
    Envinfo(EnvinfoArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Send(args) => send::run(args, format),
        Command::Receive(args) => receive::run(args, format),
        Command::Serve(args) => serve::run(args, format),
        Command::Version(args) => version::run(args),
        Command::Doctor(args) => doctor::run(args, format),
        Command::Envinfo(args) => envinfo::run(args, format),
    }
}

/// Options shared by every command that opens a link.
#[derive(Args, Debug)]
pub struct LinkArgs {
    /// Link address: tcp/<host>/<port>, udp/<host>/<port>, server/<port>,
    /// rs232/<device>, gpib/<card>/<address>.
    pub address: String,
    /// JSON link configuration file.
    #[arg(long, value_name = "FILE", env = "BUSPRIMS_CONFIG")]
    pub config: Option<PathBuf>,
    /// Link mode, overriding the configuration file.
    #[arg(long, value_name = "MODE")]
    pub mode: Option<LinkMode>,
    /// I/O timeout per operation (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

impl LinkArgs {
    pub fn open(&self) -> CliResult<Link> {
        let mut config = load_config(self.config.as_deref())?;
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        LinkOpener::new(config)
            .open_str(&self.address)
            .map_err(|err| link_error("open failed", err))
    }

    pub fn timeout(&self) -> CliResult<Duration> {
        parse_duration(&self.timeout)
    }
}

/// Line ending appended to outgoing messages.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Eol {
    None,
    #[default]
    Lf,
    Crlf,
}

impl Eol {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Eol::None => b"",
            Eol::Lf => b"\n",
            Eol::Crlf => b"\r\n",
        }
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub link: LinkArgs,
    /// Message text.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read the message from a file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Line ending appended to the message.
    #[arg(long, value_enum, default_value_t = Eol::Lf)]
    pub eol: Eol,
    /// Wait for one reply and print it.
    #[arg(long)]
    pub wait: bool,
}

#[derive(Args, Debug)]
pub struct ReceiveArgs {
    #[command(flatten)]
    pub link: LinkArgs,
    /// Number of messages to receive.
    #[arg(long, default_value = "1")]
    pub count: usize,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// TCP port to listen on.
    #[arg(long)]
    pub port: u16,
    /// JSON link configuration file.
    #[arg(long, value_name = "FILE", env = "BUSPRIMS_CONFIG")]
    pub config: Option<PathBuf>,
    /// Send every received message back to the handler.
    #[arg(long)]
    pub echo: bool,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug, Default)]
pub struct DoctorArgs {
    /// Also validate this JSON link configuration file.
    #[arg(long, value_name = "FILE", env = "BUSPRIMS_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Default)]
pub struct EnvinfoArgs {}

/// Read a JSON link configuration. Missing fields take their defaults.
pub fn load_config(path: Option<&Path>) -> CliResult<LinkConfig> {
    let Some(path) = path else {
        return Ok(LinkConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
    let config: LinkConfig = serde_json::from_str(&text).map_err(|err| {
        CliError::new(
            DATA_INVALID,
            format!("invalid link config {}: {err}", path.display()),
        )
    })?;
    config
        .serial
        .validate()
        .map_err(|err| link_error(&format!("invalid link config {}", path.display()), err))?;
    Ok(config)
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
