use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Highest valid GPIB primary address.
pub const MAX_GPIB_ADDRESS: u8 = 30;

/// Kind of physical link behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Interface {
    Gpib,
    Lan,
    LanServer,
    Rs232,
}

impl Interface {
    pub fn as_str(self) -> &'static str {
        match self {
            Interface::Gpib => "gpib",
            Interface::Lan => "lan",
            Interface::LanServer => "lan-server",
            Interface::Rs232 => "rs232",
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanProtocol {
    Tcp,
    Udp,
}

impl LanProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            LanProtocol::Tcp => "tcp",
            LanProtocol::Udp => "udp",
        }
    }
}

/// Parsed symbolic link address.
///
/// Accepted forms:
/// ```text
/// tcp/<host>/<port>        LAN client, stream socket
/// udp/<host>/<port>        LAN client, datagram socket
/// server/<port>            LAN server waiting for one handler connection
/// rs232/<device path>      serial line, e.g. rs232/dev/ttyS0
/// gpib/<card>/<address>    GPIB instrument, e.g. gpib/hpib/7
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkAddress {
    Lan {
        protocol: LanProtocol,
        host: String,
        port: u16,
    },
    Server {
        port: u16,
    },
    Rs232 {
        device: PathBuf,
    },
    Gpib {
        card: String,
        address: u8,
    },
}

impl LinkAddress {
    pub fn interface(&self) -> Interface {
        match self {
            LinkAddress::Lan { .. } => Interface::Lan,
            LinkAddress::Server { .. } => Interface::LanServer,
            LinkAddress::Rs232 { .. } => Interface::Rs232,
            LinkAddress::Gpib { .. } => Interface::Gpib,
        }
    }
}

impl FromStr for LinkAddress {
    type Err = LinkError;

    fn from_str(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let (kind, rest) = trimmed
            .split_once('/')
            .ok_or_else(|| LinkError::address(input, "expected <kind>/<target>"))?;

        match kind.to_ascii_lowercase().as_str() {
            "tcp" | "udp" => {
                let protocol = if kind.eq_ignore_ascii_case("tcp") {
                    LanProtocol::Tcp
                } else {
                    LanProtocol::Udp
                };
                let (host, port) = rest
                    .split_once('/')
                    .ok_or_else(|| LinkError::address(input, "expected <host>/<port>"))?;
                if host.is_empty() {
                    return Err(LinkError::address(input, "missing host"));
                }
                let port = parse_port(input, port)?;
                if port == 0 {
                    return Err(LinkError::address(input, "port 0 is not connectable"));
                }
                Ok(LinkAddress::Lan {
                    protocol,
                    host: host.to_string(),
                    port,
                })
            }
            "server" => Ok(LinkAddress::Server {
                port: parse_port(input, rest)?,
            }),
            "rs232" => {
                if rest.is_empty() {
                    return Err(LinkError::address(input, "missing device path"));
                }
                Ok(LinkAddress::Rs232 {
                    device: PathBuf::from(format!("/{rest}")),
                })
            }
            "gpib" => {
                let (card, address) = rest
                    .split_once('/')
                    .ok_or_else(|| LinkError::address(input, "expected <card>/<address>"))?;
                if card.is_empty() {
                    return Err(LinkError::address(input, "missing interface card"));
                }
                let address: u8 = address
                    .parse()
                    .map_err(|_| LinkError::address(input, "invalid gpib address"))?;
                if address > MAX_GPIB_ADDRESS {
                    return Err(LinkError::address(
                        input,
                        format!("gpib address must be 0..={MAX_GPIB_ADDRESS}"),
                    ));
                }
                Ok(LinkAddress::Gpib {
                    card: card.to_string(),
                    address,
                })
            }
            other => Err(LinkError::address(
                input,
                format!("unknown link kind {other:?}"),
            )),
        }
    }
}

fn parse_port(input: &str, port: &str) -> Result<u16> {
    if port.is_empty() {
        return Err(LinkError::address(input, "missing port"));
    }
    port.parse()
        .map_err(|_| LinkError::address(input, format!("invalid port {port:?}")))
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkAddress::Lan {
                protocol,
                host,
                port,
            } => write!(f, "{}/{host}/{port}", protocol.as_str()),
            LinkAddress::Server { port } => write!(f, "server/{port}"),
            LinkAddress::Rs232 { device } => {
                let device = device.display().to_string();
                write!(f, "rs232/{}", device.trim_start_matches('/'))
            }
            LinkAddress::Gpib { card, address } => write!(f, "gpib/{card}/{address}"),
        }
    }
}
