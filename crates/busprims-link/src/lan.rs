use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::AsRawFd;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use crate::address::LanProtocol;
use crate::error::{LinkError, Result};
use crate::framing::{MessageBuffer, Terminator};
use crate::readiness::{read_message, wait_ready, write_timed, Interest};

enum LanSocket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// Client connection to a handler's LAN port.
pub struct LanClient {
    socket: LanSocket,
    peer: SocketAddr,
    buffer: MessageBuffer,
}

impl LanClient {
    /// Resolve `host:port` and connect. Datagram sockets are bound to an
    /// ephemeral port and associated with the peer.
    pub fn connect(
        protocol: LanProtocol,
        host: &str,
        port: u16,
        terminator: Terminator,
        max_len: usize,
    ) -> Result<Self> {
        let display = format!("{}/{host}/{port}", protocol.as_str());
        let peer = (host, port)
            .to_socket_addrs()
            .map_err(|err| LinkError::connect(&display, err))?
            .next()
            .ok_or_else(|| {
                LinkError::connect(
                    &display,
                    io::Error::new(io::ErrorKind::NotFound, "host resolved to no address"),
                )
            })?;

        let socket = match protocol {
            LanProtocol::Tcp => {
                let stream =
                    TcpStream::connect(peer).map_err(|err| LinkError::connect(&display, err))?;
                stream.set_nodelay(true)?;
                stream.set_nonblocking(true)?;
                LanSocket::Tcp(stream)
            }
            LanProtocol::Udp => {
                let local: SocketAddr = if peer.is_ipv4() {
                    SocketAddr::from(([0, 0, 0, 0], 0))
                } else {
                    SocketAddr::from(([0u16; 8], 0))
                };
                let socket =
                    UdpSocket::bind(local).map_err(|err| LinkError::connect(&display, err))?;
                socket
                    .connect(peer)
                    .map_err(|err| LinkError::connect(&display, err))?;
                socket.set_nonblocking(true)?;
                LanSocket::Udp(socket)
            }
        };

        info!(%peer, protocol = protocol.as_str(), "connected to lan peer");

        Ok(Self {
            socket,
            peer,
            buffer: MessageBuffer::new(terminator, max_len),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn protocol(&self) -> LanProtocol {
        match self.socket {
            LanSocket::Tcp(_) => LanProtocol::Tcp,
            LanSocket::Udp(_) => LanProtocol::Udp,
        }
    }

    pub fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        match &mut self.socket {
            LanSocket::Tcp(stream) => {
                let fd = stream.as_raw_fd();
                write_timed(fd, data, timeout, |buf| stream.write(buf))
            }
            LanSocket::Udp(socket) => {
                wait_ready(socket.as_raw_fd(), Interest::Writable, timeout)?;
                Ok(socket.send(data)?)
            }
        }
    }

    pub fn receive(&mut self, timeout: Duration) -> Result<Bytes> {
        match &mut self.socket {
            LanSocket::Tcp(stream) => {
                let fd = stream.as_raw_fd();
                read_message(fd, &mut self.buffer, timeout, |buf| stream.read(buf))
            }
            LanSocket::Udp(socket) => {
                let fd = socket.as_raw_fd();
                read_message(fd, &mut self.buffer, timeout, |buf| {
                    // An empty datagram is not end-of-stream.
                    match socket.recv(buf)? {
                        0 => Err(io::ErrorKind::WouldBlock.into()),
                        n => Ok(n),
                    }
                })
            }
        }
    }

    pub fn shutdown(&mut self) {
        if let LanSocket::Tcp(stream) = &self.socket {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        debug!(peer = %self.peer, "lan client closed");
    }
}

impl std::fmt::Debug for LanClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanClient")
            .field("protocol", &self.protocol().as_str())
            .field("peer", &self.peer)
            .finish()
    }
}

/// Listening endpoint that serves a single handler connection.
pub struct LanServer {
    listener: TcpListener,
    client: Option<(TcpStream, SocketAddr)>,
    buffer: MessageBuffer,
}

impl LanServer {
    /// Bind and listen on all interfaces. Port 0 picks an ephemeral port.
    pub fn bind(port: u16, terminator: Terminator, max_len: usize) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|err| LinkError::connect(format!("server/{port}"), err))?;
        listener.set_nonblocking(true)?;
        info!(port = listener.local_addr()?.port(), "lan server listening");

        Ok(Self {
            listener,
            client: None,
            buffer: MessageBuffer::new(terminator, max_len),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client.as_ref().map(|(_, addr)| *addr)
    }

    /// Wait up to `timeout` for a client. A new client replaces the
    /// current one.
    pub fn accept(&mut self, timeout: Duration) -> Result<SocketAddr> {
        loop {
            wait_ready(self.listener.as_raw_fd(), Interest::Readable, timeout)?;
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nodelay(true)?;
                    stream.set_nonblocking(true)?;
                    self.buffer.clear();
                    self.client = Some((stream, addr));
                    info!(%addr, "accepted handler connection");
                    return Ok(addr);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(LinkError::Io(err)),
            }
        }
    }

    pub fn send(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        let (stream, _) = self.client.as_mut().ok_or(LinkError::NotConnected)?;
        let fd = stream.as_raw_fd();
        write_timed(fd, data, timeout, |buf| stream.write(buf))
    }

    /// Receive from the connected client. The client is dropped when it
    /// closes the connection.
    pub fn receive(&mut self, timeout: Duration) -> Result<Bytes> {
        let (stream, addr) = self.client.as_mut().ok_or(LinkError::NotConnected)?;
        let fd = stream.as_raw_fd();
        let result = read_message(fd, &mut self.buffer, timeout, |buf| stream.read(buf));
        if matches!(result, Err(LinkError::ConnectionClosed)) {
            info!(%addr, "handler disconnected");
            self.client = None;
        }
        result
    }

    pub fn disconnect(&mut self) {
        if let Some((stream, addr)) = self.client.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!(%addr, "handler connection closed");
        }
    }
}

impl std::fmt::Debug for LanServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanServer")
            .field("local", &self.listener.local_addr().ok())
            .field("client", &self.client_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn tcp_client_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            let n = peer.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"STATUS?\n");
            peer.write_all(b"READY\r\n").unwrap();
        });

        let mut client = LanClient::connect(
            LanProtocol::Tcp,
            "127.0.0.1",
            port,
            Terminator::default(),
            1024,
        )
        .unwrap();
        assert_eq!(
            client.send(b"STATUS?\n", Duration::from_secs(1)).unwrap(),
            8
        );
        let reply = client.receive(Duration::from_secs(2)).unwrap();
        assert_eq!(reply.as_ref(), b"READY\r\n");
        handle.join().unwrap();
    }

    #[test]
    fn tcp_receive_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut client = LanClient::connect(
            LanProtocol::Tcp,
            "127.0.0.1",
            port,
            Terminator::default(),
            1024,
        )
        .unwrap();
        let _peer = listener.accept().unwrap();

        let err = client.receive(Duration::from_millis(30)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn tcp_peer_close_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut client = LanClient::connect(
            LanProtocol::Tcp,
            "127.0.0.1",
            port,
            Terminator::default(),
            1024,
        )
        .unwrap();
        let (peer, _) = listener.accept().unwrap();
        drop(peer);

        let err = client.receive(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, LinkError::ConnectionClosed));
    }

    #[test]
    fn connect_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = LanClient::connect(
            LanProtocol::Tcp,
            "127.0.0.1",
            port,
            Terminator::default(),
            1024,
        )
        .unwrap_err();
        assert!(matches!(err, LinkError::Connect { .. }));
    }

    #[test]
    fn udp_client_round_trip() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = peer.local_addr().unwrap().port();
        let mut client = LanClient::connect(
            LanProtocol::Udp,
            "127.0.0.1",
            port,
            Terminator::none(),
            1024,
        )
        .unwrap();

        client.send(b"PING", Duration::from_secs(1)).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"PING");

        peer.send_to(b"PONG", from).unwrap();
        let reply = client.receive(Duration::from_secs(2)).unwrap();
        assert_eq!(reply.as_ref(), b"PONG");
    }

    #[test]
    fn server_accepts_single_client() {
        let mut server = LanServer::bind(0, Terminator::default(), 1024).unwrap();
        let port = server.local_addr().unwrap().port();
        assert!(matches!(
            server.send(b"x", Duration::ZERO),
            Err(LinkError::NotConnected)
        ));

        let handle = thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream.write_all(b"LOTSTART\n").unwrap();
            let mut buf = [0u8; 8];
            let n = stream.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"ACK\n");
        });

        server.accept(Duration::from_secs(2)).unwrap();
        assert!(server.is_connected());
        let msg = server.receive(Duration::from_secs(2)).unwrap();
        assert_eq!(msg.as_ref(), b"LOTSTART\n");
        server.send(b"ACK\n", Duration::from_secs(1)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn server_accept_times_out_without_client() {
        let mut server = LanServer::bind(0, Terminator::default(), 1024).unwrap();
        let err = server.accept(Duration::from_millis(20)).unwrap_err();
        assert!(err.is_timeout());
        assert!(!server.is_connected());
    }
}
