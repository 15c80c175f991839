//! Byte transports the framed protocol runs over.
//!
//! Callers above `frame` never know whether they talk to a raw TCP stream or
//! to one channel of a multiplexed connection.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::address::{HostAddress, Scheme};
use crate::error::{NetError, NetResult};
use crate::multichannel::MultichannelSocket;
use crate::protocol::{channel, CHANNEL_MAGIC, TCP_MAGIC};

/// A bidirectional byte channel with an expected frame magic.
pub trait Transport: Send {
    /// Fill `buf` completely or fail.
    fn receive(&mut self, buf: &mut [u8]) -> NetResult<()>;
    /// Write all of `buf` or fail.
    fn send(&mut self, buf: &[u8]) -> NetResult<()>;
    /// Magic that frames on this transport carry.
    fn magic(&self) -> u32;
    /// Close the underlying connection. Later calls fail.
    fn shutdown(&mut self) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn receive(&mut self, buf: &mut [u8]) -> NetResult<()> {
        (**self).receive(buf)
    }
    fn send(&mut self, buf: &[u8]) -> NetResult<()> {
        (**self).send(buf)
    }
    fn magic(&self) -> u32 {
        (**self).magic()
    }
    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}

/// Plain TCP stream transport.
pub struct TcpTransport {
    stream: TcpStream,
    magic: u32,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self::with_magic(stream, TCP_MAGIC)
    }

    pub fn with_magic(stream: TcpStream, magic: u32) -> Self {
        tune_socket(&stream);
        Self { stream, magic }
    }

    pub fn connect<A: ToSocketAddrs>(addr: A) -> NetResult<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self::new(stream))
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl Transport for TcpTransport {
    fn receive(&mut self, buf: &mut [u8]) -> NetResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(NetError::ConnectionClosed),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // One write call; a short write is a failure, not something to resume.
    // Surfaces broken connections immediately instead of masking them.
    fn send(&mut self, buf: &[u8]) -> NetResult<()> {
        let sent = self.stream.write(buf)?;
        if sent != buf.len() {
            debug!(sent, expected = buf.len(), "short write on tcp transport");
            return Err(NetError::ShortWrite {
                sent,
                expected: buf.len(),
            });
        }
        Ok(())
    }

    fn magic(&self) -> u32 {
        self.magic
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("tcp shutdown: {}", e);
        }
    }
}

// Disable Nagle; request/response traffic is latency bound
fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
}

/// One logical channel pair of a multiplexed connection.
pub struct MultichannelTransport {
    socket: Arc<MultichannelSocket>,
    send_channel: u32,
    receive_channel: u32,
}

impl MultichannelTransport {
    pub fn new(socket: Arc<MultichannelSocket>, send_channel: u32, receive_channel: u32) -> Self {
        debug_assert!(send_channel != channel::CONTROL && receive_channel != channel::CONTROL);
        Self {
            socket,
            send_channel,
            receive_channel,
        }
    }

    /// Main request/response channel in both directions.
    pub fn main(socket: Arc<MultichannelSocket>) -> Self {
        Self::new(socket, channel::MAIN, channel::MAIN)
    }
}

impl Transport for MultichannelTransport {
    fn receive(&mut self, buf: &mut [u8]) -> NetResult<()> {
        let bytes = self.socket.blocking_receive(self.receive_channel, buf.len())?;
        buf.copy_from_slice(&bytes);
        Ok(())
    }

    fn send(&mut self, buf: &[u8]) -> NetResult<()> {
        self.socket.send(self.send_channel, buf);
        Ok(())
    }

    fn magic(&self) -> u32 {
        CHANNEL_MAGIC
    }

    fn shutdown(&mut self) {
        self.socket.shutdown();
    }
}

/// Connect to the first reachable candidate. HTTP candidates are skipped.
pub fn connect_first(
    hosts: &[HostAddress],
    multichannel: bool,
    bandwidth_latency_product: u64,
) -> NetResult<(Box<dyn Transport>, HostAddress)> {
    for host in hosts {
        if host.scheme == Scheme::Http {
            warn!(%host, "http transport is not supported; skipping");
            continue;
        }
        let stream = match TcpStream::connect(host.socket_addr()) {
            Ok(s) => s,
            Err(e) => {
                warn!(%host, "connect failed: {}", e);
                continue;
            }
        };
        info!(%host, multichannel, "connected to cook server");
        let transport: Box<dyn Transport> = if multichannel {
            let socket =
                MultichannelSocket::with_bandwidth_latency_product(stream, bandwidth_latency_product)?;
            Box::new(MultichannelTransport::main(socket))
        } else {
            Box::new(TcpTransport::new(stream))
        };
        return Ok((transport, host.clone()));
    }
    Err(NetError::Handshake(format!(
        "no reachable cook server among {} candidate(s)",
        hosts.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn pair() -> (TcpTransport, TcpTransport) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = thread::spawn(move || listener.accept().unwrap().0);
        let client = TcpTransport::connect(addr).unwrap();
        let server = TcpTransport::new(accept.join().unwrap());
        (client, server)
    }

    #[test]
    fn receive_accumulates_partial_reads() {
        let (mut client, server) = pair();
        let mut raw = server.stream().try_clone().unwrap();
        let writer = thread::spawn(move || {
            for chunk in [&b"ab"[..], b"cde", b"f"] {
                raw.write_all(chunk).unwrap();
                raw.flush().unwrap();
                thread::sleep(std::time::Duration::from_millis(5));
            }
        });
        let mut buf = [0u8; 6];
        client.receive(&mut buf).unwrap();
        assert_eq!(&buf, b"abcdef");
        writer.join().unwrap();
    }

    #[test]
    fn receive_fails_when_peer_closes() {
        let (mut client, server) = pair();
        drop(server);
        let mut buf = [0u8; 4];
        assert!(matches!(
            client.receive(&mut buf),
            Err(NetError::ConnectionClosed) | Err(NetError::Io(_))
        ));
    }

    // Fail-fast send: exercised with small writes only. Large single writes on
    // sockets with tiny buffers may legitimately come back short and fail.
    #[test]
    fn send_writes_whole_small_buffer() {
        let (mut client, mut server) = pair();
        client.send(b"hello").unwrap();
        let mut buf = [0u8; 5];
        server.receive(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(client.magic(), TCP_MAGIC);
    }

    #[test]
    fn shutdown_fails_later_receives() {
        let (mut client, _server) = pair();
        client.shutdown();
        let mut buf = [0u8; 4];
        assert!(client.receive(&mut buf).is_err());
    }

    #[test]
    fn multichannel_transport_carries_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = thread::spawn(move || listener.accept().unwrap().0);
        let a = MultichannelSocket::new(TcpStream::connect(addr).unwrap()).unwrap();
        let b = MultichannelSocket::new(accept.join().unwrap()).unwrap();
        let mut ta = MultichannelTransport::main(a);
        let mut tb = MultichannelTransport::main(b);

        crate::frame::send(b"over the mux", &mut ta).unwrap();
        let got = crate::frame::receive(&mut tb).unwrap();
        assert_eq!(got.bytes, b"over the mux");
        assert_eq!(tb.magic(), CHANNEL_MAGIC);

        ta.shutdown();
        assert!(matches!(
            crate::frame::receive(&mut ta),
            Err(NetError::ConnectionClosed)
        ));
    }

    #[test]
    fn connect_first_skips_http_and_dead_hosts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // Reserve and release a port nobody listens on
        let dead = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let hosts = crate::address::parse_host_list(&format!(
            "http://127.0.0.1:{port}+127.0.0.1:{dead}+tcp://127.0.0.1:{port}"
        ));
        let (_transport, chosen) = connect_first(&hosts, false, 0).unwrap();
        assert_eq!(chosen.port, port);
        assert_eq!(chosen.scheme, Scheme::Tcp);

        let none = crate::address::parse_host_list(&format!("http://127.0.0.1:{port}"));
        assert!(matches!(connect_first(&none, false, 0), Err(NetError::Handshake(_))));
    }
}
