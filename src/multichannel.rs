//! One TCP connection split into independent logical channels.
//!
//! Each packet on the raw socket is a framed message whose payload is
//! `magic | channel | len | bytes`. Channel 0 carries acknowledgements: the
//! peer's running total of received data bytes. The sender never gets more
//! than `bandwidth_latency_product` bytes ahead of what the peer acknowledged.
//!
//! Two threads per socket: a receiver that demultiplexes into per-channel
//! buffers and acks every data packet, and a sender that drains the
//! lowest-numbered channel with pending bytes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::archive::{PayloadReader, PayloadWriter};
use crate::error::{NetError, NetResult};
use crate::frame;
use crate::protocol::{channel, multiplex, MULTIPLEX_MAGIC};
use crate::transport::TcpTransport;

#[derive(Default)]
struct ChannelBuffer {
    data: VecDeque<u8>,
    // Bytes the single blocked receiver is waiting for
    waiting_for: Option<usize>,
    ready: Arc<Condvar>,
}

#[derive(Default)]
struct ReceiveState {
    channels: HashMap<u32, ChannelBuffer>,
    total_received: u64,
    closed: bool,
}

#[derive(Default)]
struct SendState {
    pending: BTreeMap<u32, VecDeque<u8>>,
    bytes_sent: u64,
    peer_acked: u64,
    closed: bool,
}

impl SendState {
    /// Next packet the flow control allows, lowest channel first.
    fn next_sendable(&mut self, bandwidth_latency_product: u64) -> Option<(u32, Vec<u8>)> {
        let SendState {
            pending,
            bytes_sent,
            peer_acked,
            ..
        } = self;
        for (&ch, buf) in pending.iter_mut() {
            if buf.is_empty() {
                continue;
            }
            let n = buf.len().min(multiplex::MAX_PACKET);
            let ok_to_send =
                ch == channel::CONTROL || *bytes_sent + (n as u64) < *peer_acked + bandwidth_latency_product;
            if !ok_to_send {
                continue;
            }
            let chunk: Vec<u8> = buf.drain(..n).collect();
            if ch != channel::CONTROL {
                *bytes_sent += n as u64;
            }
            return Some((ch, chunk));
        }
        None
    }
}

struct Shared {
    stream: TcpStream,
    receive: Mutex<ReceiveState>,
    send: Mutex<SendState>,
    send_ready: Condvar,
    bandwidth_latency_product: u64,
}

impl Shared {
    fn enqueue(&self, ch: u32, bytes: &[u8]) {
        let mut st = self.send.lock();
        if st.closed {
            return;
        }
        st.pending.entry(ch).or_default().extend(bytes);
        self.send_ready.notify_one();
    }

    fn on_ack(&self, acked: u64) {
        let mut st = self.send.lock();
        if acked > st.peer_acked {
            st.peer_acked = acked;
        }
        self.send_ready.notify_one();
    }

    fn close(&self) {
        {
            let mut st = self.receive.lock();
            if !st.closed {
                st.closed = true;
                for buf in st.channels.values() {
                    buf.ready.notify_all();
                }
            }
        }
        {
            let mut st = self.send.lock();
            st.closed = true;
            self.send_ready.notify_all();
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn is_closed(&self) -> bool {
        self.receive.lock().closed
    }
}

/// Multiplexed socket. Dropping it shuts the connection down and joins both threads.
pub struct MultichannelSocket {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MultichannelSocket {
    pub fn new(stream: TcpStream) -> NetResult<Arc<Self>> {
        Self::with_bandwidth_latency_product(stream, multiplex::DEFAULT_BANDWIDTH_LATENCY_PRODUCT)
    }

    pub fn with_bandwidth_latency_product(
        stream: TcpStream,
        bandwidth_latency_product: u64,
    ) -> NetResult<Arc<Self>> {
        // A product below one packet would stall the sender forever
        let bandwidth_latency_product =
            bandwidth_latency_product.max(multiplex::MAX_PACKET as u64 + 1);
        let reader = TcpTransport::with_magic(stream.try_clone()?, MULTIPLEX_MAGIC);
        let writer = TcpTransport::with_magic(stream.try_clone()?, MULTIPLEX_MAGIC);
        let shared = Arc::new(Shared {
            stream,
            receive: Mutex::new(ReceiveState::default()),
            send: Mutex::new(SendState::default()),
            send_ready: Condvar::new(),
            bandwidth_latency_product,
        });

        let recv_shared = shared.clone();
        let receiver = thread::Builder::new()
            .name("cookfs-mux-recv".into())
            .spawn(move || receive_loop(recv_shared, reader))?;
        let send_shared = shared.clone();
        let sender = thread::Builder::new()
            .name("cookfs-mux-send".into())
            .spawn(move || send_loop(send_shared, writer))?;

        Ok(Arc::new(Self {
            shared,
            threads: Mutex::new(vec![receiver, sender]),
        }))
    }

    /// Block until `count` bytes are buffered on `ch`, then take exactly those.
    /// Only one thread may wait on a channel at a time.
    pub fn blocking_receive(&self, ch: u32, count: usize) -> NetResult<Vec<u8>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut st = self.shared.receive.lock();
        let ready = {
            let buf = st.channels.entry(ch).or_default();
            if buf.data.len() >= count {
                return Ok(buf.data.drain(..count).collect());
            }
            if buf.waiting_for.is_some() {
                return Err(NetError::ConcurrentReceive(ch));
            }
            buf.waiting_for = Some(count);
            buf.ready.clone()
        };

        while !st.closed && st.channels.get(&ch).map_or(0, |b| b.data.len()) < count {
            ready.wait(&mut st);
        }

        let closed = st.closed;
        let buf = st.channels.entry(ch).or_default();
        buf.waiting_for = None;
        if buf.data.len() < count {
            debug_assert!(closed);
            return Err(NetError::ConnectionClosed);
        }
        Ok(buf.data.drain(..count).collect())
    }

    /// Queue bytes on a data channel. Never blocks on the network.
    pub fn send(&self, ch: u32, bytes: &[u8]) {
        debug_assert!(ch != channel::CONTROL, "channel 0 is reserved for acks");
        self.shared.enqueue(ch, bytes);
    }

    /// Data bytes handed to the socket so far.
    pub fn bytes_sent(&self) -> u64 {
        self.shared.send.lock().bytes_sent
    }

    /// Data bytes received so far.
    pub fn bytes_received(&self) -> u64 {
        self.shared.receive.lock().total_received
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Close the connection; blocked receivers fail with `ConnectionClosed`.
    pub fn shutdown(&self) {
        self.shared.close();
    }
}

impl Drop for MultichannelSocket {
    fn drop(&mut self) {
        self.shared.close();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn decode_packet(payload: &frame::Payload) -> NetResult<(u32, &[u8])> {
    let mut r: PayloadReader<'_> = payload.reader();
    let magic = r.get_u32()?;
    if magic != MULTIPLEX_MAGIC {
        return Err(NetError::InvalidMagic {
            expected: MULTIPLEX_MAGIC,
            actual: magic,
        });
    }
    let ch = r.get_u32()?;
    let data = r.get_bytes()?;
    Ok((ch, data))
}

fn receive_loop(shared: Arc<Shared>, mut reader: TcpTransport) {
    loop {
        let payload = match frame::receive(&mut reader) {
            Ok(p) => p,
            Err(e) => {
                if !shared.is_closed() {
                    debug!("multiplexer receiver stopping: {}", e);
                }
                break;
            }
        };
        let (ch, data) = match decode_packet(&payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!("bad multiplexer packet: {}", e);
                break;
            }
        };

        if ch == channel::CONTROL {
            // Acks may be coalesced into one packet; the last one is the newest
            let mut r = PayloadReader::new(data, payload.swapped);
            let mut latest = None;
            while r.remaining() >= 8 {
                match r.get_u64() {
                    Ok(v) => latest = Some(v),
                    Err(_) => break,
                }
            }
            if let Some(acked) = latest {
                shared.on_ack(acked);
            }
            continue;
        }

        let total = {
            let mut st = shared.receive.lock();
            st.total_received += data.len() as u64;
            let buf = st.channels.entry(ch).or_default();
            buf.data.extend(data);
            if let Some(needed) = buf.waiting_for {
                if buf.data.len() >= needed {
                    buf.ready.notify_one();
                }
            }
            st.total_received
        };
        shared.enqueue(channel::CONTROL, &total.to_le_bytes());
    }
    shared.close();
}

fn send_loop(shared: Arc<Shared>, mut writer: TcpTransport) {
    loop {
        let (ch, chunk) = {
            let mut st = shared.send.lock();
            loop {
                if st.closed {
                    return;
                }
                if let Some(next) = st.next_sendable(shared.bandwidth_latency_product) {
                    break next;
                }
                shared.send_ready.wait(&mut st);
            }
        };

        let mut packet = PayloadWriter::new();
        packet.put_u32(MULTIPLEX_MAGIC).put_u32(ch).put_bytes(&chunk);
        if let Err(e) = frame::send(&packet.finish(), &mut writer) {
            if !shared.is_closed() {
                warn!("multiplexer sender stopping: {}", e);
            }
            shared.close();
            return;
        }
    }
}
