//! Transport sessions for trapmux
//!
//! A session owns the listening socket, decodes whatever arrives and hands
//! the event loop a batch of events per readiness cycle. Responses (inform
//! acknowledgements) go back out through the same session.
//!
//! Developed by GoCortex.io

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::codec::{message_length, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Udp,
    Tcp,
}

impl std::str::FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportMode::Udp),
            "tcp" => Ok(TransportMode::Tcp),
            other => anyhow::bail!("Unknown transport '{}', expected udp or tcp", other),
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Udp => f.write_str("udp"),
            TransportMode::Tcp => f.write_str("tcp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub transport: TransportMode,
    pub max_packet_size: usize,
}

impl SessionConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

/// Where a message came from, and where its response must go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Datagram(SocketAddr),
    Stream { conn_id: u64, addr: SocketAddr },
}

impl Peer {
    pub fn addr(&self) -> SocketAddr {
        match self {
            Peer::Datagram(addr) => *addr,
            Peer::Stream { addr, .. } => *addr,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceivedPdu {
    pub message: Message,
    pub peer: Peer,
    pub received_at: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    MessageReceived(ReceivedPdu),
    TimedOut,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("session is closed")]
    Closed,
    #[error("no open connection to {0}")]
    ConnectionGone(SocketAddr),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Narrow interface the event loop drives.
///
/// `deliver_ready` returns the decoded events in arrival order instead of
/// invoking a registered callback.
pub trait TransportSession {
    /// Session-internal deadline, if any. The event loop never waits longer
    /// than its own ceiling regardless.
    fn next_timeout(&self) -> Option<Duration>;

    /// Resolve once input is ready to be delivered.
    fn readable(&mut self) -> impl Future<Output = io::Result<()>>;

    /// Decode all pending input.
    fn deliver_ready(&mut self) -> Vec<SessionEvent>;

    /// Called when a wait expires without readiness.
    fn on_wait_timeout(&mut self) -> Vec<SessionEvent>;

    fn send(&mut self, message: &Message, peer: &Peer) -> impl Future<Output = Result<(), TransportError>>;

    fn close(&mut self);

    fn local_addr(&self) -> SocketAddr;
}

fn decode_into(events: &mut Vec<SessionEvent>, data: Bytes, peer: Peer, received_at: DateTime<Local>) {
    match Message::decode(data) {
        Ok(message) => events.push(SessionEvent::MessageReceived(ReceivedPdu {
            message,
            peer,
            received_at,
        })),
        Err(e) => warn!("Failed to decode SNMP message from {}: {}", peer.addr(), e),
    }
}

pub struct UdpSession {
    socket: Option<UdpSocket>,
    local_addr: SocketAddr,
    buffer: Vec<u8>,
    packet_count: u64,
}

impl UdpSession {
    pub async fn bind(config: &SessionConfig) -> Result<Self> {
        let bind_addr = config.socket_addr();
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to udp:{}", bind_addr))?;
        let local_addr = socket.local_addr().context("Failed to read bound UDP address")?;

        info!("SNMP trap listener started on udp:{}", local_addr);

        Ok(Self {
            socket: Some(socket),
            local_addr,
            buffer: vec![0u8; config.max_packet_size.max(484)],
            packet_count: 0,
        })
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }
}

impl TransportSession for UdpSession {
    fn next_timeout(&self) -> Option<Duration> {
        None
    }

    async fn readable(&mut self) -> io::Result<()> {
        match &self.socket {
            Some(socket) => socket.readable().await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "session closed")),
        }
    }

    fn deliver_ready(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let Some(socket) = &self.socket else {
            return events;
        };

        loop {
            match socket.try_recv_from(&mut self.buffer) {
                Ok((len, src_addr)) => {
                    self.packet_count += 1;
                    if self.packet_count % 1000 == 0 {
                        info!("Processed {} UDP packets on {}", self.packet_count, self.local_addr);
                    }
                    debug!("Received {} bytes from {}", len, src_addr);
                    decode_into(
                        &mut events,
                        Bytes::copy_from_slice(&self.buffer[..len]),
                        Peer::Datagram(src_addr),
                        Local::now(),
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
        events
    }

    fn on_wait_timeout(&mut self) -> Vec<SessionEvent> {
        Vec::new()
    }

    async fn send(&mut self, message: &Message, peer: &Peer) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
        socket.send_to(&message.encode(), peer.addr()).await?;
        Ok(())
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            info!(
                "SNMP trap listener on udp:{} closed after {} packets",
                self.local_addr, self.packet_count
            );
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

struct Frame {
    conn_id: u64,
    addr: SocketAddr,
    data: Bytes,
    received_at: DateTime<Local>,
}

type ConnectionMap = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Bytes>>>>;

/// Stream transport. Messages are framed by their outer BER length; each
/// connection is served by its own task that forwards complete frames here.
pub struct TcpSession {
    local_addr: SocketAddr,
    inbound: mpsc::UnboundedReceiver<Frame>,
    pending: VecDeque<Frame>,
    connections: ConnectionMap,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpSession {
    pub async fn bind(config: &SessionConfig) -> Result<Self> {
        let bind_addr = config.socket_addr();
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to tcp:{}", bind_addr))?;
        let local_addr = listener.local_addr().context("Failed to read bound TCP address")?;

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let connections: ConnectionMap = Arc::new(Mutex::new(HashMap::new()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            inbound_tx,
            Arc::clone(&connections),
            config.max_packet_size,
        ));

        info!("SNMP trap listener started on tcp:{}", local_addr);

        Ok(Self {
            local_addr,
            inbound,
            pending: VecDeque::new(),
            connections,
            accept_task: Some(accept_task),
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound: mpsc::UnboundedSender<Frame>,
    connections: ConnectionMap,
    max_message_size: usize,
) {
    let mut next_id = 0u64;
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    next_id += 1;
                    debug!("Accepted TCP connection {} from {}", next_id, addr);
                    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                    connections.lock().await.insert(next_id, outbound_tx);
                    tasks.spawn(serve_connection(
                        next_id,
                        addr,
                        stream,
                        inbound.clone(),
                        outbound_rx,
                        Arc::clone(&connections),
                        max_message_size,
                    ));
                }
                Err(e) => {
                    warn!("Failed to accept TCP connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }
}

async fn serve_connection(
    conn_id: u64,
    addr: SocketAddr,
    mut stream: TcpStream,
    inbound: mpsc::UnboundedSender<Frame>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    connections: ConnectionMap,
    max_message_size: usize,
) {
    let (mut reader, mut writer) = stream.split();
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {
                    if let Err(e) = extract_frames(conn_id, addr, &mut buf, &inbound, max_message_size) {
                        warn!("Dropping TCP connection from {}: {}", addr, e);
                        break;
                    }
                }
                Err(e) => {
                    debug!("TCP connection from {} failed: {}", addr, e);
                    break;
                }
            },
            data = outbound.recv() => match data {
                Some(data) => {
                    if let Err(e) = writer.write_all(&data).await {
                        warn!("Failed to write to TCP connection {}: {}", addr, e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    connections.lock().await.remove(&conn_id);
    debug!("TCP connection {} from {} closed", conn_id, addr);
}

fn extract_frames(
    conn_id: u64,
    addr: SocketAddr,
    buf: &mut BytesMut,
    inbound: &mpsc::UnboundedSender<Frame>,
    max_message_size: usize,
) -> Result<()> {
    while let Some(total) = message_length(&buf[..])? {
        if total > max_message_size {
            anyhow::bail!("message of {} bytes exceeds limit of {}", total, max_message_size);
        }
        if buf.len() < total {
            break;
        }
        let data = buf.split_to(total).freeze();
        inbound
            .send(Frame {
                conn_id,
                addr,
                data,
                received_at: Local::now(),
            })
            .context("session is gone")?;
    }
    Ok(())
}

impl TransportSession for TcpSession {
    fn next_timeout(&self) -> Option<Duration> {
        None
    }

    async fn readable(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            return Ok(());
        }
        match self.inbound.recv().await {
            Some(frame) => {
                self.pending.push_back(frame);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "TCP listener stopped")),
        }
    }

    fn deliver_ready(&mut self) -> Vec<SessionEvent> {
        while let Ok(frame) = self.inbound.try_recv() {
            self.pending.push_back(frame);
        }

        let mut events = Vec::with_capacity(self.pending.len());
        for frame in self.pending.drain(..) {
            let peer = Peer::Stream {
                conn_id: frame.conn_id,
                addr: frame.addr,
            };
            decode_into(&mut events, frame.data, peer, frame.received_at);
        }
        events
    }

    fn on_wait_timeout(&mut self) -> Vec<SessionEvent> {
        Vec::new()
    }

    async fn send(&mut self, message: &Message, peer: &Peer) -> Result<(), TransportError> {
        if self.accept_task.is_none() {
            return Err(TransportError::Closed);
        }
        let Peer::Stream { conn_id, addr } = *peer else {
            return Err(TransportError::ConnectionGone(peer.addr()));
        };
        let connections = self.connections.lock().await;
        let sender = connections
            .get(&conn_id)
            .ok_or(TransportError::ConnectionGone(addr))?;
        sender
            .send(message.encode())
            .map_err(|_| TransportError::ConnectionGone(addr))
    }

    fn close(&mut self) {
        if let Some(task) = self.accept_task.take() {
            // Dropping the accept loop's JoinSet aborts every connection task
            task.abort();
            self.inbound.close();
            info!("SNMP trap listener on tcp:{} closed", self.local_addr);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}
