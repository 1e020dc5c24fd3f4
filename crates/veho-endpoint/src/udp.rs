//! Unreliable datagram endpoint.
//!
//! One bound UDP socket per local endpoint, shared by every peer. There is
//! no per-connection state; outbound frames are batched per peer up to the
//! MTU budget and flushed explicitly or by the coalescing timer. A single
//! received datagram may carry several concatenated frames.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use veho_types::Endpoint;
use veho_wire::Message;

use crate::packetizer::{Packetizer, PushOutcome, DEFAULT_COALESCE_DELAY, DEFAULT_UDP_BUDGET};
use crate::{EndpointError, EndpointEvent, Result};

/// Configuration of a UDP endpoint.
#[derive(Clone, Debug)]
pub struct UdpConfig {
    /// Local address to bind.
    pub bind: SocketAddr,
    /// Multicast group to join (service discovery).
    pub multicast: Option<Ipv4Addr>,
    /// Outbound batch budget per peer.
    pub batch_budget: usize,
    /// Coalescing delay before an unflushed batch goes out.
    pub coalesce_delay: Duration,
    /// Ceiling for a single decoded message.
    pub max_message_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            multicast: None,
            batch_budget: DEFAULT_UDP_BUDGET,
            coalesce_delay: DEFAULT_COALESCE_DELAY,
            max_message_size: 65_507, // datagram payload limit
        }
    }
}

struct SendCmd {
    peer: SocketAddr,
    bytes: Bytes,
    flush: bool,
}

/// Cloneable sender handle of a UDP endpoint.
#[derive(Clone)]
pub struct UdpSender {
    local: Endpoint,
    commands: mpsc::Sender<SendCmd>,
}

impl UdpSender {
    /// Queue a frame for `peer`.
    ///
    /// Returns once the bytes are copied into the per-peer batch. With
    /// `flush = false` the batch waits for more frames or the coalescing
    /// timer.
    pub fn send(&self, peer: SocketAddr, bytes: Bytes, flush: bool) -> Result<()> {
        self.commands
            .try_send(SendCmd { peer, bytes, flush })
            .map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => EndpointError::WouldBlock,
                mpsc::error::TrySendError::Closed(_) => EndpointError::Cancelled,
            })
    }

    /// The local endpoint identity frames are sent from.
    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }
}

/// A bound UDP endpoint with its read and write loops.
pub struct UdpEndpoint {
    local: Endpoint,
    sender: UdpSender,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl UdpEndpoint {
    /// Bind the socket, join the configured multicast group and start the
    /// read/write loops. Received frames arrive on `events`.
    pub async fn bind(config: UdpConfig, events: mpsc::Sender<EndpointEvent>) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind).await?;
        if let Some(group) = config.multicast {
            // Degrade to unicast-only discovery when the group cannot be
            // joined (constrained or loopback-only environments).
            if let Err(error) = socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                tracing::warn!(%group, %error, "multicast join failed");
            }
        }
        let local_addr = socket.local_addr()?;
        let local = Endpoint::udp(local_addr.ip(), local_addr.port());
        tracing::info!(%local, "datagram endpoint bound");

        let socket = Arc::new(socket);
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);

        let reader = tokio::spawn(read_loop(
            socket.clone(),
            local,
            config.max_message_size,
            events,
        ));
        let writer = tokio::spawn(write_loop(
            socket,
            cmd_rx,
            config.batch_budget,
            config.coalesce_delay,
        ));

        let sender = UdpSender { local, commands: cmd_tx };
        Ok(Self { local, sender, reader, writer })
    }

    /// The local endpoint identity.
    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    /// A cloneable sender handle.
    pub fn sender(&self) -> UdpSender {
        self.sender.clone()
    }

    /// Cancel the loops and release the socket.
    pub fn stop(self) {
        self.reader.abort();
        self.writer.abort();
        tracing::debug!(local = %self.local, "datagram endpoint stopped");
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    local: Endpoint,
    max_message_size: usize,
    events: mpsc::Sender<EndpointEvent>,
) {
    let mut buffer = vec![0u8; 65_535];
    let mut dropped_datagrams: u64 = 0;
    loop {
        let (len, peer) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(error) => {
                tracing::warn!(%error, "datagram receive failed");
                continue;
            }
        };
        let mut offset = 0;
        while offset < len {
            match Message::decode(&buffer[offset..len]) {
                Ok((mut message, consumed)) if consumed <= max_message_size => {
                    message.source = Some(Endpoint::udp(peer.ip(), peer.port()));
                    message.target = Some(local);
                    message.is_reliable = false;
                    offset += consumed;
                    if events.send(EndpointEvent::Frame(message)).await.is_err() {
                        return; // routing gone, shut down quietly
                    }
                }
                _ => {
                    // Malformed or oversized: the rest of the datagram is
                    // unusable.
                    dropped_datagrams += 1;
                    let preview = &buffer[offset..(offset + 16).min(len)];
                    tracing::debug!(
                        %peer,
                        total = dropped_datagrams,
                        prefix = %hex::encode(preview),
                        "dropped malformed datagram"
                    );
                    break;
                }
            }
        }
    }
}

async fn write_loop(
    socket: Arc<UdpSocket>,
    mut commands: mpsc::Receiver<SendCmd>,
    budget: usize,
    coalesce_delay: Duration,
) {
    let mut batches: HashMap<SocketAddr, Packetizer> = HashMap::new();

    loop {
        let next_deadline = batches
            .values()
            .filter_map(Packetizer::armed_at)
            .min()
            .map(|armed| armed + coalesce_delay);

        let command = match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    cmd = commands.recv() => cmd,
                    _ = tokio::time::sleep_until(deadline.into()) => {
                        flush_due(&socket, &mut batches, coalesce_delay).await;
                        continue;
                    }
                }
            }
            None => commands.recv().await,
        };

        let Some(SendCmd { peer, bytes, flush }) = command else {
            return; // endpoint dropped
        };

        let batch = batches.entry(peer).or_insert_with(|| Packetizer::new(budget));
        if let PushOutcome::Flush(due) = batch.push(&bytes, Instant::now()) {
            send_datagram(&socket, peer, &due).await;
        }
        if flush {
            if let Some(due) = batch.flush() {
                send_datagram(&socket, peer, &due).await;
            }
        }
    }
}

async fn flush_due(
    socket: &UdpSocket,
    batches: &mut HashMap<SocketAddr, Packetizer>,
    coalesce_delay: Duration,
) {
    let now = Instant::now();
    for (&peer, batch) in batches.iter_mut() {
        let due = batch
            .armed_at()
            .is_some_and(|armed| now.duration_since(armed) >= coalesce_delay);
        if due {
            if let Some(bytes) = batch.flush() {
                send_datagram(socket, peer, &bytes).await;
            }
        }
    }
}

async fn send_datagram(socket: &UdpSocket, peer: SocketAddr, bytes: &[u8]) {
    // Wire-level EAGAIN is retried by the tokio send path; real errors are
    // logged and the datagram dropped (unreliable transport).
    if let Err(error) = socket.send_to(bytes, peer).await {
        tracing::warn!(%peer, %error, "datagram send failed");
    }
}
