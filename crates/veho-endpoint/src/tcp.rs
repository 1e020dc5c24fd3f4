//! Reliable stream endpoint.
//!
//! Outgoing connections are managed per peer by a state machine
//! (CLOSED → CONNECTING → CONNECTED, with RECONNECT_WAIT and exponential
//! backoff after failures). Frames submitted while disconnected queue in a
//! per-peer FIFO and go out in order once the connection is up. The read
//! side runs every connection through the magic-cookie
//! [`StreamDecoder`](crate::framing::StreamDecoder).

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use veho_types::Endpoint;
use veho_wire::{MAGIC_COOKIE_CLIENT, MAGIC_COOKIE_SERVER};

use crate::framing::StreamDecoder;
use crate::packetizer::{Packetizer, PushOutcome, DEFAULT_COALESCE_DELAY};
use crate::{EndpointError, EndpointEvent, Result};

/// Configuration shared by stream connections.
#[derive(Clone, Debug)]
pub struct TcpConfig {
    /// Initial reconnect backoff.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_cap: Duration,
    /// Ceiling for a single decoded message.
    pub max_message_size: usize,
    /// Prepend a magic cookie to every outbound batch.
    pub enable_magic_cookies: bool,
    /// Outbound batch budget per peer.
    pub batch_budget: usize,
    /// Coalescing delay before an unflushed batch goes out.
    pub coalesce_delay: Duration,
    /// Frames queued per peer while disconnected before drops start.
    pub pending_queue_limit: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(5),
            max_message_size: 4 * 1024 * 1024,
            enable_magic_cookies: false,
            batch_budget: 1400,
            coalesce_delay: DEFAULT_COALESCE_DELAY,
            pending_queue_limit: 1024,
        }
    }
}

struct SendCmd {
    bytes: Bytes,
    flush: bool,
}

/// Pool of outgoing stream connections, one state machine per peer.
pub struct TcpClientPool {
    config: TcpConfig,
    events: mpsc::Sender<EndpointEvent>,
    connections: Mutex<HashMap<SocketAddr, ConnectionHandle>>,
}

struct ConnectionHandle {
    commands: mpsc::Sender<SendCmd>,
    task: JoinHandle<()>,
}

impl TcpClientPool {
    /// A pool reporting frames and connection transitions on `events`.
    pub fn new(config: TcpConfig, events: mpsc::Sender<EndpointEvent>) -> Self {
        Self { config, events, connections: Mutex::new(HashMap::new()) }
    }

    /// Queue a frame for `peer`, connecting first if necessary.
    pub async fn send(&self, peer: SocketAddr, bytes: Bytes, flush: bool) -> Result<()> {
        let mut connections = self.connections.lock().await;
        let handle = match connections.get(&peer) {
            Some(handle) if !handle.task.is_finished() => handle,
            _ => {
                let (cmd_tx, cmd_rx) = mpsc::channel(1024);
                let task = tokio::spawn(connection_task(
                    peer,
                    self.config.clone(),
                    cmd_rx,
                    self.events.clone(),
                ));
                connections.insert(peer, ConnectionHandle { commands: cmd_tx, task });
                connections
                    .get(&peer)
                    .unwrap_or_else(|| unreachable!("just inserted"))
            }
        };
        handle
            .commands
            .try_send(SendCmd { bytes, flush })
            .map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => EndpointError::WouldBlock,
                mpsc::error::TrySendError::Closed(_) => {
                    EndpointError::NotReachable(Endpoint::tcp(peer.ip(), peer.port()))
                }
            })
    }

    /// Drop the connection to `peer`; queued frames complete with
    /// cancellation.
    pub async fn stop(&self, peer: SocketAddr) {
        if let Some(handle) = self.connections.lock().await.remove(&peer) {
            handle.task.abort();
            tracing::debug!(%peer, "stream connection stopped");
        }
    }

    /// Drop every connection.
    pub async fn shutdown(&self) {
        for (_, handle) in self.connections.lock().await.drain() {
            handle.task.abort();
        }
    }
}

/// Per-connection state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnState {
    Closed,
    Connecting,
    Connected,
    ReconnectWait,
}

async fn connection_task(
    peer: SocketAddr,
    config: TcpConfig,
    mut commands: mpsc::Receiver<SendCmd>,
    events: mpsc::Sender<EndpointEvent>,
) {
    let peer_endpoint = Endpoint::tcp(peer.ip(), peer.port());
    let mut state = ConnState::Closed;
    let mut backoff = config.backoff_base;
    let mut pending: VecDeque<SendCmd> = VecDeque::new();

    loop {
        match state {
            ConnState::Closed => {
                // Connect on the first frame to send.
                match commands.recv().await {
                    Some(cmd) => {
                        pending.push_back(cmd);
                        state = ConnState::Connecting;
                    }
                    None => return,
                }
            }
            ConnState::Connecting => match TcpStream::connect(peer).await {
                Ok(stream) => {
                    backoff = config.backoff_base;
                    let _ = stream.set_nodelay(true);
                    let _ = events.send(EndpointEvent::PeerUp(peer_endpoint)).await;
                    tracing::debug!(%peer, "stream connected");
                    state = run_connected(
                        stream,
                        peer_endpoint,
                        &config,
                        &mut commands,
                        &mut pending,
                        &events,
                        true,
                    )
                    .await;
                    if state != ConnState::ReconnectWait {
                        return;
                    }
                    let _ = events.send(EndpointEvent::PeerDown(peer_endpoint)).await;
                }
                Err(error) => {
                    tracing::debug!(%peer, %error, "connect failed");
                    state = ConnState::ReconnectWait;
                }
            },
            ConnState::ReconnectWait => {
                // Collect frames arriving during the wait so order holds.
                let wait = tokio::time::sleep(backoff);
                tokio::pin!(wait);
                loop {
                    tokio::select! {
                        _ = &mut wait => break,
                        cmd = commands.recv() => match cmd {
                            Some(cmd) => queue_pending(&mut pending, cmd, &config, peer),
                            None => return,
                        },
                    }
                }
                backoff = (backoff * 2).min(config.backoff_cap);
                state = ConnState::Connecting;
            }
            ConnState::Connected => unreachable!("handled inside run_connected"),
        }
    }
}

fn queue_pending(pending: &mut VecDeque<SendCmd>, cmd: SendCmd, config: &TcpConfig, peer: SocketAddr) {
    if pending.len() >= config.pending_queue_limit {
        tracing::warn!(%peer, "pending queue full, dropping oldest frame");
        pending.pop_front();
    }
    pending.push_back(cmd);
}

/// Drive one established connection until it drops or the pool goes away.
///
/// Returns the follow-up state: `ReconnectWait` on connection loss, any
/// other value to terminate the task.
#[allow(clippy::too_many_arguments)]
async fn run_connected(
    stream: TcpStream,
    peer_endpoint: Endpoint,
    config: &TcpConfig,
    commands: &mut mpsc::Receiver<SendCmd>,
    pending: &mut VecDeque<SendCmd>,
    events: &mpsc::Sender<EndpointEvent>,
    is_client: bool,
) -> ConnState {
    let local_addr = stream.local_addr().ok();
    let local_endpoint =
        local_addr.map(|addr| Endpoint::tcp(addr.ip(), addr.port())).unwrap_or(peer_endpoint);
    let (mut reader, mut writer) = stream.into_split();

    let mut decoder = StreamDecoder::new(config.max_message_size);
    let mut batch = Packetizer::new(config.batch_budget);
    let mut read_buffer = vec![0u8; 16 * 1024];

    // Frames queued while disconnected go out first, in order.
    while let Some(cmd) = pending.pop_front() {
        if write_batch(&mut writer, &mut batch, cmd, config, is_client).await.is_err() {
            return ConnState::ReconnectWait;
        }
    }

    loop {
        let deadline = batch.armed_at().map(|armed| armed + config.coalesce_delay);
        tokio::select! {
            read = reader.read(&mut read_buffer) => match read {
                Ok(0) => return ConnState::ReconnectWait,
                Ok(len) => {
                    for mut message in decoder.feed(&read_buffer[..len]) {
                        message.source = Some(peer_endpoint);
                        message.target = Some(local_endpoint);
                        message.is_reliable = true;
                        if events.send(EndpointEvent::Frame(message)).await.is_err() {
                            return ConnState::Closed;
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(peer = %peer_endpoint, %error, "stream read failed");
                    return ConnState::ReconnectWait;
                }
            },
            cmd = commands.recv() => match cmd {
                Some(cmd) => {
                    if write_batch(&mut writer, &mut batch, cmd, config, is_client).await.is_err() {
                        return ConnState::ReconnectWait;
                    }
                }
                None => return ConnState::Closed,
            },
            _ = sleep_until_opt(deadline) => {
                if let Some(bytes) = batch.flush() {
                    if write_all(&mut writer, config, is_client, &bytes).await.is_err() {
                        return ConnState::ReconnectWait;
                    }
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

async fn write_batch(
    writer: &mut OwnedWriteHalf,
    batch: &mut Packetizer,
    cmd: SendCmd,
    config: &TcpConfig,
    is_client: bool,
) -> std::io::Result<()> {
    if let PushOutcome::Flush(due) = batch.push(&cmd.bytes, Instant::now()) {
        write_all(writer, config, is_client, &due).await?;
    }
    if cmd.flush {
        if let Some(due) = batch.flush() {
            write_all(writer, config, is_client, &due).await?;
        }
    }
    Ok(())
}

async fn write_all(
    writer: &mut OwnedWriteHalf,
    config: &TcpConfig,
    is_client: bool,
    bytes: &[u8],
) -> std::io::Result<()> {
    if config.enable_magic_cookies {
        let cookie: &[u8] = if is_client { &MAGIC_COOKIE_CLIENT } else { &MAGIC_COOKIE_SERVER };
        writer.write_all(cookie).await?;
    }
    writer.write_all(bytes).await
}

/// Listening side of the reliable transport.
///
/// Accepted connections share the client connection's read path; responses
/// to a connected peer are sent back over its accepted connection.
pub struct TcpServer {
    local: Endpoint,
    accept_task: JoinHandle<()>,
    writers: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<SendCmd>>>>,
}

impl TcpServer {
    /// Bind and start accepting.
    pub async fn bind(
        bind: SocketAddr,
        config: TcpConfig,
        events: mpsc::Sender<EndpointEvent>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        let local = Endpoint::tcp(local_addr.ip(), local_addr.port());
        tracing::info!(%local, "stream endpoint listening");

        let writers: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<SendCmd>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let accept_task = tokio::spawn({
            let writers = writers.clone();
            async move {
                loop {
                    let (stream, peer) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            tracing::warn!(%error, "accept failed");
                            continue;
                        }
                    };
                    let (cmd_tx, mut cmd_rx) = mpsc::channel(1024);
                    writers.lock().await.insert(peer, cmd_tx);
                    let events = events.clone();
                    let config = config.clone();
                    let writers = writers.clone();
                    tokio::spawn(async move {
                        let peer_endpoint = Endpoint::tcp(peer.ip(), peer.port());
                        let mut pending = VecDeque::new();
                        let next = run_connected(
                            stream,
                            peer_endpoint,
                            &config,
                            &mut cmd_rx,
                            &mut pending,
                            &events,
                            false,
                        )
                        .await;
                        writers.lock().await.remove(&peer);
                        if next == ConnState::ReconnectWait {
                            // Servers do not reconnect; report the loss.
                            let _ = events.send(EndpointEvent::PeerDown(peer_endpoint)).await;
                        }
                    });
                }
            }
        });

        Ok(Self { local, accept_task, writers })
    }

    /// The local endpoint identity.
    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    /// Send a frame back to a connected peer.
    pub async fn send(&self, peer: SocketAddr, bytes: Bytes, flush: bool) -> Result<()> {
        let writers = self.writers.lock().await;
        let Some(writer) = writers.get(&peer) else {
            return Err(EndpointError::NotReachable(Endpoint::tcp(peer.ip(), peer.port())));
        };
        writer.try_send(SendCmd { bytes, flush }).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => EndpointError::WouldBlock,
            mpsc::error::TrySendError::Closed(_) => {
                EndpointError::NotReachable(Endpoint::tcp(peer.ip(), peer.port()))
            }
        })
    }

    /// Stop accepting and drop every connection.
    pub async fn stop(self) {
        self.accept_task.abort();
        self.writers.lock().await.clear();
        tracing::debug!(local = %self.local, "stream endpoint stopped");
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl Drop for TcpClientPool {
    fn drop(&mut self) {
        if let Ok(mut connections) = self.connections.try_lock() {
            for (_, handle) in connections.drain() {
                handle.task.abort();
            }
        }
    }
}
