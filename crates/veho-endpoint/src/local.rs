//! Host-local endpoint between routing host and applications.
//!
//! Carries the IPC command envelope over Unix sockets. The byte stream is
//! delimited by the envelope's start/end tags; a tag mismatch means the
//! stream is corrupt and the connection is closed (there is no resync on
//! the local transport). Where the platform exposes peer credentials, they
//! are read at accept time and attached to every command so the policy
//! gateway can judge the sender.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use veho_types::ClientId;
use veho_wire::ipc::{decode_envelope, encode_envelope, Command};
use veho_wire::WireError;

use crate::{EndpointError, Result};

/// Identifies one accepted connection until its application registers.
pub type ConnectionId = u64;

/// Default bounded slot count of a local queue. A full queue surfaces
/// `WouldBlock` to the sender.
pub const DEFAULT_SLOT_COUNT: usize = 100;

/// What the listener reports upward to the IPC bus.
#[derive(Debug)]
pub enum LocalEvent {
    /// A connection was accepted; credentials from the socket.
    Connected {
        /// Connection id.
        conn: ConnectionId,
        /// Peer user id.
        uid: u32,
        /// Peer group id.
        gid: u32,
    },
    /// A command arrived on a connection.
    Command {
        /// Connection id.
        conn: ConnectionId,
        /// Client id the sender claims.
        sender: ClientId,
        /// The decoded command.
        command: Command,
    },
    /// A connection went away (EOF, error or corrupt stream).
    Disconnected {
        /// Connection id.
        conn: ConnectionId,
    },
}

/// The routing host's listening side of the local bus.
pub struct LocalListener {
    path: PathBuf,
    accept_task: JoinHandle<()>,
    writers: Arc<Mutex<HashMap<ConnectionId, mpsc::Sender<Bytes>>>>,
    max_command_size: usize,
}

impl LocalListener {
    /// Bind the host socket and start accepting applications.
    pub async fn bind(
        path: &Path,
        max_command_size: usize,
        slot_count: usize,
        events: mpsc::Sender<LocalEvent>,
    ) -> Result<Self> {
        // A stale socket file from a crashed host blocks the bind.
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        tracing::info!(path = %path.display(), "local endpoint listening");

        let writers: Arc<Mutex<HashMap<ConnectionId, mpsc::Sender<Bytes>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let next_conn = Arc::new(AtomicU64::new(1));

        let accept_task = tokio::spawn({
            let writers = writers.clone();
            async move {
                loop {
                    let (stream, _addr) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            tracing::warn!(%error, "local accept failed");
                            continue;
                        }
                    };
                    let conn = next_conn.fetch_add(1, Ordering::Relaxed);
                    let (uid, gid) = peer_credentials(&stream);
                    if events
                        .send(LocalEvent::Connected { conn, uid, gid })
                        .await
                        .is_err()
                    {
                        return;
                    }

                    let (read_half, write_half) = stream.into_split();
                    let (write_tx, write_rx) = mpsc::channel(slot_count);
                    writers.lock().await.insert(conn, write_tx);

                    tokio::spawn(write_loop(write_half, write_rx));
                    tokio::spawn({
                        let events = events.clone();
                        let writers = writers.clone();
                        async move {
                            read_loop(conn, read_half, &events).await;
                            writers.lock().await.remove(&conn);
                            let _ = events.send(LocalEvent::Disconnected { conn }).await;
                        }
                    });
                }
            }
        });

        Ok(Self { path: path.to_path_buf(), accept_task, writers, max_command_size })
    }

    /// Send a command to a connected application.
    pub async fn send(&self, conn: ConnectionId, sender: ClientId, command: &Command) -> Result<()> {
        let bytes = encode_envelope(sender, command, self.max_command_size)?;
        let writers = self.writers.lock().await;
        let Some(writer) = writers.get(&conn) else {
            return Err(EndpointError::Cancelled);
        };
        writer.try_send(bytes).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => EndpointError::WouldBlock,
            mpsc::error::TrySendError::Closed(_) => EndpointError::Cancelled,
        })
    }

    /// Drop a connection (deregistration or pong timeout).
    pub async fn close(&self, conn: ConnectionId) {
        self.writers.lock().await.remove(&conn);
    }

    /// Stop accepting and remove the socket file.
    pub async fn stop(self) {
        self.accept_task.abort();
        self.writers.lock().await.clear();
        let _ = std::fs::remove_file(&self.path);
        tracing::debug!(path = %self.path.display(), "local endpoint stopped");
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

/// An application's connection to the routing host.
pub struct LocalConnector {
    writer: mpsc::Sender<Bytes>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
    max_command_size: usize,
}

impl LocalConnector {
    /// Connect to the routing host socket. Incoming commands arrive on
    /// `events` as `(sender, command)` pairs.
    pub async fn connect(
        path: &Path,
        max_command_size: usize,
        slot_count: usize,
        events: mpsc::Sender<(ClientId, Command)>,
    ) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel(slot_count);

        let write_task = tokio::spawn(write_loop(write_half, write_rx));
        let read_task = tokio::spawn(async move {
            let mut buffer = BytesMut::new();
            let mut chunk = vec![0u8; 16 * 1024];
            let mut read_half = read_half;
            loop {
                match read_half.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(len) => {
                        buffer.extend_from_slice(&chunk[..len]);
                        if drain_envelopes(&mut buffer, |sender, command| {
                            events.try_send((sender, command)).is_ok()
                        })
                        .is_err()
                        {
                            return; // corrupt stream
                        }
                    }
                }
            }
        });

        Ok(Self { writer: write_tx, read_task, write_task, max_command_size })
    }

    /// Send a command to the routing host.
    pub fn send(&self, sender: ClientId, command: &Command) -> Result<()> {
        self.sender().send(sender, command)
    }

    /// A cloneable send-only handle for use from other tasks.
    pub fn sender(&self) -> LocalSender {
        LocalSender { writer: self.writer.clone(), max_command_size: self.max_command_size }
    }

    /// Close the connection.
    pub fn stop(self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}

impl Drop for LocalConnector {
    fn drop(&mut self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}

/// Send-only handle of a [`LocalConnector`].
#[derive(Clone)]
pub struct LocalSender {
    writer: mpsc::Sender<Bytes>,
    max_command_size: usize,
}

impl LocalSender {
    /// Send a command through the underlying connection.
    pub fn send(&self, sender: ClientId, command: &Command) -> Result<()> {
        let bytes = encode_envelope(sender, command, self.max_command_size)?;
        self.writer.try_send(bytes).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => EndpointError::WouldBlock,
            mpsc::error::TrySendError::Closed(_) => EndpointError::Cancelled,
        })
    }
}

fn peer_credentials(stream: &UnixStream) -> (u32, u32) {
    match stream.peer_cred() {
        Ok(cred) => (cred.uid(), cred.gid()),
        Err(error) => {
            tracing::debug!(%error, "peer credentials unavailable");
            (u32::MAX, u32::MAX)
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = queue.recv().await {
        if writer.write_all(&bytes).await.is_err() {
            return;
        }
    }
}

async fn read_loop(
    conn: ConnectionId,
    mut reader: tokio::net::unix::OwnedReadHalf,
    events: &mpsc::Sender<LocalEvent>,
) {
    let mut buffer = BytesMut::new();
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => return,
            Err(error) => {
                tracing::debug!(conn, %error, "local read failed");
                return;
            }
            Ok(len) => {
                buffer.extend_from_slice(&chunk[..len]);
                loop {
                    match decode_envelope(&buffer) {
                        Ok((sender, command, consumed)) => {
                            buffer.advance(consumed);
                            if events
                                .send(LocalEvent::Command { conn, sender, command })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(WireError::Truncated { .. }) => break,
                        Err(error) => {
                            // Corrupt stream: drop the connection.
                            tracing::warn!(conn, %error, "corrupt local stream, closing");
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn drain_envelopes(
    buffer: &mut BytesMut,
    mut deliver: impl FnMut(ClientId, Command) -> bool,
) -> std::result::Result<(), WireError> {
    loop {
        match decode_envelope(buffer) {
            Ok((sender, command, consumed)) => {
                buffer.advance(consumed);
                if !deliver(sender, command) {
                    return Ok(()); // receiver saturated; command dropped
                }
            }
            Err(WireError::Truncated { .. }) => return Ok(()),
            Err(error) => return Err(error),
        }
    }
}
