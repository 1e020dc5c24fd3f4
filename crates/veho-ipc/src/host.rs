//! Routing-host side of the local bus.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use veho_endpoint::local::{ConnectionId, LocalEvent, LocalListener};
use veho_types::{ApplicationState, ClientId, ROUTING_CLIENT_ID};
use veho_wire::ipc::Command;

use crate::{IpcError, Result};

/// First client id handed out dynamically; statically configured ids are
/// expected below this.
pub const DYNAMIC_CLIENT_BASE: ClientId = 0x0100;

/// Host-side bus configuration.
#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Ping cadence.
    pub ping_cadence: Duration,
    /// Pong deadline; silent applications are evicted after it.
    pub pong_deadline: Duration,
    /// Maximum encoded command size.
    pub max_command_size: usize,
    /// Bounded queue slot count.
    pub slot_count: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        let cadence = Duration::from_secs(5);
        Self {
            ping_cadence: cadence,
            pong_deadline: cadence * 2,
            max_command_size: veho_wire::ipc::DEFAULT_MAX_COMMAND_SIZE,
            slot_count: veho_endpoint::local::DEFAULT_SLOT_COUNT,
        }
    }
}

/// What the bus reports to the routing core.
#[derive(Debug)]
pub enum HostEvent {
    /// An application registered; the ack has been sent.
    ApplicationJoined {
        /// Allocated client id.
        client: ClientId,
        /// Application name.
        name: String,
        /// Peer user id from the local socket.
        uid: u32,
        /// Peer group id from the local socket.
        gid: u32,
    },
    /// An application deregistered, disconnected or missed its pong
    /// deadline. Cleanup of everything it owned is the routing core's job
    /// and must be idempotent.
    ApplicationLost {
        /// The client id that went away.
        client: ClientId,
    },
    /// A command from a registered application.
    Command {
        /// Sending client.
        client: ClientId,
        /// Peer user id.
        uid: u32,
        /// Peer group id.
        gid: u32,
        /// The command.
        command: Command,
    },
}

struct ConnInfo {
    uid: u32,
    gid: u32,
    client: Option<ClientId>,
}

struct ClientRecord {
    conn: ConnectionId,
    name: String,
    #[allow(dead_code)]
    queue_name: String,
    state: ApplicationState,
    last_pong: Instant,
}

#[derive(Default)]
struct HostState {
    conns: HashMap<ConnectionId, ConnInfo>,
    clients: HashMap<ClientId, ClientRecord>,
    next_dynamic: ClientId,
}

/// The routing host's end of the bus.
pub struct IpcHost {
    listener: Arc<LocalListener>,
    state: Arc<Mutex<HostState>>,
    config: HostConfig,
    dispatch_task: JoinHandle<()>,
    ping_task: JoinHandle<()>,
}

impl IpcHost {
    /// Bind the host queue and start dispatching.
    ///
    /// `static_ids` maps application names to configured client ids; all
    /// other applications get dynamic ids. Bus events are delivered on
    /// `events`.
    pub async fn start(
        socket_path: &Path,
        config: HostConfig,
        static_ids: HashMap<String, ClientId>,
        events: mpsc::Sender<HostEvent>,
    ) -> Result<Self> {
        let (local_tx, local_rx) = mpsc::channel(256);
        let listener = Arc::new(
            LocalListener::bind(socket_path, config.max_command_size, config.slot_count, local_tx)
                .await?,
        );

        let state = Arc::new(Mutex::new(HostState {
            next_dynamic: DYNAMIC_CLIENT_BASE,
            ..HostState::default()
        }));

        let dispatch_task = tokio::spawn(dispatch_loop(
            local_rx,
            listener.clone(),
            state.clone(),
            static_ids,
            events.clone(),
        ));
        let ping_task = tokio::spawn(ping_loop(
            listener.clone(),
            state.clone(),
            config.clone(),
            events,
        ));

        Ok(Self { listener, state, config, dispatch_task, ping_task })
    }

    /// Send a command to a registered application.
    pub async fn send_to_client(&self, client: ClientId, command: &Command) -> Result<()> {
        let conn = {
            let state = self.state.lock().await;
            state
                .clients
                .get(&client)
                .map(|record| record.conn)
                .ok_or(IpcError::UnknownClient(client))?
        };
        self.listener
            .send(conn, ROUTING_CLIENT_ID, command)
            .await
            .map_err(IpcError::from)
    }

    /// Currently registered client ids.
    pub async fn registered_clients(&self) -> Vec<ClientId> {
        self.state.lock().await.clients.keys().copied().collect()
    }

    /// The configured pong deadline.
    pub fn pong_deadline(&self) -> Duration {
        self.config.pong_deadline
    }

    /// Stop the bus. The host socket is removed when the last listener
    /// reference drops.
    pub async fn stop(self) {
        self.dispatch_task.abort();
        self.ping_task.abort();
    }
}

impl Drop for IpcHost {
    fn drop(&mut self) {
        self.dispatch_task.abort();
        self.ping_task.abort();
    }
}

async fn dispatch_loop(
    mut local_rx: mpsc::Receiver<LocalEvent>,
    listener: Arc<LocalListener>,
    state: Arc<Mutex<HostState>>,
    static_ids: HashMap<String, ClientId>,
    events: mpsc::Sender<HostEvent>,
) {
    while let Some(event) = local_rx.recv().await {
        match event {
            LocalEvent::Connected { conn, uid, gid } => {
                state.lock().await.conns.insert(conn, ConnInfo { uid, gid, client: None });
            }
            LocalEvent::Disconnected { conn } => {
                let lost = {
                    let mut state = state.lock().await;
                    let client = state.conns.remove(&conn).and_then(|info| info.client);
                    if let Some(client) = client {
                        state.clients.remove(&client);
                    }
                    client
                };
                if let Some(client) = lost {
                    tracing::info!(client = format_args!("{client:#06x}"), "application disconnected");
                    if events.send(HostEvent::ApplicationLost { client }).await.is_err() {
                        return;
                    }
                }
            }
            LocalEvent::Command { conn, sender, command } => {
                handle_command(
                    conn,
                    sender,
                    command,
                    &listener,
                    &state,
                    &static_ids,
                    &events,
                )
                .await;
            }
        }
    }
}

async fn handle_command(
    conn: ConnectionId,
    sender: ClientId,
    command: Command,
    listener: &Arc<LocalListener>,
    state: &Arc<Mutex<HostState>>,
    static_ids: &HashMap<String, ClientId>,
    events: &mpsc::Sender<HostEvent>,
) {
    match command {
        Command::RegisterApplication { name, queue_name } => {
            let allocation = {
                let mut state = state.lock().await;
                allocate_client_id(&mut state, &name, static_ids)
            };
            let client = match allocation {
                Ok(client) => client,
                Err(reason) => {
                    tracing::warn!(%name, %reason, "registration rejected");
                    listener.close(conn).await;
                    return;
                }
            };
            let (uid, gid) = {
                let mut state = state.lock().await;
                state.clients.insert(
                    client,
                    ClientRecord {
                        conn,
                        name: name.clone(),
                        queue_name,
                        state: ApplicationState::New,
                        last_pong: Instant::now(),
                    },
                );
                let info = state.conns.get_mut(&conn);
                match info {
                    Some(info) => {
                        info.client = Some(client);
                        (info.uid, info.gid)
                    }
                    None => (u32::MAX, u32::MAX),
                }
            };

            if listener
                .send(conn, ROUTING_CLIENT_ID, &Command::RegisterApplicationAck { client })
                .await
                .is_err()
            {
                state.lock().await.clients.remove(&client);
                return;
            }
            {
                let mut state = state.lock().await;
                if let Some(record) = state.clients.get_mut(&client) {
                    record.state = ApplicationState::Initialized;
                }
            }
            tracing::info!(
                %name,
                client = format_args!("{client:#06x}"),
                "application registered"
            );
            let _ = events.send(HostEvent::ApplicationJoined { client, name, uid, gid }).await;
        }
        Command::DeregisterApplication => {
            let lost = {
                let mut state = state.lock().await;
                let client = state.conns.get_mut(&conn).and_then(|info| info.client.take());
                if let Some(client) = client {
                    state.clients.remove(&client);
                }
                client
            };
            listener.close(conn).await;
            if let Some(client) = lost {
                let _ = events.send(HostEvent::ApplicationLost { client }).await;
            }
        }
        Command::Pong => {
            let mut state = state.lock().await;
            if let Some(record) = state.clients.get_mut(&sender) {
                record.last_pong = Instant::now();
                if record.state == ApplicationState::Initialized {
                    record.state = ApplicationState::Started;
                }
            }
        }
        other => {
            // Everything else goes to the routing core, stamped with the
            // sender's credentials.
            let info = {
                let state = state.lock().await;
                state.conns.get(&conn).map(|info| (info.uid, info.gid, info.client))
            };
            match info {
                Some((uid, gid, Some(client))) if client == sender || sender == 0 => {
                    let _ = events
                        .send(HostEvent::Command { client, uid, gid, command: other })
                        .await;
                }
                Some(_) => {
                    tracing::warn!(conn, sender, "command from unregistered or mismatched sender");
                }
                None => {}
            }
        }
    }
}

fn allocate_client_id(
    state: &mut HostState,
    name: &str,
    static_ids: &HashMap<String, ClientId>,
) -> std::result::Result<ClientId, String> {
    if let Some(&id) = static_ids.get(name) {
        if state.clients.contains_key(&id) {
            return Err(format!("client id {id:#06x} already registered"));
        }
        return Ok(id);
    }
    // Dynamic allocation: next free id at or above the base, skipping
    // statically reserved values.
    let reserved: Vec<ClientId> = static_ids.values().copied().collect();
    let mut candidate = state.next_dynamic.max(DYNAMIC_CLIENT_BASE);
    for _ in 0..=u16::MAX {
        if candidate == 0xFFFF {
            candidate = DYNAMIC_CLIENT_BASE;
        }
        if !state.clients.contains_key(&candidate) && !reserved.contains(&candidate) {
            state.next_dynamic = candidate + 1;
            return Ok(candidate);
        }
        candidate += 1;
    }
    Err("client id space exhausted".to_string())
}

async fn ping_loop(
    listener: Arc<LocalListener>,
    state: Arc<Mutex<HostState>>,
    config: HostConfig,
    events: mpsc::Sender<HostEvent>,
) {
    let mut ticker = tokio::time::interval(config.ping_cadence);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick
    loop {
        ticker.tick().await;
        let now = Instant::now();
        let (to_ping, expired) = {
            let mut state = state.lock().await;
            let mut to_ping = Vec::new();
            let mut expired = Vec::new();
            for (&client, record) in state.clients.iter() {
                if now.duration_since(record.last_pong) >= config.pong_deadline {
                    expired.push((client, record.conn, record.name.clone()));
                } else {
                    to_ping.push((client, record.conn));
                }
            }
            for (client, _, _) in &expired {
                if let Some(record) = state.clients.remove(client) {
                    state.conns.remove(&record.conn);
                }
            }
            (to_ping, expired)
        };

        for (client, conn, name) in expired {
            tracing::warn!(
                %name,
                client = format_args!("{client:#06x}"),
                "pong deadline missed, deregistering"
            );
            listener.close(conn).await;
            if events.send(HostEvent::ApplicationLost { client }).await.is_err() {
                return;
            }
        }
        for (_client, conn) in to_ping {
            let _ = listener.send(conn, ROUTING_CLIENT_ID, &Command::Ping).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_allocation_skips_static_and_used() {
        let mut state = HostState { next_dynamic: DYNAMIC_CLIENT_BASE, ..HostState::default() };
        let mut static_ids = HashMap::new();
        static_ids.insert("fixed".to_string(), DYNAMIC_CLIENT_BASE);

        let first = allocate_client_id(&mut state, "a", &static_ids).expect("allocate");
        assert_eq!(first, DYNAMIC_CLIENT_BASE + 1);
        state.clients.insert(
            first,
            ClientRecord {
                conn: 1,
                name: "a".into(),
                queue_name: "/vsomeip-1.0".into(),
                state: ApplicationState::New,
                last_pong: Instant::now(),
            },
        );
        let second = allocate_client_id(&mut state, "b", &static_ids).expect("allocate");
        assert_eq!(second, DYNAMIC_CLIENT_BASE + 2);
    }

    #[test]
    fn test_static_collision_rejected() {
        let mut state = HostState { next_dynamic: DYNAMIC_CLIENT_BASE, ..HostState::default() };
        let mut static_ids = HashMap::new();
        static_ids.insert("app".to_string(), 0x0042);

        let first = allocate_client_id(&mut state, "app", &static_ids).expect("allocate");
        assert_eq!(first, 0x0042);
        state.clients.insert(
            first,
            ClientRecord {
                conn: 1,
                name: "app".into(),
                queue_name: "/vsomeip-1.0".into(),
                state: ApplicationState::New,
                last_pong: Instant::now(),
            },
        );
        // The same static id requested again is refused, not overwritten.
        let err = allocate_client_id(&mut state, "app", &static_ids).expect_err("collision");
        assert!(err.contains("already registered"));
    }
}
