//! Application side of the local bus.
//!
//! A proxy connects to the routing host's queue, registers, answers every
//! PING with an immediate PONG and forwards all other commands to the
//! application layer.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use veho_endpoint::local::LocalConnector;
use veho_types::ClientId;
use veho_wire::ipc::Command;

use crate::{client_queue_name, IpcError, Result};

static QUEUE_SEQ: AtomicU32 = AtomicU32::new(0);

/// Proxy-side bus configuration.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Maximum encoded command size.
    pub max_command_size: usize,
    /// Bounded queue slot count.
    pub slot_count: usize,
    /// How long to wait for the registration ack.
    pub register_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_command_size: veho_wire::ipc::DEFAULT_MAX_COMMAND_SIZE,
            slot_count: veho_endpoint::local::DEFAULT_SLOT_COUNT,
            register_timeout: Duration::from_secs(5),
        }
    }
}

/// A registered application proxy.
pub struct IpcProxy {
    connector: LocalConnector,
    client: ClientId,
    queue_name: String,
    pump_task: JoinHandle<()>,
}

impl IpcProxy {
    /// Connect to the routing host, register under `name` and wait for the
    /// allocated client id. Commands from the host (except PING, answered
    /// internally) arrive on `events`.
    pub async fn connect(
        host_socket: &Path,
        name: &str,
        config: ProxyConfig,
        events: mpsc::Sender<Command>,
    ) -> Result<Self> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<(ClientId, Command)>(256);
        let connector =
            LocalConnector::connect(host_socket, config.max_command_size, config.slot_count, raw_tx)
                .await?;

        let queue_name = client_queue_name(std::process::id(), QUEUE_SEQ.fetch_add(1, Ordering::Relaxed));
        connector.send(
            0,
            &Command::RegisterApplication {
                name: name.to_string(),
                queue_name: queue_name.clone(),
            },
        )?;

        // Wait for the ack; the host closes the connection on rejection.
        let client = loop {
            let received = tokio::time::timeout(config.register_timeout, raw_rx.recv())
                .await
                .map_err(|_| IpcError::HostUnavailable)?;
            match received {
                Some((_, Command::RegisterApplicationAck { client })) => break client,
                Some(_) => continue, // not ours; pre-registration noise
                None => {
                    return Err(IpcError::RegistrationRejected(
                        "routing host closed the connection".to_string(),
                    ))
                }
            }
        };
        tracing::info!(%name, client = format_args!("{client:#06x}"), "registered with routing host");

        // Pump the remaining host commands; PING is answered here so a busy
        // application cannot miss its pong deadline.
        let pong_connector = connector_handle(&connector);
        let pump_task = tokio::spawn(async move {
            while let Some((_, command)) = raw_rx.recv().await {
                match command {
                    Command::Ping => {
                        if pong_connector.send(client, &Command::Pong).is_err() {
                            return;
                        }
                    }
                    other => {
                        if events.send(other).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Self { connector, client, queue_name, pump_task })
    }

    /// The allocated client id.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// The queue name announced at registration.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Send a command to the routing host, stamped with this client id.
    pub fn send(&self, command: &Command) -> Result<()> {
        self.connector.send(self.client, command).map_err(IpcError::from)
    }

    /// Deregister and close the connection.
    pub fn stop(self) {
        let _ = self.connector.send(self.client, &Command::DeregisterApplication);
        self.pump_task.abort();
        self.connector.stop();
    }
}

/// Cheap clone of the connector's send side for the pump task.
fn connector_handle(connector: &LocalConnector) -> ProxySender {
    ProxySender { writer: connector.sender() }
}

/// Send-only handle usable from spawned tasks.
pub struct ProxySender {
    writer: veho_endpoint::local::LocalSender,
}

impl ProxySender {
    /// Send a command through the underlying connection.
    pub fn send(&self, client: ClientId, command: &Command) -> std::result::Result<(), veho_endpoint::EndpointError> {
        self.writer.send(client, command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostConfig, HostEvent, IpcHost};
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("veho-ipc-{}-{name}.sock", std::process::id()))
    }

    #[tokio::test]
    async fn test_register_assigns_dynamic_id() {
        let path = socket_path("dyn");
        let (host_events, mut host_rx) = mpsc::channel(16);
        let host = IpcHost::start(&path, HostConfig::default(), HashMap::new(), host_events)
            .await
            .expect("host");

        let (proxy_events, _proxy_rx) = mpsc::channel(16);
        let proxy = IpcProxy::connect(&path, "hello_client", ProxyConfig::default(), proxy_events)
            .await
            .expect("proxy");
        assert!(proxy.client() >= crate::host::DYNAMIC_CLIENT_BASE);

        match host_rx.recv().await.expect("event") {
            HostEvent::ApplicationJoined { client, name, .. } => {
                assert_eq!(client, proxy.client());
                assert_eq!(name, "hello_client");
            }
            other => unreachable!("unexpected event {other:?}"),
        }

        proxy.stop();
        host.stop().await;
    }

    #[tokio::test]
    async fn test_static_id_honored() {
        let path = socket_path("static");
        let (host_events, mut host_rx) = mpsc::channel(16);
        let mut static_ids = HashMap::new();
        static_ids.insert("hello_service".to_string(), 0x0042 as ClientId);
        let host = IpcHost::start(&path, HostConfig::default(), static_ids, host_events)
            .await
            .expect("host");

        let (proxy_events, _proxy_rx) = mpsc::channel(16);
        let proxy = IpcProxy::connect(&path, "hello_service", ProxyConfig::default(), proxy_events)
            .await
            .expect("proxy");
        assert_eq!(proxy.client(), 0x0042);

        let _ = host_rx.recv().await;
        proxy.stop();
        host.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_static_registration_rejected() {
        let path = socket_path("collision");
        let (host_events, _host_rx) = mpsc::channel(16);
        let mut static_ids = HashMap::new();
        static_ids.insert("app".to_string(), 0x0042 as ClientId);
        let host = IpcHost::start(&path, HostConfig::default(), static_ids, host_events)
            .await
            .expect("host");

        let (events_a, _rx_a) = mpsc::channel(16);
        let first = IpcProxy::connect(&path, "app", ProxyConfig::default(), events_a)
            .await
            .expect("first registration");

        let (events_b, _rx_b) = mpsc::channel(16);
        let second = IpcProxy::connect(&path, "app", ProxyConfig::default(), events_b).await;
        assert!(second.is_err(), "second registration with the same id must fail");

        first.stop();
        host.stop().await;
    }

    #[tokio::test]
    async fn test_command_forwarded_with_credentials() {
        let path = socket_path("cmd");
        let (host_events, mut host_rx) = mpsc::channel(16);
        let host = IpcHost::start(&path, HostConfig::default(), HashMap::new(), host_events)
            .await
            .expect("host");

        let (proxy_events, _proxy_rx) = mpsc::channel(16);
        let proxy = IpcProxy::connect(&path, "offerer", ProxyConfig::default(), proxy_events)
            .await
            .expect("proxy");
        let _ = host_rx.recv().await; // joined

        proxy
            .send(&Command::OfferService { service: 0x1111, instance: 0x2222, major: 1, minor: 0 })
            .expect("send");

        match host_rx.recv().await.expect("event") {
            HostEvent::Command { client, uid, command, .. } => {
                assert_eq!(client, proxy.client());
                assert_ne!(uid, u32::MAX);
                assert_eq!(
                    command,
                    Command::OfferService { service: 0x1111, instance: 0x2222, major: 1, minor: 0 }
                );
            }
            other => unreachable!("unexpected event {other:?}"),
        }

        proxy.stop();
        host.stop().await;
    }
}
