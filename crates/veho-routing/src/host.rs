//! The routing host: one per machine, owner of all external sockets.
//!
//! The host task multiplexes four event sources (the local IPC bus, the
//! endpoint engine, service discovery and the request-deadline sweep) over
//! one loop, so every table mutation happens on a single task and the
//! tables need no locks.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use veho_config::Config;
use veho_endpoint::tcp::{TcpClientPool, TcpConfig, TcpServer};
use veho_endpoint::udp::{UdpConfig, UdpEndpoint, UdpSender};
use veho_endpoint::EndpointEvent;
use veho_events::{DebounceFilter, Delivery, EventDistributor, EventSpec, SubscriberKey};
use veho_ipc::{queue_path, HostConfig, HostEvent, IpcHost, ROUTING_QUEUE_NAME};
use veho_policy::{Decision, Identity, PolicyGateway, StaticPolicy};
use veho_sd::{
    SdCommand, SdEvent, SdHandle, SdRuntimeConfig, SdTiming, ServiceDiscovery, SubscribeConfig,
};
use veho_types::{
    is_event_id, ClientId, Endpoint, EventgroupId, InstanceId, MessageType, ReturnCode,
    RoutingState, ServiceId, TransportProtocol, SD_METHOD_ID, SD_SERVICE_ID,
};
use veho_wire::ipc::Command;
use veho_wire::tp::Reassembler;
use veho_wire::Message;

use crate::tables::{OfferOutcome, Provider, RoutingTables, ServiceRecord};
use crate::{Result, RoutingError};

/// Payload bytes per TP segment: fits the datagram batch budget with the
/// SOME/IP and TP headers, aligned to the TP offset granularity.
const TP_SEGMENT_PAYLOAD: usize = 1392;

/// Startup options of the routing host.
#[derive(Clone, Debug)]
pub struct HostOptions {
    /// Base directory for the local queue sockets.
    pub base_dir: PathBuf,
    /// Deadline for pending requests.
    pub request_deadline: Duration,
    /// Sweep granularity for deadlines and reassembly timeouts.
    pub sweep_interval: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            base_dir: veho_ipc::default_base_dir(),
            request_deadline: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(500),
        }
    }
}

/// Handle to a running routing host.
pub struct RoutingHost {
    task: JoinHandle<()>,
    host_socket: PathBuf,
    control: mpsc::Sender<RoutingState>,
}

impl RoutingHost {
    /// Start the routing host for this machine.
    pub async fn start(config: Arc<Config>, options: HostOptions) -> Result<Self> {
        let host_socket = queue_path(&options.base_dir, ROUTING_QUEUE_NAME);

        // Policy gateway from the security section.
        let policy = if config.security.enable {
            let backend = StaticPolicy::from_json(&config.security.policies)?.with_whitelist(
                config.security.update_whitelist.uids.clone(),
                config.security.update_whitelist.services.clone(),
                config.security.update_whitelist.check_whitelist,
            );
            PolicyGateway::new(Arc::new(backend), config.security.check_credentials)
        } else {
            PolicyGateway::permissive()
        };

        // Local bus.
        let static_ids: HashMap<String, ClientId> = config
            .applications
            .iter()
            .filter_map(|app| app.id.map(|id| (app.name.clone(), id)))
            .collect();
        let (bus_tx, bus_rx) = mpsc::channel(256);
        let ipc = Arc::new(
            IpcHost::start(&host_socket, HostConfig::default(), static_ids, bus_tx).await?,
        );

        // Endpoint engine: merged event stream.
        let (net_tx, net_rx) = mpsc::channel(1024);

        let unicast = config.unicast.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        // SD socket on the configured port, joined to the SD multicast group.
        let sd_multicast: Ipv4Addr = config
            .service_discovery
            .multicast
            .parse()
            .unwrap_or(Ipv4Addr::new(224, 244, 224, 245));
        let sd_socket = UdpEndpoint::bind(
            UdpConfig {
                bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.service_discovery.port),
                multicast: Some(sd_multicast),
                ..UdpConfig::default()
            },
            net_tx.clone(),
        )
        .await?;

        // Shared client-side data socket.
        let data_socket = UdpEndpoint::bind(
            UdpConfig {
                bind: SocketAddr::new(unicast, 0),
                ..UdpConfig::default()
            },
            net_tx.clone(),
        )
        .await?;

        let tcp_pool = Arc::new(TcpClientPool::new(TcpConfig::default(), net_tx.clone()));

        // Service discovery.
        let (sd_events_tx, sd_events_rx) = mpsc::channel(256);
        let timing = SdTiming {
            initial_delay_min: Duration::from_millis(config.service_discovery.initial_delay_min),
            initial_delay_max: Duration::from_millis(config.service_discovery.initial_delay_max),
            repetition_base_delay: Duration::from_millis(
                config.service_discovery.repetition_base_delay,
            ),
            repetition_max: config.service_discovery.repetition_max,
            cyclic_offer_delay: Duration::from_millis(config.service_discovery.cyclic_offer_delay),
            ttl: config.service_discovery.ttl,
            request_response_delay_min: Duration::from_millis(
                config.service_discovery.request_response_delay_min,
            ),
            request_response_delay_max: Duration::from_millis(
                config.service_discovery.request_response_delay_max,
            ),
        };
        let sd = ServiceDiscovery::start(
            SdRuntimeConfig {
                timing,
                subscribe: SubscribeConfig::default(),
                multicast: SocketAddr::new(IpAddr::V4(sd_multicast), config.service_discovery.port),
            },
            sd_socket.sender(),
            sd_events_tx,
        );
        let sd_handle = sd.handle();
        let sd_enabled = config.service_discovery.enable;

        let core = HostCore {
            config,
            options: options.clone(),
            policy,
            ipc,
            tables: RoutingTables::new(),
            distributor: EventDistributor::new(),
            local_subscriptions: HashMap::new(),
            cyclic_next: HashMap::new(),
            identities: HashMap::new(),
            routing_state: RoutingState::Running,
            sd: sd_handle,
            sd_enabled,
            data_socket: data_socket.sender(),
            tcp_pool,
            server_udp: HashMap::new(),
            server_tcp: HashMap::new(),
            net_tx,
            reassembler: Reassembler::default(),
            unicast,
        };

        let (control_tx, control_rx) = mpsc::channel(16);
        let task = tokio::spawn(run(
            core, bus_rx, net_rx, sd_events_rx, control_rx, sd, sd_socket, data_socket,
        ));
        Ok(Self { task, host_socket, control: control_tx })
    }

    /// Path of the host queue socket applications connect to.
    pub fn host_socket(&self) -> &PathBuf {
        &self.host_socket
    }

    /// Change the routing state (embedded equivalent of the suspend and
    /// resume signals).
    pub async fn set_routing_state(&self, state: RoutingState) -> Result<()> {
        self.control.send(state).await.map_err(|_| RoutingError::Stopped)
    }

    /// Stop the host.
    pub fn stop(self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.host_socket);
    }
}

impl Drop for RoutingHost {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.host_socket);
    }
}

struct HostCore {
    config: Arc<Config>,
    options: HostOptions,
    policy: PolicyGateway,
    ipc: Arc<IpcHost>,
    tables: RoutingTables,
    distributor: EventDistributor,
    // Local clients subscribed per eventgroup (local and remote services).
    local_subscriptions: HashMap<(ServiceId, InstanceId, EventgroupId), HashSet<ClientId>>,
    // Next emission deadline per cyclic event, driven by the sweep.
    cyclic_next: HashMap<(ServiceId, InstanceId, u16), Instant>,
    identities: HashMap<ClientId, Identity>,
    routing_state: RoutingState,
    sd: SdHandle,
    sd_enabled: bool,
    data_socket: UdpSender,
    tcp_pool: Arc<TcpClientPool>,
    // Server-side endpoints per configured port, created on first offer.
    server_udp: HashMap<u16, UdpEndpoint>,
    server_tcp: HashMap<u16, TcpServer>,
    net_tx: mpsc::Sender<EndpointEvent>,
    reassembler: Reassembler,
    unicast: IpAddr,
}

#[allow(clippy::too_many_arguments)]
async fn run(
    mut core: HostCore,
    mut bus_rx: mpsc::Receiver<HostEvent>,
    mut net_rx: mpsc::Receiver<EndpointEvent>,
    mut sd_rx: mpsc::Receiver<SdEvent>,
    mut control_rx: mpsc::Receiver<RoutingState>,
    sd: ServiceDiscovery,
    sd_socket: UdpEndpoint,
    data_socket: UdpEndpoint,
) {
    let mut sweep = tokio::time::interval(core.options.sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = bus_rx.recv() => match event {
                Some(event) => core.on_bus_event(event).await,
                None => break,
            },
            event = net_rx.recv() => match event {
                Some(event) => core.on_net_event(event).await,
                None => break,
            },
            event = sd_rx.recv() => match event {
                Some(event) => core.on_sd_event(event).await,
                None => break,
            },
            state = control_rx.recv() => match state {
                Some(state) => core.set_routing_state(state).await,
                None => break,
            },
            _ = sweep.tick() => core.on_sweep(Instant::now()).await,
        }
    }
    sd.stop();
    sd_socket.stop();
    data_socket.stop();
    tracing::info!("routing host stopped");
}

impl HostCore {
    // ------------------------------------------------------------------
    // Local bus
    // ------------------------------------------------------------------

    async fn on_bus_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::ApplicationJoined { client, name, uid, gid } => {
                let identity = Identity::local(uid, gid);
                if self.policy.authenticate_router(&identity) == Decision::Deny {
                    tracing::warn!(%name, "application failed router authentication");
                }
                self.identities.insert(client, identity);
                // Late joiners learn the current routing state immediately.
                let state = self.routing_state;
                self.send_command(client, &Command::SetRoutingState { state }).await;
            }
            HostEvent::ApplicationLost { client } => {
                self.on_application_lost(client).await;
            }
            HostEvent::Command { client, uid, gid, command } => {
                let identity = Identity::local(uid, gid);
                self.identities.insert(client, identity);
                self.on_app_command(client, identity, command).await;
            }
        }
    }

    async fn on_application_lost(&mut self, client: ClientId) {
        tracing::info!(client = format_args!("{client:#06x}"), "cleaning up lost application");
        let withdrawn = self.tables.remove_client(client);
        for (service, instance) in withdrawn {
            let _ = self.sd.send(SdCommand::StopOfferService { service, instance }).await;
            self.distributor.remove_instance(service, instance);
            self.cyclic_next.retain(|&(s, i, _), _| !(s == service && i == instance));
            self.broadcast_availability(service, instance, false).await;
        }
        self.distributor.unsubscribe_client(client);
        for subscribers in self.local_subscriptions.values_mut() {
            subscribers.remove(&client);
        }
        self.identities.remove(&client);
    }

    async fn on_app_command(&mut self, client: ClientId, identity: Identity, command: Command) {
        match command {
            Command::OfferService { service, instance, major, minor } => {
                self.on_local_offer(client, identity, service, instance, major, minor).await;
            }
            Command::StopOfferService { service, instance, .. } => {
                if let Some(record) = self.tables.service(service, instance) {
                    if record.provider != (Provider::Local { client }) {
                        return; // not the provider
                    }
                }
                if self.tables.stop_offer(service, instance).is_some() {
                    let _ = self.sd.send(SdCommand::StopOfferService { service, instance }).await;
                    self.distributor.remove_instance(service, instance);
                    self.cyclic_next.retain(|&(s, i, _), _| !(s == service && i == instance));
                    self.broadcast_availability(service, instance, false).await;
                }
            }
            Command::RequestService { service, instance, major, minor } => {
                self.tables.add_request(client, service, instance);
                if self.tables.availability(service, instance).is_up() {
                    let record = self.tables.service(service, instance);
                    let (major, minor) =
                        record.map(|r| (r.major, r.minor)).unwrap_or((major, minor));
                    self.send_command(
                        client,
                        &Command::OfferService { service, instance, major, minor },
                    )
                    .await;
                } else if self.sd_enabled {
                    let _ = self
                        .sd
                        .send(SdCommand::RequestService { service, instance, major, minor })
                        .await;
                }
            }
            Command::ReleaseService { service, instance } => {
                self.tables.release_request(client, service, instance);
                if self.tables.requesters(service, instance).is_empty() {
                    let _ = self.sd.send(SdCommand::ReleaseService { service, instance }).await;
                }
            }
            Command::Subscribe { service, instance, eventgroup, major, ttl } => {
                self.on_local_subscribe(client, identity, service, instance, eventgroup, major, ttl)
                    .await;
            }
            Command::Unsubscribe { service, instance, eventgroup } => {
                self.local_subscriptions
                    .entry((service, instance, eventgroup))
                    .or_default()
                    .remove(&client);
                self.distributor.unsubscribe(
                    service,
                    instance,
                    eventgroup,
                    &SubscriberKey::local(client),
                );
                let still_subscribed = self
                    .local_subscriptions
                    .get(&(service, instance, eventgroup))
                    .is_some_and(|set| !set.is_empty());
                let remote = matches!(
                    self.tables.service(service, instance).map(|r| r.provider),
                    Some(Provider::Remote)
                );
                if remote && !still_subscribed {
                    let _ = self
                        .sd
                        .send(SdCommand::Unsubscribe { service, instance, eventgroup })
                        .await;
                }
            }
            Command::SomeIpMessage { instance, reliable, frame, .. } => {
                match Message::decode(&frame) {
                    Ok((mut message, _)) => {
                        message.instance = instance;
                        message.is_reliable = reliable;
                        self.dispatch_outbound(client, identity, message).await;
                    }
                    Err(error) => {
                        tracing::warn!(client, %error, "dropped malformed frame from application");
                    }
                }
            }
            Command::SomeIpField { instance, frame } => {
                if let Ok((message, _)) = Message::decode(&frame) {
                    self.on_local_notify(client, instance, message, true).await;
                }
            }
            Command::SetRoutingState { state } => {
                self.set_routing_state(state).await;
            }
            other => {
                tracing::debug!(client, command = other.id(), "unhandled bus command");
            }
        }
    }

    async fn on_local_offer(
        &mut self,
        client: ClientId,
        identity: Identity,
        service: ServiceId,
        instance: InstanceId,
        major: u8,
        minor: u32,
    ) {
        if !self.policy.is_offer_allowed(&identity, service, instance).is_allowed() {
            tracing::warn!(client, "offer denied by policy");
            return;
        }

        // Server endpoints from the static service configuration.
        let (reliable, unreliable) = self.ensure_server_endpoints(service, instance).await;

        let outcome = self.tables.offer(
            service,
            instance,
            ServiceRecord {
                major,
                minor,
                provider: Provider::Local { client },
                reliable,
                unreliable,
            },
        );
        match outcome {
            OfferOutcome::Rejected => {
                tracing::warn!(
                    service = format_args!("{service:#06x}"),
                    instance = format_args!("{instance:#06x}"),
                    "offer rejected: older minor version"
                );
                self.send_command(
                    client,
                    &Command::SubscribeNack { service, instance, eventgroup: 0 },
                )
                .await;
            }
            OfferOutcome::Unchanged => {} // idempotent re-offer
            OfferOutcome::Accepted => {
                self.register_configured_events(service, instance);
                if self.sd_enabled {
                    let _ = self
                        .sd
                        .send(SdCommand::OfferService {
                            service,
                            instance,
                            major,
                            minor,
                            reliable,
                            unreliable,
                        })
                        .await;
                }
                self.broadcast_availability(service, instance, true).await;
            }
        }
    }

    /// Provider-side debounce for subscribers of an eventgroup, from the
    /// service configuration.
    fn filter_for_group(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> Option<DebounceFilter> {
        let service_config = self.config.find_service(service, instance)?;
        let group = service_config.eventgroups.iter().find(|g| g.eventgroup == eventgroup)?;
        group
            .events
            .iter()
            .find_map(|event| event.debounce.as_ref())
            .map(|debounce| DebounceFilter::new(debounce.interval, debounce.on_change, None))
    }

    fn register_configured_events(&mut self, service: ServiceId, instance: InstanceId) {
        let Some(service_config) = self.config.find_service(service, instance) else {
            return;
        };
        for group in &service_config.eventgroups {
            let mut ids = Vec::new();
            for event in &group.events {
                let spec = if event.is_field {
                    EventSpec::field(event.event)
                } else {
                    EventSpec::event(event.event)
                }
                .with_reliable(event.is_reliable)
                .with_cycle(Duration::from_millis(event.cycle));
                self.distributor.register_event(service, instance, spec);
                if event.cycle > 0 {
                    self.cyclic_next.insert(
                        (service, instance, event.event),
                        Instant::now() + Duration::from_millis(event.cycle),
                    );
                }
                ids.push(event.event);
            }
            self.distributor.register_eventgroup(service, instance, group.eventgroup, ids);
        }
    }

    async fn ensure_server_endpoints(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
    ) -> (Option<Endpoint>, Option<Endpoint>) {
        let Some(service_config) = self.config.find_service(service, instance).cloned() else {
            return (None, None);
        };
        let mut reliable = None;
        let mut unreliable = None;

        if let Some(port) = service_config.unreliable {
            if !self.server_udp.contains_key(&port) {
                match UdpEndpoint::bind(
                    UdpConfig {
                        bind: SocketAddr::new(self.unicast, port),
                        ..UdpConfig::default()
                    },
                    self.net_tx.clone(),
                )
                .await
                {
                    Ok(endpoint) => {
                        self.server_udp.insert(port, endpoint);
                    }
                    Err(error) => {
                        tracing::error!(port, %error, "cannot bind service datagram port");
                    }
                }
            }
            if self.server_udp.contains_key(&port) {
                unreliable = Some(Endpoint::udp(self.unicast, port));
            }
        }
        if let Some(ref tcp) = service_config.reliable {
            let port = tcp.port;
            if !self.server_tcp.contains_key(&port) {
                let tcp_config = TcpConfig {
                    enable_magic_cookies: tcp.enable_magic_cookies,
                    ..TcpConfig::default()
                };
                match TcpServer::bind(
                    SocketAddr::new(self.unicast, port),
                    tcp_config,
                    self.net_tx.clone(),
                )
                .await
                {
                    Ok(server) => {
                        self.server_tcp.insert(port, server);
                    }
                    Err(error) => {
                        tracing::error!(port, %error, "cannot bind service stream port");
                    }
                }
            }
            if self.server_tcp.contains_key(&port) {
                reliable = Some(Endpoint::tcp(self.unicast, port));
            }
        }
        (reliable, unreliable)
    }

    async fn on_local_subscribe(
        &mut self,
        client: ClientId,
        identity: Identity,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: u8,
        ttl: u32,
    ) {
        if !self
            .policy
            .is_member_allowed(&identity, service, instance, eventgroup)
            .is_allowed()
        {
            self.send_command(client, &Command::SubscribeNack { service, instance, eventgroup })
                .await;
            return;
        }

        self.local_subscriptions
            .entry((service, instance, eventgroup))
            .or_default()
            .insert(client);

        match self.tables.service(service, instance).map(|r| r.provider) {
            Some(Provider::Local { .. }) => {
                let filter = self.filter_for_group(service, instance, eventgroup);
                let initial = self.distributor.subscribe(
                    service,
                    instance,
                    eventgroup,
                    SubscriberKey::local(client),
                    filter,
                    Instant::now(),
                );
                match initial {
                    Ok(deliveries) => {
                        self.send_command(
                            client,
                            &Command::SubscribeAck { service, instance, eventgroup },
                        )
                        .await;
                        for delivery in deliveries {
                            self.deliver(delivery).await;
                        }
                    }
                    Err(_) => {
                        self.send_command(
                            client,
                            &Command::SubscribeNack { service, instance, eventgroup },
                        )
                        .await;
                    }
                }
            }
            Some(Provider::Remote) => {
                let unreliable_local =
                    Some(Endpoint::udp(self.unicast, self.data_socket.local_endpoint().port));
                let _ = self
                    .sd
                    .send(SdCommand::Subscribe {
                        service,
                        instance,
                        eventgroup,
                        major,
                        ttl,
                        reliable: None,
                        unreliable: unreliable_local,
                    })
                    .await;
                // Ack follows from the SD handshake.
            }
            None => {
                // Neither offered locally nor seen remotely yet; the
                // subscription fires once the offer arrives.
                let unreliable_local =
                    Some(Endpoint::udp(self.unicast, self.data_socket.local_endpoint().port));
                let _ = self
                    .sd
                    .send(SdCommand::Subscribe {
                        service,
                        instance,
                        eventgroup,
                        major,
                        ttl,
                        reliable: None,
                        unreliable: unreliable_local,
                    })
                    .await;
            }
        }
    }

    async fn on_local_notify(
        &mut self,
        _client: ClientId,
        instance: InstanceId,
        message: Message,
        is_field: bool,
    ) {
        if !is_event_id(message.method) {
            return;
        }
        let service = message.service;
        // Auto-register events the configuration does not describe.
        if !self.distributor.has_event(service, instance, message.method) {
            let spec = if is_field {
                EventSpec::field(message.method)
            } else {
                EventSpec::event(message.method)
            };
            self.distributor.register_event(service, instance, spec);
        }

        let result = self.distributor.notify(
            service,
            instance,
            message.method,
            message.payload.clone(),
            false,
            Instant::now(),
        );
        match result {
            Ok((fired, deliveries)) => {
                if fired {
                    if let Some((cycle, true)) =
                        self.distributor.cycle_of(service, instance, message.method)
                    {
                        // A change restarts this event's cycle timer.
                        self.cyclic_next
                            .insert((service, instance, message.method), Instant::now() + cycle);
                    }
                }
                if !self.routing_state.allows_notifications() {
                    return; // diagnosis or suspended: suppress fan-out
                }
                for delivery in deliveries {
                    self.deliver(delivery).await;
                }
            }
            Err(error) => {
                tracing::debug!(%error, "notify for unregistered event");
            }
        }
    }

    /// Move one distributor delivery to its subscriber.
    async fn deliver(&mut self, delivery: Delivery) {
        let mut message =
            Message::notification(delivery.service, delivery.event, delivery.payload.clone());
        message.instance = delivery.instance;
        message.is_initial = delivery.is_initial;
        message.interface_version = self
            .tables
            .service(delivery.service, delivery.instance)
            .map(|r| r.major)
            .unwrap_or(1);
        message.is_reliable = delivery.reliable;

        match delivery.subscriber.endpoint {
            None => {
                let command = Command::SomeIpMessage {
                    instance: delivery.instance,
                    reliable: delivery.reliable,
                    initial: delivery.is_initial,
                    frame: message.encode(),
                };
                self.send_command(delivery.subscriber.client, &command).await;
            }
            Some(endpoint) => {
                // Skip silently while the transport is down; the
                // subscription stays pending until it recovers.
                let _ = self.send_network(&message, endpoint).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound dispatch
    // ------------------------------------------------------------------

    async fn dispatch_outbound(&mut self, sender: ClientId, identity: Identity, mut message: Message) {
        if !self.routing_state.allows_sending() {
            tracing::debug!("outbound message dropped: routing suspended");
            return;
        }
        // Fill in sender bookkeeping the application left empty.
        if message.client == 0 {
            message.client = sender;
        }
        if message.session == 0 {
            message.session = self.tables.next_session(message.client);
        }

        match message.message_type {
            MessageType::Request | MessageType::RequestNoReturn => {
                self.dispatch_request(sender, identity, message).await;
            }
            MessageType::Response | MessageType::Error => {
                self.dispatch_local_response(message).await;
            }
            MessageType::Notification => {
                let instance = message.instance;
                self.on_local_notify(sender, instance, message, false).await;
            }
            other => {
                tracing::debug!(?other, "unexpected message type from application");
            }
        }
    }

    async fn dispatch_request(&mut self, sender: ClientId, identity: Identity, message: Message) {
        let (service, instance) = (message.service, message.instance);
        let is_request = message.message_type == MessageType::Request;

        let allowed = self
            .policy
            .is_request_allowed(&identity, service, instance)
            .is_allowed()
            && self
                .policy
                .is_member_allowed(&identity, service, instance, message.method)
                .is_allowed();
        if !allowed {
            if is_request {
                let error = Message::error_to(&message, ReturnCode::NotOk);
                self.send_to_local(sender, &error).await;
            }
            return; // silent drop for no-return messages
        }

        let Some(record) = self.tables.service(service, instance).cloned() else {
            if is_request {
                let error = Message::error_to(&message, ReturnCode::UnknownService);
                self.send_to_local(sender, &error).await;
            }
            return;
        };

        match record.provider {
            Provider::Local { client: provider } => {
                if is_request {
                    self.tables.add_pending(
                        message.client,
                        message.session,
                        sender,
                        Instant::now() + self.options.request_deadline,
                        None,
                    );
                }
                let command = Command::SomeIpMessage {
                    instance,
                    reliable: message.is_reliable,
                    initial: false,
                    frame: message.encode(),
                };
                self.send_command(provider, &command).await;
            }
            Provider::Remote => {
                let Some(endpoint) = pick_endpoint(&record, message.is_reliable) else {
                    if is_request {
                        let error = Message::error_to(&message, ReturnCode::NotReachable);
                        self.send_to_local(sender, &error).await;
                    }
                    return;
                };
                if is_request {
                    self.tables.add_pending(
                        message.client,
                        message.session,
                        sender,
                        Instant::now() + self.options.request_deadline,
                        Some(endpoint),
                    );
                }
                if let Err(error) = self.send_network(&message, endpoint).await {
                    tracing::warn!(%error, "network send failed");
                    if is_request {
                        self.tables.take_pending(message.client, message.session);
                        let error = Message::error_to(&message, ReturnCode::NotReachable);
                        self.send_to_local(sender, &error).await;
                    }
                }
            }
        }
    }

    async fn dispatch_local_response(&mut self, message: Message) {
        // A response from a local server either answers a local requester
        // or goes back to the remote peer the request came from.
        if let Some(pending) = self.tables.take_pending(message.client, message.session) {
            self.send_to_local(pending.requester, &message).await;
            return;
        }
        if let Some((endpoint, reliable)) =
            self.tables.take_remote_pending(message.client, message.session)
        {
            let mut message = message;
            message.is_reliable = reliable;
            if let Err(error) = self.send_network(&message, endpoint).await {
                tracing::warn!(%error, "response to remote requester failed");
            }
            return;
        }
        tracing::debug!(
            client = format_args!("{:#06x}", message.client),
            session = message.session,
            "response without a pending request"
        );
    }

    async fn send_to_local(&mut self, client: ClientId, message: &Message) {
        let command = Command::SomeIpMessage {
            instance: message.instance,
            reliable: message.is_reliable,
            initial: message.is_initial,
            frame: message.encode(),
        };
        self.send_command(client, &command).await;
    }

    async fn send_network(&mut self, message: &Message, endpoint: Endpoint) -> Result<()> {
        match endpoint.protocol {
            TransportProtocol::Udp => {
                // Messages that do not fit a datagram batch travel as TP
                // segments.
                if message.encoded_len() > veho_endpoint::packetizer::DEFAULT_UDP_BUDGET {
                    for segment in veho_wire::tp::segment(message, TP_SEGMENT_PAYLOAD) {
                        self.data_socket.send(endpoint.socket_addr(), segment.encode(), true)?;
                    }
                } else {
                    self.data_socket.send(endpoint.socket_addr(), message.encode(), true)?;
                }
                Ok(())
            }
            TransportProtocol::Tcp => {
                self.tcp_pool.send(endpoint.socket_addr(), message.encode(), true).await?;
                Ok(())
            }
            TransportProtocol::Local => Err(RoutingError::UnknownService(
                message.service,
                message.instance,
            )),
        }
    }

    async fn send_command(&self, client: ClientId, command: &Command) {
        if let Err(error) = self.ipc.send_to_client(client, command).await {
            tracing::debug!(
                client = format_args!("{client:#06x}"),
                %error,
                "command to application dropped"
            );
        }
    }

    async fn broadcast_availability(&mut self, service: ServiceId, instance: InstanceId, up: bool) {
        let (major, minor) = self
            .tables
            .service(service, instance)
            .map(|r| (r.major, r.minor))
            .unwrap_or((0, 0));
        let command = if up {
            Command::OfferService { service, instance, major, minor }
        } else {
            Command::StopOfferService { service, instance, major, minor }
        };
        for client in self.tables.requesters(service, instance) {
            self.send_command(client, &command).await;
        }
    }

    async fn set_routing_state(&mut self, state: RoutingState) {
        if self.routing_state == state {
            return;
        }
        tracing::info!(?state, "routing state changed");
        self.routing_state = state;
        let _ = self
            .sd
            .send(SdCommand::SetEnabled {
                enabled: self.sd_enabled && state.allows_discovery(),
            })
            .await;
        // Every application learns the new state so its sends can fail
        // fast with NotRunning.
        for client in self.ipc.registered_clients().await {
            self.send_command(client, &Command::SetRoutingState { state }).await;
        }
    }

    // ------------------------------------------------------------------
    // Network inbound
    // ------------------------------------------------------------------

    async fn on_net_event(&mut self, event: EndpointEvent) {
        match event {
            EndpointEvent::Frame(message) => {
                if message.service == SD_SERVICE_ID && message.method == SD_METHOD_ID {
                    let _ = self.sd.send(SdCommand::Inbound { message }).await;
                    return;
                }
                let message = if message.message_type.is_tp() {
                    match self.reassembler.feed(message, Instant::now()) {
                        Ok(Some(complete)) => complete,
                        Ok(None) => return,
                        Err(error) => {
                            tracing::debug!(%error, "TP reassembly failed");
                            return;
                        }
                    }
                } else {
                    message
                };
                self.dispatch_inbound(message).await;
            }
            EndpointEvent::PeerUp(endpoint) => {
                tracing::debug!(%endpoint, "peer up");
            }
            EndpointEvent::PeerDown(endpoint) => {
                self.on_endpoint_down(endpoint).await;
            }
        }
    }

    async fn dispatch_inbound(&mut self, mut message: Message) {
        // The instance is not on the wire; resolve it from the target port.
        if let Some(instance) = self.instance_for_target(&message) {
            message.instance = instance;
        }

        match message.message_type {
            MessageType::Response | MessageType::Error => {
                if let Some(pending) = self.tables.take_pending(message.client, message.session) {
                    self.send_to_local(pending.requester, &message).await;
                } else {
                    tracing::debug!("response from network without pending request");
                }
            }
            MessageType::Request | MessageType::RequestNoReturn => {
                self.dispatch_inbound_request(message).await;
            }
            MessageType::Notification => {
                self.dispatch_inbound_notification(message).await;
            }
            other => {
                tracing::debug!(?other, "unexpected inbound message type");
            }
        }
    }

    fn instance_for_target(&self, message: &Message) -> Option<InstanceId> {
        let target = message.target?;
        for service_config in &self.config.services {
            if service_config.service != message.service {
                continue;
            }
            let matches = service_config.unreliable == Some(target.port)
                || service_config.reliable.as_ref().map(|r| r.port) == Some(target.port);
            if matches {
                return Some(service_config.instance);
            }
        }
        None
    }

    async fn dispatch_inbound_request(&mut self, message: Message) {
        let (service, instance) = (message.service, message.instance);
        let is_request = message.message_type == MessageType::Request;
        let Some(record) = self.tables.service(service, instance) else {
            if is_request {
                if let Some(source) = message.source {
                    let mut error = Message::error_to(&message, ReturnCode::UnknownService);
                    error.is_reliable = message.is_reliable;
                    let _ = self.send_network(&error, source).await;
                }
            }
            return;
        };
        let Provider::Local { client: provider } = record.provider else {
            return; // not served here
        };
        if message.interface_version != record.major {
            if is_request {
                if let Some(source) = message.source {
                    let mut error =
                        Message::error_to(&message, ReturnCode::WrongInterfaceVersion);
                    error.is_reliable = message.is_reliable;
                    let _ = self.send_network(&error, source).await;
                }
            }
            return;
        }

        if is_request {
            if let Some(source) = message.source {
                self.tables.add_remote_pending(
                    message.client,
                    message.session,
                    source,
                    message.is_reliable,
                );
            }
        }
        let command = Command::SomeIpMessage {
            instance,
            reliable: message.is_reliable,
            initial: false,
            frame: message.encode(),
        };
        self.send_command(provider, &command).await;
    }

    async fn dispatch_inbound_notification(&mut self, message: Message) {
        // Deliver to every local client subscribed to any eventgroup of
        // this service instance.
        let mut recipients: HashSet<ClientId> = HashSet::new();
        for ((service, instance, _group), clients) in &self.local_subscriptions {
            if *service == message.service && *instance == message.instance {
                recipients.extend(clients.iter().copied());
            }
        }
        // Unknown instance on notifications without a port match: fall back
        // to subscriptions keyed by service only.
        if recipients.is_empty() && message.instance == 0 {
            for ((service, _instance, _group), clients) in &self.local_subscriptions {
                if *service == message.service {
                    recipients.extend(clients.iter().copied());
                }
            }
        }
        for client in recipients {
            self.send_to_local(client, &message).await;
        }
    }

    async fn on_endpoint_down(&mut self, endpoint: Endpoint) {
        tracing::info!(%endpoint, "endpoint down");
        let dropped = self.distributor.unsubscribe_endpoint(&endpoint);
        if dropped > 0 {
            tracing::debug!(count = dropped, "dropped remote subscriptions");
        }
        // Abort pending requests that went to that endpoint.
        for (client, session, pending) in self.tables.take_pending_for_endpoint(&endpoint) {
            let mut error = Message::request(0, 0, Bytes::new());
            error.client = client;
            error.session = session;
            error.message_type = MessageType::Error;
            error.return_code = ReturnCode::NotReachable;
            self.send_to_local(pending.requester, &error).await;
        }
    }

    // ------------------------------------------------------------------
    // Service discovery events
    // ------------------------------------------------------------------

    async fn on_sd_event(&mut self, event: SdEvent) {
        match event {
            SdEvent::ServiceOffered {
                service,
                instance,
                major,
                minor,
                reliable,
                unreliable,
                ..
            } => {
                // A local offer always wins over a remote one.
                if matches!(
                    self.tables.service(service, instance).map(|r| r.provider),
                    Some(Provider::Local { .. })
                ) {
                    return;
                }
                let outcome = self.tables.offer(
                    service,
                    instance,
                    ServiceRecord {
                        major,
                        minor,
                        provider: Provider::Remote,
                        reliable,
                        unreliable,
                    },
                );
                if outcome == OfferOutcome::Accepted {
                    self.broadcast_availability(service, instance, true).await;
                }
            }
            SdEvent::ServiceStopped { service, instance } => {
                if matches!(
                    self.tables.service(service, instance).map(|r| r.provider),
                    Some(Provider::Remote)
                ) {
                    self.tables.stop_offer(service, instance);
                    self.broadcast_availability(service, instance, false).await;
                }
            }
            SdEvent::SubscriptionAcked { service, instance, eventgroup } => {
                let clients = self
                    .local_subscriptions
                    .get(&(service, instance, eventgroup))
                    .cloned()
                    .unwrap_or_default();
                for client in clients {
                    self.send_command(
                        client,
                        &Command::SubscribeAck { service, instance, eventgroup },
                    )
                    .await;
                }
            }
            SdEvent::SubscriptionNacked { service, instance, eventgroup }
            | SdEvent::SubscriptionExpired { service, instance, eventgroup } => {
                let clients = self
                    .local_subscriptions
                    .get(&(service, instance, eventgroup))
                    .cloned()
                    .unwrap_or_default();
                for client in clients {
                    self.send_command(
                        client,
                        &Command::SubscribeNack { service, instance, eventgroup },
                    )
                    .await;
                }
            }
            SdEvent::RemoteSubscribe {
                service,
                instance,
                eventgroup,
                major,
                ttl,
                counter,
                subscriber,
                reliable,
                unreliable,
            } => {
                self.on_remote_subscribe(
                    service, instance, eventgroup, major, ttl, counter, subscriber, reliable,
                    unreliable,
                )
                .await;
            }
            SdEvent::RemoteUnsubscribe { service, instance, eventgroup, subscriber } => {
                // Subscriptions are keyed by notification endpoint; drop
                // every one behind the subscriber's SD endpoint.
                let _ = (eventgroup, subscriber);
                let removed = self.distributor.unsubscribe_endpoint(&Endpoint::udp(
                    subscriber.address,
                    subscriber.port,
                ));
                tracing::debug!(service, instance, removed, "remote unsubscribe");
            }
            SdEvent::PeerRebooted { peer } => {
                tracing::info!(%peer, "peer rebooted");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_remote_subscribe(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: u8,
        ttl: u32,
        counter: u8,
        subscriber: Endpoint,
        reliable: Option<Endpoint>,
        unreliable: Option<Endpoint>,
    ) {
        let offered_locally = matches!(
            self.tables.service(service, instance).map(|r| r.provider),
            Some(Provider::Local { .. })
        );
        let known_group = self
            .distributor
            .eventgroup_events(service, instance, eventgroup)
            .is_some();
        let accept = offered_locally && known_group;

        let verdict = SdCommand::AcceptSubscription {
            service,
            instance,
            eventgroup,
            major,
            counter,
            subscriber,
            accept: accept.then_some(ttl),
        };
        let _ = self.sd.send(verdict).await;

        if accept {
            let notify_endpoint = unreliable.or(reliable);
            if let Some(endpoint) = notify_endpoint {
                // Remote subscribers carry no client-side state; the
                // provider-side debounce is all the filtering they get.
                let filter = self.filter_for_group(service, instance, eventgroup);
                let initial = self.distributor.subscribe(
                    service,
                    instance,
                    eventgroup,
                    SubscriberKey::remote(endpoint),
                    filter,
                    Instant::now(),
                );
                if let Ok(deliveries) = initial {
                    for delivery in deliveries {
                        self.deliver(delivery).await;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Sweeps
    // ------------------------------------------------------------------

    async fn on_sweep(&mut self, now: Instant) {
        for (client, session, pending) in self.tables.expired_pending(now) {
            // Synthesize the timeout error locally, exactly once.
            let mut error = Message::request(0, 0, Bytes::new());
            error.client = client;
            error.session = session;
            error.message_type = MessageType::Error;
            error.return_code = ReturnCode::Timeout;
            self.send_to_local(pending.requester, &error).await;
        }
        let dropped = self.reassembler.expire(now);
        if dropped > 0 {
            tracing::debug!(dropped, "dropped incomplete TP reassemblies");
        }
        let due = self.distributor.poll_due(now);
        for delivery in due {
            self.deliver(delivery).await;
        }
        self.emit_cyclic(now).await;
    }

    /// Re-emit cached values of cyclic events whose period elapsed.
    async fn emit_cyclic(&mut self, now: Instant) {
        for (service, instance, event, cycle) in self.distributor.cyclic_events() {
            let next = self
                .cyclic_next
                .entry((service, instance, event))
                .or_insert(now + cycle);
            if now < *next {
                continue;
            }
            *next = now + cycle;
            let Some(payload) = self.distributor.cached_value(service, instance, event).cloned()
            else {
                continue; // nothing written yet
            };
            match self.distributor.notify(service, instance, event, payload, true, now) {
                Ok((_, deliveries)) => {
                    if !self.routing_state.allows_notifications() {
                        continue;
                    }
                    for delivery in deliveries {
                        self.deliver(delivery).await;
                    }
                }
                Err(error) => {
                    tracing::debug!(%error, "cyclic event vanished");
                    self.cyclic_next.remove(&(service, instance, event));
                }
            }
        }
    }
}

fn pick_endpoint(record: &ServiceRecord, prefer_reliable: bool) -> Option<Endpoint> {
    if prefer_reliable {
        record.reliable.or(record.unreliable)
    } else {
        record.unreliable.or(record.reliable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_endpoint_prefers_hint() {
        let record = ServiceRecord {
            major: 1,
            minor: 0,
            provider: Provider::Remote,
            reliable: Some(Endpoint::tcp([10u8, 0, 0, 1].into(), 30510)),
            unreliable: Some(Endpoint::udp([10u8, 0, 0, 1].into(), 30509)),
        };
        assert!(pick_endpoint(&record, true).expect("endpoint").is_reliable());
        assert!(!pick_endpoint(&record, false).expect("endpoint").is_reliable());

        let reliable_only = ServiceRecord { unreliable: None, ..record.clone() };
        assert!(pick_endpoint(&reliable_only, false).expect("endpoint").is_reliable());
    }
}
