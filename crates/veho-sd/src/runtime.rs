//! The discovery runtime task.
//!
//! Owns the SD socket handle, drives every offer/find/subscription machine
//! from one loop, and exchanges commands and events with the routing core.
//! All SD frames ride on the datagram transport: multicast by default,
//! unicast where the protocol calls for a directed answer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use veho_endpoint::udp::UdpSender;
use veho_types::{
    Endpoint, EventgroupId, InstanceId, MajorVersion, MessageType, MinorVersion, ReturnCode,
    ServiceId, SubscriptionState, Ttl, ANY_INSTANCE, ANY_MAJOR, ANY_MINOR, ANY_SERVICE,
    PROTOCOL_VERSION, SD_METHOD_ID, SD_SERVICE_ID,
};
use veho_wire::sd::{SdEntry, SdEntryType, SdOption, SdPayload};
use veho_wire::Message;

use crate::fsm::{FindFsm, OfferFsm, SdAction};
use crate::reboot::{RebootTracker, SessionSender};
use crate::subscription::{SubscribeAction, SubscribeConfig, SubscriptionFsm};
use crate::{Result, SdError, SdTiming};

/// Commands from the routing core.
#[derive(Debug)]
pub enum SdCommand {
    /// Announce a locally offered service.
    OfferService {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Major version.
        major: MajorVersion,
        /// Minor version.
        minor: MinorVersion,
        /// Reliable endpoint to advertise.
        reliable: Option<Endpoint>,
        /// Unreliable endpoint to advertise.
        unreliable: Option<Endpoint>,
    },
    /// Withdraw a local offer.
    StopOfferService {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
    },
    /// Start searching for a remote service.
    RequestService {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Requested major version.
        major: MajorVersion,
        /// Requested minor version.
        minor: MinorVersion,
    },
    /// Stop searching.
    ReleaseService {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
    },
    /// Subscribe to a remote eventgroup.
    Subscribe {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Eventgroup id.
        eventgroup: EventgroupId,
        /// Major version.
        major: MajorVersion,
        /// Subscription ttl in seconds.
        ttl: Ttl,
        /// Local endpoint to receive reliable notifications on.
        reliable: Option<Endpoint>,
        /// Local endpoint to receive unreliable notifications on.
        unreliable: Option<Endpoint>,
    },
    /// Drop an eventgroup subscription.
    Unsubscribe {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Eventgroup id.
        eventgroup: EventgroupId,
    },
    /// Routing's verdict on a [`SdEvent::RemoteSubscribe`].
    AcceptSubscription {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Eventgroup id.
        eventgroup: EventgroupId,
        /// Major version from the subscribe entry.
        major: MajorVersion,
        /// Counter from the subscribe entry.
        counter: u8,
        /// The subscriber's SD endpoint the verdict goes to.
        subscriber: Endpoint,
        /// Acknowledged ttl; reject when `None`.
        accept: Option<Ttl>,
    },
    /// Discovery on/off (routing state SUSPENDED stops all SD activity).
    SetEnabled {
        /// Run discovery.
        enabled: bool,
    },
    /// An inbound SD frame from the endpoint engine.
    Inbound {
        /// The decoded SD frame.
        message: Message,
    },
}

/// Events to the routing core.
#[derive(Debug)]
pub enum SdEvent {
    /// A remote offer was seen (new or refreshed).
    ServiceOffered {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Offered major version.
        major: MajorVersion,
        /// Offered minor version.
        minor: MinorVersion,
        /// Reliable endpoint of the service.
        reliable: Option<Endpoint>,
        /// Unreliable endpoint of the service.
        unreliable: Option<Endpoint>,
        /// SD endpoint the offer came from.
        source: Endpoint,
    },
    /// A remote offer was withdrawn or expired.
    ServiceStopped {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
    },
    /// Our subscription was acknowledged.
    SubscriptionAcked {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Eventgroup id.
        eventgroup: EventgroupId,
    },
    /// Our subscription was rejected.
    SubscriptionNacked {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Eventgroup id.
        eventgroup: EventgroupId,
    },
    /// Our subscription's ttl ran out.
    SubscriptionExpired {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Eventgroup id.
        eventgroup: EventgroupId,
    },
    /// A remote host subscribes to one of our eventgroups. Routing answers
    /// with [`SdCommand::AcceptSubscription`].
    RemoteSubscribe {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Eventgroup id.
        eventgroup: EventgroupId,
        /// Major version from the entry.
        major: MajorVersion,
        /// Requested ttl.
        ttl: Ttl,
        /// Counter from the entry.
        counter: u8,
        /// The subscriber's SD endpoint.
        subscriber: Endpoint,
        /// Subscriber's reliable notification endpoint.
        reliable: Option<Endpoint>,
        /// Subscriber's unreliable notification endpoint.
        unreliable: Option<Endpoint>,
    },
    /// A remote host dropped its subscription.
    RemoteUnsubscribe {
        /// Service id.
        service: ServiceId,
        /// Instance id.
        instance: InstanceId,
        /// Eventgroup id.
        eventgroup: EventgroupId,
        /// The subscriber's SD endpoint.
        subscriber: Endpoint,
    },
    /// A peer rebooted; all its cached state was dropped.
    PeerRebooted {
        /// The peer's SD endpoint.
        peer: Endpoint,
    },
}

/// Runtime configuration of the discovery task.
#[derive(Clone, Debug)]
pub struct SdRuntimeConfig {
    /// Timing parameters.
    pub timing: SdTiming,
    /// Subscription parameters.
    pub subscribe: SubscribeConfig,
    /// SD multicast destination.
    pub multicast: SocketAddr,
}

/// Cloneable command handle to the discovery task.
#[derive(Clone)]
pub struct SdHandle {
    commands: mpsc::Sender<SdCommand>,
}

impl SdHandle {
    /// Submit a command.
    pub async fn send(&self, command: SdCommand) -> Result<()> {
        self.commands.send(command).await.map_err(|_| SdError::Stopped)
    }

    /// Submit a command without waiting (drops on a saturated queue).
    pub fn try_send(&self, command: SdCommand) -> Result<()> {
        self.commands.try_send(command).map_err(|_| SdError::Stopped)
    }
}

/// The discovery runtime.
pub struct ServiceDiscovery {
    handle: SdHandle,
    task: JoinHandle<()>,
}

impl ServiceDiscovery {
    /// Start the discovery task. SD frames go out through `socket`; events
    /// for the routing core arrive on `events`.
    pub fn start(
        config: SdRuntimeConfig,
        socket: UdpSender,
        events: mpsc::Sender<SdEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let task = tokio::spawn(run(config, socket, cmd_rx, events));
        Self { handle: SdHandle { commands: cmd_tx }, task }
    }

    /// The command handle.
    pub fn handle(&self) -> SdHandle {
        self.handle.clone()
    }

    /// Stop the task.
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ServiceDiscovery {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct OfferRecord {
    fsm: OfferFsm,
    major: MajorVersion,
    minor: MinorVersion,
    reliable: Option<Endpoint>,
    unreliable: Option<Endpoint>,
}

struct FindRecord {
    fsm: FindFsm,
    major: MajorVersion,
    minor: MinorVersion,
}

struct SubRecord {
    fsm: SubscriptionFsm,
    major: MajorVersion,
    local_reliable: Option<Endpoint>,
    local_unreliable: Option<Endpoint>,
    target: Option<Endpoint>,
}

struct RemoteOffer {
    source: Endpoint,
    expires: Option<Instant>,
}

struct SdState {
    config: SdRuntimeConfig,
    socket: UdpSender,
    events: mpsc::Sender<SdEvent>,
    enabled: bool,
    offers: HashMap<(ServiceId, InstanceId), OfferRecord>,
    finds: HashMap<(ServiceId, InstanceId), FindRecord>,
    subs: HashMap<(ServiceId, InstanceId, EventgroupId), SubRecord>,
    remote_offers: HashMap<(ServiceId, InstanceId), RemoteOffer>,
    reboots: RebootTracker,
    sessions: SessionSender,
}

async fn run(
    config: SdRuntimeConfig,
    socket: UdpSender,
    mut commands: mpsc::Receiver<SdCommand>,
    events: mpsc::Sender<SdEvent>,
) {
    let mut state = SdState {
        config,
        socket,
        events,
        enabled: true,
        offers: HashMap::new(),
        finds: HashMap::new(),
        subs: HashMap::new(),
        remote_offers: HashMap::new(),
        reboots: RebootTracker::new(),
        sessions: SessionSender::new(),
    };

    loop {
        let wakeup = state.next_wakeup();
        let command = match wakeup {
            Some(deadline) => {
                tokio::select! {
                    cmd = commands.recv() => cmd,
                    _ = tokio::time::sleep_until(deadline.into()) => {
                        state.on_timer(Instant::now()).await;
                        continue;
                    }
                }
            }
            None => commands.recv().await,
        };
        let Some(command) = command else {
            return; // routing gone
        };
        state.on_command(command, Instant::now()).await;
    }
}

impl SdState {
    fn next_wakeup(&self) -> Option<Instant> {
        if !self.enabled {
            return None;
        }
        let offers = self.offers.values().filter_map(|r| r.fsm.next_wakeup());
        let finds = self.finds.values().filter_map(|r| r.fsm.next_wakeup());
        let subs = self.subs.values().filter_map(|r| r.fsm.next_wakeup());
        let expiries = self.remote_offers.values().filter_map(|r| r.expires);
        offers.chain(finds).chain(subs).chain(expiries).min()
    }

    async fn on_timer(&mut self, now: Instant) {
        if !self.enabled {
            return;
        }
        let offer_keys: Vec<_> = self.offers.keys().copied().collect();
        for key in offer_keys {
            let actions = match self.offers.get_mut(&key) {
                Some(record) => record.fsm.on_timer(now),
                None => continue,
            };
            self.run_offer_actions(key, actions).await;
        }

        let find_keys: Vec<_> = self.finds.keys().copied().collect();
        for key in find_keys {
            let actions = match self.finds.get_mut(&key) {
                Some(record) => record.fsm.on_timer(now),
                None => continue,
            };
            self.run_find_actions(key, actions).await;
        }

        let sub_keys: Vec<_> = self.subs.keys().copied().collect();
        for key in sub_keys {
            let actions = match self.subs.get_mut(&key) {
                Some(record) => record.fsm.on_timer(now),
                None => continue,
            };
            self.run_subscribe_actions(key, actions).await;
        }

        // Expire remote offers whose ttl ran out.
        let expired: Vec<_> = self
            .remote_offers
            .iter()
            .filter(|(_, offer)| offer.expires.is_some_and(|at| now >= at))
            .map(|(&key, _)| key)
            .collect();
        for key in expired {
            self.drop_remote_offer(key, now).await;
        }
    }

    async fn on_command(&mut self, command: SdCommand, now: Instant) {
        match command {
            SdCommand::OfferService { service, instance, major, minor, reliable, unreliable } => {
                let record = self
                    .offers
                    .entry((service, instance))
                    .or_insert_with(|| OfferRecord {
                        fsm: OfferFsm::new(self.config.timing.clone()),
                        major,
                        minor,
                        reliable,
                        unreliable,
                    });
                record.major = major;
                record.minor = minor;
                record.reliable = reliable;
                record.unreliable = unreliable;
                let enabled = self.enabled;
                let actions = record.fsm.on_status(enabled, now);
                self.run_offer_actions((service, instance), actions).await;
            }
            SdCommand::StopOfferService { service, instance } => {
                if let Some(record) = self.offers.get_mut(&(service, instance)) {
                    let actions = record.fsm.on_status(false, now);
                    self.run_offer_actions((service, instance), actions).await;
                    self.offers.remove(&(service, instance));
                }
            }
            SdCommand::RequestService { service, instance, major, minor } => {
                let record = self.finds.entry((service, instance)).or_insert_with(|| FindRecord {
                    fsm: FindFsm::new(self.config.timing.clone()),
                    major,
                    minor,
                });
                if self.remote_offers.contains_key(&(service, instance)) {
                    record.fsm.on_offer_seen();
                } else {
                    let enabled = self.enabled;
                    let actions = record.fsm.on_status(enabled, now);
                    self.run_find_actions((service, instance), actions).await;
                }
            }
            SdCommand::ReleaseService { service, instance } => {
                self.finds.remove(&(service, instance));
            }
            SdCommand::Subscribe {
                service,
                instance,
                eventgroup,
                major,
                ttl,
                reliable,
                unreliable,
            } => {
                let subscribe_config =
                    SubscribeConfig { ttl, ..self.config.subscribe.clone() };
                let target = self
                    .remote_offers
                    .get(&(service, instance))
                    .map(|offer| offer.source);
                let record =
                    self.subs.entry((service, instance, eventgroup)).or_insert_with(|| SubRecord {
                        fsm: SubscriptionFsm::new(subscribe_config),
                        major,
                        local_reliable: reliable,
                        local_unreliable: unreliable,
                        target,
                    });
                record.target = target;
                if record.target.is_some() {
                    let actions = record.fsm.on_subscribe(now);
                    self.run_subscribe_actions((service, instance, eventgroup), actions).await;
                }
                // Without a known offer the subscription stays UNKNOWN until
                // one arrives.
            }
            SdCommand::Unsubscribe { service, instance, eventgroup } => {
                if let Some(record) = self.subs.get_mut(&(service, instance, eventgroup)) {
                    let actions = record.fsm.on_unsubscribe();
                    self.run_subscribe_actions((service, instance, eventgroup), actions).await;
                    self.subs.remove(&(service, instance, eventgroup));
                }
            }
            SdCommand::AcceptSubscription {
                service,
                instance,
                eventgroup,
                major,
                counter,
                subscriber,
                accept,
            } => {
                let entry = SdEntry::subscribe_ack(
                    &SdEntry::subscribe(service, instance, eventgroup, major, 0, counter),
                    accept.unwrap_or(0),
                );
                self.send_entries(vec![(entry, Vec::new())], Some(subscriber)).await;
            }
            SdCommand::SetEnabled { enabled } => {
                if self.enabled == enabled {
                    return;
                }
                self.enabled = enabled;
                let offer_keys: Vec<_> = self.offers.keys().copied().collect();
                for key in offer_keys {
                    let actions = match self.offers.get_mut(&key) {
                        Some(record) => record.fsm.on_status(enabled, now),
                        None => continue,
                    };
                    // Suspension still announces the withdrawal.
                    self.run_offer_actions(key, actions).await;
                }
                let find_keys: Vec<_> = self.finds.keys().copied().collect();
                for key in find_keys {
                    if let Some(record) = self.finds.get_mut(&key) {
                        let actions = record.fsm.on_status(enabled, now);
                        if enabled {
                            self.run_find_actions(key, actions).await;
                        }
                    }
                }
                tracing::info!(enabled, "service discovery state changed");
            }
            SdCommand::Inbound { message } => {
                if let Err(error) = self.on_inbound(message, now).await {
                    tracing::debug!(%error, "dropped malformed SD message");
                }
            }
        }
    }

    async fn on_inbound(&mut self, message: Message, now: Instant) -> Result<()> {
        let Some(source) = message.source else {
            return Ok(());
        };
        // Our own multicast traffic loops back; ignore it.
        if source == self.socket.local_endpoint() {
            return Ok(());
        }
        let payload = SdPayload::decode(&message.payload)?;

        if self.reboots.check(source, payload.reboot(), message.session) {
            self.on_peer_reboot(source, now).await;
        }

        let unicast_ok = payload.unicast();
        for entry in &payload.entries {
            match entry.entry_type {
                SdEntryType::OfferService => {
                    if entry.is_stop() {
                        self.on_remote_stop_offer(entry, now).await;
                    } else {
                        self.on_remote_offer(&payload, entry, source, now).await?;
                    }
                }
                SdEntryType::FindService => {
                    self.on_remote_find(entry, source, unicast_ok, message.target, now).await;
                }
                SdEntryType::SubscribeEventgroup => {
                    self.on_remote_subscribe(&payload, entry, source).await?;
                }
                SdEntryType::SubscribeEventgroupAck => {
                    self.on_subscribe_answer(entry, now).await;
                }
            }
        }
        Ok(())
    }

    async fn on_peer_reboot(&mut self, peer: Endpoint, now: Instant) {
        tracing::info!(%peer, "peer reboot detected, dropping its cached state");
        let stale: Vec<_> = self
            .remote_offers
            .iter()
            .filter(|(_, offer)| offer.source == peer)
            .map(|(&key, _)| key)
            .collect();
        for key in stale {
            self.drop_remote_offer(key, now).await;
        }
        let _ = self.events.send(SdEvent::PeerRebooted { peer }).await;
    }

    async fn on_remote_offer(
        &mut self,
        payload: &SdPayload,
        entry: &SdEntry,
        source: Endpoint,
        now: Instant,
    ) -> Result<()> {
        let endpoints = payload.resolve_endpoints(entry)?;
        let reliable = endpoints.iter().find(|e| e.is_reliable()).copied();
        let unreliable = endpoints.iter().find(|e| !e.is_reliable()).copied();
        let key = (entry.service, entry.instance);

        let expires = (entry.ttl != 0xFFFFFF)
            .then(|| now + Duration::from_secs(u64::from(entry.ttl)));
        self.remote_offers.insert(key, RemoteOffer { source, expires });

        if let Some(find) = self.finds.get_mut(&key) {
            find.fsm.on_offer_seen();
        }

        // Re-subscribe eventgroups that lost their transport, and kick off
        // subscriptions that were requested before the offer appeared.
        let sub_keys: Vec<_> = self
            .subs
            .keys()
            .filter(|(s, i, _)| *s == entry.service && *i == entry.instance)
            .copied()
            .collect();
        for sub_key in sub_keys {
            let actions = match self.subs.get_mut(&sub_key) {
                Some(record) => {
                    record.target = Some(source);
                    match record.fsm.state() {
                        SubscriptionState::Resubscribing => {
                            record.fsm.on_transport_recovered(now)
                        }
                        SubscriptionState::Unknown => record.fsm.on_subscribe(now),
                        _ => Vec::new(),
                    }
                }
                None => continue,
            };
            self.run_subscribe_actions(sub_key, actions).await;
        }

        let _ = self
            .events
            .send(SdEvent::ServiceOffered {
                service: entry.service,
                instance: entry.instance,
                major: entry.major,
                minor: entry.minor,
                reliable,
                unreliable,
                source,
            })
            .await;
        Ok(())
    }

    async fn on_remote_stop_offer(&mut self, entry: &SdEntry, now: Instant) {
        self.drop_remote_offer((entry.service, entry.instance), now).await;
    }

    async fn drop_remote_offer(&mut self, key: (ServiceId, InstanceId), now: Instant) {
        if let Some(offer) = self.remote_offers.remove(&key) {
            self.reboots.forget(&offer.source);
        }
        if let Some(find) = self.finds.get_mut(&key) {
            find.fsm.on_offer_lost(now);
        }
        let sub_keys: Vec<_> = self
            .subs
            .keys()
            .filter(|(s, i, _)| (*s, *i) == key)
            .copied()
            .collect();
        for sub_key in sub_keys {
            if let Some(record) = self.subs.get_mut(&sub_key) {
                record.target = None;
                let _ = record.fsm.on_transport_lost();
            }
        }
        let _ = self
            .events
            .send(SdEvent::ServiceStopped { service: key.0, instance: key.1 })
            .await;
    }

    async fn on_remote_find(
        &mut self,
        entry: &SdEntry,
        source: Endpoint,
        unicast_ok: bool,
        target: Option<Endpoint>,
        now: Instant,
    ) {
        if !self.enabled {
            return;
        }
        let was_multicast = target.is_some_and(|t| t.is_multicast());
        let keys: Vec<_> = self
            .offers
            .keys()
            .filter(|(s, i)| {
                (entry.service == ANY_SERVICE || entry.service == *s)
                    && (entry.instance == ANY_INSTANCE || entry.instance == *i)
            })
            .copied()
            .collect();
        for key in keys {
            let (matches, actions) = match self.offers.get_mut(&key) {
                Some(record) => {
                    let version_ok = (entry.major == ANY_MAJOR || entry.major == record.major)
                        && (entry.minor == ANY_MINOR || entry.minor <= record.minor);
                    if version_ok {
                        (true, record.fsm.on_find(source, unicast_ok, now))
                    } else {
                        (false, Vec::new())
                    }
                }
                None => (false, Vec::new()),
            };
            if !matches {
                continue;
            }
            // Answers to multicast finds wait a random share of the
            // request-response window.
            let delay = if was_multicast { self.draw_response_delay() } else { Duration::ZERO };
            if delay.is_zero() {
                self.run_offer_actions(key, actions).await;
            } else {
                self.run_offer_actions_delayed(key, actions, delay);
            }
        }
    }

    async fn on_remote_subscribe(
        &mut self,
        payload: &SdPayload,
        entry: &SdEntry,
        source: Endpoint,
    ) -> Result<()> {
        let endpoints = payload.resolve_endpoints(entry)?;
        let reliable = endpoints.iter().find(|e| e.is_reliable()).copied();
        let unreliable = endpoints.iter().find(|e| !e.is_reliable()).copied();
        let event = if entry.is_stop() {
            SdEvent::RemoteUnsubscribe {
                service: entry.service,
                instance: entry.instance,
                eventgroup: entry.eventgroup,
                subscriber: source,
            }
        } else {
            SdEvent::RemoteSubscribe {
                service: entry.service,
                instance: entry.instance,
                eventgroup: entry.eventgroup,
                major: entry.major,
                ttl: entry.ttl,
                counter: entry.counter,
                subscriber: source,
                reliable,
                unreliable,
            }
        };
        let _ = self.events.send(event).await;
        Ok(())
    }

    async fn on_subscribe_answer(&mut self, entry: &SdEntry, now: Instant) {
        let key = (entry.service, entry.instance, entry.eventgroup);
        let (actions, event) = match self.subs.get_mut(&key) {
            Some(record) if entry.is_stop() => (
                record.fsm.on_nack(now),
                SdEvent::SubscriptionNacked {
                    service: key.0,
                    instance: key.1,
                    eventgroup: key.2,
                },
            ),
            Some(record) => (
                record.fsm.on_ack(now),
                SdEvent::SubscriptionAcked {
                    service: key.0,
                    instance: key.1,
                    eventgroup: key.2,
                },
            ),
            None => return,
        };
        let _ = self.events.send(event).await;
        self.run_subscribe_actions(key, actions).await;
    }

    async fn run_offer_actions(&mut self, key: (ServiceId, InstanceId), actions: Vec<SdAction>) {
        for action in actions {
            match action {
                SdAction::SendOffer { to } => self.send_offer(key, to, false).await,
                SdAction::SendStopOffer => self.send_offer(key, None, true).await,
                SdAction::SendFind => {}
            }
        }
    }

    fn run_offer_actions_delayed(
        &mut self,
        key: (ServiceId, InstanceId),
        actions: Vec<SdAction>,
        delay: Duration,
    ) {
        // The delayed answer uses the same frame construction but runs on
        // its own timer.
        for action in actions {
            let (to, stop) = match action {
                SdAction::SendOffer { to } => (to, false),
                SdAction::SendStopOffer => (None, true),
                SdAction::SendFind => continue,
            };
            let Some(frame) = self.build_offer_frame(key, to, stop) else { continue };
            let destination = to.map(|e| e.socket_addr()).unwrap_or(self.config.multicast);
            let socket = self.socket.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = socket.send(destination, frame, true);
            });
        }
    }

    async fn run_find_actions(&mut self, key: (ServiceId, InstanceId), actions: Vec<SdAction>) {
        for action in actions {
            if action == SdAction::SendFind {
                self.send_find(key).await;
            }
        }
    }

    async fn run_subscribe_actions(
        &mut self,
        key: (ServiceId, InstanceId, EventgroupId),
        actions: Vec<SubscribeAction>,
    ) {
        for action in actions {
            match action {
                SubscribeAction::SendSubscribe => self.send_subscribe(key, false).await,
                SubscribeAction::SendStopSubscribe => self.send_subscribe(key, true).await,
                SubscribeAction::Expired => {
                    let _ = self
                        .events
                        .send(SdEvent::SubscriptionExpired {
                            service: key.0,
                            instance: key.1,
                            eventgroup: key.2,
                        })
                        .await;
                    self.subs.remove(&key);
                }
            }
        }
    }

    async fn send_offer(&mut self, key: (ServiceId, InstanceId), to: Option<Endpoint>, stop: bool) {
        let Some(frame) = self.build_offer_frame(key, to, stop) else { return };
        let destination = to
            .map(|endpoint| endpoint.socket_addr())
            .unwrap_or(self.config.multicast);
        if let Err(error) = self.socket.send(destination, frame, true) {
            tracing::warn!(%error, "failed to send offer");
        }
    }

    fn build_offer_frame(
        &mut self,
        key: (ServiceId, InstanceId),
        to: Option<Endpoint>,
        stop: bool,
    ) -> Option<bytes::Bytes> {
        let record = self.offers.get(&key)?;
        let (major, minor) = (record.major, record.minor);
        let (reliable, unreliable) = (record.reliable, record.unreliable);

        let ttl = if stop { 0 } else { self.config.timing.ttl };
        let mut payload = SdPayload::default();
        let mut options = Vec::new();
        if let Some(reliable) = reliable {
            options.push(SdOption::from_endpoint(&reliable));
        }
        if let Some(unreliable) = unreliable {
            options.push(SdOption::from_endpoint(&unreliable));
        }
        payload.push_entry_with_options(SdEntry::offer(key.0, key.1, major, minor, ttl), options);
        Some(self.finish_frame(payload, to))
    }

    async fn send_find(&mut self, key: (ServiceId, InstanceId)) {
        let Some(record) = self.finds.get(&key) else { return };
        let (major, minor) = (record.major, record.minor);
        let mut payload = SdPayload::default();
        payload.entries.push(SdEntry::find(key.0, key.1, major, minor, self.config.timing.ttl));
        let frame = self.finish_frame(payload, None);
        if let Err(error) = self.socket.send(self.config.multicast, frame, true) {
            tracing::warn!(%error, "failed to send find");
        }
    }

    async fn send_subscribe(&mut self, key: (ServiceId, InstanceId, EventgroupId), stop: bool) {
        let Some(record) = self.subs.get(&key) else { return };
        let Some(target) = record.target else { return };
        let major = record.major;
        let ttl = if stop { 0 } else { record.fsm.ttl() };
        let (local_reliable, local_unreliable) = (record.local_reliable, record.local_unreliable);

        let mut payload = SdPayload::default();
        let mut options = Vec::new();
        if let Some(reliable) = local_reliable {
            options.push(SdOption::from_endpoint(&reliable));
        }
        if let Some(unreliable) = local_unreliable {
            options.push(SdOption::from_endpoint(&unreliable));
        }
        payload.push_entry_with_options(
            SdEntry::subscribe(key.0, key.1, key.2, major, ttl, 0),
            options,
        );
        let frame = self.finish_frame(payload, Some(target));
        if let Err(error) = self.socket.send(target.socket_addr(), frame, true) {
            tracing::warn!(%error, "failed to send subscribe");
        }
    }

    async fn send_entries(
        &mut self,
        entries: Vec<(SdEntry, Vec<SdOption>)>,
        to: Option<Endpoint>,
    ) {
        let mut payload = SdPayload::default();
        for (entry, options) in entries {
            payload.push_entry_with_options(entry, options);
        }
        let frame = self.finish_frame(payload, to);
        let destination = to.map(|e| e.socket_addr()).unwrap_or(self.config.multicast);
        if let Err(error) = self.socket.send(destination, frame, true) {
            tracing::warn!(%error, "failed to send SD entries");
        }
    }

    fn finish_frame(&mut self, mut payload: SdPayload, to: Option<Endpoint>) -> bytes::Bytes {
        let (session, reboot) = self.sessions.next(to);
        payload.flags = 0;
        if reboot {
            payload.flags |= veho_wire::sd::FLAG_REBOOT;
        }
        payload.flags |= veho_wire::sd::FLAG_UNICAST;

        let message = Message {
            service: SD_SERVICE_ID,
            method: SD_METHOD_ID,
            client: 0x0000,
            session,
            interface_version: PROTOCOL_VERSION,
            message_type: MessageType::Notification,
            return_code: ReturnCode::Ok,
            payload: payload.encode(),
            instance: 0,
            is_reliable: false,
            is_initial: false,
            source: None,
            target: None,
        };
        message.encode()
    }

    fn draw_response_delay(&self) -> Duration {
        let min = self.config.timing.request_response_delay_min;
        let max = self.config.timing.request_response_delay_max;
        if max <= min {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veho_endpoint::udp::{UdpConfig, UdpEndpoint};
    use veho_endpoint::EndpointEvent;

    fn fast_timing() -> SdTiming {
        SdTiming {
            initial_delay_min: Duration::from_millis(1),
            initial_delay_max: Duration::from_millis(1),
            repetition_base_delay: Duration::from_millis(5),
            repetition_max: 1,
            cyclic_offer_delay: Duration::from_millis(50),
            ttl: 3,
            request_response_delay_min: Duration::ZERO,
            request_response_delay_max: Duration::ZERO,
        }
    }

    struct TestDomain {
        sd: ServiceDiscovery,
        events: mpsc::Receiver<SdEvent>,
        peer: UdpEndpoint,
        peer_rx: mpsc::Receiver<EndpointEvent>,
        // Keeps the SD socket's loops alive for the test's lifetime.
        _own: UdpEndpoint,
    }

    async fn sd_domain() -> TestDomain {
        // "Multicast" is replaced by a plain peer socket so the test stays
        // on loopback.
        let (peer_events, peer_rx) = mpsc::channel(64);
        let peer = UdpEndpoint::bind(UdpConfig::default(), peer_events).await.expect("peer");
        let peer_addr = SocketAddr::new([127, 0, 0, 1].into(), peer.local_endpoint().port);

        let (sd_events_tx, sd_events_rx) = mpsc::channel(64);
        let (own_events, _own_rx) = mpsc::channel(64);
        let own = UdpEndpoint::bind(UdpConfig::default(), own_events).await.expect("own");
        let config = SdRuntimeConfig {
            timing: fast_timing(),
            subscribe: SubscribeConfig::default(),
            multicast: peer_addr,
        };
        let sd = ServiceDiscovery::start(config, own.sender(), sd_events_tx);
        TestDomain { sd, events: sd_events_rx, peer, peer_rx, _own: own }
    }

    #[tokio::test]
    async fn test_offer_announced_on_wire() {
        let mut domain = sd_domain().await;
        let (sd, peer) = (domain.sd, domain.peer);
        let peer_rx = &mut domain.peer_rx;
        sd.handle()
            .send(SdCommand::OfferService {
                service: 0x0001,
                instance: 0x0001,
                major: 1,
                minor: 0,
                reliable: None,
                unreliable: Some(Endpoint::udp([127, 0, 0, 1].into(), 30509)),
            })
            .await
            .expect("command");

        let frame = tokio::time::timeout(Duration::from_secs(2), peer_rx.recv())
            .await
            .expect("no timeout")
            .expect("event");
        let EndpointEvent::Frame(message) = frame else {
            unreachable!("unexpected event");
        };
        assert_eq!(message.service, SD_SERVICE_ID);
        assert_eq!(message.method, SD_METHOD_ID);

        let payload = SdPayload::decode(&message.payload).expect("sd payload");
        assert!(payload.reboot(), "first message carries the reboot flag");
        assert_eq!(payload.entries.len(), 1);
        assert_eq!(payload.entries[0].entry_type, SdEntryType::OfferService);
        assert_eq!(payload.entries[0].service, 0x0001);
        let endpoints = payload.resolve_endpoints(&payload.entries[0]).expect("options");
        assert_eq!(endpoints[0].port, 30509);

        sd.stop();
        peer.stop();
    }

    #[tokio::test]
    async fn test_remote_offer_surfaces_as_event() {
        let mut domain = sd_domain().await;
        let (sd, peer) = (domain.sd, domain.peer);
        let events = &mut domain.events;

        // Build an offer frame as a remote host would.
        let mut payload = SdPayload::new(false, true);
        payload.push_entry_with_options(
            SdEntry::offer(0x0001, 0x0001, 1, 0, 3),
            vec![SdOption::from_endpoint(&Endpoint::udp([127, 0, 0, 1].into(), 30509))],
        );
        let message = Message {
            service: SD_SERVICE_ID,
            method: SD_METHOD_ID,
            client: 0,
            session: 1,
            interface_version: 1,
            message_type: MessageType::Notification,
            return_code: ReturnCode::Ok,
            payload: payload.encode(),
            instance: 0,
            is_reliable: false,
            is_initial: false,
            source: Some(Endpoint::udp([127, 0, 0, 9].into(), 30490)),
            target: None,
        };

        sd.handle().send(SdCommand::Inbound { message }).await.expect("inbound");

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no timeout")
            .expect("event");
        match event {
            SdEvent::ServiceOffered { service, instance, unreliable, .. } => {
                assert_eq!(service, 0x0001);
                assert_eq!(instance, 0x0001);
                assert_eq!(unreliable.map(|e| e.port), Some(30509));
            }
            other => unreachable!("unexpected event {other:?}"),
        }

        sd.stop();
        peer.stop();
    }

    #[tokio::test]
    async fn test_remote_offer_ttl_expires() {
        let mut domain = sd_domain().await;
        let (sd, peer) = (domain.sd, domain.peer);
        let events = &mut domain.events;

        let mut payload = SdPayload::new(false, true);
        payload.push_entry_with_options(
            SdEntry::offer(0x0001, 0x0001, 1, 0, 1), // ttl 1 second
            vec![SdOption::from_endpoint(&Endpoint::udp([127, 0, 0, 1].into(), 30509))],
        );
        let message = Message {
            service: SD_SERVICE_ID,
            method: SD_METHOD_ID,
            client: 0,
            session: 1,
            interface_version: 1,
            message_type: MessageType::Notification,
            return_code: ReturnCode::Ok,
            payload: payload.encode(),
            instance: 0,
            is_reliable: false,
            is_initial: false,
            source: Some(Endpoint::udp([127, 0, 0, 9].into(), 30490)),
            target: None,
        };
        sd.handle().send(SdCommand::Inbound { message }).await.expect("inbound");

        let mut saw_offer = false;
        let mut saw_stop = false;
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(5);
        while !(saw_offer && saw_stop) {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .expect("events before deadline")
                .expect("channel open");
            match event {
                SdEvent::ServiceOffered { .. } => saw_offer = true,
                SdEvent::ServiceStopped { service, instance } => {
                    assert_eq!((service, instance), (0x0001, 0x0001));
                    saw_stop = true;
                }
                _ => {}
            }
        }

        sd.stop();
        peer.stop();
    }
}
