//! The public API: an explicit [`Runtime`] value created at process start,
//! and one [`Application`] per participant.
//!
//! An application is a proxy on the local bus. If its name matches the
//! configured routing host, creating it also brings up the
//! [`RoutingHost`](crate::host::RoutingHost) in-process; every other
//! application attaches to the already-running host.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use veho_config::Config;
use veho_events::DebounceFilter;
use veho_ipc::{queue_path, IpcProxy, ProxyConfig, ROUTING_QUEUE_NAME};
use veho_types::{
    ClientId, EventId, EventgroupId, InstanceId, MajorVersion, MessageType, MinorVersion,
    RoutingState, ServiceId, SessionId, Ttl, ANY_EVENT, ANY_INSTANCE, ANY_METHOD, ANY_SERVICE,
};
use veho_wire::ipc::Command;
use veho_wire::Message;

use crate::host::{HostOptions, RoutingHost};
use crate::{Result, RoutingError};

/// Callback invoked on availability changes.
pub type AvailabilityHandler = Box<dyn Fn(ServiceId, InstanceId, bool) + Send + Sync>;
/// Callback invoked per received message.
pub type MessageHandler = Box<dyn Fn(&Message) + Send + Sync>;
/// Callback invoked on subscription acknowledge (true) or reject (false).
pub type SubscriptionHandler = Box<dyn Fn(EventgroupId, bool) + Send + Sync>;

/// The explicit runtime value; created once at process start and used to
/// create applications.
pub struct Runtime {
    config: Arc<Config>,
    options: HostOptions,
}

impl Runtime {
    /// A runtime over a loaded configuration.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config, options: HostOptions::default() }
    }

    /// Override the host options (base directory, deadlines).
    pub fn with_options(config: Arc<Config>, options: HostOptions) -> Self {
        Self { config, options }
    }

    /// The configuration this runtime was created with.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Create (and start) an application.
    ///
    /// An empty name is resolved through `VSOMEIP_APPLICATION_NAME`. If the
    /// name matches the configured `routing` entry, the routing host is
    /// started in-process first.
    pub async fn create_application(&self, name: &str) -> Result<Application> {
        let name = if name.is_empty() {
            std::env::var(veho_config::ENV_APPLICATION_NAME).unwrap_or_default()
        } else {
            name.to_string()
        };

        let host = if self.config.is_routing_host(&name) {
            Some(RoutingHost::start(self.config.clone(), self.options.clone()).await?)
        } else {
            None
        };

        let socket = queue_path(&self.options.base_dir, ROUTING_QUEUE_NAME);
        let (events_tx, events_rx) = mpsc::channel(256);

        // The host may still be coming up; registration retries briefly.
        let mut attempt = 0u32;
        let proxy = loop {
            match IpcProxy::connect(&socket, &name, ProxyConfig::default(), events_tx.clone()).await
            {
                Ok(proxy) => break proxy,
                Err(error) if attempt < 50 => {
                    attempt += 1;
                    tracing::debug!(%error, attempt, "routing host not ready, retrying");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(error) => return Err(error.into()),
            }
        };

        let client = proxy.client();
        let shared = Arc::new(AppShared {
            client,
            routing_state: Mutex::new(RoutingState::Running),
            availability: Mutex::new(HashMap::new()),
            availability_handlers: Mutex::new(Vec::new()),
            message_handlers: Mutex::new(HashMap::new()),
            subscription_handlers: Mutex::new(HashMap::new()),
            pending_responses: Mutex::new(HashMap::new()),
            debounce: Mutex::new(HashMap::new()),
        });

        let dispatch = tokio::spawn(dispatch_loop(events_rx, shared.clone()));
        let flush = tokio::spawn(flush_debounced(shared.clone()));

        tracing::info!(%name, client = format_args!("{client:#06x}"), "application created");
        Ok(Application {
            name,
            proxy,
            shared,
            session: AtomicU16::new(0),
            _host: host,
            dispatch,
            flush,
        })
    }
}

/// A subscriber-side filter plus the notification it is holding back.
struct SubscriberFilter {
    filter: DebounceFilter,
    pending: Option<Message>,
}

struct AppShared {
    client: ClientId,
    routing_state: Mutex<RoutingState>,
    availability: Mutex<HashMap<(ServiceId, InstanceId), bool>>,
    availability_handlers: Mutex<Vec<(ServiceId, InstanceId, AvailabilityHandler)>>,
    message_handlers: Mutex<HashMap<(ServiceId, InstanceId, EventId), MessageHandler>>,
    subscription_handlers: Mutex<HashMap<(ServiceId, InstanceId), SubscriptionHandler>>,
    pending_responses: Mutex<HashMap<SessionId, oneshot::Sender<Message>>>,
    debounce: Mutex<HashMap<(ServiceId, InstanceId, EventId), SubscriberFilter>>,
}

/// One participant on the bus.
pub struct Application {
    name: String,
    proxy: IpcProxy,
    shared: Arc<AppShared>,
    session: AtomicU16,
    _host: Option<RoutingHost>,
    dispatch: JoinHandle<()>,
    flush: JoinHandle<()>,
}

impl Application {
    /// The application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The allocated client id.
    pub fn client_id(&self) -> ClientId {
        self.shared.client
    }

    /// The last routing state announced by the host.
    pub fn routing_state(&self) -> RoutingState {
        *lock(&self.shared.routing_state)
    }

    /// Offer a service instance.
    pub fn offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Result<()> {
        self.proxy
            .send(&Command::OfferService { service, instance, major, minor })
            .map_err(Into::into)
    }

    /// Withdraw an offer. A no-op on the host side for never-offered
    /// instances.
    pub fn stop_offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Result<()> {
        self.proxy
            .send(&Command::StopOfferService { service, instance, major, minor })
            .map_err(Into::into)
    }

    /// Declare interest in a service instance; availability callbacks and
    /// FINDs follow.
    pub fn request_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Result<()> {
        self.proxy
            .send(&Command::RequestService { service, instance, major, minor })
            .map_err(Into::into)
    }

    /// Drop a service request.
    pub fn release_service(&self, service: ServiceId, instance: InstanceId) -> Result<()> {
        self.proxy
            .send(&Command::ReleaseService { service, instance })
            .map_err(Into::into)
    }

    /// Subscribe to an eventgroup.
    pub fn subscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        ttl: Ttl,
    ) -> Result<()> {
        self.proxy
            .send(&Command::Subscribe { service, instance, eventgroup, major, ttl })
            .map_err(Into::into)
    }

    /// Drop an eventgroup subscription.
    pub fn unsubscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> Result<()> {
        self.proxy
            .send(&Command::Unsubscribe { service, instance, eventgroup })
            .map_err(Into::into)
    }

    /// Install a subscriber-side debounce filter for an event (or
    /// [`ANY_EVENT`]). An interval of `-1` disables delivery entirely;
    /// updates held back by a positive interval are delivered by the
    /// application's flush timer once the interval elapses.
    pub fn set_debounce(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        interval_ms: i64,
        on_change_only: bool,
    ) {
        lock(&self.shared.debounce).insert(
            (service, instance, event),
            SubscriberFilter {
                filter: DebounceFilter::new(interval_ms, on_change_only, None),
                pending: None,
            },
        );
    }

    /// True if the service instance is currently available.
    pub fn is_available(&self, service: ServiceId, instance: InstanceId) -> bool {
        lock(&self.shared.availability)
            .get(&(service, instance))
            .copied()
            .unwrap_or(false)
    }

    /// Send a message. Fails fast with [`RoutingError::NotRunning`] while
    /// the routing state rejects outbound traffic.
    pub fn send(&self, mut message: Message) -> Result<()> {
        if !self.routing_state().allows_sending() {
            return Err(RoutingError::NotRunning);
        }
        if message.client == 0 {
            message.client = self.shared.client;
        }
        if message.session == 0 {
            message.session = self.next_session();
        }
        let command = Command::SomeIpMessage {
            instance: message.instance,
            reliable: message.is_reliable,
            initial: false,
            frame: message.encode(),
        };
        self.proxy.send(&command).map_err(Into::into)
    }

    /// Send a REQUEST and await its RESPONSE or ERROR.
    pub async fn request(&self, mut message: Message, timeout: Duration) -> Result<Message> {
        message.message_type = MessageType::Request;
        if message.client == 0 {
            message.client = self.shared.client;
        }
        if message.session == 0 {
            message.session = self.next_session();
        }
        let session = message.session;
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending_responses).insert(session, tx);

        if let Err(error) = self.send(message) {
            lock(&self.shared.pending_responses).remove(&session);
            return Err(error);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RoutingError::Stopped),
            Err(_) => {
                lock(&self.shared.pending_responses).remove(&session);
                Err(RoutingError::Timeout)
            }
        }
    }

    /// Publish an event or field value.
    pub fn notify(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Bytes,
        is_field: bool,
    ) -> Result<()> {
        let mut message = Message::notification(service, event, payload);
        message.client = self.shared.client;
        message.instance = instance;
        let command = if is_field {
            Command::SomeIpField { instance, frame: message.encode() }
        } else {
            Command::SomeIpMessage {
                instance,
                reliable: false,
                initial: false,
                frame: message.encode(),
            }
        };
        self.proxy.send(&command).map_err(Into::into)
    }

    /// Register a handler for messages matching (service, instance,
    /// method); each of the three accepts its wildcard.
    pub fn register_message_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        method: EventId,
        handler: MessageHandler,
    ) {
        lock(&self.shared.message_handlers).insert((service, instance, method), handler);
    }

    /// Register an availability handler for (service, instance), each
    /// accepting its wildcard.
    pub fn register_availability_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        handler: AvailabilityHandler,
    ) {
        lock(&self.shared.availability_handlers).push((service, instance, handler));
    }

    /// Register a handler for subscription acknowledge/reject.
    pub fn register_subscription_handler(
        &self,
        service: ServiceId,
        instance: InstanceId,
        handler: SubscriptionHandler,
    ) {
        lock(&self.shared.subscription_handlers).insert((service, instance), handler);
    }

    /// Request a routing state change (embedded equivalent of the
    /// suspend/resume signals).
    pub fn set_routing_state(&self, state: RoutingState) -> Result<()> {
        self.proxy.send(&Command::SetRoutingState { state }).map_err(Into::into)
    }

    /// Deregister and stop.
    pub fn stop(self) {
        self.dispatch.abort();
        self.flush.abort();
        self.proxy.stop();
        tracing::info!(name = %self.name, "application stopped");
    }

    fn next_session(&self) -> SessionId {
        loop {
            let session = self.session.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if session != 0 {
                return session;
            }
        }
    }
}

/// Locks a mutex, recovering from poisoning (callbacks may panic in tests).
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn dispatch_loop(mut events: mpsc::Receiver<Command>, shared: Arc<AppShared>) {
    while let Some(command) = events.recv().await {
        match command {
            Command::SomeIpMessage { instance, initial, frame, .. } => {
                let Ok((mut message, _)) = Message::decode(&frame) else {
                    continue;
                };
                message.instance = instance;
                message.is_initial = initial;
                handle_message(&shared, message);
            }
            Command::OfferService { service, instance, .. } => {
                update_availability(&shared, service, instance, true);
            }
            Command::StopOfferService { service, instance, .. } => {
                update_availability(&shared, service, instance, false);
            }
            Command::SubscribeAck { service, instance, eventgroup } => {
                notify_subscription(&shared, service, instance, eventgroup, true);
            }
            Command::SubscribeNack { service, instance, eventgroup } => {
                notify_subscription(&shared, service, instance, eventgroup, false);
            }
            Command::SetRoutingState { state } => {
                *lock(&shared.routing_state) = state;
            }
            _ => {}
        }
    }
}

fn handle_message(shared: &Arc<AppShared>, message: Message) {
    // Responses resolve a pending request exactly once.
    if message.message_type.is_answer() {
        if let Some(waiter) = lock(&shared.pending_responses).remove(&message.session) {
            let _ = waiter.send(message);
            return;
        }
    }

    // Notifications pass the subscriber-side debounce filter. A rejected
    // update that the filter buffered is kept for the flush timer.
    if message.message_type == MessageType::Notification {
        let mut filters = lock(&shared.debounce);
        let key_exact = (message.service, message.instance, message.method);
        let key_any = (message.service, message.instance, ANY_EVENT);
        let key = if filters.contains_key(&key_exact) { key_exact } else { key_any };
        if let Some(entry) = filters.get_mut(&key) {
            if !entry.filter.admit(&message.payload, Instant::now()) {
                if entry.filter.has_pending() {
                    entry.pending = Some(message);
                }
                return;
            }
            entry.pending = None;
        }
        drop(filters);
    }

    dispatch_to_handlers(shared, &message);
}

fn dispatch_to_handlers(shared: &Arc<AppShared>, message: &Message) {
    let handlers = lock(&shared.message_handlers);
    let candidates = [
        (message.service, message.instance, message.method),
        (message.service, message.instance, ANY_METHOD),
        (message.service, ANY_INSTANCE, ANY_METHOD),
        (ANY_SERVICE, ANY_INSTANCE, ANY_METHOD),
    ];
    for key in candidates {
        if let Some(handler) = handlers.get(&key) {
            handler(message);
            return;
        }
    }
}

/// Deliver debounced updates whose interval has elapsed. Without this
/// timer a buffered update would only leave the filter when the publisher
/// happens to send another notification.
async fn flush_debounced(shared: Arc<AppShared>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let due: Vec<Message> = {
            let mut filters = lock(&shared.debounce);
            let now = Instant::now();
            filters
                .values_mut()
                .filter_map(|entry| {
                    let payload = entry.filter.take_due(now)?;
                    let mut message = entry.pending.take()?;
                    message.payload = payload;
                    Some(message)
                })
                .collect()
        };
        for message in due {
            dispatch_to_handlers(&shared, &message);
        }
    }
}

fn update_availability(
    shared: &Arc<AppShared>,
    service: ServiceId,
    instance: InstanceId,
    up: bool,
) {
    let changed = {
        let mut availability = lock(&shared.availability);
        availability.insert((service, instance), up) != Some(up)
    };
    if !changed {
        return;
    }
    let handlers = lock(&shared.availability_handlers);
    for (filter_service, filter_instance, handler) in handlers.iter() {
        let matches = (*filter_service == ANY_SERVICE || *filter_service == service)
            && (*filter_instance == ANY_INSTANCE || *filter_instance == instance);
        if matches {
            handler(service, instance, up);
        }
    }
}

fn notify_subscription(
    shared: &Arc<AppShared>,
    service: ServiceId,
    instance: InstanceId,
    eventgroup: EventgroupId,
    acknowledged: bool,
) {
    let handlers = lock(&shared.subscription_handlers);
    if let Some(handler) = handlers.get(&(service, instance)) {
        handler(eventgroup, acknowledged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_counter_skips_zero() {
        let app_session = AtomicU16::new(0xFFFE);
        // Reproduce the wrap logic: 0 is never produced.
        let mut seen = Vec::new();
        for _ in 0..4 {
            let session = loop {
                let session = app_session.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
                if session != 0 {
                    break session;
                }
            };
            seen.push(session);
        }
        assert!(!seen.contains(&0));
        assert_eq!(seen[0], 0xFFFF);
    }
}
