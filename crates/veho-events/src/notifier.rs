//! Timer-driven cyclic re-emission.
//!
//! The distributor itself is passive; these tasks drive it. Every cyclic
//! event gets its own interval task re-emitting the cached value with
//! `force = true`. This is the driver for embedders that hand the
//! distributor to its own tasks; the routing host instead folds cyclic
//! emission into its sweep tick, where the tables stay single-owner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use veho_types::{EventId, InstanceId, ServiceId};

use crate::registry::{Delivery, EventDistributor};

/// Owns the interval tasks for cyclically emitted events.
#[derive(Default)]
pub struct CyclicNotifier {
    tasks: HashMap<(ServiceId, InstanceId, EventId), JoinHandle<()>>,
}

impl CyclicNotifier {
    /// A notifier with no running tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start cyclic emission of an event. Restarting an already-running
    /// event replaces its task (the cycle timer starts over).
    pub fn start(
        &mut self,
        distributor: Arc<Mutex<EventDistributor>>,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        cycle: Duration,
        out: mpsc::UnboundedSender<Delivery>,
    ) {
        self.stop(service, instance, event);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cycle);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so emission
            // starts one full cycle after the offer.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut distributor = distributor.lock().await;
                let Some(payload) = distributor.cached_value(service, instance, event).cloned()
                else {
                    continue; // nothing written yet
                };
                match distributor.notify(service, instance, event, payload, true, Instant::now()) {
                    Ok((_, deliveries)) => {
                        drop(distributor);
                        for delivery in deliveries {
                            if out.send(delivery).is_err() {
                                return; // receiver gone, stop quietly
                            }
                        }
                    }
                    Err(error) => {
                        tracing::debug!(%error, "cyclic event vanished, stopping its timer");
                        return;
                    }
                }
            }
        });
        self.tasks.insert((service, instance, event), handle);
    }

    /// Stop cyclic emission of an event.
    pub fn stop(&mut self, service: ServiceId, instance: InstanceId, event: EventId) {
        if let Some(handle) = self.tasks.remove(&(service, instance, event)) {
            handle.abort();
        }
    }

    /// Stop every task.
    pub fn shutdown(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }

    /// Number of running cyclic tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True when no cyclic task is running.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for CyclicNotifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}
