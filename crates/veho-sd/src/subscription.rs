//! Eventgroup subscription state machine (client side).
//!
//! One machine per (service, instance, eventgroup) the local host
//! subscribes to remotely. The machine emits SUBSCRIBE entries, expects the
//! ack within a window, retries a bounded number of times on nack/timeout,
//! counts the ttl down while acknowledged and re-subscribes after network
//! loss.

use std::time::{Duration, Instant};

use veho_types::SubscriptionState;

/// What a subscription transition asks the driver to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscribeAction {
    /// Send a SUBSCRIBE_EVENTGROUP entry to the offering host.
    SendSubscribe,
    /// Send a STOP_SUBSCRIBE (ttl 0) entry.
    SendStopSubscribe,
    /// The subscription is gone; remove it and tell the application.
    Expired,
}

/// Configuration of the subscription machine.
#[derive(Clone, Debug)]
pub struct SubscribeConfig {
    /// Window to wait for SUBSCRIBE_EVENTGROUP_ACK.
    pub ack_window: Duration,
    /// Retries after nack or ack timeout before giving up until the next
    /// external trigger.
    pub max_retries: u8,
    /// Subscription ttl announced on the wire (seconds).
    pub ttl: u32,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self { ack_window: Duration::from_millis(2000), max_retries: 3, ttl: 0xFFFFFF }
    }
}

/// The per-eventgroup subscription machine.
#[derive(Debug)]
pub struct SubscriptionFsm {
    state: SubscriptionState,
    config: SubscribeConfig,
    retries: u8,
    deadline: Option<Instant>,
}

impl SubscriptionFsm {
    /// A machine in `Unknown`.
    pub fn new(config: SubscribeConfig) -> Self {
        Self { state: SubscriptionState::Unknown, config, retries: 0, deadline: None }
    }

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// The configured ttl.
    pub fn ttl(&self) -> u32 {
        self.config.ttl
    }

    /// The application subscribed (or the offer just became available).
    pub fn on_subscribe(&mut self, now: Instant) -> Vec<SubscribeAction> {
        match self.state {
            SubscriptionState::Unknown | SubscriptionState::NotAcknowledged => {
                self.state = SubscriptionState::NotAcknowledged;
                self.retries = 0;
                self.deadline = Some(now + self.config.ack_window);
                vec![SubscribeAction::SendSubscribe]
            }
            _ => Vec::new(), // already subscribed or resubscribing
        }
    }

    /// SUBSCRIBE_EVENTGROUP_ACK arrived.
    pub fn on_ack(&mut self, now: Instant) -> Vec<SubscribeAction> {
        self.state = SubscriptionState::Acknowledged;
        self.retries = 0;
        self.deadline = ttl_deadline(self.config.ttl, now);
        Vec::new()
    }

    /// SUBSCRIBE_EVENTGROUP_NACK arrived.
    pub fn on_nack(&mut self, now: Instant) -> Vec<SubscribeAction> {
        self.state = match self.state {
            SubscriptionState::ResubscribingNotAcknowledged | SubscriptionState::Resubscribing => {
                SubscriptionState::ResubscribingNotAcknowledged
            }
            _ => SubscriptionState::NotAcknowledged,
        };
        self.retry(now)
    }

    /// The underlying transport or the remote offer went away.
    pub fn on_transport_lost(&mut self) -> Vec<SubscribeAction> {
        match self.state {
            SubscriptionState::Unknown => Vec::new(),
            _ => {
                self.state = SubscriptionState::Resubscribing;
                self.deadline = None;
                Vec::new()
            }
        }
    }

    /// The transport recovered (or the offer reappeared): re-subscribe.
    pub fn on_transport_recovered(&mut self, now: Instant) -> Vec<SubscribeAction> {
        match self.state {
            SubscriptionState::Resubscribing => {
                self.state = SubscriptionState::ResubscribingNotAcknowledged;
                self.retries = 0;
                self.deadline = Some(now + self.config.ack_window);
                vec![SubscribeAction::SendSubscribe]
            }
            _ => Vec::new(),
        }
    }

    /// The application unsubscribed.
    pub fn on_unsubscribe(&mut self) -> Vec<SubscribeAction> {
        let was_active = self.state != SubscriptionState::Unknown;
        self.state = SubscriptionState::Unknown;
        self.deadline = None;
        if was_active {
            vec![SubscribeAction::SendStopSubscribe]
        } else {
            Vec::new()
        }
    }

    /// A timer expiry at `now` (ack window or ttl).
    pub fn on_timer(&mut self, now: Instant) -> Vec<SubscribeAction> {
        let Some(deadline) = self.deadline else {
            return Vec::new();
        };
        if now < deadline {
            return Vec::new();
        }
        match self.state {
            SubscriptionState::NotAcknowledged
            | SubscriptionState::ResubscribingNotAcknowledged => self.retry(now),
            SubscriptionState::Acknowledged => {
                // ttl ran out without a refreshing ack.
                self.state = SubscriptionState::Unknown;
                self.deadline = None;
                vec![SubscribeAction::Expired]
            }
            _ => Vec::new(),
        }
    }

    /// The next deadline, if any timer is armed.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.deadline
    }

    fn retry(&mut self, now: Instant) -> Vec<SubscribeAction> {
        if self.retries >= self.config.max_retries {
            self.deadline = None;
            return Vec::new(); // stay NOT_ACKNOWLEDGED until an external trigger
        }
        self.retries += 1;
        self.deadline = Some(now + self.config.ack_window);
        vec![SubscribeAction::SendSubscribe]
    }
}

fn ttl_deadline(ttl: u32, now: Instant) -> Option<Instant> {
    // 0xFFFFFF announces an unbounded subscription.
    if ttl == 0xFFFFFF {
        None
    } else {
        Some(now + Duration::from_secs(u64::from(ttl)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SubscribeConfig {
        SubscribeConfig { ack_window: Duration::from_millis(100), max_retries: 2, ttl: 3 }
    }

    #[test]
    fn test_subscribe_ack_cycle() {
        let mut fsm = SubscriptionFsm::new(config());
        let t0 = Instant::now();
        assert_eq!(fsm.on_subscribe(t0), vec![SubscribeAction::SendSubscribe]);
        assert_eq!(fsm.state(), SubscriptionState::NotAcknowledged);

        assert!(fsm.on_ack(t0 + Duration::from_millis(10)).is_empty());
        assert_eq!(fsm.state(), SubscriptionState::Acknowledged);
        // ttl timer armed for 3 seconds.
        let deadline = fsm.next_wakeup().expect("ttl armed");
        assert_eq!(deadline.duration_since(t0 + Duration::from_millis(10)), Duration::from_secs(3));
    }

    #[test]
    fn test_ack_timeout_retries_then_gives_up() {
        let mut fsm = SubscriptionFsm::new(config());
        let t0 = Instant::now();
        fsm.on_subscribe(t0);

        let d1 = fsm.next_wakeup().expect("window");
        assert_eq!(fsm.on_timer(d1), vec![SubscribeAction::SendSubscribe]);
        let d2 = fsm.next_wakeup().expect("window");
        assert_eq!(fsm.on_timer(d2), vec![SubscribeAction::SendSubscribe]);
        // Retries exhausted.
        let d3 = fsm.next_wakeup().expect("window");
        assert!(fsm.on_timer(d3).is_empty());
        assert_eq!(fsm.state(), SubscriptionState::NotAcknowledged);
        assert_eq!(fsm.next_wakeup(), None);
    }

    #[test]
    fn test_nack_enters_not_acknowledged() {
        let mut fsm = SubscriptionFsm::new(config());
        let t0 = Instant::now();
        fsm.on_subscribe(t0);
        let actions = fsm.on_nack(t0 + Duration::from_millis(5));
        assert_eq!(fsm.state(), SubscriptionState::NotAcknowledged);
        // First retry goes out immediately.
        assert_eq!(actions, vec![SubscribeAction::SendSubscribe]);
    }

    #[test]
    fn test_ttl_expiry_removes_subscription() {
        let mut fsm = SubscriptionFsm::new(config());
        let t0 = Instant::now();
        fsm.on_subscribe(t0);
        fsm.on_ack(t0);
        let ttl_deadline = fsm.next_wakeup().expect("ttl");
        assert_eq!(fsm.on_timer(ttl_deadline), vec![SubscribeAction::Expired]);
        assert_eq!(fsm.state(), SubscriptionState::Unknown);
    }

    #[test]
    fn test_network_loss_and_recovery_resubscribes() {
        let mut fsm = SubscriptionFsm::new(config());
        let t0 = Instant::now();
        fsm.on_subscribe(t0);
        fsm.on_ack(t0);

        assert!(fsm.on_transport_lost().is_empty());
        assert_eq!(fsm.state(), SubscriptionState::Resubscribing);

        let actions = fsm.on_transport_recovered(t0 + Duration::from_secs(1));
        assert_eq!(actions, vec![SubscribeAction::SendSubscribe]);
        assert_eq!(fsm.state(), SubscriptionState::ResubscribingNotAcknowledged);

        fsm.on_ack(t0 + Duration::from_secs(1));
        assert_eq!(fsm.state(), SubscriptionState::Acknowledged);
    }

    #[test]
    fn test_unbounded_ttl_arms_no_timer() {
        let mut fsm = SubscriptionFsm::new(SubscribeConfig { ttl: 0xFFFFFF, ..config() });
        let t0 = Instant::now();
        fsm.on_subscribe(t0);
        fsm.on_ack(t0);
        assert_eq!(fsm.next_wakeup(), None);
    }

    #[test]
    fn test_unsubscribe_sends_stop() {
        let mut fsm = SubscriptionFsm::new(config());
        let t0 = Instant::now();
        fsm.on_subscribe(t0);
        fsm.on_ack(t0);
        assert_eq!(fsm.on_unsubscribe(), vec![SubscribeAction::SendStopSubscribe]);
        assert!(fsm.on_unsubscribe().is_empty(), "idempotent");
    }
}
