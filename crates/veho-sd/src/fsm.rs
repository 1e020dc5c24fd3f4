//! Offer and find state machines.
//!
//! Both machines follow the same phase scheme: a random initial delay, a
//! repetition phase with doubling gaps, and (for offers) a cyclic announce
//! phase. States carry their own deadlines; the driver sleeps until
//! [`OfferFsm::next_wakeup`] and feeds the expiry back via `on_timer`.

use std::time::{Duration, Instant};

use rand::Rng;

use veho_types::Endpoint;

/// What a transition asks the driver to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SdAction {
    /// Send an OFFER for this service; multicast unless a target is given.
    SendOffer {
        /// Unicast target, multicast when absent.
        to: Option<Endpoint>,
    },
    /// Send a STOP_OFFER (ttl 0) for this service.
    SendStopOffer,
    /// Send a FIND for this service.
    SendFind,
}

/// Offer FSM states. `Inactive` has no timers; the three ready substates
/// each carry the deadline that drives them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OfferState {
    Inactive,
    Initial { due: Instant },
    Repeating { run: u8, due: Instant },
    Announcing { next_offer: Instant },
}

/// Per offered service instance: announces it per the SD timing rules.
#[derive(Debug)]
pub struct OfferFsm {
    state: OfferState,
    timing: crate::SdTiming,
}

impl OfferFsm {
    /// A machine in `Inactive`.
    pub fn new(timing: crate::SdTiming) -> Self {
        Self { state: OfferState::Inactive, timing }
    }

    /// Service went up (offered locally, network available) or down.
    pub fn on_status(&mut self, up: bool, now: Instant) -> Vec<SdAction> {
        match (self.state, up) {
            (OfferState::Inactive, true) => {
                let delay = draw_delay(self.timing.initial_delay_min, self.timing.initial_delay_max);
                self.state = OfferState::Initial { due: now + delay };
                Vec::new()
            }
            (OfferState::Inactive, false) => Vec::new(),
            (_, true) => Vec::new(), // already running
            (_, false) => {
                self.state = OfferState::Inactive;
                vec![SdAction::SendStopOffer]
            }
        }
    }

    /// A timer expiry at `now`.
    pub fn on_timer(&mut self, now: Instant) -> Vec<SdAction> {
        match self.state {
            OfferState::Initial { due } if now >= due => {
                if self.timing.repetition_max > 0 {
                    self.state = OfferState::Repeating {
                        run: 0,
                        due: now + self.timing.repetition_base_delay,
                    };
                } else {
                    self.state =
                        OfferState::Announcing { next_offer: now + self.timing.cyclic_offer_delay };
                }
                vec![SdAction::SendOffer { to: None }]
            }
            OfferState::Repeating { run, due } if now >= due => {
                let next_run = run + 1;
                if next_run >= self.timing.repetition_max {
                    self.state =
                        OfferState::Announcing { next_offer: now + self.timing.cyclic_offer_delay };
                } else {
                    let gap = self.timing.repetition_base_delay * (1u32 << next_run);
                    self.state = OfferState::Repeating { run: next_run, due: now + gap };
                }
                vec![SdAction::SendOffer { to: None }]
            }
            OfferState::Announcing { next_offer } if now >= next_offer => {
                self.state =
                    OfferState::Announcing { next_offer: now + self.timing.cyclic_offer_delay };
                vec![SdAction::SendOffer { to: None }]
            }
            _ => Vec::new(),
        }
    }

    /// A FIND for this service arrived from `finder`.
    pub fn on_find(&mut self, finder: Endpoint, unicast_allowed: bool, now: Instant) -> Vec<SdAction> {
        let unicast = unicast_allowed.then_some(finder);
        match self.state {
            // Repetition phase answers immediately without leaving the state.
            OfferState::Repeating { .. } => vec![SdAction::SendOffer { to: unicast }],
            OfferState::Announcing { next_offer } => {
                let remaining = next_offer.saturating_duration_since(now);
                if remaining > self.timing.cyclic_offer_delay / 2 {
                    vec![SdAction::SendOffer { to: unicast }]
                } else {
                    // The upcoming cyclic offer reaches the finder anyway.
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// The next deadline, if any timer is armed.
    pub fn next_wakeup(&self) -> Option<Instant> {
        match self.state {
            OfferState::Inactive => None,
            OfferState::Initial { due } | OfferState::Repeating { due, .. } => Some(due),
            OfferState::Announcing { next_offer } => Some(next_offer),
        }
    }

    /// True while the service is announced.
    pub fn is_active(&self) -> bool {
        self.state != OfferState::Inactive
    }
}

/// Find FSM states: like the offer phases but finite; after the last
/// repetition the machine goes quiet and waits for an offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FindState {
    Inactive,
    Initial { due: Instant },
    Repeating { run: u8, due: Instant },
    Exhausted,
    Seen,
}

/// Per requested service instance: sends FINDs until an offer is seen.
#[derive(Debug)]
pub struct FindFsm {
    state: FindState,
    timing: crate::SdTiming,
}

impl FindFsm {
    /// A machine in `Inactive`.
    pub fn new(timing: crate::SdTiming) -> Self {
        Self { state: FindState::Inactive, timing }
    }

    /// The service became requested (or the request was dropped).
    pub fn on_status(&mut self, requested: bool, now: Instant) -> Vec<SdAction> {
        match (self.state, requested) {
            (FindState::Inactive, true) => {
                let delay = draw_delay(self.timing.initial_delay_min, self.timing.initial_delay_max);
                self.state = FindState::Initial { due: now + delay };
                Vec::new()
            }
            (_, false) => {
                self.state = FindState::Inactive;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// A timer expiry at `now`.
    pub fn on_timer(&mut self, now: Instant) -> Vec<SdAction> {
        match self.state {
            FindState::Initial { due } if now >= due => {
                if self.timing.repetition_max > 0 {
                    self.state =
                        FindState::Repeating { run: 0, due: now + self.timing.repetition_base_delay };
                } else {
                    self.state = FindState::Exhausted;
                }
                vec![SdAction::SendFind]
            }
            FindState::Repeating { run, due } if now >= due => {
                let next_run = run + 1;
                if next_run >= self.timing.repetition_max {
                    self.state = FindState::Exhausted;
                } else {
                    let gap = self.timing.repetition_base_delay * (1u32 << next_run);
                    self.state = FindState::Repeating { run: next_run, due: now + gap };
                }
                vec![SdAction::SendFind]
            }
            _ => Vec::new(),
        }
    }

    /// A matching OFFER was seen.
    pub fn on_offer_seen(&mut self) {
        if self.state != FindState::Inactive {
            self.state = FindState::Seen;
        }
    }

    /// The previously seen offer expired or was withdrawn; search again.
    pub fn on_offer_lost(&mut self, now: Instant) {
        if self.state == FindState::Seen {
            let delay = draw_delay(self.timing.initial_delay_min, self.timing.initial_delay_max);
            self.state = FindState::Initial { due: now + delay };
        }
    }

    /// The next deadline, if any timer is armed.
    pub fn next_wakeup(&self) -> Option<Instant> {
        match self.state {
            FindState::Initial { due } | FindState::Repeating { due, .. } => Some(due),
            _ => None,
        }
    }

    /// True once a matching offer was seen.
    pub fn is_seen(&self) -> bool {
        self.state == FindState::Seen
    }
}

fn draw_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> crate::SdTiming {
        crate::SdTiming {
            initial_delay_min: Duration::from_millis(10),
            initial_delay_max: Duration::from_millis(10),
            repetition_base_delay: Duration::from_millis(100),
            repetition_max: 2,
            cyclic_offer_delay: Duration::from_millis(1000),
            ..crate::SdTiming::default()
        }
    }

    fn finder() -> Endpoint {
        Endpoint::udp([10u8, 0, 0, 7].into(), 30490)
    }

    #[test]
    fn test_offer_walks_through_phases() {
        let mut fsm = OfferFsm::new(timing());
        let t0 = Instant::now();
        assert!(fsm.on_status(true, t0).is_empty());
        let due = fsm.next_wakeup().expect("initial delay armed");
        assert_eq!(due, t0 + Duration::from_millis(10));

        // Initial offer.
        assert_eq!(fsm.on_timer(due), vec![SdAction::SendOffer { to: None }]);
        // Repetition run 0 after base delay.
        let due = fsm.next_wakeup().expect("repetition armed");
        assert_eq!(due.duration_since(t0), Duration::from_millis(110));
        assert_eq!(fsm.on_timer(due), vec![SdAction::SendOffer { to: None }]);
        // Run 1 after 2 x base; repetition_max = 2 reached afterwards.
        let due = fsm.next_wakeup().expect("second repetition armed");
        assert_eq!(fsm.on_timer(due), vec![SdAction::SendOffer { to: None }]);
        // Announcing: cyclic offers.
        let cyclic = fsm.next_wakeup().expect("cyclic armed");
        assert_eq!(cyclic.duration_since(due), Duration::from_millis(1000));
        assert_eq!(fsm.on_timer(cyclic), vec![SdAction::SendOffer { to: None }]);
        assert!(fsm.is_active());
    }

    #[test]
    fn test_offer_stop_returns_to_inactive() {
        let mut fsm = OfferFsm::new(timing());
        let t0 = Instant::now();
        fsm.on_status(true, t0);
        let due = fsm.next_wakeup().expect("armed");
        fsm.on_timer(due);

        assert_eq!(fsm.on_status(false, due), vec![SdAction::SendStopOffer]);
        assert!(!fsm.is_active());
        assert_eq!(fsm.next_wakeup(), None);
    }

    #[test]
    fn test_find_in_repetition_answered_immediately() {
        let mut fsm = OfferFsm::new(timing());
        let t0 = Instant::now();
        fsm.on_status(true, t0);
        let due = fsm.next_wakeup().expect("armed");
        fsm.on_timer(due); // now repeating

        let actions = fsm.on_find(finder(), true, due + Duration::from_millis(1));
        assert_eq!(actions, vec![SdAction::SendOffer { to: Some(finder()) }]);
        // Still repeating: the armed deadline is unchanged.
        assert_eq!(fsm.next_wakeup().map(|d| d.duration_since(t0)), Some(Duration::from_millis(110)));
    }

    #[test]
    fn test_find_in_announcing_half_cycle_rule() {
        let mut fsm = OfferFsm::new(crate::SdTiming { repetition_max: 0, ..timing() });
        let t0 = Instant::now();
        fsm.on_status(true, t0);
        let due = fsm.next_wakeup().expect("armed");
        fsm.on_timer(due); // straight to announcing, next offer in 1000 ms

        // 100 ms into the cycle: 900 ms remain, more than half; answer.
        let actions = fsm.on_find(finder(), true, due + Duration::from_millis(100));
        assert_eq!(actions, vec![SdAction::SendOffer { to: Some(finder()) }]);

        // 800 ms into the cycle: 200 ms remain; suppressed.
        let actions = fsm.on_find(finder(), true, due + Duration::from_millis(800));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_find_unicast_flag_falls_back_to_multicast() {
        let mut fsm = OfferFsm::new(timing());
        let t0 = Instant::now();
        fsm.on_status(true, t0);
        let due = fsm.next_wakeup().expect("armed");
        fsm.on_timer(due);

        let actions = fsm.on_find(finder(), false, due);
        assert_eq!(actions, vec![SdAction::SendOffer { to: None }]);
    }

    #[test]
    fn test_find_fsm_gives_up_after_repetitions() {
        let mut fsm = FindFsm::new(timing());
        let t0 = Instant::now();
        fsm.on_status(true, t0);

        let mut sent = 0;
        while let Some(due) = fsm.next_wakeup() {
            let actions = fsm.on_timer(due);
            sent += actions.iter().filter(|a| **a == SdAction::SendFind).count();
        }
        // Initial find plus repetition_max runs.
        assert_eq!(sent, 3);
        assert!(!fsm.is_seen());
    }

    #[test]
    fn test_find_seen_and_lost_cycle() {
        let mut fsm = FindFsm::new(timing());
        let t0 = Instant::now();
        fsm.on_status(true, t0);
        fsm.on_offer_seen();
        assert!(fsm.is_seen());
        assert_eq!(fsm.next_wakeup(), None);

        fsm.on_offer_lost(t0 + Duration::from_secs(3));
        assert!(!fsm.is_seen());
        assert!(fsm.next_wakeup().is_some(), "searching again");
    }
}
