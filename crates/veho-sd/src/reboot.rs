//! Reboot detection and outbound SD session bookkeeping.
//!
//! Every SD sender keeps one session counter per destination (one for the
//! multicast group, one per unicast peer). The reboot flag stays set until
//! the counter wraps from 0xFFFF back to 1 for the first time. Receivers
//! keep the mirrored state per source and detect a reboot whenever
//! (flag, session) stops being strictly monotonic.

use std::collections::HashMap;

use veho_types::{next_session_id, Endpoint, SessionId};

/// Outbound per-destination session state.
#[derive(Debug, Default)]
pub struct SessionSender {
    counters: HashMap<Option<Endpoint>, (SessionId, bool)>,
}

impl SessionSender {
    /// An empty sender table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next `(session, reboot_flag)` for a destination (`None` = the
    /// multicast group).
    pub fn next(&mut self, destination: Option<Endpoint>) -> (SessionId, bool) {
        let (session, reboot) = self.counters.entry(destination).or_insert((0, true));
        let (next, wrapped) = next_session_id(*session);
        *session = next;
        if wrapped {
            *reboot = false;
        }
        (*session, *reboot)
    }
}

/// Inbound per-source reboot tracking.
#[derive(Debug, Default)]
pub struct RebootTracker {
    seen: HashMap<Endpoint, (bool, SessionId)>,
}

impl RebootTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an inbound SD message from `source`.
    ///
    /// Returns true when the sender rebooted since the last message, in
    /// which case every cached offer and subscription from that source is
    /// stale and must be dropped.
    pub fn check(&mut self, source: Endpoint, reboot_flag: bool, session: SessionId) -> bool {
        let rebooted = match self.seen.get(&source) {
            None => false, // first contact, nothing cached to invalidate
            Some(&(old_flag, old_session)) => {
                // Reboot when the flag rises, or when it stays set while
                // the session fails to advance.
                (!old_flag && reboot_flag) || (old_flag && reboot_flag && session <= old_session)
            }
        };
        self.seen.insert(source, (reboot_flag, session));
        rebooted
    }

    /// Forget a source (its offers expired or the endpoint went away).
    pub fn forget(&mut self, source: &Endpoint) {
        self.seen.remove(source);
    }
}
