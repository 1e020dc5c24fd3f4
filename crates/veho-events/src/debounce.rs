//! Subscriber-side debounce filters.
//!
//! A subscriber may bound the rate and the change criterion of delivered
//! notifications. The filter admits an update when the interval since the
//! last emission has elapsed and the change predicate is satisfied; updates
//! arriving early are buffered and flushed by [`DebounceFilter::take_due`]
//! once the interval expires.
//!
//! Interval semantics:
//!
//! - `-1` disables delivery entirely (nothing is ever emitted),
//! - `0` with `on_change_only` coalesces purely by change,
//! - positive values bound the emission rate.

use std::time::Instant;

use bytes::Bytes;

use crate::event::ChangePredicate;

/// Per-subscription debounce state.
#[derive(Clone)]
pub struct DebounceFilter {
    interval_ms: i64,
    on_change_only: bool,
    epsilon: Option<ChangePredicate>,
    last_emit: Option<Instant>,
    last_emitted: Option<Bytes>,
    pending: Option<Bytes>,
}

impl std::fmt::Debug for DebounceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebounceFilter")
            .field("interval_ms", &self.interval_ms)
            .field("on_change_only", &self.on_change_only)
            .field("pending", &self.pending.as_ref().map(Bytes::len))
            .finish()
    }
}

impl DebounceFilter {
    /// A filter with the given interval, change criterion and predicate.
    pub fn new(interval_ms: i64, on_change_only: bool, epsilon: Option<ChangePredicate>) -> Self {
        Self {
            interval_ms,
            on_change_only,
            epsilon,
            last_emit: None,
            last_emitted: None,
            pending: None,
        }
    }

    /// True when the filter never emits (interval `-1`).
    pub fn is_disabled(&self) -> bool {
        self.interval_ms < 0
    }

    /// True while an update is buffered awaiting its interval.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Offer an update. Returns `true` when it must be delivered now;
    /// otherwise the update may be buffered for [`Self::take_due`].
    pub fn admit(&mut self, payload: &Bytes, now: Instant) -> bool {
        if self.is_disabled() {
            return false;
        }

        if self.on_change_only && !self.is_change(payload) {
            return false;
        }

        if let (Some(last), true) = (self.last_emit, self.interval_ms > 0) {
            let elapsed_ms = now.duration_since(last).as_millis() as i64;
            if elapsed_ms < self.interval_ms {
                self.pending = Some(payload.clone());
                return false;
            }
        }

        self.mark_emitted(payload.clone(), now);
        true
    }

    /// Flush the buffered update once the interval has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Option<Bytes> {
        if self.is_disabled() || self.interval_ms == 0 {
            return None;
        }
        let pending = self.pending.as_ref()?;
        let due = match self.last_emit {
            Some(last) => now.duration_since(last).as_millis() as i64 >= self.interval_ms,
            None => true,
        };
        if !due {
            return None;
        }
        let payload = pending.clone();
        self.pending = None;
        self.mark_emitted(payload.clone(), now);
        Some(payload)
    }

    fn is_change(&self, payload: &Bytes) -> bool {
        match &self.last_emitted {
            None => true,
            Some(old) => match &self.epsilon {
                Some(predicate) => predicate(old, payload),
                None => old != payload,
            },
        }
    }

    fn mark_emitted(&mut self, payload: Bytes, now: Instant) {
        self.last_emit = Some(now);
        self.last_emitted = Some(payload);
        self.pending = None;
    }
}
