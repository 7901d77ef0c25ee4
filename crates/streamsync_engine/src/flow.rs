//! Flow-control scheduling for `next` acknowledgements.
//!
//! Every data frame asks for one more `next` on its stream. Sends for the
//! same stream are spaced at least `min_interval` apart; a frame arriving
//! inside the window schedules a single deferred send, and further frames
//! coalesce into it. A deferred send never fires for a stream that is no
//! longer desired.
//!
//! Each deferred send carries a ticket. Only the timer holding the ticket of
//! the current pending send may fire it; timers outliving an unsubscribe are
//! ignored. The last send time survives an unsubscribe so a resubscribe
//! inside the window is spaced too.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// What to do with the acknowledgement for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Send `next` now.
    SendNow,
    /// Schedule one send after `delay`; the timer must present `ticket`.
    Schedule {
        /// Time until the window closes.
        delay: Duration,
        /// Identifies this deferred send.
        ticket: u64,
    },
    /// A send is already pending; nothing to do.
    Coalesced,
}

/// Per-stream debounce of acknowledgements.
#[derive(Debug)]
pub struct AckScheduler {
    min_interval: Duration,
    last_sent: HashMap<String, Instant>,
    pending: HashMap<String, u64>,
    next_ticket: u64,
}

impl AckScheduler {
    /// Creates a scheduler with the given minimum spacing.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: HashMap::new(),
            pending: HashMap::new(),
            next_ticket: 0,
        }
    }

    /// Decides how to acknowledge a frame on `stream` received at `now`.
    ///
    /// `SendNow` records `now` as the last send.
    pub fn on_frame(&mut self, stream: &str, now: Instant) -> AckDecision {
        if self.pending.contains_key(stream) {
            return AckDecision::Coalesced;
        }
        let elapsed = self
            .last_sent
            .get(stream)
            .map(|last| now.saturating_duration_since(*last));
        match elapsed {
            Some(elapsed) if elapsed < self.min_interval => {
                self.next_ticket += 1;
                let ticket = self.next_ticket;
                self.pending.insert(stream.to_string(), ticket);
                AckDecision::Schedule {
                    delay: self.min_interval - elapsed,
                    ticket,
                }
            }
            _ => {
                self.last_sent.insert(stream.to_string(), now);
                AckDecision::SendNow
            }
        }
    }

    /// Resolves the deferred send identified by `ticket` at `now`.
    ///
    /// Returns true if the send should go out; the send is then recorded.
    /// A stale ticket leaves the current pending send untouched. A stream
    /// that is no longer desired drops its pending send and yields false.
    pub fn fire(&mut self, stream: &str, ticket: u64, now: Instant, still_desired: bool) -> bool {
        if self.pending.get(stream) != Some(&ticket) {
            return false;
        }
        self.pending.remove(stream);
        if !still_desired {
            return false;
        }
        self.last_sent.insert(stream.to_string(), now);
        true
    }

    /// Drops any pending send for `stream`. The last send time is kept.
    pub fn forget(&mut self, stream: &str) {
        self.pending.remove(stream);
    }

    /// Drops every pending send.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Returns true if a deferred send is pending for `stream`.
    pub fn is_pending(&self, stream: &str) -> bool {
        self.pending.contains_key(stream)
    }

    /// Returns the last send time for `stream`.
    pub fn last_sent(&self, stream: &str) -> Option<Instant> {
        self.last_sent.get(stream).copied()
    }

    /// Minimum spacing between sends.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}
