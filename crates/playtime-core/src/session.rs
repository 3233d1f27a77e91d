//! Per-session accrual.
//!
//! An [`ActiveSession`] only gains time when a tick arrives and both the
//! previous and the reported state are "playing". Wall-clock time that
//! passes without ticks is never counted, so a session whose client has
//! silently disconnected stops accruing the moment its ticks stop.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// Host-assigned identifier for one playback session.
///
/// Unique only while the session is alive; hosts may reuse ids later.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Last reported playback state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlaybackState {
    Playing,
    Paused,
}

impl PlaybackState {
    pub(crate) const fn from_paused(is_paused: bool) -> Self {
        if is_paused { Self::Paused } else { Self::Playing }
    }
}

/// In-memory state for one live playback session.
#[derive(Debug, Clone)]
pub(crate) struct ActiveSession {
    pub(crate) user_id: UserId,
    pub(crate) last_tick: DateTime<Utc>,
    pub(crate) state: PlaybackState,
    /// Credited playtime not yet folded into the ledger.
    accumulated_ms: u64,
}

impl ActiveSession {
    pub(crate) const fn new(user_id: UserId, now: DateTime<Utc>, is_paused: bool) -> Self {
        Self {
            user_id,
            last_tick: now,
            state: PlaybackState::from_paused(is_paused),
            accumulated_ms: 0,
        }
    }

    /// Whole seconds waiting to be folded.
    pub(crate) const fn accumulated_seconds(&self) -> u64 {
        self.accumulated_ms / 1000
    }

    /// Applies a tick and returns the milliseconds credited by it.
    ///
    /// The gap since the previous tick counts only for a playing → playing
    /// transition with `0 < gap <= max_gap`. The tick time and state are
    /// recorded either way.
    pub(crate) fn tick(&mut self, now: DateTime<Utc>, is_paused: bool, max_gap: Duration) -> u64 {
        let next = PlaybackState::from_paused(is_paused);
        let gap = now - self.last_tick;

        let credited = match (self.state, next) {
            (PlaybackState::Playing, PlaybackState::Playing)
                if gap > Duration::zero() && gap <= max_gap =>
            {
                u64::try_from(gap.num_milliseconds()).unwrap_or(0)
            }
            _ => 0,
        };

        self.accumulated_ms = self.accumulated_ms.saturating_add(credited);
        self.last_tick = now;
        self.state = next;
        credited
    }

    /// Removes and returns the whole seconds accrued so far.
    ///
    /// Sub-second remainders stay behind for the next drain.
    pub(crate) const fn drain_seconds(&mut self) -> u64 {
        let seconds = self.accumulated_seconds();
        self.accumulated_ms -= seconds * 1000;
        seconds
    }

    /// Discards everything accrued, including sub-second remainders.
    pub(crate) const fn clear(&mut self) {
        self.accumulated_ms = 0;
    }
}
