//! Reconciling tracked sessions against the host's live session list.
//!
//! Event feeds lose messages. A client that crashes never sends a stop, and
//! a process that starts mid-playback never sees the start. The sweep fixes
//! both: tracked sessions the host no longer reports are pruned, and live
//! playing sessions the tracker missed are picked up.
//!
//! A host's session list is only authoritative for the moment it was taken.
//! Sessions that ticked or were blocked after that moment are kept even if
//! the list does not mention them.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tracker::TrackerState;
use crate::{SessionId, Tracker, UserId};

/// One entry of the host's authoritative session list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSession {
    pub session_id: SessionId,
    pub user_id: UserId,
    /// Whether the session has something loaded for playback.
    #[serde(default)]
    pub playing: bool,
    #[serde(default)]
    pub paused: bool,
}

impl LiveSession {
    const fn is_actively_playing(&self) -> bool {
        self.playing && !self.paused
    }
}

/// The host's session list as of `taken_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSnapshot {
    pub taken_at: DateTime<Utc>,
    pub sessions: Vec<LiveSession>,
}

impl LiveSnapshot {
    pub fn new(taken_at: DateTime<Utc>, sessions: Vec<LiveSession>) -> Self {
        Self { taken_at, sessions }
    }
}

/// A tracked session the host no longer reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunedSession {
    pub session_id: SessionId,
    pub user_id: UserId,
    /// Seconds folded into the ledger when it was removed.
    pub seconds: u64,
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub pruned: Vec<PrunedSession>,
    /// Live sessions that were not tracked and now are.
    pub recovered: Vec<SessionId>,
    /// Live sessions of users already over their limit. They were marked
    /// blocked and the caller must ask the host to stop them.
    pub blocked: Vec<SessionId>,
}

impl ReconcileOutcome {
    pub fn is_empty(&self) -> bool {
        self.pruned.is_empty() && self.recovered.is_empty() && self.blocked.is_empty()
    }
}

impl Tracker {
    /// Brings the tracked session set in line with `snapshot`.
    ///
    /// `is_exempt` is evaluated before the tracker lock is taken.
    pub fn reconcile(&self, snapshot: &LiveSnapshot, is_exempt: impl Fn(&UserId) -> bool) -> ReconcileOutcome {
        let live = &snapshot.sessions;
        let taken_at = snapshot.taken_at;
        let candidates: Vec<&LiveSession> = live
            .iter()
            .filter(|s| s.is_actively_playing())
            .filter(|s| !s.user_id.is_empty_sentinel() && !is_exempt(&s.user_id))
            .collect();
        let live_ids: HashSet<&SessionId> = live.iter().map(|s| &s.session_id).collect();

        let now = self.now();
        let today = now.date_naive();
        let mut outcome = ReconcileOutcome::default();
        let mut state = self.lock_state();

        let mut lost: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(id, s)| !live_ids.contains(id) && s.last_tick <= taken_at)
            .map(|(id, _)| id.clone())
            .collect();
        lost.sort();
        for session_id in lost {
            if let Some((user_id, seconds)) = state.stop(&session_id, today) {
                tracing::info!(%session_id, %user_id, seconds, "pruned lost session");
                outcome.pruned.push(PrunedSession {
                    session_id,
                    user_id,
                    seconds,
                });
            }
        }
        let TrackerState {
            sessions,
            warned,
            blocked,
            ..
        } = &mut *state;
        blocked.retain(|id, b| live_ids.contains(id) || sessions.contains_key(id) || b.since > taken_at);
        warned.retain(|id| live_ids.contains(id) || sessions.contains_key(id));

        for live in candidates {
            let id = &live.session_id;
            if state.sessions.contains_key(id) || state.blocked.contains_key(id) {
                continue;
            }
            if state.is_over_limit(&live.user_id, today) {
                state.block(id, &live.user_id, now);
                tracing::info!(session_id = %id, user_id = %live.user_id, "blocked untracked session over limit");
                outcome.blocked.push(id.clone());
            } else {
                state.start(id, &live.user_id, live.paused, now);
                tracing::info!(session_id = %id, user_id = %live.user_id, "recovered untracked session");
                outcome.recovered.push(id.clone());
            }
        }

        outcome
    }
}
