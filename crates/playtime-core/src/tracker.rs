//! The shared accounting service.
//!
//! # Locking
//!
//! The ledger, the active-session map, and the warned/blocked sets form one
//! consistency unit behind a single mutex. Every public method holds it only
//! for in-memory work. Writing the ledger to disk happens outside that lock,
//! serialized by a separate save lock, so a slow disk never stalls event
//! processing. The snapshot is taken while the save lock is held, so saves
//! land on disk in the order their snapshots were taken.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;

use crate::session::{ActiveSession, PlaybackState};
use crate::{Clock, DailyLedger, LedgerError, LimitSettings, SessionId, UserId};

/// Tuning knobs for a [`Tracker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerSettings {
    pub limits: LimitSettings,
    /// A user is "near" their limit when less than this remains.
    /// Default: 300 (5 minutes).
    pub warn_threshold_seconds: u64,
    /// Largest gap between two ticks that still counts as playtime.
    /// Default: 120 (2 minutes).
    pub max_tick_gap_seconds: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            limits: LimitSettings::default(),
            warn_threshold_seconds: 300,
            max_tick_gap_seconds: 120,
        }
    }
}

/// Read-only view of one tracked session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub accumulated_seconds: u64,
    pub paused: bool,
    pub last_tick: DateTime<Utc>,
    pub blocked: bool,
    pub warned: bool,
}

/// A session refused playback, and whose it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockedSession {
    pub(crate) user_id: UserId,
    pub(crate) since: DateTime<Utc>,
}

/// Everything guarded by the primary lock.
#[derive(Debug, Default)]
pub(crate) struct TrackerState {
    pub(crate) ledger: DailyLedger,
    pub(crate) sessions: HashMap<SessionId, ActiveSession>,
    pub(crate) warned: HashSet<SessionId>,
    pub(crate) blocked: HashMap<SessionId, BlockedSession>,
    pub(crate) limits: LimitSettings,
}

impl TrackerState {
    pub(crate) fn start(
        &mut self,
        session_id: &SessionId,
        user_id: &UserId,
        is_paused: bool,
        now: DateTime<Utc>,
    ) {
        let fresh = ActiveSession::new(user_id.clone(), now, is_paused);
        if let Some(mut replaced) = self.sessions.insert(session_id.clone(), fresh) {
            let seconds = replaced.drain_seconds();
            self.ledger
                .add_seconds(&replaced.user_id, now.date_naive(), seconds);
            tracing::debug!(%session_id, seconds, "restarted session, folded previous residue");
        }
    }

    pub(crate) fn block(&mut self, session_id: &SessionId, user_id: &UserId, now: DateTime<Utc>) {
        self.blocked
            .entry(session_id.clone())
            .or_insert_with(|| BlockedSession {
                user_id: user_id.clone(),
                since: now,
            });
    }

    /// Drops every block on `user`'s sessions. Returns how many were lifted.
    pub(crate) fn lift_blocks(&mut self, user: &UserId) -> usize {
        let before = self.blocked.len();
        self.blocked.retain(|_, b| &b.user_id != user);
        before - self.blocked.len()
    }

    /// Removes a session, folding its residue into `today`.
    pub(crate) fn stop(&mut self, session_id: &SessionId, today: NaiveDate) -> Option<(UserId, u64)> {
        self.warned.remove(session_id);
        self.blocked.remove(session_id);
        let mut session = self.sessions.remove(session_id)?;
        let seconds = session.drain_seconds();
        self.ledger.add_seconds(&session.user_id, today, seconds);
        Some((session.user_id, seconds))
    }

    fn completed(&self, user: &UserId, today: NaiveDate) -> u64 {
        self.ledger.completed_seconds(user, today)
    }

    fn in_flight(&self, user: &UserId) -> u64 {
        self.sessions
            .values()
            .filter(|s| &s.user_id == user)
            .map(ActiveSession::accumulated_seconds)
            .sum()
    }

    pub(crate) fn is_over_limit(&self, user: &UserId, today: NaiveDate) -> bool {
        self.limits
            .limit_for(user)
            .is_some_and(|limit| self.completed(user, today) >= limit)
    }
}

/// Owns the ledger and every live session.
///
/// Construct one per process and share it behind an [`Arc`].
pub struct Tracker {
    state: Mutex<TrackerState>,
    save_lock: Mutex<()>,
    ledger_path: PathBuf,
    clock: Arc<dyn Clock>,
    warn_threshold_seconds: u64,
    max_tick_gap: Duration,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("ledger_path", &self.ledger_path)
            .field("warn_threshold_seconds", &self.warn_threshold_seconds)
            .field("max_tick_gap", &self.max_tick_gap)
            .finish_non_exhaustive()
    }
}

impl Tracker {
    /// Creates a tracker backed by the ledger file at `ledger_path`.
    ///
    /// A missing or malformed ledger file yields an empty ledger.
    pub fn open(ledger_path: impl Into<PathBuf>, settings: TrackerSettings, clock: Arc<dyn Clock>) -> Self {
        let ledger_path = ledger_path.into();
        let ledger = DailyLedger::load(&ledger_path);
        let max_gap_secs = i64::try_from(settings.max_tick_gap_seconds).unwrap_or(i64::MAX);

        Self {
            state: Mutex::new(TrackerState {
                ledger,
                limits: settings.limits,
                ..TrackerState::default()
            }),
            save_lock: Mutex::new(()),
            ledger_path,
            clock,
            warn_threshold_seconds: settings.warn_threshold_seconds,
            max_tick_gap: Duration::seconds(max_gap_secs),
        }
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    pub(crate) fn lock_state(&self) -> parking_lot::MutexGuard<'_, TrackerState> {
        self.state.lock()
    }

    /// Replaces the limit configuration.
    pub fn set_limits(&self, limits: LimitSettings) {
        self.state.lock().limits = limits;
    }

    /// The effective limit for `user` in seconds, `None` when unlimited.
    pub fn limit_seconds(&self, user: &UserId) -> Option<u64> {
        self.state.lock().limits.limit_for(user)
    }

    // ---- session lifecycle ----

    /// Starts tracking a session. Re-starting a tracked id replaces it.
    ///
    /// The reserved empty user is never tracked.
    pub fn start_session(&self, session_id: &SessionId, user_id: &UserId, is_paused: bool) {
        if user_id.is_empty_sentinel() {
            tracing::debug!(%session_id, "ignoring session without a user");
            return;
        }
        let now = self.clock.now();
        self.state.lock().start(session_id, user_id, is_paused, now);
        tracing::info!(%session_id, %user_id, is_paused, "started tracking session");
    }

    /// Applies a progress tick. Unknown sessions are ignored.
    ///
    /// Callers must not tick blocked sessions; the tracker does not filter
    /// them.
    pub fn tick_session(&self, session_id: &SessionId, is_paused: bool) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(session_id) else {
            return;
        };
        let credited_ms = session.tick(now, is_paused, self.max_tick_gap);
        tracing::debug!(
            %session_id,
            credited_ms,
            accumulated = session.accumulated_seconds(),
            is_paused,
            "session tick"
        );
    }

    /// Stops tracking a session and folds its residue into today.
    ///
    /// Returns the seconds folded, zero for an unknown session.
    pub fn stop_session(&self, session_id: &SessionId) -> u64 {
        let today = self.today();
        let stopped = self.state.lock().stop(session_id, today);
        match stopped {
            Some((user_id, seconds)) => {
                tracing::info!(%session_id, %user_id, seconds, "stopped tracking session");
                seconds
            }
            None => 0,
        }
    }

    /// Folds every session's accrued seconds into today and saves.
    ///
    /// Sessions keep running; only their counters are drained. Returns the
    /// seconds folded. On a save error the folded time stays in the
    /// in-memory ledger and the next save writes it.
    pub fn flush_all(&self) -> Result<u64, LedgerError> {
        let today = self.today();
        let folded = {
            let mut state = self.state.lock();
            let TrackerState {
                ledger, sessions, ..
            } = &mut *state;
            let mut folded = 0;
            for session in sessions.values_mut() {
                let seconds = session.drain_seconds();
                ledger.add_seconds(&session.user_id, today, seconds);
                folded += seconds;
            }
            folded
        };

        self.save()?;
        if folded > 0 {
            tracing::info!(seconds = folded, "flushed active sessions");
        }
        Ok(folded)
    }

    /// Writes the current ledger to disk atomically.
    pub fn save(&self) -> Result<(), LedgerError> {
        let _guard = self.save_lock.lock();
        let snapshot = self.state.lock().ledger.clone();
        snapshot.save(&self.ledger_path)
    }

    /// Clears today's usage for `user`, including time still in flight.
    ///
    /// Blocks and warnings on the user's sessions are lifted too, whether or
    /// not those sessions are tracked.
    pub fn reset_user(&self, user: &UserId) -> Result<(), LedgerError> {
        let today = self.today();
        {
            let mut state = self.state.lock();
            let unblocked = state.lift_blocks(user);
            let TrackerState {
                ledger,
                sessions,
                warned,
                ..
            } = &mut *state;
            let removed = ledger.reset_day(user, today);
            for session in sessions.values_mut().filter(|s| &s.user_id == user) {
                session.clear();
            }
            warned.retain(|id| sessions.get(id).is_none_or(|s| &s.user_id != user));
            tracing::info!(%user, removed, unblocked, "reset today's playtime");
        }
        self.save()
    }

    // ---- queries ----

    /// Seconds already folded into today's ledger bucket.
    pub fn completed_seconds_today(&self, user: &UserId) -> u64 {
        self.state.lock().completed(user, self.today())
    }

    /// Completed seconds plus time accrued by live sessions.
    pub fn total_seconds_today(&self, user: &UserId) -> u64 {
        let today = self.today();
        let state = self.state.lock();
        state.completed(user, today) + state.in_flight(user)
    }

    /// Seconds left before the limit, `None` when unlimited.
    pub fn remaining_seconds(&self, user: &UserId) -> Option<i64> {
        let today = self.today();
        let state = self.state.lock();
        let limit = state.limits.limit_for(user)?;
        let used = state.completed(user, today) + state.in_flight(user);
        Some(saturating_i64(limit) - saturating_i64(used))
    }

    /// Whether completed time has reached the limit.
    ///
    /// In-flight time is not counted: a session crossing the limit mid-play
    /// keeps going until a flush folds its time in.
    pub fn is_over_limit(&self, user: &UserId) -> bool {
        self.state.lock().is_over_limit(user, self.today())
    }

    /// Whether less than the warning threshold remains, counting live time.
    pub fn is_near_limit(&self, user: &UserId) -> bool {
        self.remaining_seconds(user)
            .is_some_and(|remaining| remaining > 0 && remaining < saturating_i64(self.warn_threshold_seconds))
    }

    pub fn is_tracking(&self, session_id: &SessionId) -> bool {
        self.state.lock().sessions.contains_key(session_id)
    }

    /// The user a tracked session belongs to.
    pub fn session_user(&self, session_id: &SessionId) -> Option<UserId> {
        self.state
            .lock()
            .sessions
            .get(session_id)
            .map(|s| s.user_id.clone())
    }

    /// Every user with ledger history or a tracked session, sorted.
    pub fn known_users(&self) -> Vec<UserId> {
        let state = self.state.lock();
        let mut users: Vec<UserId> = state
            .ledger
            .users()
            .cloned()
            .chain(state.sessions.values().map(|s| s.user_id.clone()))
            .collect();
        users.sort();
        users.dedup();
        users
    }

    pub fn tracked_session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.state.lock().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_session_blocked(&self, session_id: &SessionId) -> bool {
        self.state.lock().blocked.contains_key(session_id)
    }

    /// Refuses further playback on `session_id`, owned by `user_id`.
    pub fn mark_session_blocked(&self, session_id: &SessionId, user_id: &UserId) {
        let now = self.clock.now();
        self.state.lock().block(session_id, user_id, now);
    }

    pub fn unblock_session(&self, session_id: &SessionId) {
        self.state.lock().blocked.remove(session_id);
    }

    /// Lifts the blocks on every session of `user`. Returns how many there were.
    pub fn unblock_user(&self, user: &UserId) -> usize {
        self.state.lock().lift_blocks(user)
    }

    pub fn has_warned_session(&self, session_id: &SessionId) -> bool {
        self.state.lock().warned.contains(session_id)
    }

    pub fn mark_warned_session(&self, session_id: &SessionId) {
        self.state.lock().warned.insert(session_id.clone());
    }

    /// Every tracked session, ordered by id.
    pub fn snapshot(&self) -> Vec<SessionView> {
        let state = self.state.lock();
        let mut views: Vec<_> = state
            .sessions
            .iter()
            .map(|(id, s)| SessionView {
                session_id: id.clone(),
                user_id: s.user_id.clone(),
                accumulated_seconds: s.accumulated_seconds(),
                paused: s.state == PlaybackState::Paused,
                last_tick: s.last_tick,
                blocked: state.blocked.contains_key(id),
                warned: state.warned.contains(id),
            })
            .collect();
        views.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        views
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
