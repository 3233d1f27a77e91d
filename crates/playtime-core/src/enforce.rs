//! Host-facing enforcement.
//!
//! The [`Tracker`] only keeps books. The [`Enforcer`] sits between the host's
//! event feed and the tracker and turns limit answers into host commands:
//! a one-time warning when a user is close to their limit, and a stop when
//! they are over it. Stops re-issued to clients that keep reporting
//! progress are throttled per session.
//!
//! Blocked sessions are never ticked. Their progress events only re-issue
//! the (throttled) stop.
//!
//! # Library Access
//!
//! When access control is on, the enforcer also tells the host to disable a
//! user's library once they are over their limit and to enable it again once
//! they are back under it (a reset, a raised limit, or a new UTC day). The
//! command is sent only when the wanted state differs from the last one the
//! host acknowledged. A user seen for the first time always gets one.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use thiserror::Error;

use crate::{LedgerError, LiveSnapshot, ReconcileOutcome, SessionId, Tracker, UserId};

/// Minimum spacing between two enforcement actions on the same session.
/// Default: 5 seconds.
pub const DEFAULT_ENFORCEMENT_INTERVAL_SECS: i64 = 5;

const STOP_HEADER: &str = "Playtime limit reached";
const STOP_TEXT: &str = "You have used all of today's playtime.";
const WARN_HEADER: &str = "Playtime almost up";

/// Failures reported by the host when delivering a command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The host refused or could not route the command.
    #[error("host rejected command: {0}")]
    Rejected(String),
    /// Writing the command to the host failed.
    #[error("I/O error sending command: {0}")]
    Io(#[from] std::io::Error),
}

/// The host's view of who is playing what.
pub trait SessionDirectory: Send + Sync {
    /// The host's session list, if a new one arrived since the last call.
    ///
    /// `None` means there is nothing authoritative to reconcile against, and
    /// the periodic pass leaves tracked sessions alone.
    fn live_sessions(&self) -> Option<LiveSnapshot>;

    /// Users that are never tracked (e.g. administrators).
    fn is_exempt(&self, user: &UserId) -> bool;
}

/// Commands the host can carry out.
pub trait SessionCommands: Send + Sync {
    fn stop_playback(&self, session: &SessionId, reason: &str) -> Result<(), CommandError>;

    fn notify(&self, session: &SessionId, header: &str, text: &str) -> Result<(), CommandError>;

    /// Enables or disables the user's access to the media library.
    fn set_access(&self, user: &UserId, enabled: bool) -> Result<(), CommandError>;
}

/// Drives a [`Tracker`] from host events and enforces limits.
pub struct Enforcer<D, C> {
    tracker: Arc<Tracker>,
    directory: D,
    commands: C,
    last_action: DashMap<SessionId, DateTime<Utc>>,
    /// Library access last acknowledged by the host, per user.
    access: DashMap<UserId, bool>,
    interval: Duration,
    manage_access: bool,
}

impl<D: SessionDirectory, C: SessionCommands> Enforcer<D, C> {
    pub fn new(tracker: Arc<Tracker>, directory: D, commands: C) -> Self {
        Self {
            tracker,
            directory,
            commands,
            last_action: DashMap::new(),
            access: DashMap::new(),
            interval: Duration::seconds(DEFAULT_ENFORCEMENT_INTERVAL_SECS),
            manage_access: true,
        }
    }

    /// Overrides the per-session enforcement throttle.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Turns library access switching on or off. On by default.
    #[must_use]
    pub fn with_access_control(mut self, enabled: bool) -> Self {
        self.manage_access = enabled;
        self
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub const fn directory(&self) -> &D {
        &self.directory
    }

    fn ignores(&self, user: &UserId) -> bool {
        user.is_empty_sentinel() || self.directory.is_exempt(user)
    }

    /// Handles a playback start.
    pub fn on_start(&self, session: &SessionId, user: &UserId, is_paused: bool) {
        if self.ignores(user) {
            return;
        }
        if self.tracker.is_over_limit(user) {
            tracing::info!(session_id = %session, user_id = %user, "start refused, user over limit");
            self.block(session, user);
            return;
        }
        self.tracker.start_session(session, user, is_paused);
        self.check_limits(session, user);
    }

    /// Handles a periodic progress report.
    pub fn on_progress(&self, session: &SessionId, user: &UserId, is_paused: bool) {
        if self.tracker.is_session_blocked(session) {
            self.enforce_stop(session);
            return;
        }
        if !self.tracker.is_tracking(session) {
            tracing::debug!(session_id = %session, "progress for untracked session, treating as start");
            self.on_start(session, user, is_paused);
            return;
        }
        self.tracker.tick_session(session, is_paused);
        let owner = self
            .tracker
            .session_user(session)
            .unwrap_or_else(|| user.clone());
        self.check_limits(session, &owner);
    }

    /// Handles a playback stop.
    pub fn on_stop(&self, session: &SessionId) -> u64 {
        self.last_action.remove(session);
        self.tracker.stop_session(session)
    }

    /// The scheduled pass: flush, reconcile, then enforce.
    ///
    /// A failed save is logged; the time stays in memory for the next pass.
    /// Reconciliation only runs when the host delivered a fresh session list.
    pub fn run_periodic(&self) -> ReconcileOutcome {
        if let Err(e) = self.tracker.flush_all() {
            log_save_failure(&e);
        }

        let outcome = match self.directory.live_sessions() {
            Some(snapshot) => self
                .tracker
                .reconcile(&snapshot, |user| self.directory.is_exempt(user)),
            None => {
                tracing::debug!("no fresh session list, skipping reconciliation");
                ReconcileOutcome::default()
            }
        };

        for session in &outcome.blocked {
            self.enforce_stop(session);
        }
        for view in self.tracker.snapshot() {
            if !view.blocked {
                self.check_limits(&view.session_id, &view.user_id);
            }
        }
        for user in self.tracker.known_users() {
            if self.ignores(&user) {
                continue;
            }
            if !self.tracker.is_over_limit(&user) {
                let lifted = self.tracker.unblock_user(&user);
                if lifted > 0 {
                    tracing::info!(user_id = %user, lifted, "user back under limit, lifted blocks");
                }
            }
            self.sync_access(&user);
        }

        self.last_action
            .retain(|id, _| self.tracker.is_session_blocked(id));

        if !outcome.is_empty() {
            tracing::info!(
                pruned = outcome.pruned.len(),
                recovered = outcome.recovered.len(),
                blocked = outcome.blocked.len(),
                "reconciled sessions"
            );
        }
        outcome
    }

    /// Clears today's usage for `user`, lifts blocks on every session of
    /// theirs, and restores their library access.
    pub fn reset_user(&self, user: &UserId) -> Result<(), LedgerError> {
        let result = self.tracker.reset_user(user);
        self.last_action
            .retain(|id, _| self.tracker.is_session_blocked(id));
        self.sync_access(user);
        result
    }

    /// Blocks and stops an over-limit session, or warns a near-limit one once.
    fn check_limits(&self, session: &SessionId, user: &UserId) {
        if self.tracker.is_over_limit(user) {
            tracing::info!(session_id = %session, user_id = %user, "user over limit, stopping playback");
            self.block(session, user);
            return;
        }
        if self.tracker.has_warned_session(session) || !self.tracker.is_near_limit(user) {
            return;
        }

        // Marked first so a failed delivery is not retried.
        self.tracker.mark_warned_session(session);
        let remaining = self.tracker.remaining_seconds(user).unwrap_or(0);
        let text = format!("{} of playtime left today.", format_remaining(remaining));
        tracing::info!(session_id = %session, user_id = %user, remaining, "warning near limit");
        if let Err(e) = self.commands.notify(session, WARN_HEADER, &text) {
            tracing::warn!(session_id = %session, error = %e, "failed to send limit warning");
        }
    }

    fn block(&self, session: &SessionId, user: &UserId) {
        self.tracker.mark_session_blocked(session, user);
        self.sync_access(user);
        self.enforce_stop(session);
    }

    /// Sends notice + stop, at most once per throttle interval per session.
    fn enforce_stop(&self, session: &SessionId) {
        let now = self.tracker.now();
        if let Some(last) = self.last_action.get(session) {
            if now - *last < self.interval {
                tracing::debug!(session_id = %session, "stop throttled");
                return;
            }
        }
        self.last_action.insert(session.clone(), now);

        if let Err(e) = self.commands.notify(session, STOP_HEADER, STOP_TEXT) {
            tracing::warn!(session_id = %session, error = %e, "failed to send limit notice");
        }
        if let Err(e) = self.commands.stop_playback(session, STOP_TEXT) {
            tracing::warn!(session_id = %session, error = %e, "failed to stop playback");
        }
    }

    /// Tells the host to switch `user`'s library access if it changed.
    ///
    /// A failed delivery is not recorded, so the next pass sends it again.
    fn sync_access(&self, user: &UserId) {
        if !self.manage_access || self.ignores(user) {
            return;
        }
        let enabled = !self.tracker.is_over_limit(user);
        if self.access.get(user).is_some_and(|known| *known == enabled) {
            return;
        }
        match self.commands.set_access(user, enabled) {
            Ok(()) => {
                tracing::info!(user_id = %user, enabled, "updated library access");
                self.access.insert(user.clone(), enabled);
            }
            Err(e) => tracing::warn!(user_id = %user, enabled, error = %e, "failed to update library access"),
        }
    }
}

fn log_save_failure(e: &LedgerError) {
    tracing::warn!(error = %e, "failed to save ledger, will retry next flush");
}

/// Renders a remaining-time figure for user-facing messages.
fn format_remaining(seconds: i64) -> String {
    let minutes = (seconds.max(0) + 59) / 60;
    if minutes == 1 {
        "1 minute".to_string()
    } else {
        format!("{minutes} minutes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::tests::{settings, start_time};
    use crate::{Clock, LiveSession, ManualClock};
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Sent {
        Stop(String),
        Notify(String, String),
        Access(String, bool),
    }

    #[derive(Default)]
    struct FakeHost {
        live: Mutex<Option<LiveSnapshot>>,
        exempt: Vec<UserId>,
        sent: Mutex<Vec<Sent>>,
        fail: bool,
    }

    impl SessionDirectory for Arc<FakeHost> {
        fn live_sessions(&self) -> Option<LiveSnapshot> {
            self.live.lock().take()
        }

        fn is_exempt(&self, user: &UserId) -> bool {
            self.exempt.contains(user)
        }
    }

    impl SessionCommands for Arc<FakeHost> {
        fn stop_playback(&self, session: &SessionId, _reason: &str) -> Result<(), CommandError> {
            self.sent.lock().push(Sent::Stop(session.to_string()));
            if self.fail {
                return Err(CommandError::Rejected("session gone".into()));
            }
            Ok(())
        }

        fn notify(&self, session: &SessionId, header: &str, _text: &str) -> Result<(), CommandError> {
            self.sent
                .lock()
                .push(Sent::Notify(session.to_string(), header.to_string()));
            Ok(())
        }

        fn set_access(&self, user: &UserId, enabled: bool) -> Result<(), CommandError> {
            self.sent.lock().push(Sent::Access(user.to_string(), enabled));
            if self.fail {
                return Err(CommandError::Rejected("user locked".into()));
            }
            Ok(())
        }
    }

    impl FakeHost {
        fn stops(&self) -> usize {
            self.sent
                .lock()
                .iter()
                .filter(|s| matches!(s, Sent::Stop(_)))
                .count()
        }

        fn warnings(&self) -> usize {
            self.sent
                .lock()
                .iter()
                .filter(|s| matches!(s, Sent::Notify(_, h) if h == WARN_HEADER))
                .count()
        }

        fn access_changes(&self) -> Vec<Sent> {
            self.sent
                .lock()
                .iter()
                .filter(|s| matches!(s, Sent::Access(..)))
                .cloned()
                .collect()
        }

        fn report(&self, taken_at: DateTime<Utc>, sessions: Vec<LiveSession>) {
            *self.live.lock() = Some(LiveSnapshot::new(taken_at, sessions));
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        host: Arc<FakeHost>,
        enforcer: Enforcer<Arc<FakeHost>, Arc<FakeHost>>,
    }

    /// An enforcer with a `limit_minutes` daily limit for everyone.
    fn harness(limit_minutes: i64, host: FakeHost) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(start_time()));
        let tracker = Arc::new(Tracker::open(
            dir.path().join("ledger.json"),
            settings(Some(limit_minutes)),
            clock.clone(),
        ));
        let host = Arc::new(host);
        let enforcer = Enforcer::new(tracker, host.clone(), host.clone());
        Harness {
            _dir: dir,
            clock,
            host,
            enforcer,
        }
    }

    impl Harness {
        fn progress(&self, session: &SessionId, count: usize) {
            for _ in 0..count {
                self.clock.advance_secs(10);
                self.enforcer.on_progress(session, &"alice".into(), false);
            }
        }

        fn playing(&self, session: &SessionId) -> LiveSession {
            LiveSession {
                session_id: session.clone(),
                user_id: "alice".into(),
                playing: true,
                paused: false,
            }
        }

        /// Plays `seconds` in a throwaway session so alice's day is used up.
        fn exhaust(&self, seconds: usize) {
            let s = SessionId::from("earlier");
            self.enforcer.on_start(&s, &"alice".into(), false);
            self.progress(&s, seconds / 10);
            self.enforcer.on_stop(&s);
        }
    }

    fn alice() -> UserId {
        "alice".into()
    }

    #[test]
    fn exempt_users_are_ignored() {
        let h = harness(
            10,
            FakeHost {
                exempt: vec!["root".into()],
                ..FakeHost::default()
            },
        );
        let s = SessionId::from("s1");
        h.enforcer.on_start(&s, &"root".into(), false);
        h.enforcer.on_progress(&s, &"root".into(), false);
        h.enforcer.run_periodic();

        assert!(!h.enforcer.tracker().is_tracking(&s));
        assert!(h.host.sent.lock().is_empty());
    }

    #[test]
    fn warning_is_sent_once_per_session() {
        let h = harness(10, FakeHost::default());
        let s = SessionId::from("s1");
        h.enforcer.on_start(&s, &alice(), false);
        h.progress(&s, 35);

        assert!(h.enforcer.tracker().has_warned_session(&s));
        assert_eq!(h.host.warnings(), 1);
        assert_eq!(h.host.stops(), 0);
    }

    #[test]
    fn periodic_pass_without_session_list_keeps_tracking() {
        let h = harness(10, FakeHost::default());
        let s = SessionId::from("s1");
        h.enforcer.on_start(&s, &alice(), false);
        h.progress(&s, 31);
        assert_eq!(h.host.warnings(), 1);

        let outcome = h.enforcer.run_periodic();
        h.progress(&s, 3);

        assert!(outcome.is_empty());
        assert!(h.enforcer.tracker().is_tracking(&s));
        assert!(h.enforcer.tracker().has_warned_session(&s));
        assert_eq!(h.host.warnings(), 1);
        assert_eq!(h.enforcer.tracker().total_seconds_today(&alice()), 340);
    }

    #[test]
    fn stale_session_list_does_not_prune_newer_sessions() {
        let h = harness(10, FakeHost::default());
        h.host.report(h.clock.now(), Vec::new());
        let s = SessionId::from("s1");
        h.enforcer.on_start(&s, &alice(), false);
        h.progress(&s, 31);

        let outcome = h.enforcer.run_periodic();
        assert!(outcome.pruned.is_empty());

        // The list was consumed; the next pass has nothing to act on.
        h.progress(&s, 3);
        assert!(h.enforcer.run_periodic().is_empty());
        assert!(h.enforcer.tracker().is_tracking(&s));
        assert_eq!(h.host.warnings(), 1);
        assert_eq!(h.enforcer.tracker().completed_seconds_today(&alice()), 340);
    }

    #[test]
    fn over_limit_start_is_blocked_and_stopped() {
        let h = harness(10, FakeHost::default());
        h.exhaust(610);

        let second = SessionId::from("s2");
        h.enforcer.on_start(&second, &alice(), false);

        assert!(h.enforcer.tracker().is_session_blocked(&second));
        assert!(!h.enforcer.tracker().is_tracking(&second));
        assert_eq!(h.host.stops(), 1);
    }

    #[test]
    fn blocked_session_progress_is_throttled_and_not_ticked() {
        let h = harness(10, FakeHost::default());
        let s = SessionId::from("s1");
        h.enforcer.tracker().mark_session_blocked(&s, &alice());

        h.enforcer.on_progress(&s, &alice(), false);
        h.clock.advance_secs(1);
        h.enforcer.on_progress(&s, &alice(), false);
        h.clock.advance_secs(1);
        h.enforcer.on_progress(&s, &alice(), false);
        assert_eq!(h.host.stops(), 1);

        h.clock.advance_secs(5);
        h.enforcer.on_progress(&s, &alice(), false);
        assert_eq!(h.host.stops(), 2);
        assert!(!h.enforcer.tracker().is_tracking(&s));
        assert_eq!(h.enforcer.tracker().total_seconds_today(&alice()), 0);
    }

    #[test]
    fn progress_for_untracked_session_starts_tracking() {
        let h = harness(10, FakeHost::default());
        let s = SessionId::from("s1");
        h.enforcer.on_progress(&s, &alice(), false);
        h.progress(&s, 3);

        assert_eq!(h.enforcer.tracker().total_seconds_today(&alice()), 30);
    }

    #[test]
    fn breach_mid_session_is_enforced_after_flush() {
        let h = harness(10, FakeHost::default());
        let s = SessionId::from("s1");
        h.enforcer.on_start(&s, &alice(), false);
        h.progress(&s, 65);

        // Over in flight, but not yet folded: playback continues.
        assert_eq!(h.host.stops(), 0);

        h.host.report(h.clock.now(), vec![h.playing(&s)]);
        h.enforcer.run_periodic();
        assert!(h.enforcer.tracker().is_session_blocked(&s));
        assert_eq!(h.host.stops(), 1);

        // Further progress is not counted.
        let before = h.enforcer.tracker().total_seconds_today(&alice());
        h.progress(&s, 3);
        assert_eq!(h.enforcer.tracker().total_seconds_today(&alice()), before);
    }

    #[test]
    fn periodic_pass_prunes_and_recovers() {
        let h = harness(10, FakeHost::default());
        let lost = SessionId::from("lost");
        h.enforcer.on_start(&lost, &alice(), false);
        h.progress(&lost, 2);
        h.host.report(
            h.clock.now(),
            vec![LiveSession {
                session_id: "missed".into(),
                user_id: "bob".into(),
                playing: true,
                paused: false,
            }],
        );

        let outcome = h.enforcer.run_periodic();
        assert_eq!(outcome.pruned.len(), 1);
        assert_eq!(outcome.recovered, vec![SessionId::from("missed")]);
        assert_eq!(h.enforcer.tracker().completed_seconds_today(&alice()), 20);
        assert!(h.enforcer.tracker().is_tracking(&"missed".into()));
    }

    #[test]
    fn reset_user_lifts_blocks_on_tracked_sessions() {
        let h = harness(10, FakeHost::default());
        let s = SessionId::from("s1");
        h.enforcer.on_start(&s, &alice(), false);
        h.progress(&s, 61);
        h.enforcer.run_periodic();
        assert!(h.enforcer.tracker().is_session_blocked(&s));

        h.enforcer.reset_user(&alice()).unwrap();
        assert!(!h.enforcer.tracker().is_session_blocked(&s));
        assert!(!h.enforcer.tracker().is_over_limit(&alice()));
    }

    #[test]
    fn reset_user_lifts_blocks_on_refused_starts() {
        let h = harness(10, FakeHost::default());
        h.exhaust(610);
        let s = SessionId::from("s2");
        h.enforcer.on_start(&s, &alice(), false);
        assert_eq!(h.host.stops(), 1);

        h.enforcer.reset_user(&alice()).unwrap();
        h.clock.advance_secs(10);
        h.enforcer.on_progress(&s, &alice(), false);
        h.progress(&s, 2);

        assert!(!h.enforcer.tracker().is_session_blocked(&s));
        assert!(h.enforcer.tracker().is_tracking(&s));
        assert_eq!(h.host.stops(), 1);
        assert_eq!(h.enforcer.tracker().total_seconds_today(&alice()), 20);
    }

    #[test]
    fn access_follows_over_limit_state() {
        let h = harness(10, FakeHost::default());
        let s = SessionId::from("s1");
        h.enforcer.on_start(&s, &alice(), false);
        h.progress(&s, 61);

        h.enforcer.run_periodic();
        h.enforcer.run_periodic();
        assert_eq!(h.host.access_changes(), vec![Sent::Access("alice".into(), false)]);

        h.enforcer.reset_user(&alice()).unwrap();
        assert_eq!(
            h.host.access_changes(),
            vec![
                Sent::Access("alice".into(), false),
                Sent::Access("alice".into(), true),
            ]
        );
    }

    #[test]
    fn new_day_restores_access_and_lifts_blocks() {
        let h = harness(10, FakeHost::default());
        h.exhaust(610);
        let s = SessionId::from("s2");
        h.enforcer.on_start(&s, &alice(), false);
        assert!(h.enforcer.tracker().is_session_blocked(&s));

        // 18:00 + 6h crosses UTC midnight.
        h.clock.advance_secs(6 * 3600);
        h.enforcer.run_periodic();

        assert!(!h.enforcer.tracker().is_session_blocked(&s));
        assert_eq!(
            h.host.access_changes().last(),
            Some(&Sent::Access("alice".into(), true))
        );
    }

    #[test]
    fn access_control_can_be_disabled() {
        let h = harness(10, FakeHost::default());
        let enforcer = Enforcer::new(
            Arc::clone(h.enforcer.tracker()),
            h.host.clone(),
            h.host.clone(),
        )
        .with_access_control(false);
        h.exhaust(610);
        enforcer.on_start(&"s2".into(), &alice(), false);
        enforcer.run_periodic();

        assert!(
            h.host
                .access_changes()
                .iter()
                .all(|s| *s != Sent::Access("alice".into(), false))
        );
    }

    #[test]
    fn failed_access_update_is_retried() {
        let h = harness(
            10,
            FakeHost {
                fail: true,
                ..FakeHost::default()
            },
        );
        h.enforcer.on_start(&"s1".into(), &alice(), false);
        h.enforcer.run_periodic();
        h.enforcer.run_periodic();

        assert_eq!(h.host.access_changes().len(), 2);
    }

    #[test]
    fn failed_commands_do_not_disturb_state() {
        let h = harness(
            10,
            FakeHost {
                fail: true,
                ..FakeHost::default()
            },
        );
        let s = SessionId::from("s1");
        h.enforcer.tracker().mark_session_blocked(&s, &alice());
        h.enforcer.on_progress(&s, &alice(), false);

        assert_eq!(h.host.stops(), 1);
        assert!(h.enforcer.tracker().is_session_blocked(&s));
    }

    #[test]
    fn remaining_time_is_rounded_up_to_minutes() {
        assert_eq!(format_remaining(290), "5 minutes");
        assert_eq!(format_remaining(45), "1 minute");
        assert_eq!(format_remaining(-3), "0 minutes");
    }
}
