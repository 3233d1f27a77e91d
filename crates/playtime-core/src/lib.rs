//! Playtime accounting engine.
//!
//! This crate turns a stream of playback lifecycle events into a per-user
//! "seconds consumed today" ledger and answers limit questions against it:
//! - Session accrual: tick-driven, gap-bounded counting per playback session
//! - Tracker: the shared ledger + session map behind one lock
//! - Reconciliation: repairing missed starts and pruning lost sessions
//! - Enforcement: the host-facing layer that warns, blocks, and throttles

pub mod clock;
pub mod enforce;
pub mod limits;
mod reconcile;
mod session;
mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use enforce::{CommandError, Enforcer, SessionCommands, SessionDirectory};
pub use limits::{LimitOverride, LimitSettings, resolve_limit_seconds};
pub use playtime_ledger::{DailyLedger, LedgerError, UserId};
pub use reconcile::{LiveSession, LiveSnapshot, PrunedSession, ReconcileOutcome};
pub use session::SessionId;
pub use tracker::{SessionView, Tracker, TrackerSettings};
