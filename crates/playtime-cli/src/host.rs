//! JSON-lines host adapter.
//!
//! A media server plugin (or any bridge script) feeds playback events to
//! `playtime serve` on stdin, one JSON object per line, and reads commands
//! back from stdout in the same format.
//!
//! Events:
//! ```json
//! {"type":"session_start","session_id":"a1","user_id":"kid","paused":false}
//! {"type":"session_progress","session_id":"a1","user_id":"kid","paused":false}
//! {"type":"session_stop","session_id":"a1"}
//! {"type":"live_sessions","sessions":[{"session_id":"a1","user_id":"kid","playing":true,"paused":false}]}
//! {"type":"reset_user","user_id":"kid"}
//! ```
//!
//! Commands:
//! ```json
//! {"command":"notify","session_id":"a1","header":"...","text":"..."}
//! {"command":"stop","session_id":"a1","reason":"..."}
//! {"command":"set_access","user_id":"kid","enabled":false}
//! ```
//!
//! A `live_sessions` list is used by at most one reconciliation pass. Hosts
//! should send a fresh one before each flush interval elapses.

use std::collections::HashSet;
use std::io::Write;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use playtime_core::{
    CommandError, LiveSession, LiveSnapshot, SessionCommands, SessionDirectory, SessionId, UserId,
};
use serde::{Deserialize, Serialize};

/// An event reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    SessionStart {
        session_id: SessionId,
        user_id: UserId,
        #[serde(default)]
        paused: bool,
    },
    SessionProgress {
        session_id: SessionId,
        user_id: UserId,
        #[serde(default)]
        paused: bool,
    },
    SessionStop {
        session_id: SessionId,
    },
    LiveSessions {
        sessions: Vec<LiveSession>,
    },
    ResetUser {
        user_id: UserId,
    },
}

/// A command for the host to carry out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HostCommand {
    Stop {
        session_id: SessionId,
        reason: String,
    },
    Notify {
        session_id: SessionId,
        header: String,
        text: String,
    },
    SetAccess {
        user_id: UserId,
        enabled: bool,
    },
}

/// The most recent session list the host reported, until a pass takes it.
#[derive(Debug, Default)]
pub struct SnapshotDirectory {
    pending: Mutex<Option<LiveSnapshot>>,
    exempt: HashSet<UserId>,
}

impl SnapshotDirectory {
    pub fn new(exempt: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            pending: Mutex::new(None),
            exempt: exempt.into_iter().collect(),
        }
    }

    /// Stores the host's list as of `received_at`, replacing any unused one.
    pub fn replace(&self, sessions: Vec<LiveSession>, received_at: DateTime<Utc>) {
        *self.pending.lock() = Some(LiveSnapshot::new(received_at, sessions));
    }
}

impl SessionDirectory for SnapshotDirectory {
    fn live_sessions(&self) -> Option<LiveSnapshot> {
        self.pending.lock().take()
    }

    fn is_exempt(&self, user: &UserId) -> bool {
        self.exempt.contains(user)
    }
}

/// Writes commands as JSON lines.
#[derive(Debug)]
pub struct JsonLineCommands<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLineCommands<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn send(&self, command: &HostCommand) -> Result<(), CommandError> {
        let line = serde_json::to_string(command).map_err(|e| CommandError::Rejected(e.to_string()))?;
        let mut out = self.out.lock();
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> SessionCommands for JsonLineCommands<W> {
    fn stop_playback(&self, session: &SessionId, reason: &str) -> Result<(), CommandError> {
        self.send(&HostCommand::Stop {
            session_id: session.clone(),
            reason: reason.to_string(),
        })
    }

    fn notify(&self, session: &SessionId, header: &str, text: &str) -> Result<(), CommandError> {
        self.send(&HostCommand::Notify {
            session_id: session.clone(),
            header: header.to_string(),
            text: text.to_string(),
        })
    }

    fn set_access(&self, user: &UserId, enabled: bool) -> Result<(), CommandError> {
        self.send(&HostCommand::SetAccess {
            user_id: user.clone(),
            enabled,
        })
    }
}
