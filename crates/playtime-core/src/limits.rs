//! Daily limit resolution.
//!
//! A user's limit is the global default unless an override says otherwise.
//! Override values follow the host's configuration page conventions:
//! `-1` defers to the default, `0` is unlimited, anything positive is the
//! user's own limit in minutes.

use serde::{Deserialize, Serialize};

use crate::UserId;

/// Override value meaning "use the global default".
pub const USE_DEFAULT: i64 = -1;

/// A per-user limit override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverride {
    pub user_id: UserId,
    pub minutes: i64,
}

/// Resolves the effective daily limit for `user`, in seconds.
///
/// A result `<= 0` means unlimited. A missing default is unlimited.
pub fn resolve_limit_seconds(
    user: &UserId,
    default_minutes: Option<i64>,
    overrides: &[LimitOverride],
) -> i64 {
    let default_minutes = default_minutes.unwrap_or(0);
    let minutes = overrides
        .iter()
        .find(|o| &o.user_id == user)
        .map_or(default_minutes, |o| {
            if o.minutes == USE_DEFAULT {
                default_minutes
            } else {
                o.minutes
            }
        });
    minutes.saturating_mul(60)
}

/// The limit configuration a tracker enforces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Global default in minutes; `None` or `<= 0` is unlimited.
    pub default_minutes: Option<i64>,
    #[serde(default)]
    pub overrides: Vec<LimitOverride>,
}

impl LimitSettings {
    /// The limit for `user` in seconds, or `None` when unlimited.
    pub fn limit_for(&self, user: &UserId) -> Option<u64> {
        let seconds = resolve_limit_seconds(user, self.default_minutes, &self.overrides);
        u64::try_from(seconds).ok().filter(|s| *s > 0)
    }
}
