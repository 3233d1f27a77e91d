//! Reset command for clearing a user's playtime for today.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use playtime_core::{DailyLedger, UserId};
use playtime_ledger::day_key;

use super::util::{format_duration, lock_ledger};
use crate::Config;

/// Deletes today's bucket for `user` and saves the ledger.
///
/// Refuses to touch a ledger that cannot be parsed, so a corrupt file is
/// never replaced by an empty one.
pub fn run<W: Write>(writer: &mut W, config: &Config, user: &UserId, today: NaiveDate) -> Result<()> {
    let _lock = lock_ledger(&config.ledger_path)?;

    let mut ledger = DailyLedger::read(&config.ledger_path)
        .with_context(|| format!("failed to read {}", config.ledger_path.display()))?;
    let removed = ledger.reset_day(user, today);
    ledger
        .save(&config.ledger_path)
        .context("failed to save ledger")?;

    tracing::info!(%user, removed, "reset today's playtime");
    writeln!(
        writer,
        "Cleared {} of playtime for {user} on {}",
        format_duration(removed),
        day_key(today)
    )?;
    Ok(())
}
