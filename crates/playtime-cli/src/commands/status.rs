//! Status command for showing today's playtime per user.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use playtime_core::{DailyLedger, UserId};
use playtime_ledger::day_key;
use serde::Serialize;

use super::util::format_duration;
use crate::Config;

/// One user's standing for the day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserStatus {
    pub user_id: UserId,
    pub used_seconds: u64,
    /// `None` when the user is unlimited.
    pub limit_seconds: Option<u64>,
    pub remaining_seconds: Option<u64>,
}

/// Builds the status rows for every user in the ledger.
pub fn collect(ledger: &DailyLedger, config: &Config, today: NaiveDate) -> Vec<UserStatus> {
    let limits = config.limits();
    ledger
        .users()
        .filter(|user| !config.exempt_users.contains(user))
        .map(|user| {
            let used_seconds = ledger.completed_seconds(user, today);
            let limit_seconds = limits.limit_for(user);
            UserStatus {
                user_id: user.clone(),
                used_seconds,
                limit_seconds,
                remaining_seconds: limit_seconds.map(|limit| limit.saturating_sub(used_seconds)),
            }
        })
        .collect()
}

pub fn run<W: Write>(writer: &mut W, config: &Config, today: NaiveDate, json: bool) -> Result<()> {
    let ledger = DailyLedger::read(&config.ledger_path)
        .with_context(|| format!("failed to read {}", config.ledger_path.display()))?;
    let rows = collect(&ledger, config, today);

    if json {
        serde_json::to_writer_pretty(&mut *writer, &rows)?;
        writeln!(writer)?;
        return Ok(());
    }

    writeln!(writer, "Playtime for {}", day_key(today))?;
    writeln!(writer, "Ledger: {}", config.ledger_path.display())?;

    if rows.is_empty() {
        writeln!(writer, "No playtime recorded.")?;
        return Ok(());
    }

    for row in rows {
        let used = format_duration(row.used_seconds);
        match (row.limit_seconds, row.remaining_seconds) {
            (Some(limit), Some(remaining)) => writeln!(
                writer,
                "- {}: {used} of {} used, {} left",
                row.user_id,
                format_duration(limit),
                format_duration(remaining)
            )?,
            _ => writeln!(writer, "- {}: {used} used, unlimited", row.user_id)?,
        }
    }

    Ok(())
}
