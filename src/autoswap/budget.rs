//! Rolling fee budget accounting.

use chrono::{DateTime, Duration, Utc};

use crate::database::{Database, DatabaseError};

/// The autoswapper's fee allowance over the current window.
#[derive(Debug, Clone, PartialEq)]
pub struct Budget {
    /// When the window opened.
    pub start_date: DateTime<Utc>,
    /// When the window rolls over.
    pub end_date: DateTime<Utc>,
    /// Allowance in sat.
    pub total: u64,
    /// What is left of the allowance.
    pub remaining: u64,
}

impl Budget {
    /// Compute the current budget window.
    ///
    /// The window is anchored at the earliest autoswap recorded within the
    /// last `interval_secs`; with no spending on record it starts at `now`
    /// with the full allowance.
    pub fn current(
        database: &Database,
        total: u64,
        interval_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Budget, DatabaseError> {
        let interval = Duration::seconds(interval_secs as i64);
        let window_floor = now - interval;

        let start_date = database
            .first_auto_swap_since(window_floor)?
            .unwrap_or(now);
        let end_date = start_date + interval;

        let spent: u64 = database
            .query_auto_swaps_since(start_date)?
            .iter()
            .map(|entry| entry.fee_estimate)
            .sum();

        Ok(Budget {
            start_date,
            end_date,
            total,
            remaining: total.saturating_sub(spent),
        })
    }
}
