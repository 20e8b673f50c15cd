use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::config::AllowanceConfig;

/// Per-owner bookkeeping for periodic top-ups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowanceState {
    pub last_grant_day: Option<NaiveDate>,
    /// `(year, month)` that `granted_this_month` counts toward.
    pub month: Option<(i32, u32)>,
    pub granted_this_month: i64,
}

/// Daily top-up bounded by an optional monthly cap.
///
/// On the first check of a new day the balance is raised to the daily
/// allowance, never lowered. The credited amount counts toward the month's
/// cap, which resets when the calendar month changes.
#[derive(Debug, Clone)]
pub struct AllowancePolicy {
    daily: i64,
    monthly_cap: Option<i64>,
}

impl AllowancePolicy {
    pub fn new(config: &AllowanceConfig) -> Self {
        Self {
            daily: config.daily_allowance.max(0),
            monthly_cap: config.monthly_cap.map(|c| c.max(0)),
        }
    }

    pub fn disabled() -> Self {
        Self {
            daily: 0,
            monthly_cap: None,
        }
    }

    /// Credits to grant for `today` given the current balance. Updates
    /// `state` so a second check on the same day grants nothing.
    pub fn top_up(&self, state: &mut AllowanceState, balance: i64, today: NaiveDate) -> i64 {
        if state.last_grant_day == Some(today) {
            return 0;
        }
        state.last_grant_day = Some(today);

        let month = (today.year(), today.month());
        if state.month != Some(month) {
            state.month = Some(month);
            state.granted_this_month = 0;
        }

        let mut grant = (self.daily - balance).max(0);
        if let Some(cap) = self.monthly_cap {
            grant = grant.min((cap - state.granted_this_month).max(0));
        }
        state.granted_this_month += grant;
        grant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn policy(daily: i64, cap: Option<i64>) -> AllowancePolicy {
        AllowancePolicy::new(&AllowanceConfig {
            initial_balance: 0,
            daily_allowance: daily,
            monthly_cap: cap,
        })
    }

    #[test]
    fn tops_up_once_per_day() {
        let p = policy(50, None);
        let mut state = AllowanceState::default();
        assert_eq!(p.top_up(&mut state, 10, day(2026, 3, 1)), 40);
        assert_eq!(p.top_up(&mut state, 0, day(2026, 3, 1)), 0);
        assert_eq!(p.top_up(&mut state, 0, day(2026, 3, 2)), 50);
    }

    #[test]
    fn never_lowers_balance() {
        let p = policy(50, None);
        let mut state = AllowanceState::default();
        assert_eq!(p.top_up(&mut state, 120, day(2026, 3, 1)), 0);
    }

    #[test]
    fn monthly_cap_limits_grants() {
        let p = policy(50, Some(70));
        let mut state = AllowanceState::default();
        assert_eq!(p.top_up(&mut state, 0, day(2026, 3, 1)), 50);
        assert_eq!(p.top_up(&mut state, 0, day(2026, 3, 2)), 20);
        assert_eq!(p.top_up(&mut state, 0, day(2026, 3, 3)), 0);
        // new month resets the cap
        assert_eq!(p.top_up(&mut state, 0, day(2026, 4, 1)), 50);
    }

    #[test]
    fn disabled_grants_nothing() {
        let mut state = AllowanceState::default();
        assert_eq!(AllowancePolicy::disabled().top_up(&mut state, -5, day(2026, 3, 1)), 0);
    }
}
