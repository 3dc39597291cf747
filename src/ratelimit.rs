use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::{net::IpAddr, num::NonZeroU32, time::Duration};

use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};

use crate::{
    error::{Error, ErrorKind},
    CONFIG,
};

type Limiter<T = IpAddr> = RateLimiter<T, DashMapStateStore<T>, DefaultClock>;

static LIMITER_SEND_CODE: Lazy<Limiter> = Lazy::new(|| {
    let seconds = Duration::from_secs(CONFIG.ip_ratelimit_seconds());
    let burst = NonZeroU32::new(CONFIG.ip_ratelimit_max_burst()).expect("Non-zero ip ratelimit burst");
    RateLimiter::keyed(Quota::with_period(seconds).expect("Non-zero ip ratelimit seconds").allow_burst(burst))
});

/// Per-source-IP limit on verification-code issuance.
pub fn check_limit_send_code_ip(ip: &IpAddr) -> Result<(), Error> {
    match LIMITER_SEND_CODE.check_key(ip) {
        Ok(_) => Ok(()),
        Err(_) => Err(Error::new(ErrorKind::RateLimited, "Too many requests from this address")
            .with_retry_after(CONFIG.ip_ratelimit_seconds())),
    }
}

/// Fixed-window state per phone number or email address.
struct TargetWindow {
    last_issue: i64,
    day: NaiveDate,
    count: u32,
}

static TARGET_WINDOWS: Lazy<DashMap<String, TargetWindow>> = Lazy::new(DashMap::new);

/// Cooldown and daily-quota check for one delivery target. The check and the
/// recording of an acceptance happen under the entry lock of the map shard,
/// so two simultaneous issuers for the same target serialize and at most one
/// is accepted inside the cooldown.
pub fn check_and_record_target(target: &str) -> Result<(), Error> {
    let now = Utc::now();
    let mut entry = TARGET_WINDOWS.entry(target.to_string()).or_insert(TargetWindow {
        last_issue: 0,
        day: now.date_naive(),
        count: 0,
    });

    check_window(&mut entry, now.timestamp(), now.date_naive(), CONFIG.code_cooldown(), CONFIG.code_daily_limit())
}

fn check_window(
    state: &mut TargetWindow,
    now_ts: i64,
    today: NaiveDate,
    cooldown: u64,
    daily_limit: u32,
) -> Result<(), Error> {
    // Quota resets at UTC midnight
    if state.day != today {
        state.day = today;
        state.count = 0;
    }

    let elapsed = now_ts - state.last_issue;
    if state.last_issue != 0 && elapsed < cooldown as i64 {
        let remaining = cooldown as i64 - elapsed;
        return Err(Error::new(ErrorKind::RateLimited, "A code was sent recently, please wait before retrying")
            .with_retry_after(remaining.max(1) as u64));
    }

    if state.count >= daily_limit {
        let midnight = today.succ_opt().and_then(|d| d.and_hms_opt(0, 0, 0)).map(|d| d.and_utc().timestamp());
        let until_reset = midnight.map(|m| (m - now_ts).max(1) as u64).unwrap_or(3600);
        return Err(Error::new(ErrorKind::DailyLimitExceeded, "Daily code limit reached for this address")
            .with_retry_after(until_reset));
    }

    state.last_issue = now_ts;
    state.count += 1;
    Ok(())
}

/// Drops window entries whose day is over, called by the nightly sweep.
pub fn purge_stale_windows() {
    let today = Utc::now().date_naive();
    TARGET_WINDOWS.retain(|_, w| w.day == today);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(day: NaiveDate) -> TargetWindow {
        TargetWindow {
            last_issue: 0,
            day,
            count: 0,
        }
    }

    #[test]
    fn first_issue_is_accepted_and_recorded() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let mut w = fresh(day);

        assert!(check_window(&mut w, 1000, day, 60, 10).is_ok());
        assert_eq!(w.count, 1);
        assert_eq!(w.last_issue, 1000);
    }

    #[test]
    fn cooldown_blocks_until_elapsed() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let mut w = fresh(day);

        assert!(check_window(&mut w, 1000, day, 60, 10).is_ok());

        let err = check_window(&mut w, 1030, day, 60, 10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);

        assert!(check_window(&mut w, 1060, day, 60, 10).is_ok());
        assert_eq!(w.count, 2);
    }

    #[test]
    fn rejected_attempt_does_not_consume_quota() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let mut w = fresh(day);

        assert!(check_window(&mut w, 1000, day, 60, 10).is_ok());
        let _ = check_window(&mut w, 1001, day, 60, 10);
        assert_eq!(w.count, 1);
    }

    #[test]
    fn daily_quota_is_enforced_and_resets_at_midnight() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let mut w = fresh(day);

        let mut ts = 1_000_000;
        for _ in 0..3 {
            assert!(check_window(&mut w, ts, day, 60, 3).is_ok());
            ts += 120;
        }

        let err = check_window(&mut w, ts, day, 60, 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DailyLimitExceeded);

        // Next UTC day, quota is back
        let next_day = day.succ_opt().unwrap();
        assert!(check_window(&mut w, ts + 86_400, next_day, 60, 3).is_ok());
        assert_eq!(w.count, 1);
    }
}
