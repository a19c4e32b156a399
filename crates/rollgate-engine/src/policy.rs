//! Rollout admission control.
//!
//! Answers "may this instance receive the group's target version now?"
//! from the group's [`RolloutPolicy`] and the group's [`UpdatesStats`].
//! The limit arithmetic is a pure function ([`check_limits`]) so every
//! throttle can be exercised without a store.

use chrono::{DateTime, Datelike, Timelike, Weekday};
use chrono_tz::Tz;
use tracing::{debug, warn};

use rollgate_state::{Group, RolloutPolicy, UpdateStore, UpdatesStats, UpdatesStatsQuery};

use crate::config::UNLIMITED_UPDATES_PER_PERIOD;
use crate::error::{Denial, EngineError, EngineResult};

/// First local hour of the office-hours window.
pub const OFFICE_OPEN_HOUR: u32 = 9;

/// Local hour at which the office-hours window closes.
pub const OFFICE_CLOSE_HOUR: u32 = 17;

/// Parse an IANA timezone name; `None` means UTC.
pub fn parse_timezone(name: Option<&str>) -> EngineResult<Tz> {
    match name {
        None => Ok(Tz::UTC),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| EngineError::InvalidTimezone(name.to_string())),
    }
}

/// Whether `now` falls on a weekday between 09:00 and 17:00 local time.
pub fn within_office_hours(timezone: Option<&str>, now: u64) -> EngineResult<bool> {
    let tz = parse_timezone(timezone)?;
    let Some(utc) = i64::try_from(now)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
    else {
        return Ok(false);
    };
    let local = utc.with_timezone(&tz);
    let weekend = matches!(local.weekday(), Weekday::Sat | Weekday::Sun);
    Ok(!weekend && (OFFICE_OPEN_HOUR..OFFICE_CLOSE_HOUR).contains(&local.hour()))
}

/// Whether the policy needs fleet counters at all.
pub fn needs_stats(policy: &RolloutPolicy) -> bool {
    policy.safe_mode || policy.max_updates_per_period < UNLIMITED_UPDATES_PER_PERIOD
}

/// Apply the period, concurrency and timeout limits.
///
/// In safe mode the limit drops to one until some instance has finished
/// an attempt at the target version.
pub fn check_limits(policy: &RolloutPolicy, stats: &UpdatesStats) -> Result<(), Denial> {
    let mut effective_max = u64::from(policy.max_updates_per_period);
    if policy.safe_mode && stats.updates_to_current_version_attempted == 0 {
        effective_max = 1;
    }

    if stats.updates_granted_in_last_period >= effective_max {
        return Err(Denial::MaxUpdatesPerPeriodLimitReached);
    }
    if stats.updates_in_progress >= effective_max {
        return Err(Denial::MaxConcurrentUpdatesLimitReached);
    }
    if policy.safe_mode && stats.updates_timed_out >= effective_max {
        return Err(Denial::MaxTimedOutUpdatesLimitReached);
    }
    Ok(())
}

/// Decide whether `group` may grant `target_version` at `now`.
///
/// Hitting the timeout limit in safe mode also switches the group's
/// updates off; an operator has to re-enable them.
pub async fn enforce_rollout_policy(
    store: &dyn UpdateStore,
    group: &Group,
    target_version: &str,
    now: u64,
) -> EngineResult<()> {
    let policy = &group.policy;
    if !policy.updates_enabled {
        return Err(Denial::UpdatesDisabled.into());
    }
    if policy.office_hours && !within_office_hours(policy.timezone.as_deref(), now)? {
        debug!(group = %group.id, "outside office hours");
        return Err(Denial::UpdatesDisabled.into());
    }
    if !needs_stats(policy) {
        return Ok(());
    }

    let stats = store
        .group_updates_stats(&UpdatesStatsQuery {
            group_id: group.id.clone(),
            version: target_version.to_string(),
            period_interval_secs: policy.period_interval_secs,
            update_timeout_secs: policy.update_timeout_secs,
            now,
        })
        .await?;

    match check_limits(policy, &stats) {
        Ok(()) => Ok(()),
        Err(Denial::MaxTimedOutUpdatesLimitReached) => {
            store.disable_group_updates(&group.id).await?;
            warn!(
                group = %group.id,
                version = target_version,
                timed_out = stats.updates_timed_out,
                "too many timed out updates, group updates disabled"
            );
            Err(Denial::MaxTimedOutUpdatesLimitReached.into())
        }
        Err(denial) => {
            debug!(group = %group.id, ?stats, %denial, "rollout throttled");
            Err(denial.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_state::*;

    fn policy(max: u32, safe_mode: bool) -> RolloutPolicy {
        RolloutPolicy {
            max_updates_per_period: max,
            safe_mode,
            ..RolloutPolicy::default()
        }
    }

    // 2024-01-03 is a Wednesday.
    const WED_NOON_UTC: u64 = 1_704_283_200;
    const SAT_NOON_UTC: u64 = 1_704_542_400;

    #[test]
    fn period_quota_applies_first() {
        let stats = UpdatesStats {
            updates_granted_in_last_period: 2,
            updates_in_progress: 5,
            updates_to_current_version_attempted: 1,
            ..Default::default()
        };
        assert_eq!(
            check_limits(&policy(2, false), &stats),
            Err(Denial::MaxUpdatesPerPeriodLimitReached)
        );
    }

    #[test]
    fn concurrency_cap() {
        let stats = UpdatesStats {
            updates_granted_in_last_period: 0,
            updates_in_progress: 3,
            ..Default::default()
        };
        assert_eq!(
            check_limits(&policy(3, false), &stats),
            Err(Denial::MaxConcurrentUpdatesLimitReached)
        );
        assert_eq!(check_limits(&policy(4, false), &stats), Ok(()));
    }

    #[test]
    fn safe_mode_canaries_one_instance() {
        let one_granted = UpdatesStats {
            updates_granted_in_last_period: 1,
            updates_in_progress: 1,
            ..Default::default()
        };
        assert_eq!(
            check_limits(&policy(10, true), &one_granted),
            Err(Denial::MaxUpdatesPerPeriodLimitReached)
        );

        let canary_done = UpdatesStats {
            updates_granted_in_last_period: 1,
            updates_to_current_version_attempted: 1,
            ..Default::default()
        };
        assert_eq!(check_limits(&policy(10, true), &canary_done), Ok(()));
    }

    #[test]
    fn timeouts_only_count_in_safe_mode() {
        let stats = UpdatesStats {
            updates_timed_out: 2,
            updates_to_current_version_attempted: 1,
            ..Default::default()
        };
        assert_eq!(check_limits(&policy(2, false), &stats), Ok(()));
        assert_eq!(
            check_limits(&policy(2, true), &stats),
            Err(Denial::MaxTimedOutUpdatesLimitReached)
        );
    }

    #[test]
    fn unlimited_without_safe_mode_skips_stats() {
        assert!(!needs_stats(&policy(UNLIMITED_UPDATES_PER_PERIOD, false)));
        assert!(needs_stats(&policy(UNLIMITED_UPDATES_PER_PERIOD, true)));
        assert!(needs_stats(&policy(5, false)));
    }

    #[test]
    fn office_hours_window() {
        assert!(within_office_hours(None, WED_NOON_UTC).unwrap());
        assert!(!within_office_hours(None, SAT_NOON_UTC).unwrap());
        // 12:00 UTC is 21:00 in Tokyo.
        assert!(!within_office_hours(Some("Asia/Tokyo"), WED_NOON_UTC).unwrap());
        // and 07:00 in New York.
        assert!(!within_office_hours(Some("America/New_York"), WED_NOON_UTC).unwrap());
        assert!(within_office_hours(Some("Europe/Berlin"), WED_NOON_UTC).unwrap());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let err = within_office_hours(Some("Mars/Olympus"), WED_NOON_UTC).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTimezone(_)));
    }

    fn group(policy: RolloutPolicy) -> Group {
        Group {
            id: "g1".to_string(),
            name: "default".to_string(),
            description: String::new(),
            application_id: "app-1".to_string(),
            channel_id: None,
            policy,
            rollout_in_progress: false,
            track: "g1".to_string(),
            created_at: 1,
        }
    }

    #[tokio::test]
    async fn disabled_group_is_denied() {
        let store = StateStore::open_in_memory().unwrap();
        let g = group(RolloutPolicy {
            updates_enabled: false,
            ..RolloutPolicy::default()
        });
        let err = enforce_rollout_policy(&store, &g, "2.0.0", WED_NOON_UTC)
            .await
            .unwrap_err();
        assert_eq!(err.denial(), Some(Denial::UpdatesDisabled));
    }

    #[tokio::test]
    async fn office_hours_gate_denies_on_weekend() {
        let store = StateStore::open_in_memory().unwrap();
        let g = group(RolloutPolicy {
            office_hours: true,
            ..RolloutPolicy::default()
        });
        let err = enforce_rollout_policy(&store, &g, "2.0.0", SAT_NOON_UTC)
            .await
            .unwrap_err();
        assert_eq!(err.denial(), Some(Denial::UpdatesDisabled));
    }

    #[tokio::test]
    async fn timed_out_updates_disable_the_group() {
        let store = StateStore::open_in_memory().unwrap();
        let g = group(RolloutPolicy {
            safe_mode: true,
            update_timeout_secs: 60,
            ..RolloutPolicy::default()
        });
        store.put_group(&g).unwrap();
        let mut stuck = InstanceApplication::first_seen("inst-1", "app-1", "g1", "1.0.0", 0);
        stuck.status = InstanceStatus::Downloading;
        stuck.update_in_progress = true;
        stuck.last_update_granted_at = Some(10);
        stuck.last_update_version = Some("2.0.0".to_string());
        store.upsert_instance(None, Some(&stuck)).unwrap();

        let err = enforce_rollout_policy(&store, &g, "2.0.0", 10_000)
            .await
            .unwrap_err();
        assert_eq!(err.denial(), Some(Denial::MaxTimedOutUpdatesLimitReached));
        assert!(!store.get_group("g1").unwrap().unwrap().policy.updates_enabled);
    }
}
