//! Dashboard statistics for groups.
//!
//! Windows are a closed set; each one fixes its bucket width:
//!
//! | window | span    | bucket  |
//! |--------|---------|---------|
//! | `1h`   | 1 hour  | 10 min  |
//! | `1d`   | 1 day   | 1 hour  |
//! | `7d`   | 7 days  | 1 day   |
//! | `30d`  | 30 days | 1 day   |

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};

use rollgate_state::{
    InstancesStatusStats, StatusCountTimeline, UpdatesStats, UpdatesStatsQuery,
    VersionBreakdownEntry, VersionCountTimeline,
};

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Span of a dashboard query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatsWindow {
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "1d")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl StatsWindow {
    pub const ALL: [StatsWindow; 4] = [
        StatsWindow::Hour,
        StatsWindow::Day,
        StatsWindow::Week,
        StatsWindow::Month,
    ];

    pub fn span_secs(&self) -> u64 {
        match self {
            StatsWindow::Hour => HOUR,
            StatsWindow::Day => DAY,
            StatsWindow::Week => 7 * DAY,
            StatsWindow::Month => 30 * DAY,
        }
    }

    pub fn bucket_secs(&self) -> u64 {
        match self {
            StatsWindow::Hour => 10 * MINUTE,
            StatsWindow::Day => HOUR,
            StatsWindow::Week | StatsWindow::Month => DAY,
        }
    }

    /// `[since, until)` ending at `now`, with `since` on a bucket boundary.
    pub fn range(&self, now: u64) -> (u64, u64) {
        let bucket = self.bucket_secs();
        let since = now.saturating_sub(self.span_secs()) / bucket * bucket;
        (since, now)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatsWindow::Hour => "1h",
            StatsWindow::Day => "1d",
            StatsWindow::Week => "7d",
            StatsWindow::Month => "30d",
        }
    }
}

impl fmt::Display for StatsWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatsWindow {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|w| w.as_str() == s.trim())
            .ok_or_else(|| EngineError::InvalidStatsWindow(s.to_string()))
    }
}

/// RFC 3339 label for a bucket start.
pub fn bucket_label(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| ts.to_string())
}

impl Engine {
    /// Instance counts per status among instances seen within `window`.
    pub async fn group_instances_stats(
        &self,
        group_id: &str,
        window: StatsWindow,
    ) -> EngineResult<InstancesStatusStats> {
        self.require_group(group_id).await?;
        let (since, _) = window.range(self.now());
        Ok(self.store().group_instances_stats(group_id, since).await?)
    }

    /// Versions currently run by the group's instances.
    pub async fn group_version_breakdown(
        &self,
        group_id: &str,
    ) -> EngineResult<Vec<VersionBreakdownEntry>> {
        self.require_group(group_id).await?;
        Ok(self.store().group_version_breakdown(group_id, 0).await?)
    }

    pub async fn group_version_count_timeline(
        &self,
        group_id: &str,
        window: StatsWindow,
    ) -> EngineResult<VersionCountTimeline> {
        self.require_group(group_id).await?;
        let (since, until) = window.range(self.now());
        Ok(self
            .store()
            .group_version_count_timeline(group_id, since, until, window.bucket_secs())
            .await?)
    }

    pub async fn group_status_count_timeline(
        &self,
        group_id: &str,
        window: StatsWindow,
    ) -> EngineResult<StatusCountTimeline> {
        self.require_group(group_id).await?;
        let (since, until) = window.range(self.now());
        Ok(self
            .store()
            .group_status_count_timeline(group_id, since, until, window.bucket_secs())
            .await?)
    }

    /// Rollout counters of the group against its channel's current target.
    ///
    /// `None` when the group has no channel target.
    pub async fn group_updates_stats(&self, group_id: &str) -> EngineResult<Option<UpdatesStats>> {
        let group = self.require_group(group_id).await?;
        let Some((_, target)) = self.group_target(&group).await? else {
            return Ok(None);
        };
        let stats = self
            .store()
            .group_updates_stats(&UpdatesStatsQuery {
                group_id: group.id.clone(),
                version: target.version,
                period_interval_secs: group.policy.period_interval_secs,
                update_timeout_secs: group.policy.update_timeout_secs,
                now: self.now(),
            })
            .await?;
        Ok(Some(stats))
    }
}
