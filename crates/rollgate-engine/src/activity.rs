//! Activity log and group rollout bookkeeping.

use tracing::{debug, info};

use rollgate_state::{
    ActivityClass, ActivityEntry, ActivitySeverity, Group, UpdateStore, UpdatesStatsQuery,
};

use crate::error::EngineResult;

/// Writes operator-facing activity entries.
pub struct ActivityLog<'a> {
    store: &'a dyn UpdateStore,
    dedupe_window_secs: u64,
}

impl<'a> ActivityLog<'a> {
    pub fn new(store: &'a dyn UpdateStore, dedupe_window_secs: u64) -> Self {
        Self {
            store,
            dedupe_window_secs,
        }
    }

    pub async fn record(&self, entry: &ActivityEntry) -> EngineResult<()> {
        self.store.insert_activity(entry).await?;
        Ok(())
    }

    /// Record `entry` unless the same milestone was logged within the
    /// dedupe window. Returns whether it was written.
    pub async fn record_once(&self, entry: &ActivityEntry) -> EngineResult<bool> {
        let since = entry.created_at.saturating_sub(self.dedupe_window_secs);
        if self.store.activity_exists_since(entry, since).await? {
            debug!(class = ?entry.class, version = %entry.version, "activity already recorded");
            return Ok(false);
        }
        self.store.insert_activity(entry).await?;
        Ok(true)
    }

    pub async fn package_not_found(&self, group: &Group, now: u64) -> EngineResult<()> {
        let mut entry = group_entry(
            group,
            ActivityClass::PackageNotFound,
            ActivitySeverity::Warning,
            "",
            now,
        );
        entry.channel_id = group.channel_id.clone();
        self.record_once(&entry).await?;
        Ok(())
    }

    /// Note a grant of `version`: log the rollout start once and raise the
    /// group's rollout flag.
    pub async fn rollout_started(&self, group: &Group, version: &str, now: u64) -> EngineResult<()> {
        let entry = group_entry(
            group,
            ActivityClass::RolloutStarted,
            ActivitySeverity::Info,
            version,
            now,
        );
        self.record_once(&entry).await?;
        if !group.rollout_in_progress {
            self.store.set_group_rollout_in_progress(&group.id, true).await?;
            info!(group = %group.id, version, "rollout started");
        }
        Ok(())
    }

    pub async fn rollout_failed(&self, group: &Group, version: &str, now: u64) -> EngineResult<()> {
        let entry = group_entry(
            group,
            ActivityClass::RolloutFailed,
            ActivitySeverity::Error,
            version,
            now,
        );
        self.record(&entry).await
    }

    pub async fn instance_update_failed(
        &self,
        group: &Group,
        instance_id: &str,
        version: &str,
        now: u64,
    ) -> EngineResult<()> {
        let mut entry = group_entry(
            group,
            ActivityClass::InstanceUpdateFailed,
            ActivitySeverity::Error,
            version,
            now,
        );
        entry.instance_id = Some(instance_id.to_string());
        self.record(&entry).await
    }

    /// Close the group's rollout once nothing is left in flight at `version`
    /// and at least one instance got there. Returns whether it closed.
    pub async fn settle_rollout(&self, group: &Group, version: &str, now: u64) -> EngineResult<bool> {
        if !group.rollout_in_progress {
            return Ok(false);
        }
        let stats = self
            .store
            .group_updates_stats(&UpdatesStatsQuery {
                group_id: group.id.clone(),
                version: version.to_string(),
                period_interval_secs: group.policy.period_interval_secs,
                update_timeout_secs: group.policy.update_timeout_secs,
                now,
            })
            .await?;
        let pending = stats
            .updates_to_current_version_granted
            .saturating_sub(stats.updates_to_current_version_attempted);
        if pending > 0 || stats.updates_to_current_version_succeeded == 0 {
            debug!(group = %group.id, version, pending, "rollout still running");
            return Ok(false);
        }

        self.store.set_group_rollout_in_progress(&group.id, false).await?;
        let entry = group_entry(
            group,
            ActivityClass::RolloutFinished,
            ActivitySeverity::Success,
            version,
            now,
        );
        self.record(&entry).await?;
        info!(
            group = %group.id,
            version,
            succeeded = stats.updates_to_current_version_succeeded,
            failed = stats.updates_to_current_version_failed,
            "rollout finished"
        );
        Ok(true)
    }

    /// The target package of a channel changed.
    pub async fn channel_package_updated(
        &self,
        app_id: &str,
        channel_id: &str,
        version: &str,
        now: u64,
    ) -> EngineResult<()> {
        self.record(&ActivityEntry {
            application_id: app_id.to_string(),
            group_id: None,
            channel_id: Some(channel_id.to_string()),
            instance_id: None,
            class: ActivityClass::ChannelPackageUpdated,
            severity: ActivitySeverity::Info,
            version: version.to_string(),
            created_at: now,
        })
        .await
    }
}

fn group_entry(
    group: &Group,
    class: ActivityClass,
    severity: ActivitySeverity,
    version: &str,
    now: u64,
) -> ActivityEntry {
    ActivityEntry {
        application_id: group.application_id.clone(),
        group_id: Some(group.id.clone()),
        channel_id: None,
        instance_id: None,
        class,
        severity,
        version: version.to_string(),
        created_at: now,
    }
}
