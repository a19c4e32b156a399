//! The persistence contract the rollout engine is written against.
//!
//! `UpdateStore` names every operation the engine needs: point lookups and
//! upserts, an ordered and limited floor listing, atomic status changes and
//! grants, activity deduplication probes, and windowed aggregates. The
//! engine never sees how these are computed. `StateStore` (redb) is the
//! bundled implementation.

use async_trait::async_trait;

use crate::error::StateResult;
use crate::store::{FloorRange, StateStore};
use crate::types::*;

#[async_trait]
pub trait UpdateStore: Send + Sync {
    // ── Catalog ────────────────────────────────────────────────────

    async fn put_team(&self, team: &Team) -> StateResult<()>;

    async fn get_team(&self, id: &str) -> StateResult<Option<Team>>;

    async fn put_application(&self, app: &Application) -> StateResult<()>;

    async fn get_application(&self, id: &str) -> StateResult<Option<Application>>;

    async fn list_applications(&self) -> StateResult<Vec<Application>>;

    async fn delete_application(&self, id: &str) -> StateResult<bool>;

    async fn put_channel(&self, channel: &Channel) -> StateResult<()>;

    async fn get_channel(&self, id: &str) -> StateResult<Option<Channel>>;

    async fn list_channels(&self, app_id: &str) -> StateResult<Vec<Channel>>;

    async fn delete_channel(&self, id: &str) -> StateResult<bool>;

    async fn put_package(&self, package: &Package) -> StateResult<()>;

    async fn get_package(&self, id: &str) -> StateResult<Option<Package>>;

    async fn list_packages(&self, app_id: &str) -> StateResult<Vec<Package>>;

    async fn delete_package(&self, id: &str) -> StateResult<bool>;

    // ── Floors ─────────────────────────────────────────────────────

    async fn put_floor(&self, floor: &ChannelPackageFloor) -> StateResult<()>;

    async fn get_floor(
        &self,
        channel_id: &str,
        package_id: &str,
    ) -> StateResult<Option<ChannelPackageFloor>>;

    async fn delete_floor(&self, channel_id: &str, package_id: &str) -> StateResult<bool>;

    async fn list_floors_for_package(&self, package_id: &str)
    -> StateResult<Vec<ChannelPackageFloor>>;

    async fn list_all_channel_floors(&self, channel_id: &str) -> StateResult<Vec<FloorPackage>>;

    /// Floors of `channel_id` inside `range`, ascending by version, at most
    /// `range.limit` rows.
    async fn list_channel_floors(
        &self,
        channel_id: &str,
        range: &FloorRange,
    ) -> StateResult<Vec<FloorPackage>>;

    // ── Groups ─────────────────────────────────────────────────────

    async fn put_group(&self, group: &Group) -> StateResult<()>;

    async fn get_group(&self, id: &str) -> StateResult<Option<Group>>;

    async fn list_groups(&self, app_id: Option<&str>) -> StateResult<Vec<Group>>;

    async fn delete_group(&self, id: &str) -> StateResult<bool>;

    async fn set_group_rollout_in_progress(&self, id: &str, in_progress: bool) -> StateResult<()>;

    async fn disable_group_updates(&self, id: &str) -> StateResult<()>;

    // ── Instances ──────────────────────────────────────────────────

    async fn get_instance(&self, id: &str) -> StateResult<Option<Instance>>;

    async fn get_instance_application(
        &self,
        instance_id: &str,
        app_id: &str,
    ) -> StateResult<Option<InstanceApplication>>;

    /// Write whichever rows are given; both in one transaction.
    async fn upsert_instance(
        &self,
        instance: Option<&Instance>,
        application: Option<&InstanceApplication>,
    ) -> StateResult<()>;

    /// Apply a check-in to the instance-application row in one
    /// transaction, writing `instance` alongside when given.
    async fn record_check_in(
        &self,
        instance: Option<&Instance>,
        check_in: &CheckIn,
    ) -> StateResult<InstanceApplication>;

    /// Atomically set a status, appending history only on change.
    async fn transition_instance_status(
        &self,
        transition: &StatusTransition,
    ) -> StateResult<InstanceApplication>;

    /// Atomically grant `version` on the way to `target`.
    async fn grant_update(
        &self,
        instance_id: &str,
        app_id: &str,
        version: &str,
        target: &str,
        at: u64,
    ) -> StateResult<InstanceApplication>;

    async fn list_status_history(
        &self,
        instance_id: &str,
        app_id: &str,
        limit: usize,
    ) -> StateResult<Vec<InstanceStatusHistoryEntry>>;

    // ── Activity ───────────────────────────────────────────────────

    async fn insert_activity(&self, entry: &ActivityEntry) -> StateResult<()>;

    async fn activity_exists_since(&self, probe: &ActivityEntry, since: u64) -> StateResult<bool>;

    async fn list_activity(&self, app_id: &str, since: u64) -> StateResult<Vec<ActivityEntry>>;

    // ── Aggregates (synthetic instances excluded) ──────────────────

    async fn group_updates_stats(&self, query: &UpdatesStatsQuery) -> StateResult<UpdatesStats>;

    async fn group_instances_stats(
        &self,
        group_id: &str,
        since: u64,
    ) -> StateResult<InstancesStatusStats>;

    async fn group_version_breakdown(
        &self,
        group_id: &str,
        since: u64,
    ) -> StateResult<Vec<VersionBreakdownEntry>>;

    async fn group_version_count_timeline(
        &self,
        group_id: &str,
        since: u64,
        until: u64,
        bucket_secs: u64,
    ) -> StateResult<VersionCountTimeline>;

    async fn group_status_count_timeline(
        &self,
        group_id: &str,
        since: u64,
        until: u64,
        bucket_secs: u64,
    ) -> StateResult<StatusCountTimeline>;
}

#[async_trait]
impl UpdateStore for StateStore {
    async fn put_team(&self, team: &Team) -> StateResult<()> {
        StateStore::put_team(self, team)
    }

    async fn get_team(&self, id: &str) -> StateResult<Option<Team>> {
        StateStore::get_team(self, id)
    }

    async fn put_application(&self, app: &Application) -> StateResult<()> {
        StateStore::put_application(self, app)
    }

    async fn get_application(&self, id: &str) -> StateResult<Option<Application>> {
        StateStore::get_application(self, id)
    }

    async fn list_applications(&self) -> StateResult<Vec<Application>> {
        StateStore::list_applications(self)
    }

    async fn delete_application(&self, id: &str) -> StateResult<bool> {
        StateStore::delete_application(self, id)
    }

    async fn put_channel(&self, channel: &Channel) -> StateResult<()> {
        StateStore::put_channel(self, channel)
    }

    async fn get_channel(&self, id: &str) -> StateResult<Option<Channel>> {
        StateStore::get_channel(self, id)
    }

    async fn list_channels(&self, app_id: &str) -> StateResult<Vec<Channel>> {
        StateStore::list_channels(self, app_id)
    }

    async fn delete_channel(&self, id: &str) -> StateResult<bool> {
        StateStore::delete_channel(self, id)
    }

    async fn put_package(&self, package: &Package) -> StateResult<()> {
        StateStore::put_package(self, package)
    }

    async fn get_package(&self, id: &str) -> StateResult<Option<Package>> {
        StateStore::get_package(self, id)
    }

    async fn list_packages(&self, app_id: &str) -> StateResult<Vec<Package>> {
        StateStore::list_packages(self, app_id)
    }

    async fn delete_package(&self, id: &str) -> StateResult<bool> {
        StateStore::delete_package(self, id)
    }

    async fn put_floor(&self, floor: &ChannelPackageFloor) -> StateResult<()> {
        StateStore::put_floor(self, floor)
    }

    async fn get_floor(
        &self,
        channel_id: &str,
        package_id: &str,
    ) -> StateResult<Option<ChannelPackageFloor>> {
        StateStore::get_floor(self, channel_id, package_id)
    }

    async fn delete_floor(&self, channel_id: &str, package_id: &str) -> StateResult<bool> {
        StateStore::delete_floor(self, channel_id, package_id)
    }

    async fn list_floors_for_package(
        &self,
        package_id: &str,
    ) -> StateResult<Vec<ChannelPackageFloor>> {
        StateStore::list_floors_for_package(self, package_id)
    }

    async fn list_all_channel_floors(&self, channel_id: &str) -> StateResult<Vec<FloorPackage>> {
        StateStore::list_all_channel_floors(self, channel_id)
    }

    async fn list_channel_floors(
        &self,
        channel_id: &str,
        range: &FloorRange,
    ) -> StateResult<Vec<FloorPackage>> {
        StateStore::list_channel_floors(self, channel_id, range)
    }

    async fn put_group(&self, group: &Group) -> StateResult<()> {
        StateStore::put_group(self, group)
    }

    async fn get_group(&self, id: &str) -> StateResult<Option<Group>> {
        StateStore::get_group(self, id)
    }

    async fn list_groups(&self, app_id: Option<&str>) -> StateResult<Vec<Group>> {
        StateStore::list_groups(self, app_id)
    }

    async fn delete_group(&self, id: &str) -> StateResult<bool> {
        StateStore::delete_group(self, id)
    }

    async fn set_group_rollout_in_progress(&self, id: &str, in_progress: bool) -> StateResult<()> {
        StateStore::set_group_rollout_in_progress(self, id, in_progress)
    }

    async fn disable_group_updates(&self, id: &str) -> StateResult<()> {
        StateStore::disable_group_updates(self, id)
    }

    async fn get_instance(&self, id: &str) -> StateResult<Option<Instance>> {
        StateStore::get_instance(self, id)
    }

    async fn get_instance_application(
        &self,
        instance_id: &str,
        app_id: &str,
    ) -> StateResult<Option<InstanceApplication>> {
        StateStore::get_instance_application(self, instance_id, app_id)
    }

    async fn upsert_instance(
        &self,
        instance: Option<&Instance>,
        application: Option<&InstanceApplication>,
    ) -> StateResult<()> {
        StateStore::upsert_instance(self, instance, application)
    }

    async fn record_check_in(
        &self,
        instance: Option<&Instance>,
        check_in: &CheckIn,
    ) -> StateResult<InstanceApplication> {
        StateStore::record_check_in(self, instance, check_in)
    }

    async fn transition_instance_status(
        &self,
        transition: &StatusTransition,
    ) -> StateResult<InstanceApplication> {
        StateStore::transition_instance_status(self, transition)
    }

    async fn grant_update(
        &self,
        instance_id: &str,
        app_id: &str,
        version: &str,
        target: &str,
        at: u64,
    ) -> StateResult<InstanceApplication> {
        StateStore::grant_update(self, instance_id, app_id, version, target, at)
    }

    async fn list_status_history(
        &self,
        instance_id: &str,
        app_id: &str,
        limit: usize,
    ) -> StateResult<Vec<InstanceStatusHistoryEntry>> {
        StateStore::list_status_history(self, instance_id, app_id, limit)
    }

    async fn insert_activity(&self, entry: &ActivityEntry) -> StateResult<()> {
        StateStore::insert_activity(self, entry)
    }

    async fn activity_exists_since(&self, probe: &ActivityEntry, since: u64) -> StateResult<bool> {
        StateStore::activity_exists_since(self, probe, since)
    }

    async fn list_activity(&self, app_id: &str, since: u64) -> StateResult<Vec<ActivityEntry>> {
        StateStore::list_activity(self, app_id, since)
    }

    async fn group_updates_stats(&self, query: &UpdatesStatsQuery) -> StateResult<UpdatesStats> {
        StateStore::group_updates_stats(self, query)
    }

    async fn group_instances_stats(
        &self,
        group_id: &str,
        since: u64,
    ) -> StateResult<InstancesStatusStats> {
        StateStore::group_instances_stats(self, group_id, since)
    }

    async fn group_version_breakdown(
        &self,
        group_id: &str,
        since: u64,
    ) -> StateResult<Vec<VersionBreakdownEntry>> {
        StateStore::group_version_breakdown(self, group_id, since)
    }

    async fn group_version_count_timeline(
        &self,
        group_id: &str,
        since: u64,
        until: u64,
        bucket_secs: u64,
    ) -> StateResult<VersionCountTimeline> {
        StateStore::group_version_count_timeline(self, group_id, since, until, bucket_secs)
    }

    async fn group_status_count_timeline(
        &self,
        group_id: &str,
        since: u64,
        until: u64,
        bucket_secs: u64,
    ) -> StateResult<StatusCountTimeline> {
        StateStore::group_status_count_timeline(self, group_id, since, until, bucket_secs)
    }
}
