//! StateStore: redb-backed persistence for rollgate.
//!
//! Provides typed CRUD over the catalog (teams, applications, channels,
//! packages, floors, groups), the instance tables, the append-only status
//! history and activity logs, and the windowed aggregates the rollout
//! engine needs. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;
use crate::version::{Version, is_older};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;
type LogTable = TableDefinition<'static, u64, &'static [u8]>;

/// Version bounds and page size for a channel floor listing.
#[derive(Debug, Clone)]
pub struct FloorRange {
    /// Exclusive lower bound (the instance's current version).
    pub above: Version,
    /// Inclusive upper bound (the channel's target version).
    pub up_to: Version,
    /// Maximum number of rows returned.
    pub limit: usize,
}

/// Thread-safe update store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "update store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory update store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [
            TEAMS,
            APPLICATIONS,
            CHANNELS,
            PACKAGES,
            FLOORS,
            GROUPS,
            INSTANCES,
            INSTANCE_APPS,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(STATUS_HISTORY).map_err(map_err!(Table))?;
        txn.open_table(ACTIVITY).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Scan a table, keeping the rows `keep` accepts.
    fn scan_json<T, F>(&self, table: JsonTable, mut keep: F) -> StateResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: FnMut(&T) -> bool,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let row: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&row) {
                results.push(row);
            }
        }
        Ok(results)
    }

    fn scan_log<T, F>(&self, table: LogTable, mut keep: F) -> StateResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: FnMut(&T) -> bool,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let row: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&row) {
                results.push(row);
            }
        }
        Ok(results)
    }

    fn delete_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Append to a sequence-keyed log inside an open write transaction.
    fn append_log<T: Serialize>(
        txn: &redb::WriteTransaction,
        table: LogTable,
        value: &T,
    ) -> StateResult<u64> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let mut table = txn.open_table(table).map_err(map_err!(Table))?;
        let next = match table.last().map_err(map_err!(Read))? {
            Some((key, _)) => key.value() + 1,
            None => 1,
        };
        table
            .insert(next, bytes.as_slice())
            .map_err(map_err!(Write))?;
        Ok(next)
    }

    // ── Teams / Applications ───────────────────────────────────────

    pub fn put_team(&self, team: &Team) -> StateResult<()> {
        self.put_json(TEAMS, &team.id, team)
    }

    pub fn get_team(&self, id: &str) -> StateResult<Option<Team>> {
        self.get_json(TEAMS, id)
    }

    pub fn put_application(&self, app: &Application) -> StateResult<()> {
        self.put_json(APPLICATIONS, &app.id, app)?;
        debug!(app = %app.id, "application stored");
        Ok(())
    }

    pub fn get_application(&self, id: &str) -> StateResult<Option<Application>> {
        self.get_json(APPLICATIONS, id)
    }

    pub fn list_applications(&self) -> StateResult<Vec<Application>> {
        self.scan_json(APPLICATIONS, |_| true)
    }

    pub fn delete_application(&self, id: &str) -> StateResult<bool> {
        self.delete_key(APPLICATIONS, id)
    }

    // ── Channels ───────────────────────────────────────────────────

    pub fn put_channel(&self, channel: &Channel) -> StateResult<()> {
        self.put_json(CHANNELS, &channel.id, channel)?;
        debug!(channel = %channel.id, package = ?channel.package_id, "channel stored");
        Ok(())
    }

    pub fn get_channel(&self, id: &str) -> StateResult<Option<Channel>> {
        self.get_json(CHANNELS, id)
    }

    pub fn list_channels(&self, app_id: &str) -> StateResult<Vec<Channel>> {
        self.scan_json(CHANNELS, |c: &Channel| c.application_id == app_id)
    }

    pub fn delete_channel(&self, id: &str) -> StateResult<bool> {
        self.delete_key(CHANNELS, id)
    }

    // ── Packages ───────────────────────────────────────────────────

    pub fn put_package(&self, package: &Package) -> StateResult<()> {
        self.put_json(PACKAGES, &package.id, package)?;
        debug!(package = %package.id, version = %package.version, "package stored");
        Ok(())
    }

    pub fn get_package(&self, id: &str) -> StateResult<Option<Package>> {
        self.get_json(PACKAGES, id)
    }

    /// Packages of an application, newest version first.
    pub fn list_packages(&self, app_id: &str) -> StateResult<Vec<Package>> {
        let mut packages = self.scan_json(PACKAGES, |p: &Package| p.application_id == app_id)?;
        packages.sort_by(|a, b| {
            let a = Version::parse(&a.version).ok();
            let b = Version::parse(&b.version).ok();
            b.cmp(&a)
        });
        Ok(packages)
    }

    pub fn delete_package(&self, id: &str) -> StateResult<bool> {
        self.delete_key(PACKAGES, id)
    }

    // ── Floors ─────────────────────────────────────────────────────

    pub fn put_floor(&self, floor: &ChannelPackageFloor) -> StateResult<()> {
        self.put_json(FLOORS, &floor.table_key(), floor)
    }

    pub fn get_floor(
        &self,
        channel_id: &str,
        package_id: &str,
    ) -> StateResult<Option<ChannelPackageFloor>> {
        self.get_json(FLOORS, &floor_key(channel_id, package_id))
    }

    pub fn delete_floor(&self, channel_id: &str, package_id: &str) -> StateResult<bool> {
        self.delete_key(FLOORS, &floor_key(channel_id, package_id))
    }

    pub fn list_floors_for_package(&self, package_id: &str) -> StateResult<Vec<ChannelPackageFloor>> {
        self.scan_json(FLOORS, |f: &ChannelPackageFloor| f.package_id == package_id)
    }

    /// All floors of a channel with their packages, ascending by version.
    pub fn list_all_channel_floors(&self, channel_id: &str) -> StateResult<Vec<FloorPackage>> {
        let floors = self.scan_json(FLOORS, |f: &ChannelPackageFloor| f.channel_id == channel_id)?;
        let mut resolved = Vec::with_capacity(floors.len());
        for floor in floors {
            match self.get_package(&floor.package_id)? {
                Some(package) => resolved.push(FloorPackage {
                    package,
                    reason: floor.reason,
                }),
                None => debug!(
                    channel = %channel_id,
                    package = %floor.package_id,
                    "floor references a missing package, skipping"
                ),
            }
        }
        resolved.sort_by(|a, b| {
            let a = Version::parse(&a.package.version).ok();
            let b = Version::parse(&b.package.version).ok();
            a.cmp(&b)
        });
        Ok(resolved)
    }

    /// Floors of a channel within `range`, ascending by version.
    ///
    /// Packages blacklisted for the channel and packages whose version
    /// does not parse are never returned.
    pub fn list_channel_floors(
        &self,
        channel_id: &str,
        range: &FloorRange,
    ) -> StateResult<Vec<FloorPackage>> {
        let mut floors: Vec<(Version, FloorPackage)> = self
            .list_all_channel_floors(channel_id)?
            .into_iter()
            .filter(|f| !f.package.is_blacklisted_for(channel_id))
            .filter_map(|f| Version::parse(&f.package.version).ok().map(|v| (v, f)))
            .filter(|(v, _)| *v > range.above && *v <= range.up_to)
            .collect();
        floors.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(floors
            .into_iter()
            .take(range.limit)
            .map(|(_, f)| f)
            .collect())
    }

    // ── Groups ─────────────────────────────────────────────────────

    pub fn put_group(&self, group: &Group) -> StateResult<()> {
        self.put_json(GROUPS, &group.id, group)?;
        debug!(group = %group.id, track = %group.track, "group stored");
        Ok(())
    }

    pub fn get_group(&self, id: &str) -> StateResult<Option<Group>> {
        self.get_json(GROUPS, id)
    }

    /// Groups of one application, or of all applications.
    pub fn list_groups(&self, app_id: Option<&str>) -> StateResult<Vec<Group>> {
        self.scan_json(GROUPS, |g: &Group| {
            app_id.is_none_or(|app| g.application_id == app)
        })
    }

    pub fn delete_group(&self, id: &str) -> StateResult<bool> {
        self.delete_key(GROUPS, id)
    }

    /// Read-modify-write a group inside one write transaction.
    fn modify_group<F>(&self, id: &str, change: F) -> StateResult<Group>
    where
        F: FnOnce(&mut Group),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let group = {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            let mut group: Group = {
                let guard = table
                    .get(id)
                    .map_err(map_err!(Read))?
                    .ok_or_else(|| StateError::NotFound(format!("group {id}")))?;
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
            };
            change(&mut group);
            let bytes = serde_json::to_vec(&group).map_err(map_err!(Serialize))?;
            table
                .insert(id, bytes.as_slice())
                .map_err(map_err!(Write))?;
            group
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(group)
    }

    pub fn set_group_rollout_in_progress(&self, id: &str, in_progress: bool) -> StateResult<()> {
        self.modify_group(id, |g| g.rollout_in_progress = in_progress)?;
        debug!(group = %id, in_progress, "group rollout flag updated");
        Ok(())
    }

    pub fn disable_group_updates(&self, id: &str) -> StateResult<()> {
        self.modify_group(id, |g| g.policy.updates_enabled = false)?;
        debug!(group = %id, "group updates disabled");
        Ok(())
    }

    // ── Instances ──────────────────────────────────────────────────

    pub fn get_instance(&self, id: &str) -> StateResult<Option<Instance>> {
        self.get_json(INSTANCES, id)
    }

    pub fn get_instance_application(
        &self,
        instance_id: &str,
        app_id: &str,
    ) -> StateResult<Option<InstanceApplication>> {
        self.get_json(INSTANCE_APPS, &instance_app_key(instance_id, app_id))
    }

    /// Per-application rows of a group's instances.
    pub fn list_group_instance_applications(
        &self,
        group_id: &str,
    ) -> StateResult<Vec<InstanceApplication>> {
        self.scan_json(INSTANCE_APPS, |row: &InstanceApplication| {
            row.group_id == group_id
        })
    }

    /// Write an instance row, an instance-application row, or both.
    ///
    /// Both rows go through a single write transaction, so they are
    /// committed together or not at all.
    pub fn upsert_instance(
        &self,
        instance: Option<&Instance>,
        application: Option<&InstanceApplication>,
    ) -> StateResult<()> {
        if instance.is_none() && application.is_none() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        if let Some(instance) = instance {
            let bytes = serde_json::to_vec(instance).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table
                .insert(instance.id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        if let Some(application) = application {
            let key = application.table_key();
            let bytes = serde_json::to_vec(application).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(INSTANCE_APPS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Record a check-in, creating the instance-application row on first
    /// sight, in one write transaction together with `instance` if given.
    ///
    /// The row is read inside the transaction, so a concurrent grant or
    /// status transition is never rolled back. Moving to another group
    /// resets the status to `Undefined`.
    pub fn record_check_in(
        &self,
        instance: Option<&Instance>,
        check_in: &CheckIn,
    ) -> StateResult<InstanceApplication> {
        let key = instance_app_key(&check_in.instance_id, &check_in.application_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        if let Some(instance) = instance {
            let bytes = serde_json::to_vec(instance).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            table
                .insert(instance.id.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        let row = {
            let mut table = txn.open_table(INSTANCE_APPS).map_err(map_err!(Table))?;
            let existing: Option<InstanceApplication> = match table
                .get(key.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let row = match existing {
                Some(mut row) => {
                    row.version = check_in.version.clone();
                    row.last_check_at = check_in.at;
                    if row.group_id != check_in.group_id {
                        info!(
                            instance = %check_in.instance_id,
                            from = %row.group_id,
                            to = %check_in.group_id,
                            "instance moved to another group"
                        );
                        row.group_id = check_in.group_id.clone();
                        row.status = InstanceStatus::Undefined;
                        row.update_in_progress = false;
                    }
                    row
                }
                None => {
                    debug!(instance = %check_in.instance_id, app = %check_in.application_id, "first check-in");
                    InstanceApplication::first_seen(
                        &check_in.instance_id,
                        &check_in.application_id,
                        &check_in.group_id,
                        &check_in.version,
                        check_in.at,
                    )
                }
            };
            let bytes = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            row
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(row)
    }

    /// Read-modify-write an instance-application row and optionally append
    /// a history entry built from the updated row, in one transaction.
    fn modify_instance_application<F>(
        &self,
        instance_id: &str,
        app_id: &str,
        change: F,
    ) -> StateResult<InstanceApplication>
    where
        F: FnOnce(&mut InstanceApplication) -> Option<InstanceStatusHistoryEntry>,
    {
        let key = instance_app_key(instance_id, app_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (row, history) = {
            let mut table = txn.open_table(INSTANCE_APPS).map_err(map_err!(Table))?;
            let mut row: InstanceApplication = {
                let guard = table
                    .get(key.as_str())
                    .map_err(map_err!(Read))?
                    .ok_or_else(|| StateError::NotFound(format!("instance application {key}")))?;
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
            };
            let history = change(&mut row);
            let bytes = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            (row, history)
        };
        if let Some(entry) = history {
            Self::append_log(&txn, STATUS_HISTORY, &entry)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(row)
    }

    /// Apply a status transition.
    ///
    /// The status and `update_in_progress` are always written. A history
    /// row is appended only when the status actually changes. Completing
    /// moves the instance forward to its last granted version.
    pub fn transition_instance_status(
        &self,
        transition: &StatusTransition,
    ) -> StateResult<InstanceApplication> {
        let row = self.modify_instance_application(
            &transition.instance_id,
            &transition.application_id,
            |row| {
                let changed = row.status != transition.status;
                row.status = transition.status;
                row.update_in_progress = transition.status.keeps_update_in_progress();
                if transition.status == InstanceStatus::Complete {
                    if let Some(version) = &row.last_update_version {
                        if is_older(&row.version, version) {
                            row.version = version.clone();
                        }
                    }
                }
                changed.then(|| InstanceStatusHistoryEntry {
                    instance_id: row.instance_id.clone(),
                    application_id: row.application_id.clone(),
                    group_id: row.group_id.clone(),
                    status: row.status,
                    version: row.version.clone(),
                    created_at: transition.at,
                    error_code: transition.error_code.clone(),
                })
            },
        )?;
        debug!(
            instance = %transition.instance_id,
            app = %transition.application_id,
            status = %transition.status,
            "instance status updated"
        );
        Ok(row)
    }

    /// Record a grant of `version` on the way to `target`.
    ///
    /// `version` differs from `target` when the instance is sent to a floor
    /// first; rollout counters are keyed on `target`.
    pub fn grant_update(
        &self,
        instance_id: &str,
        app_id: &str,
        version: &str,
        target: &str,
        at: u64,
    ) -> StateResult<InstanceApplication> {
        self.modify_instance_application(instance_id, app_id, |row| {
            let changed = row.status != InstanceStatus::UpdateGranted;
            row.last_update_granted_at = Some(at);
            row.last_update_version = Some(version.to_string());
            row.last_update_target = Some(target.to_string());
            row.status = InstanceStatus::UpdateGranted;
            row.update_in_progress = true;
            changed.then(|| InstanceStatusHistoryEntry {
                instance_id: row.instance_id.clone(),
                application_id: row.application_id.clone(),
                group_id: row.group_id.clone(),
                status: InstanceStatus::UpdateGranted,
                version: row.version.clone(),
                created_at: at,
                error_code: None,
            })
        })
    }

    /// Most recent history entries of an instance, newest first.
    pub fn list_status_history(
        &self,
        instance_id: &str,
        app_id: &str,
        limit: usize,
    ) -> StateResult<Vec<InstanceStatusHistoryEntry>> {
        let mut entries = self.scan_log(STATUS_HISTORY, |e: &InstanceStatusHistoryEntry| {
            e.instance_id == instance_id && e.application_id == app_id
        })?;
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    // ── Activity ───────────────────────────────────────────────────

    pub fn insert_activity(&self, entry: &ActivityEntry) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        Self::append_log(&txn, ACTIVITY, entry)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app = %entry.application_id, class = ?entry.class, "activity recorded");
        Ok(())
    }

    /// Whether an entry describing the same milestone exists at or after `since`.
    pub fn activity_exists_since(&self, probe: &ActivityEntry, since: u64) -> StateResult<bool> {
        let matches = self.scan_log(ACTIVITY, |e: &ActivityEntry| {
            e.created_at >= since && e.same_milestone(probe)
        })?;
        Ok(!matches.is_empty())
    }

    /// Activity of an application at or after `since`, newest first.
    pub fn list_activity(&self, app_id: &str, since: u64) -> StateResult<Vec<ActivityEntry>> {
        let mut entries = self.scan_log(ACTIVITY, |e: &ActivityEntry| {
            e.application_id == app_id && e.created_at >= since
        })?;
        entries.reverse();
        Ok(entries)
    }

    // ── Aggregates ─────────────────────────────────────────────────

    /// Non-synthetic instance rows of a group.
    fn fleet_rows(&self, group_id: &str) -> StateResult<Vec<InstanceApplication>> {
        self.scan_json(INSTANCE_APPS, |row: &InstanceApplication| {
            row.group_id == group_id && !is_synthetic_instance(&row.instance_id)
        })
    }

    pub fn group_updates_stats(&self, query: &UpdatesStatsQuery) -> StateResult<UpdatesStats> {
        let target = Version::parse(&query.version).ok();
        let period_start = query.now.saturating_sub(query.period_interval_secs);
        let mut stats = UpdatesStats::default();

        for row in self.fleet_rows(&query.group_id)? {
            stats.total_instances += 1;

            let is_target = |version: Option<&str>| match (version, &target) {
                (Some(v), Some(target)) => Version::parse(v).is_ok_and(|v| v == *target),
                (Some(v), None) => v == query.version,
                (None, _) => false,
            };
            // A completed floor on the way to the target counts as an
            // attempt; only reaching the target itself is a success.
            if is_target(row.granted_target()) {
                stats.updates_to_current_version_granted += 1;
                if row.status.is_terminal_attempt() {
                    stats.updates_to_current_version_attempted += 1;
                }
                match row.status {
                    InstanceStatus::Complete if is_target(row.last_update_version.as_deref()) => {
                        stats.updates_to_current_version_succeeded += 1
                    }
                    InstanceStatus::Error => stats.updates_to_current_version_failed += 1,
                    _ => {}
                }
            }

            if let Some(granted_at) = row.last_update_granted_at {
                if granted_at >= period_start {
                    stats.updates_granted_in_last_period += 1;
                }
                if row.update_in_progress {
                    if query.now.saturating_sub(granted_at) > query.update_timeout_secs {
                        stats.updates_timed_out += 1;
                    } else {
                        stats.updates_in_progress += 1;
                    }
                }
            }
        }
        Ok(stats)
    }

    pub fn group_instances_stats(
        &self,
        group_id: &str,
        since: u64,
    ) -> StateResult<InstancesStatusStats> {
        let mut stats = InstancesStatusStats::default();
        for row in self.fleet_rows(group_id)? {
            if row.last_check_at >= since {
                stats.record(row.status);
            }
        }
        Ok(stats)
    }

    /// Versions run by a group's recently seen instances, newest first.
    pub fn group_version_breakdown(
        &self,
        group_id: &str,
        since: u64,
    ) -> StateResult<Vec<VersionBreakdownEntry>> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        let mut total = 0u64;
        for row in self.fleet_rows(group_id)? {
            if row.last_check_at >= since {
                *counts.entry(row.version).or_default() += 1;
                total += 1;
            }
        }
        let mut breakdown: Vec<VersionBreakdownEntry> = counts
            .into_iter()
            .map(|(version, instances)| VersionBreakdownEntry {
                percentage: instances as f64 * 100.0 / total as f64,
                version,
                instances,
            })
            .collect();
        breakdown.sort_by(|a, b| {
            let va = Version::parse(&a.version).ok();
            let vb = Version::parse(&b.version).ok();
            vb.cmp(&va).then_with(|| a.version.cmp(&b.version))
        });
        Ok(breakdown)
    }

    /// Non-synthetic history entries of a group, oldest first.
    fn group_history(&self, group_id: &str) -> StateResult<Vec<InstanceStatusHistoryEntry>> {
        self.scan_log(STATUS_HISTORY, |e: &InstanceStatusHistoryEntry| {
            e.group_id == group_id && !is_synthetic_instance(&e.instance_id)
        })
    }

    /// Number of instances per version at the end of each bucket.
    ///
    /// The version an instance ran at time `t` is taken from its latest
    /// history entry at or before `t`. Instances without history use their
    /// current version from the moment they were first seen.
    pub fn group_version_count_timeline(
        &self,
        group_id: &str,
        since: u64,
        until: u64,
        bucket_secs: u64,
    ) -> StateResult<VersionCountTimeline> {
        let rows = self.fleet_rows(group_id)?;
        let mut history: HashMap<String, Vec<InstanceStatusHistoryEntry>> = HashMap::new();
        for entry in self.group_history(group_id)? {
            history.entry(entry.instance_id.clone()).or_default().push(entry);
        }

        let mut timeline = VersionCountTimeline::new();
        for start in bucket_starts(since, until, bucket_secs) {
            let end = start + bucket_secs;
            let counts = timeline.entry(start).or_default();
            for row in &rows {
                let entries = history.get(&row.instance_id).map(Vec::as_slice).unwrap_or(&[]);
                if let Some(version) = version_at(row, entries, end) {
                    *counts.entry(version).or_default() += 1;
                }
            }
        }
        Ok(timeline)
    }

    /// Status transitions per bucket, split by status and version.
    pub fn group_status_count_timeline(
        &self,
        group_id: &str,
        since: u64,
        until: u64,
        bucket_secs: u64,
    ) -> StateResult<StatusCountTimeline> {
        let mut timeline = StatusCountTimeline::new();
        for start in bucket_starts(since, until, bucket_secs) {
            timeline.entry(start).or_default();
        }
        if bucket_secs == 0 {
            return Ok(timeline);
        }
        for entry in self.group_history(group_id)? {
            if entry.created_at < since || entry.created_at >= until {
                continue;
            }
            let start = since + (entry.created_at - since) / bucket_secs * bucket_secs;
            *timeline
                .entry(start)
                .or_default()
                .entry(entry.status)
                .or_default()
                .entry(entry.version)
                .or_default() += 1;
        }
        Ok(timeline)
    }
}

/// Bucket start timestamps covering `[since, until)`.
fn bucket_starts(since: u64, until: u64, bucket_secs: u64) -> Vec<u64> {
    if bucket_secs == 0 || until <= since {
        return Vec::new();
    }
    (since..until).step_by(bucket_secs as usize).collect()
}

fn version_at(
    row: &InstanceApplication,
    entries: &[InstanceStatusHistoryEntry],
    at: u64,
) -> Option<String> {
    if let Some(latest) = entries.iter().rev().find(|e| e.created_at <= at) {
        return Some(latest.version.clone());
    }
    if row.created_at > at {
        return None;
    }
    match entries.first() {
        // The first recorded transition after `at` still reports the old
        // version unless it completed an update.
        Some(next) if next.status != InstanceStatus::Complete => Some(next.version.clone()),
        Some(_) => None,
        None => Some(row.version.clone()),
    }
}
