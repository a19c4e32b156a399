//! The engine facade.
//!
//! [`Engine`] owns the identity cache, the clock and a handle to the
//! update store. Every public operation takes `&self`, so one engine can
//! serve any number of concurrent check-ins behind an `Arc`.

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use rollgate_state::{
    ActivityEntry, AppId, Channel, CheckIn, Group, Instance, InstanceApplication, InstanceRecord,
    InstanceStatus, InstanceStatusHistoryEntry, Package, StatusTransition, UpdateStore, Version,
    version::is_older,
};

use crate::activity::ActivityLog;
use crate::cache::{IdentityCache, canonical_uuid};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::decision::{CheckInFacts, Step, TargetState, plan_check_in};
use crate::error::{Denial, EngineError, EngineResult};
use crate::floors::{self, ManifestMode, UpdatePlan};
use crate::policy;
use crate::status;

/// Longest instance id accepted.
const MAX_INSTANCE_ID_LEN: usize = 256;

/// One instance checking in for one application in one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRegistration {
    pub instance_id: String,
    #[serde(default)]
    pub alias: Option<String>,
    pub ip: String,
    pub version: String,
    /// Application id, product id or braced UUID.
    pub app_id: String,
    pub group_id: String,
}

/// A progress event as reported by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event_type: u32,
    pub event_result: u32,
    #[serde(default)]
    pub previous_version: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}

/// A progress event addressed to an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventReport {
    pub instance_id: String,
    pub app_id: String,
    pub group_id: String,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

pub struct Engine {
    store: Arc<dyn UpdateStore>,
    cache: IdentityCache,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

fn validate_instance_id(id: &str) -> EngineResult<()> {
    let trimmed = id.trim();
    if trimmed.is_empty()
        || trimmed.len() != id.len()
        || id.len() > MAX_INSTANCE_ID_LEN
        || id.chars().any(char::is_control)
    {
        return Err(EngineError::InvalidInstanceId(id.to_string()));
    }
    Ok(())
}

fn validate_version(version: &str) -> EngineResult<Version> {
    Version::parse(version).map_err(|_| EngineError::InvalidSemver(version.to_string()))
}

impl Engine {
    pub fn new(store: Arc<dyn UpdateStore>, config: EngineConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn UpdateStore>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache: IdentityCache::new(),
            clock,
            config,
        }
    }

    pub fn store(&self) -> &dyn UpdateStore {
        self.store.as_ref()
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now()
    }

    pub(crate) fn activity(&self) -> ActivityLog<'_> {
        ActivityLog::new(self.store(), self.config.activity_dedupe_window_secs)
    }

    // ── Lookups ────────────────────────────────────────────────────

    pub(crate) async fn require_group(&self, id: &str) -> EngineResult<Group> {
        self.store
            .get_group(id)
            .await?
            .ok_or_else(|| EngineError::InvalidGroup(id.to_string()))
    }

    pub(crate) async fn require_channel(&self, id: &str) -> EngineResult<Channel> {
        self.store
            .get_channel(id)
            .await?
            .ok_or_else(|| EngineError::InvalidChannel(id.to_string()))
    }

    pub(crate) async fn require_package(&self, id: &str) -> EngineResult<Package> {
        self.store
            .get_package(id)
            .await?
            .ok_or_else(|| EngineError::InvalidPackage(id.to_string()))
    }

    /// The group's channel and that channel's target package, if both exist.
    pub(crate) async fn group_target(&self, group: &Group) -> EngineResult<Option<(Channel, Package)>> {
        let Some(channel_id) = group.channel_id.as_deref() else {
            return Ok(None);
        };
        let Some(channel) = self.store.get_channel(channel_id).await? else {
            return Ok(None);
        };
        let Some(package_id) = channel.package_id.as_deref() else {
            return Ok(None);
        };
        let package = self.store.get_package(package_id).await?;
        Ok(package.map(|p| (channel, p)))
    }

    /// Resolve an external application id and a group id, and check the
    /// group belongs to the application.
    pub(crate) async fn resolve_app_and_group(
        &self,
        app: &str,
        group_id: &str,
    ) -> EngineResult<(AppId, Group)> {
        let app_id = self
            .cache
            .resolve_app_id(self.store(), app)
            .await?
            .ok_or(EngineError::InvalidApplicationOrGroup)?;
        let group_id = canonical_uuid(group_id).unwrap_or_else(|| group_id.trim().to_string());
        match self.store.get_group(&group_id).await? {
            Some(group) if group.application_id == app_id => Ok((app_id, group)),
            _ => Err(EngineError::InvalidApplicationOrGroup),
        }
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Record a check-in: create or refresh the instance and its
    /// per-application row.
    pub async fn register_instance(&self, req: &InstanceRegistration) -> EngineResult<InstanceRecord> {
        let (app_id, group) = self.resolve_app_and_group(&req.app_id, &req.group_id).await?;
        self.upsert_check_in(req, &app_id, &group).await
    }

    pub(crate) async fn upsert_check_in(
        &self,
        req: &InstanceRegistration,
        app_id: &str,
        group: &Group,
    ) -> EngineResult<InstanceRecord> {
        validate_instance_id(&req.instance_id)?;
        let ip: IpAddr = req
            .ip
            .trim()
            .parse()
            .map_err(|_| EngineError::InvalidIp(req.ip.clone()))?;
        let ip = ip.to_string();
        validate_version(&req.version)?;
        let now = self.now();

        let (instance, instance_changed) = match self.store.get_instance(&req.instance_id).await? {
            Some(mut instance) => {
                let alias_changed = req.alias.is_some() && instance.alias != req.alias;
                let changed = instance.ip != ip || alias_changed;
                instance.ip = ip;
                if alias_changed {
                    instance.alias = req.alias.clone();
                }
                (instance, changed)
            }
            None => {
                let instance = Instance {
                    id: req.instance_id.clone(),
                    ip,
                    alias: req.alias.clone(),
                    created_at: now,
                };
                (instance, true)
            }
        };

        let application = self
            .store
            .record_check_in(
                instance_changed.then_some(&instance),
                &CheckIn {
                    instance_id: req.instance_id.clone(),
                    application_id: app_id.to_string(),
                    group_id: group.id.clone(),
                    version: req.version.clone(),
                    at: now,
                },
            )
            .await?;
        Ok(InstanceRecord {
            instance,
            application,
        })
    }

    pub async fn get_instance(&self, instance_id: &str, app: &str) -> EngineResult<Option<InstanceRecord>> {
        let Some(app_id) = self.cache.resolve_app_id(self.store(), app).await? else {
            return Err(EngineError::InvalidApplication(app.to_string()));
        };
        let Some(instance) = self.store.get_instance(instance_id).await? else {
            return Ok(None);
        };
        let application = self.store.get_instance_application(instance_id, &app_id).await?;
        Ok(application.map(|application| InstanceRecord {
            instance,
            application,
        }))
    }

    /// Status history of an instance, newest first.
    pub async fn instance_status_history(
        &self,
        instance_id: &str,
        app_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<InstanceStatusHistoryEntry>> {
        Ok(self
            .store
            .list_status_history(instance_id, app_id, limit)
            .await?)
    }

    /// Activity of an application at or after `since`, newest first.
    pub async fn list_activity(&self, app_id: &str, since: u64) -> EngineResult<Vec<ActivityEntry>> {
        Ok(self.store.list_activity(app_id, since).await?)
    }

    // ── Update decisions ───────────────────────────────────────────

    /// Register the check-in and return the single package to install.
    pub async fn get_update_package(&self, req: &InstanceRegistration) -> EngineResult<Package> {
        let plan = self.get_update_plan(req, ManifestMode::Single).await?;
        Ok(plan.next_package().clone())
    }

    /// Register the check-in and return everything deliverable in `mode`.
    pub async fn get_update_plan(
        &self,
        req: &InstanceRegistration,
        mode: ManifestMode,
    ) -> EngineResult<UpdatePlan> {
        let (app_id, group) = self.resolve_app_and_group(&req.app_id, &req.group_id).await?;
        self.upsert_check_in(req, &app_id, &group).await?;
        self.decide(&app_id, &group, &req.instance_id, mode).await
    }

    /// Decide for an instance that has already been registered.
    pub(crate) async fn decide(
        &self,
        app_id: &str,
        group: &Group,
        instance_id: &str,
        mode: ManifestMode,
    ) -> EngineResult<UpdatePlan> {
        let row = self
            .store
            .get_instance_application(instance_id, app_id)
            .await?
            .ok_or_else(|| EngineError::InvalidInstance(instance_id.to_string()))?;
        let now = self.now();
        let target = self.group_target(group).await?;

        let target_state = match &target {
            None => TargetState::Missing,
            Some((channel, package)) if package.is_blacklisted_for(&channel.id) => {
                TargetState::Blacklisted
            }
            Some(_) => TargetState::Available,
        };
        let behind_target = target
            .as_ref()
            .is_some_and(|(_, package)| is_older(&row.version, &package.version));
        let step = plan_check_in(&CheckInFacts {
            status: row.status,
            had_grant: row.last_update_version.is_some(),
            target: target_state,
            behind_target,
        });
        debug!(
            instance = %instance_id,
            group = %group.id,
            status = %row.status,
            version = %row.version,
            ?step,
            "check-in decision"
        );

        match (step, target) {
            (Step::RejectInFlight, _) => Err(Denial::UpdateInProgressOnInstance.into()),
            (Step::NoPackage, _) | (_, None) => {
                self.activity().package_not_found(group, now).await?;
                Err(Denial::NoPackageFound.into())
            }
            (Step::Blacklisted { complete } | Step::UpToDate { complete }, Some((_, package))) => {
                if complete {
                    self.complete_open_grant(&row, group, &package.version, now)
                        .await?;
                }
                Err(Denial::NoUpdatePackageAvailable.into())
            }
            (Step::Redeliver, Some((channel, package))) => {
                debug!(instance = %instance_id, "update already granted, delivering again");
                self.build_plan(&channel, package, &row.version).await
            }
            (Step::EvaluatePolicy, Some((channel, package))) => {
                self.grant(&row, group, &channel, package, mode, now).await
            }
        }
    }

    async fn build_plan(
        &self,
        channel: &Channel,
        target: Package,
        instance_version: &str,
    ) -> EngineResult<UpdatePlan> {
        let required = floors::required_floors(
            self.store(),
            channel,
            instance_version,
            self.config.max_floors_per_response,
        )
        .await?;
        Ok(UpdatePlan::new(target, required))
    }

    async fn grant(
        &self,
        row: &InstanceApplication,
        group: &Group,
        channel: &Channel,
        target: Package,
        mode: ManifestMode,
        now: u64,
    ) -> EngineResult<UpdatePlan> {
        let target_version = target.version.clone();
        if let Err(err) =
            policy::enforce_rollout_policy(self.store(), group, &target_version, now).await
        {
            if let Some(denial) = err.denial() {
                self.store
                    .transition_instance_status(&StatusTransition {
                        instance_id: row.instance_id.clone(),
                        application_id: row.application_id.clone(),
                        status: InstanceStatus::OnHold,
                        error_code: None,
                        at: now,
                    })
                    .await?;
                if denial == Denial::MaxTimedOutUpdatesLimitReached {
                    self.activity()
                        .rollout_failed(group, &target_version, now)
                        .await?;
                }
                debug!(instance = %row.instance_id, %denial, "instance put on hold");
            }
            return Err(err);
        }

        let plan = self.build_plan(channel, target, &row.version).await?;
        let delivered = plan.final_package(mode).version.clone();
        self.store
            .grant_update(
                &row.instance_id,
                &row.application_id,
                &delivered,
                &target_version,
                now,
            )
            .await?;
        self.activity()
            .rollout_started(group, &target_version, now)
            .await?;
        info!(
            instance = %row.instance_id,
            group = %group.id,
            from = %row.version,
            to = %delivered,
            target = %target_version,
            "update granted"
        );
        Ok(plan)
    }

    /// Close a grant the instance no longer needs.
    async fn complete_open_grant(
        &self,
        row: &InstanceApplication,
        group: &Group,
        target_version: &str,
        now: u64,
    ) -> EngineResult<()> {
        self.store
            .transition_instance_status(&StatusTransition {
                instance_id: row.instance_id.clone(),
                application_id: row.application_id.clone(),
                status: InstanceStatus::Complete,
                error_code: None,
                at: now,
            })
            .await?;
        let group = self.require_group(&group.id).await?;
        self.activity()
            .settle_rollout(&group, target_version, now)
            .await?;
        Ok(())
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Apply a progress event. Returns the status the instance moved to,
    /// or `None` when the event was acknowledged without a transition.
    pub async fn register_event(&self, report: &EventReport) -> EngineResult<Option<InstanceStatus>> {
        validate_instance_id(&report.instance_id)?;
        let (app_id, group) = self
            .resolve_app_and_group(&report.app_id, &report.group_id)
            .await?;
        self.apply_event(&app_id, &group, &report.instance_id, &report.event)
            .await
    }

    pub(crate) async fn apply_event(
        &self,
        app_id: &str,
        group: &Group,
        instance_id: &str,
        event: &ProgressEvent,
    ) -> EngineResult<Option<InstanceStatus>> {
        let next = status::status_for_event(event.event_type, event.event_result)?;
        let row = self
            .store
            .get_instance_application(instance_id, app_id)
            .await?
            .ok_or_else(|| EngineError::InvalidInstance(instance_id.to_string()))?;
        if row.group_id != group.id {
            return Err(EngineError::InvalidApplicationOrGroup);
        }
        if !row.update_in_progress {
            return Err(Denial::NoUpdateInProgress.into());
        }
        let Some(next) = next else {
            debug!(instance = %instance_id, "intermediate completion acknowledged");
            return Ok(None);
        };
        if status::is_regression(row.status, next) {
            debug!(
                instance = %instance_id,
                current = %row.status,
                reported = %next,
                "ignoring out-of-order event"
            );
            return Ok(None);
        }

        let now = self.now();
        let error_code = match next {
            InstanceStatus::Error => event.error_code.clone(),
            _ => None,
        };
        let updated = self
            .store
            .transition_instance_status(&StatusTransition {
                instance_id: instance_id.to_string(),
                application_id: app_id.to_string(),
                status: next,
                error_code,
                at: now,
            })
            .await?;
        debug!(
            instance = %instance_id,
            status = %updated.status,
            previous_version = ?event.previous_version,
            "instance progressed"
        );

        match next {
            InstanceStatus::Complete => {
                if let Some((_, target)) = self.group_target(group).await? {
                    let group = self.require_group(&group.id).await?;
                    self.activity()
                        .settle_rollout(&group, &target.version, now)
                        .await?;
                }
            }
            InstanceStatus::Error => {
                let version = updated
                    .last_update_version
                    .as_deref()
                    .unwrap_or(&updated.version);
                info!(
                    instance = %instance_id,
                    version,
                    error_code = ?event.error_code,
                    "instance update failed"
                );
                self.activity()
                    .instance_update_failed(group, instance_id, version, now)
                    .await?;
            }
            _ => {}
        }
        Ok(Some(updated.status))
    }
}
