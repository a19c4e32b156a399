//! One normalized client check-in: progress events plus an optional
//! update check, answered in a single response.
//!
//! The protocol layer decodes its wire format into a [`CheckInRequest`]
//! and encodes the [`CheckInResponse`] back; neither side of that lives
//! here.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use rollgate_state::{Arch, GroupId, InstanceApplication, InstanceStatus};

use crate::engine::{Engine, InstanceRegistration, ProgressEvent};
use crate::error::{Denial, EngineError, EngineResult};
use crate::floors::{ManifestEntry, ManifestMode};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInRequest {
    pub instance_id: String,
    #[serde(default)]
    pub alias: Option<String>,
    pub ip: String,
    pub version: String,
    /// Application id, product id or braced UUID.
    pub app_id: String,
    /// Track name, or a group id.
    pub track: String,
    /// Architecture as reported by the client; empty means `all`.
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub events: Vec<ProgressEvent>,
    #[serde(default = "default_true")]
    pub update_check: bool,
    /// The client accepts floors and target in one response.
    #[serde(default)]
    pub multi_manifest: bool,
}

/// What happened to one reported event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventAck {
    pub event_type: u32,
    pub event_result: u32,
    /// Status the instance moved to, if any.
    pub status: Option<InstanceStatus>,
    /// Why the event was not applied.
    pub rejected: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    NotRequested,
    NoUpdate {
        reason: Denial,
    },
    Update {
        manifest: Vec<ManifestEntry>,
        has_more_floors: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckInResponse {
    pub app_id: String,
    pub group_id: GroupId,
    pub events: Vec<EventAck>,
    pub update: UpdateOutcome,
    /// The instance as stored after this check-in.
    pub instance: InstanceApplication,
}

impl Engine {
    /// Process a check-in end to end.
    ///
    /// Events are applied before the update decision, so an instance that
    /// reports completion and asks for updates in the same request is
    /// judged on its new status. Rejected events and denied updates are
    /// part of the response; only invalid requests and storage failures
    /// are errors.
    pub async fn process_check_in(&self, req: &CheckInRequest) -> EngineResult<CheckInResponse> {
        let arch: Arch = req
            .arch
            .parse()
            .map_err(|_| EngineError::InvalidArch(req.arch.clone()))?;
        let app_id = self
            .cache()
            .resolve_app_id(self.store(), &req.app_id)
            .await?
            .ok_or(EngineError::InvalidApplicationOrGroup)?;
        let group_id = self
            .cache()
            .resolve_group_id(self.store(), &app_id, &req.track, arch)
            .await?
            .ok_or(EngineError::InvalidApplicationOrGroup)?;
        let group = match self.store().get_group(&group_id).await? {
            Some(group) if group.application_id == app_id => group,
            _ => return Err(EngineError::InvalidApplicationOrGroup),
        };

        let registration = InstanceRegistration {
            instance_id: req.instance_id.clone(),
            alias: req.alias.clone(),
            ip: req.ip.clone(),
            version: req.version.clone(),
            app_id: app_id.clone(),
            group_id: group.id.clone(),
        };
        self.upsert_check_in(&registration, &app_id, &group).await?;

        let mut events = Vec::with_capacity(req.events.len());
        for event in &req.events {
            let mut ack = EventAck {
                event_type: event.event_type,
                event_result: event.event_result,
                status: None,
                rejected: None,
            };
            match self.apply_event(&app_id, &group, &req.instance_id, event).await {
                Ok(status) => ack.status = status,
                Err(err @ EngineError::State(_)) => return Err(err),
                Err(err) => {
                    if err.is_flow_control() {
                        debug!(instance = %req.instance_id, %err, "event not applied");
                    } else {
                        warn!(instance = %req.instance_id, %err, "event rejected");
                    }
                    ack.rejected = Some(err.to_string());
                }
            }
            events.push(ack);
        }

        let update = if req.update_check {
            let mode = if req.multi_manifest {
                ManifestMode::Multi
            } else {
                ManifestMode::Single
            };
            // Events may have moved the rollout flag.
            let group = self.require_group(&group.id).await?;
            match self.decide(&app_id, &group, &req.instance_id, mode).await {
                Ok(plan) => UpdateOutcome::Update {
                    manifest: plan.deliverable(mode).to_vec(),
                    has_more_floors: plan.has_more_floors,
                },
                Err(err) => match err.denial() {
                    Some(reason) => UpdateOutcome::NoUpdate { reason },
                    None => return Err(err),
                },
            }
        } else {
            UpdateOutcome::NotRequested
        };

        let instance = self
            .store()
            .get_instance_application(&req.instance_id, &app_id)
            .await?
            .ok_or_else(|| EngineError::InvalidInstance(req.instance_id.clone()))?;
        Ok(CheckInResponse {
            app_id,
            group_id: group.id,
            events,
            update,
            instance,
        })
    }
}
