//! Declarative fleet manifests.
//!
//! A manifest lists the catalog an operator wants to exist: teams,
//! applications, channels, packages, groups and channel floors. Applying
//! it creates what is missing and updates what already exists (matched by
//! id), going through the same engine calls and integrity checks as any
//! other catalog write.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use rollgate_engine::{Engine, NewApplication, NewChannel, NewGroup, NewPackage};
use rollgate_state::{Application, Channel, Group, Package, Team};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetManifest {
    pub teams: Vec<TeamSpec>,
    pub applications: Vec<NewApplication>,
    pub channels: Vec<NewChannel>,
    pub packages: Vec<NewPackage>,
    pub groups: Vec<NewGroup>,
    pub floors: Vec<FloorSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamSpec {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloorSpec {
    pub channel_id: String,
    pub package_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
}

impl ApplySummary {
    fn record(&mut self, existed: bool) {
        if existed {
            self.updated += 1;
        } else {
            self.created += 1;
        }
    }
}

impl FleetManifest {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read manifest {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parse manifest {}", path.display()))
    }

    /// Bring the catalog in line with this manifest.
    ///
    /// Channels are written without their target first; targets are set
    /// once every package exists, and groups come last so their channels
    /// are in place. The first rejected write aborts the run.
    pub async fn apply(&self, engine: &Engine) -> anyhow::Result<ApplySummary> {
        let mut summary = ApplySummary::default();
        let store = engine.store();

        for team in &self.teams {
            match store.get_team(&team.id).await? {
                Some(existing) => {
                    if existing.name != team.name {
                        engine
                            .update_team(&Team {
                                name: team.name.clone(),
                                ..existing
                            })
                            .await
                            .with_context(|| format!("team {}", team.id))?;
                    }
                    summary.record(true);
                }
                None => {
                    engine
                        .create_team(Some(team.id.clone()), &team.name)
                        .await
                        .with_context(|| format!("team {}", team.id))?;
                    summary.record(false);
                }
            }
        }

        for app in &self.applications {
            let existing = match &app.id {
                Some(id) => store.get_application(id).await?,
                None => None,
            };
            match existing {
                Some(existing) => {
                    engine
                        .update_application(&Application {
                            id: existing.id,
                            product_id: app.product_id.clone(),
                            name: app.name.clone(),
                            description: app.description.clone(),
                            team_id: app.team_id.clone(),
                            created_at: existing.created_at,
                        })
                        .await
                        .with_context(|| format!("application {}", app.name))?;
                    summary.record(true);
                }
                None => {
                    engine
                        .create_application(app.clone())
                        .await
                        .with_context(|| format!("application {}", app.name))?;
                    summary.record(false);
                }
            }
        }

        let mut channel_ids = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let existing = match &channel.id {
                Some(id) => store.get_channel(id).await?,
                None => None,
            };
            let written = match existing {
                Some(existing) => {
                    engine
                        .update_channel(&Channel {
                            id: existing.id,
                            name: channel.name.clone(),
                            color: channel.color.clone(),
                            application_id: channel.application_id.clone(),
                            arch: channel.arch,
                            package_id: existing.package_id,
                            created_at: existing.created_at,
                        })
                        .await
                        .with_context(|| format!("channel {}", channel.name))?;
                    summary.record(true);
                    channel.id.clone()
                }
                None => {
                    let created = engine
                        .create_channel(NewChannel {
                            package_id: None,
                            ..channel.clone()
                        })
                        .await
                        .with_context(|| format!("channel {}", channel.name))?;
                    summary.record(false);
                    Some(created.id)
                }
            };
            channel_ids.push(written);
        }

        for package in &self.packages {
            let label = package.id.as_deref().unwrap_or(&package.version);
            let existing = match &package.id {
                Some(id) => store.get_package(id).await?,
                None => None,
            };
            match existing {
                Some(existing) => {
                    engine
                        .update_package(&package_from(package, existing))
                        .await
                        .with_context(|| format!("package {label}"))?;
                    summary.record(true);
                }
                None => {
                    engine
                        .create_package(package.clone())
                        .await
                        .with_context(|| format!("package {label}"))?;
                    summary.record(false);
                }
            }
        }

        for (spec, id) in self.channels.iter().zip(channel_ids) {
            let (Some(id), Some(target)) = (id, spec.package_id.as_deref()) else {
                continue;
            };
            let Some(mut channel) = store.get_channel(&id).await? else {
                continue;
            };
            if channel.package_id.as_deref() == Some(target) {
                continue;
            }
            channel.package_id = Some(target.to_string());
            engine
                .update_channel(&channel)
                .await
                .with_context(|| format!("target of channel {id}"))?;
            debug!(channel = %id, package = target, "channel target set");
        }

        for floor in &self.floors {
            let existed = store
                .get_floor(&floor.channel_id, &floor.package_id)
                .await?
                .is_some();
            engine
                .add_channel_package_floor(&floor.channel_id, &floor.package_id, &floor.reason)
                .await
                .with_context(|| format!("floor {} on {}", floor.package_id, floor.channel_id))?;
            summary.record(existed);
        }

        for group in &self.groups {
            let existing = match &group.id {
                Some(id) => store.get_group(id).await?,
                None => None,
            };
            match existing {
                Some(existing) => {
                    engine
                        .update_group(&Group {
                            name: group.name.clone(),
                            description: group.description.clone(),
                            application_id: group.application_id.clone(),
                            channel_id: group.channel_id.clone(),
                            policy: group.policy.clone(),
                            track: group.track.clone().unwrap_or_default(),
                            ..existing
                        })
                        .await
                        .with_context(|| format!("group {}", group.name))?;
                    summary.record(true);
                }
                None => {
                    engine
                        .create_group(group.clone())
                        .await
                        .with_context(|| format!("group {}", group.name))?;
                    summary.record(false);
                }
            }
        }

        info!(
            created = summary.created,
            updated = summary.updated,
            "manifest applied"
        );
        Ok(summary)
    }
}

fn package_from(spec: &NewPackage, existing: Package) -> Package {
    Package {
        id: existing.id,
        application_id: spec.application_id.clone(),
        version: spec.version.clone(),
        arch: spec.arch,
        kind: spec.kind,
        url: spec.url.clone(),
        filename: spec.filename.clone(),
        description: spec.description.clone(),
        size: spec.size,
        hash: spec.hash.clone(),
        action: spec.action.clone(),
        extra_files: spec.extra_files.clone(),
        channels_blacklist: spec.channels_blacklist.clone(),
        created_at: existing.created_at,
    }
}
