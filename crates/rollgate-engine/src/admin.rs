//! Catalog administration: teams, applications, channels, packages,
//! groups and channel floors.
//!
//! Every write checks the relationships it touches before anything is
//! stored, so a rejected mutation leaves no partial state. Writes to
//! applications and groups invalidate the identity cache.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use rollgate_state::{
    AppId, Application, Arch, Channel, ChannelPackageFloor, FloorPackage, Group, Package,
    PackageAction, PackageFile, PackageType, RolloutPolicy, Team, new_id,
};

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::floors::{self, RequiredFloors};
use crate::policy::parse_timezone;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewApplication {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub team_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChannel {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub color: String,
    pub application_id: AppId,
    pub arch: Arch,
    #[serde(default)]
    pub package_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPackage {
    #[serde(default)]
    pub id: Option<String>,
    pub application_id: AppId,
    pub version: String,
    pub arch: Arch,
    pub kind: PackageType,
    pub url: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub action: Option<PackageAction>,
    #[serde(default)]
    pub extra_files: Vec<PackageFile>,
    #[serde(default)]
    pub channels_blacklist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGroup {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub application_id: AppId,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub policy: RolloutPolicy,
    /// Defaults to the group id.
    #[serde(default)]
    pub track: Option<String>,
}

impl Engine {
    // ── Teams / Applications ───────────────────────────────────────

    pub async fn create_team(&self, id: Option<String>, name: &str) -> EngineResult<Team> {
        let team = Team {
            id: id.unwrap_or_else(new_id),
            name: name.to_string(),
            created_at: self.now(),
        };
        self.store().put_team(&team).await?;
        Ok(team)
    }

    pub async fn update_team(&self, team: &Team) -> EngineResult<Team> {
        let existing = self
            .store()
            .get_team(&team.id)
            .await?
            .ok_or_else(|| EngineError::InvalidTeam(team.id.clone()))?;
        let updated = Team {
            created_at: existing.created_at,
            ..team.clone()
        };
        self.store().put_team(&updated).await?;
        Ok(updated)
    }

    async fn require_application(&self, id: &str) -> EngineResult<Application> {
        self.store()
            .get_application(id)
            .await?
            .ok_or_else(|| EngineError::InvalidApplication(id.to_string()))
    }

    pub async fn create_application(&self, new: NewApplication) -> EngineResult<Application> {
        if self.store().get_team(&new.team_id).await?.is_none() {
            return Err(EngineError::InvalidTeam(new.team_id));
        }
        let app = Application {
            id: new.id.unwrap_or_else(new_id),
            product_id: new.product_id,
            name: new.name,
            description: new.description,
            team_id: new.team_id,
            created_at: self.now(),
        };
        self.store().put_application(&app).await?;
        self.cache().invalidate_apps().await;
        info!(app = %app.id, name = %app.name, "application created");
        Ok(app)
    }

    pub async fn update_application(&self, app: &Application) -> EngineResult<Application> {
        let existing = self.require_application(&app.id).await?;
        if self.store().get_team(&app.team_id).await?.is_none() {
            return Err(EngineError::InvalidTeam(app.team_id.clone()));
        }
        let updated = Application {
            created_at: existing.created_at,
            ..app.clone()
        };
        self.store().put_application(&updated).await?;
        self.cache().invalidate_apps().await;
        Ok(updated)
    }

    pub async fn delete_application(&self, id: &str) -> EngineResult<bool> {
        let deleted = self.store().delete_application(id).await?;
        self.cache().invalidate_apps().await;
        self.cache().invalidate_tracks().await;
        Ok(deleted)
    }

    pub async fn list_applications(&self) -> EngineResult<Vec<Application>> {
        Ok(self.store().list_applications().await?)
    }

    // ── Channels ───────────────────────────────────────────────────

    /// Check that `package_id` may be the target of a channel.
    async fn check_channel_target(
        &self,
        channel_id: &str,
        app_id: &str,
        arch: Arch,
        package_id: &str,
    ) -> EngineResult<Package> {
        let package = self.require_package(package_id).await?;
        check_same_application(app_id, &package)?;
        check_arch(arch, &package)?;
        if package.is_blacklisted_for(channel_id) {
            return Err(EngineError::BlacklistedPackage);
        }
        Ok(package)
    }

    pub async fn create_channel(&self, new: NewChannel) -> EngineResult<Channel> {
        self.require_application(&new.application_id).await?;
        let id = new.id.unwrap_or_else(new_id);
        if let Some(package_id) = &new.package_id {
            self.check_channel_target(&id, &new.application_id, new.arch, package_id)
                .await?;
        }
        let channel = Channel {
            id,
            name: new.name,
            color: new.color,
            application_id: new.application_id,
            arch: new.arch,
            package_id: new.package_id,
            created_at: self.now(),
        };
        self.store().put_channel(&channel).await?;
        info!(channel = %channel.id, arch = %channel.arch, "channel created");
        Ok(channel)
    }

    /// Update a channel. Its application and architecture are fixed.
    pub async fn update_channel(&self, channel: &Channel) -> EngineResult<Channel> {
        let existing = self.require_channel(&channel.id).await?;
        if channel.application_id != existing.application_id {
            return Err(EngineError::ApplicationMismatch);
        }
        if channel.arch != existing.arch {
            return Err(EngineError::InvalidArch(channel.arch.to_string()));
        }
        let target = match &channel.package_id {
            Some(package_id) => Some(
                self.check_channel_target(
                    &channel.id,
                    &channel.application_id,
                    channel.arch,
                    package_id,
                )
                .await?,
            ),
            None => None,
        };

        let updated = Channel {
            created_at: existing.created_at,
            ..channel.clone()
        };
        self.store().put_channel(&updated).await?;

        if let Some(package) = target.filter(|_| existing.package_id != updated.package_id) {
            info!(channel = %updated.id, version = %package.version, "channel target updated");
            self.activity()
                .channel_package_updated(&updated.application_id, &updated.id, &package.version, self.now())
                .await?;
        }
        Ok(updated)
    }

    /// Delete a channel together with its floors; groups on it are detached.
    pub async fn delete_channel(&self, id: &str) -> EngineResult<bool> {
        let Some(channel) = self.store().get_channel(id).await? else {
            return Ok(false);
        };
        for floor in self.store().list_all_channel_floors(id).await? {
            self.store().delete_floor(id, &floor.package.id).await?;
        }
        for mut group in self.store().list_groups(Some(channel.application_id.as_str())).await? {
            if group.channel_id.as_deref() == Some(id) {
                group.channel_id = None;
                self.store().put_group(&group).await?;
            }
        }
        let deleted = self.store().delete_channel(id).await?;
        self.cache().invalidate_tracks().await;
        Ok(deleted)
    }

    pub async fn list_channels(&self, app_id: &str) -> EngineResult<Vec<Channel>> {
        Ok(self.store().list_channels(app_id).await?)
    }

    // ── Packages ───────────────────────────────────────────────────

    /// Check a package's blacklist against the channels it names.
    async fn check_blacklist(&self, package: &Package) -> EngineResult<()> {
        for channel_id in &package.channels_blacklist {
            let channel = self.require_channel(channel_id).await?;
            if channel.application_id != package.application_id {
                return Err(EngineError::InvalidChannel(channel_id.clone()));
            }
            if channel.package_id.as_deref() == Some(package.id.as_str()) {
                return Err(EngineError::BlacklistingTargetChannel);
            }
            if self.store().get_floor(channel_id, &package.id).await?.is_some() {
                return Err(EngineError::PackageIsFloor);
            }
        }
        Ok(())
    }

    /// Check that channels referencing `package` still match its arch.
    async fn check_references(&self, package: &Package) -> EngineResult<()> {
        for channel in self.store().list_channels(&package.application_id).await? {
            if channel.package_id.as_deref() == Some(package.id.as_str()) {
                check_arch(channel.arch, package)?;
            }
        }
        for floor in self.store().list_floors_for_package(&package.id).await? {
            let channel = self.require_channel(&floor.channel_id).await?;
            check_arch(channel.arch, package)?;
        }
        Ok(())
    }

    pub async fn create_package(&self, new: NewPackage) -> EngineResult<Package> {
        self.require_application(&new.application_id).await?;
        validate_package_version(&new.version)?;
        let package = Package {
            id: new.id.unwrap_or_else(new_id),
            application_id: new.application_id,
            version: new.version,
            arch: new.arch,
            kind: new.kind,
            url: new.url,
            filename: new.filename,
            description: new.description,
            size: new.size,
            hash: new.hash,
            action: new.action,
            extra_files: new.extra_files,
            channels_blacklist: new.channels_blacklist,
            created_at: self.now(),
        };
        self.check_blacklist(&package).await?;
        self.store().put_package(&package).await?;
        info!(package = %package.id, version = %package.version, arch = %package.arch, "package created");
        Ok(package)
    }

    /// Update a package. Its application is fixed.
    pub async fn update_package(&self, package: &Package) -> EngineResult<Package> {
        let existing = self.require_package(&package.id).await?;
        if package.application_id != existing.application_id {
            return Err(EngineError::ApplicationMismatch);
        }
        validate_package_version(&package.version)?;
        self.check_blacklist(package).await?;
        self.check_references(package).await?;
        let updated = Package {
            created_at: existing.created_at,
            ..package.clone()
        };
        self.store().put_package(&updated).await?;
        Ok(updated)
    }

    /// Delete a package, its floors, and any channel targets pointing at it.
    pub async fn delete_package(&self, id: &str) -> EngineResult<bool> {
        let Some(package) = self.store().get_package(id).await? else {
            return Ok(false);
        };
        for floor in self.store().list_floors_for_package(id).await? {
            self.store().delete_floor(&floor.channel_id, id).await?;
        }
        for mut channel in self.store().list_channels(&package.application_id).await? {
            if channel.package_id.as_deref() == Some(id) {
                channel.package_id = None;
                self.store().put_channel(&channel).await?;
                debug!(channel = %channel.id, "channel target cleared");
            }
        }
        Ok(self.store().delete_package(id).await?)
    }

    pub async fn list_packages(&self, app_id: &str) -> EngineResult<Vec<Package>> {
        Ok(self.store().list_packages(app_id).await?)
    }

    // ── Groups ─────────────────────────────────────────────────────

    async fn check_group_refs(
        &self,
        app_id: &str,
        channel_id: Option<&str>,
        policy: &RolloutPolicy,
    ) -> EngineResult<()> {
        if let Some(channel_id) = channel_id {
            let channel = self.require_channel(channel_id).await?;
            if channel.application_id != app_id {
                return Err(EngineError::InvalidChannel(channel_id.to_string()));
            }
        }
        if let Some(tz) = policy.timezone.as_deref() {
            parse_timezone(Some(tz))?;
        }
        Ok(())
    }

    pub async fn create_group(&self, new: NewGroup) -> EngineResult<Group> {
        self.require_application(&new.application_id).await?;
        self.check_group_refs(&new.application_id, new.channel_id.as_deref(), &new.policy)
            .await?;
        let id = new.id.unwrap_or_else(new_id);
        let track = new
            .track
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| id.clone());
        let group = Group {
            id,
            name: new.name,
            description: new.description,
            application_id: new.application_id,
            channel_id: new.channel_id,
            policy: new.policy,
            rollout_in_progress: false,
            track,
            created_at: self.now(),
        };
        self.store().put_group(&group).await?;
        self.cache().invalidate_tracks().await;
        info!(group = %group.id, track = %group.track, "group created");
        Ok(group)
    }

    /// Update a group. The application, creation time and rollout flag
    /// are kept from the stored row.
    pub async fn update_group(&self, group: &Group) -> EngineResult<Group> {
        let existing = self.require_group(&group.id).await?;
        if group.application_id != existing.application_id {
            return Err(EngineError::ApplicationMismatch);
        }
        self.check_group_refs(&group.application_id, group.channel_id.as_deref(), &group.policy)
            .await?;
        let track = if group.track.trim().is_empty() {
            group.id.clone()
        } else {
            group.track.clone()
        };
        let updated = Group {
            track,
            rollout_in_progress: existing.rollout_in_progress,
            created_at: existing.created_at,
            ..group.clone()
        };
        self.store().put_group(&updated).await?;
        self.cache().invalidate_tracks().await;
        Ok(updated)
    }

    pub async fn delete_group(&self, id: &str) -> EngineResult<bool> {
        let deleted = self.store().delete_group(id).await?;
        self.cache().invalidate_tracks().await;
        Ok(deleted)
    }

    pub async fn get_group(&self, id: &str) -> EngineResult<Option<Group>> {
        Ok(self.store().get_group(id).await?)
    }

    pub async fn list_groups(&self, app_id: &str) -> EngineResult<Vec<Group>> {
        Ok(self.store().list_groups(Some(app_id)).await?)
    }

    // ── Floors ─────────────────────────────────────────────────────

    /// Make `package_id` a mandatory stop on `channel_id`.
    pub async fn add_channel_package_floor(
        &self,
        channel_id: &str,
        package_id: &str,
        reason: &str,
    ) -> EngineResult<ChannelPackageFloor> {
        let channel = self.require_channel(channel_id).await?;
        let package = self.require_package(package_id).await?;
        check_same_application(&channel.application_id, &package)?;
        check_arch(channel.arch, &package)?;
        if package.is_blacklisted_for(channel_id) {
            return Err(EngineError::BlacklistedPackage);
        }
        validate_package_version(&package.version)?;

        let floor = ChannelPackageFloor {
            channel_id: channel_id.to_string(),
            package_id: package_id.to_string(),
            reason: reason.to_string(),
            created_at: self.now(),
        };
        self.store().put_floor(&floor).await?;
        info!(channel = %channel_id, package = %package_id, version = %package.version, "floor added");
        Ok(floor)
    }

    pub async fn remove_channel_package_floor(
        &self,
        channel_id: &str,
        package_id: &str,
    ) -> EngineResult<bool> {
        let removed = self.store().delete_floor(channel_id, package_id).await?;
        if removed {
            info!(channel = %channel_id, package = %package_id, "floor removed");
        }
        Ok(removed)
    }

    /// All floors of a channel, ascending by version.
    pub async fn list_channel_floors(&self, channel_id: &str) -> EngineResult<Vec<FloorPackage>> {
        self.require_channel(channel_id).await?;
        Ok(self.store().list_all_channel_floors(channel_id).await?)
    }

    /// Floors an instance on `channel_id` at `instance_version` must pass.
    pub async fn required_floors(
        &self,
        channel_id: &str,
        instance_version: &str,
    ) -> EngineResult<RequiredFloors> {
        let channel = self.require_channel(channel_id).await?;
        floors::required_floors(
            self.store(),
            &channel,
            instance_version,
            self.config().max_floors_per_response,
        )
        .await
    }
}

fn check_same_application(app_id: &str, package: &Package) -> EngineResult<()> {
    if package.application_id != app_id {
        return Err(EngineError::ApplicationMismatch);
    }
    Ok(())
}

fn check_arch(channel_arch: Arch, package: &Package) -> EngineResult<()> {
    if channel_arch != package.arch {
        return Err(EngineError::ArchMismatch {
            channel: channel_arch.to_string(),
            package: package.arch.to_string(),
        });
    }
    Ok(())
}

fn validate_package_version(version: &str) -> EngineResult<()> {
    rollgate_state::Version::parse(version)
        .map(|_| ())
        .map_err(|_| EngineError::InvalidSemver(version.to_string()))
}
