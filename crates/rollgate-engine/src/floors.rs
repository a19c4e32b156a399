//! Floor resolution: mandatory intermediate versions.
//!
//! A floor is a package an instance must install before it may continue
//! past it. Given an instance version and a channel, the resolver returns
//! the floors strictly above the instance and at or below the channel's
//! target, oldest first, bounded per response.
//!
//! ```text
//! instance 500 ── floor 1000 ── floor 2000 ── target 3000
//!                  ^ delivered first to single-manifest clients
//! ```

use serde::Serialize;
use tracing::debug;

use rollgate_state::{Channel, FloorPackage, FloorRange, Package, UpdateStore, Version};

use crate::error::{Denial, EngineError, EngineResult};

/// Floors an instance still has to pass, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequiredFloors {
    pub floors: Vec<FloorPackage>,
    /// More floors exist beyond the ones returned.
    pub has_more: bool,
}

/// Compute the floors an instance at `instance_version` must step through.
///
/// Fetches `cap + 1` rows so that `has_more` needs no separate count.
pub async fn required_floors(
    store: &dyn UpdateStore,
    channel: &Channel,
    instance_version: &str,
    cap: usize,
) -> EngineResult<RequiredFloors> {
    let target_id = channel
        .package_id
        .as_deref()
        .ok_or(EngineError::Denied(Denial::NoPackageFound))?;
    let current = Version::parse(instance_version)
        .map_err(|_| EngineError::InvalidSemver(instance_version.to_string()))?;
    let target = store
        .get_package(target_id)
        .await?
        .ok_or_else(|| EngineError::InvalidPackage(target_id.to_string()))?;
    let target_version = Version::parse(&target.version)
        .map_err(|_| EngineError::InvalidSemver(target.version.clone()))?;

    let cap = cap.max(1);
    let range = FloorRange {
        above: current,
        up_to: target_version,
        limit: cap + 1,
    };
    let mut floors = store.list_channel_floors(&channel.id, &range).await?;
    let has_more = floors.len() > cap;
    floors.truncate(cap);

    debug!(
        channel = %channel.id,
        instance_version,
        floors = floors.len(),
        has_more,
        "resolved required floors"
    );
    Ok(RequiredFloors { floors, has_more })
}

/// One package in an update response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestEntry {
    pub package: Package,
    pub is_floor: bool,
    pub is_target: bool,
    pub floor_reason: Option<String>,
}

/// How many packages the client can take in one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestMode {
    /// One package per check-in.
    #[default]
    Single,
    /// An ordered list of floors followed by the target.
    Multi,
}

/// Packages handed to an instance for one grant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdatePlan {
    entries: Vec<ManifestEntry>,
    pub has_more_floors: bool,
}

impl UpdatePlan {
    /// Floors first, then the target unless it already closes the list or
    /// more floors are pending.
    pub fn new(target: Package, required: RequiredFloors) -> Self {
        let mut entries: Vec<ManifestEntry> = required
            .floors
            .into_iter()
            .map(|floor| ManifestEntry {
                is_target: floor.package.id == target.id,
                is_floor: true,
                floor_reason: Some(floor.reason),
                package: floor.package,
            })
            .collect();

        let target_listed = entries.last().is_some_and(|e| e.is_target);
        if !required.has_more && !target_listed {
            entries.push(ManifestEntry {
                package: target,
                is_floor: false,
                is_target: true,
                floor_reason: None,
            });
        }

        Self {
            entries,
            has_more_floors: required.has_more,
        }
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Entries delivered to a client in the given mode.
    pub fn deliverable(&self, mode: ManifestMode) -> &[ManifestEntry] {
        match mode {
            ManifestMode::Single => &self.entries[..1],
            ManifestMode::Multi => &self.entries,
        }
    }

    /// The package the instance ends up on after this grant.
    pub fn final_package(&self, mode: ManifestMode) -> &Package {
        let delivered = self.deliverable(mode);
        &delivered[delivered.len() - 1].package
    }

    /// The first package to install.
    pub fn next_package(&self) -> &Package {
        &self.entries[0].package
    }
}
