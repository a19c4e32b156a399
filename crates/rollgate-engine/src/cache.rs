//! Identity cache: external identifiers to internal ids.
//!
//! Clients name their application by product id or by a brace-wrapped
//! UUID, and their group by a track name scoped to the application and the
//! channel architecture. Both indexes are rebuilt from the store on the
//! first lookup after an invalidation and then served from memory.
//!
//! A published snapshot is never mutated: writers swap the whole `Arc` (or
//! clear it), so readers holding an older snapshot keep a consistent view.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use rollgate_state::{AppId, Arch, Group, GroupId, StateResult, UpdateStore};

/// Lookup key of the track index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackKey {
    pub app_id: AppId,
    pub track: String,
    pub arch: Arch,
}

type AppIndex = HashMap<String, AppId>;
type TrackIndex = HashMap<TrackKey, GroupId>;

/// Lazily rebuilt application and track indexes.
#[derive(Default)]
pub struct IdentityCache {
    apps: RwLock<Option<Arc<AppIndex>>>,
    tracks: RwLock<Option<Arc<TrackIndex>>>,
}

/// Strip the decorations clients put around identifiers.
fn normalize(external: &str) -> &str {
    external
        .trim()
        .trim_matches(|c| c == '{' || c == '}' || c == '"' || c == '\'')
}

/// Canonical form of a UUID-shaped identifier.
pub fn canonical_uuid(id: &str) -> Option<String> {
    uuid::Uuid::parse_str(normalize(id))
        .ok()
        .map(|u| u.hyphenated().to_string())
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the application index; the next lookup rebuilds it.
    pub async fn invalidate_apps(&self) {
        *self.apps.write().await = None;
        debug!("application id cache invalidated");
    }

    /// Drop the track index; the next lookup rebuilds it.
    pub async fn invalidate_tracks(&self) {
        *self.tracks.write().await = None;
        debug!("track cache invalidated");
    }

    async fn app_snapshot(&self, store: &dyn UpdateStore) -> StateResult<Arc<AppIndex>> {
        if let Some(snapshot) = self.apps.read().await.as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let mut slot = self.apps.write().await;
        // Another task may have rebuilt while we waited for the lock.
        if let Some(snapshot) = slot.as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let mut index = AppIndex::new();
        for app in store.list_applications().await? {
            if let Some(product_id) = &app.product_id {
                index.insert(product_id.clone(), app.id.clone());
            }
            index.insert(app.id.clone(), app.id);
        }
        let snapshot = Arc::new(index);
        *slot = Some(Arc::clone(&snapshot));
        debug!(entries = snapshot.len(), "application id cache rebuilt");
        Ok(snapshot)
    }

    async fn track_snapshot(&self, store: &dyn UpdateStore) -> StateResult<Arc<TrackIndex>> {
        if let Some(snapshot) = self.tracks.read().await.as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let mut slot = self.tracks.write().await;
        if let Some(snapshot) = slot.as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let snapshot = Arc::new(build_track_index(store).await?);
        *slot = Some(Arc::clone(&snapshot));
        debug!(entries = snapshot.len(), "track cache rebuilt");
        Ok(snapshot)
    }

    /// Resolve an external application identifier.
    ///
    /// UUID-shaped identifiers are returned in canonical form without a
    /// lookup; anything else must be a known product id.
    pub async fn resolve_app_id(
        &self,
        store: &dyn UpdateStore,
        external: &str,
    ) -> StateResult<Option<AppId>> {
        if let Some(id) = canonical_uuid(external) {
            return Ok(Some(id));
        }
        let index = self.app_snapshot(store).await?;
        Ok(index.get(normalize(external)).cloned())
    }

    /// Resolve a track of an application on a channel architecture.
    ///
    /// Falls back to treating a UUID-shaped track as a group id; the caller
    /// still has to check that group exists and belongs to the app.
    pub async fn resolve_group_id(
        &self,
        store: &dyn UpdateStore,
        app_id: &str,
        track: &str,
        arch: Arch,
    ) -> StateResult<Option<GroupId>> {
        let index = self.track_snapshot(store).await?;
        let key = TrackKey {
            app_id: app_id.to_string(),
            track: normalize(track).to_string(),
            arch,
        };
        if let Some(id) = index.get(&key) {
            return Ok(Some(id.clone()));
        }
        Ok(canonical_uuid(track))
    }
}

async fn build_track_index(store: &dyn UpdateStore) -> StateResult<TrackIndex> {
    let mut groups: Vec<Group> = store.list_groups(None).await?;
    groups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let app_ids: HashSet<&str> = groups.iter().map(|g| g.application_id.as_str()).collect();
    let mut arch_of_channel: HashMap<String, Arch> = HashMap::new();
    for app_id in app_ids {
        for channel in store.list_channels(app_id).await? {
            arch_of_channel.insert(channel.id, channel.arch);
        }
    }

    let mut index = TrackIndex::new();
    for group in &groups {
        let Some(arch) = group
            .channel_id
            .as_ref()
            .and_then(|c| arch_of_channel.get(c))
            .copied()
        else {
            debug!(group = %group.id, "group has no channel, not addressable by track");
            continue;
        };
        let key = TrackKey {
            app_id: group.application_id.clone(),
            track: group.track.clone(),
            arch,
        };
        // Groups are visited oldest first, so the newest one wins.
        if let Some(previous) = index.insert(key, group.id.clone()) {
            warn!(
                track = %group.track,
                %arch,
                shadowed = %previous,
                winner = %group.id,
                "duplicate track, most recently created group wins"
            );
        }
    }
    Ok(index)
}
