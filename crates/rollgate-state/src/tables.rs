//! redb table definitions for the rollgate update store.
//!
//! Entity tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Append-only logs use a monotonically increasing `u64` key.

use redb::TableDefinition;

/// Teams keyed by `{team_id}`.
pub const TEAMS: TableDefinition<&str, &[u8]> = TableDefinition::new("teams");

/// Applications keyed by `{app_id}`.
pub const APPLICATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("applications");

/// Channels keyed by `{channel_id}`.
pub const CHANNELS: TableDefinition<&str, &[u8]> = TableDefinition::new("channels");

/// Packages keyed by `{package_id}`.
pub const PACKAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("packages");

/// Channel floors keyed by `{channel_id}:{package_id}`.
pub const FLOORS: TableDefinition<&str, &[u8]> = TableDefinition::new("channel_package_floors");

/// Groups keyed by `{group_id}`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Instances keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Per-application instance state keyed by `{app_id}:{instance_id}`.
pub const INSTANCE_APPS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("instance_applications");

/// Status history rows keyed by insertion sequence.
pub const STATUS_HISTORY: TableDefinition<u64, &[u8]> =
    TableDefinition::new("instance_status_history");

/// Activity entries keyed by insertion sequence.
pub const ACTIVITY: TableDefinition<u64, &[u8]> = TableDefinition::new("activity");
