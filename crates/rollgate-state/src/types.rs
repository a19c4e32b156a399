//! Domain types for the rollgate update store.
//!
//! These types describe applications, their update channels and
//! packages, the groups that carry rollout policy, and the instances that
//! check in for updates. Cross references are plain ids (a channel names
//! its target package, a package names the channels that blacklist it);
//! nothing embeds its parent. All types are JSON-serialized into redb.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Identifier of an application.
pub type AppId = String;

/// Identifier of a channel.
pub type ChannelId = String;

/// Identifier of a package.
pub type PackageId = String;

/// Identifier of a group.
pub type GroupId = String;

/// Fleet-assigned identifier of an instance.
pub type InstanceId = String;

/// Generate a fresh random identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Team / Application ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub created_at: u64,
}

/// An application whose instances receive updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Application {
    pub id: AppId,
    /// External product identifier (e.g. `io.example.os`) clients may use
    /// instead of the id.
    pub product_id: Option<String>,
    pub name: String,
    pub description: String,
    pub team_id: String,
    pub created_at: u64,
}

// ── Architecture ──────────────────────────────────────────────────

/// CPU architecture of a channel and of the packages it references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    All,
    Amd64,
    Aarch64,
    X86,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::All => "all",
            Arch::Amd64 => "amd64",
            Arch::Aarch64 => "aarch64",
            Arch::X86 => "x86",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an architecture string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownArch(pub String);

impl fmt::Display for UnknownArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown architecture {:?}", self.0)
    }
}

impl std::error::Error for UnknownArch {}

impl FromStr for Arch {
    type Err = UnknownArch;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "" => Ok(Arch::All),
            "amd64" | "x64" | "x86_64" => Ok(Arch::Amd64),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            "x86" | "i686" => Ok(Arch::X86),
            _ => Err(UnknownArch(s.to_string())),
        }
    }
}

// ── Channel ───────────────────────────────────────────────────────

/// A named update stream pointing at a target package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub color: String,
    pub application_id: AppId,
    /// Fixed at creation.
    pub arch: Arch,
    pub package_id: Option<PackageId>,
    pub created_at: u64,
}

// ── Package ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageType {
    PlatformUpdate,
    Container,
    Generic,
}

/// Installer instructions handed to clients along with a platform update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PackageAction {
    pub event: String,
    pub sha256: String,
    pub needs_admin: bool,
    pub is_delta: bool,
    pub disable_payload_backoff: bool,
    pub deadline: Option<String>,
}

/// An additional payload file shipped with a package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageFile {
    pub name: String,
    pub size: u64,
    pub hash: String,
    pub hash256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Package {
    pub id: PackageId,
    pub application_id: AppId,
    pub version: String,
    pub arch: Arch,
    pub kind: PackageType,
    pub url: String,
    pub filename: String,
    pub description: String,
    pub size: u64,
    pub hash: String,
    pub action: Option<PackageAction>,
    #[serde(default)]
    pub extra_files: Vec<PackageFile>,
    /// Channels that must never receive this package.
    #[serde(default)]
    pub channels_blacklist: Vec<ChannelId>,
    pub created_at: u64,
}

impl Package {
    pub fn is_blacklisted_for(&self, channel_id: &str) -> bool {
        self.channels_blacklist.iter().any(|c| c == channel_id)
    }
}

/// Marks `package_id` as a mandatory stop on `channel_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelPackageFloor {
    pub channel_id: ChannelId,
    pub package_id: PackageId,
    pub reason: String,
    pub created_at: u64,
}

impl ChannelPackageFloor {
    pub fn table_key(&self) -> String {
        floor_key(&self.channel_id, &self.package_id)
    }
}

/// Composite key for the floors table.
pub fn floor_key(channel_id: &str, package_id: &str) -> String {
    format!("{channel_id}:{package_id}")
}

/// A floor package together with the reason it was declared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FloorPackage {
    pub package: Package,
    pub reason: String,
}

// ── Group ─────────────────────────────────────────────────────────

/// Rollout throttling knobs of a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RolloutPolicy {
    pub updates_enabled: bool,
    pub safe_mode: bool,
    pub office_hours: bool,
    /// IANA timezone used for office hours (e.g. `Europe/Berlin`).
    pub timezone: Option<String>,
    pub period_interval_secs: u64,
    pub max_updates_per_period: u32,
    pub update_timeout_secs: u64,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            updates_enabled: true,
            safe_mode: true,
            office_hours: false,
            timezone: None,
            period_interval_secs: 15 * 60,
            max_updates_per_period: 2,
            update_timeout_secs: 60 * 60,
        }
    }
}

/// A set of instances sharing a channel and a rollout policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub description: String,
    /// Immutable after creation.
    pub application_id: AppId,
    pub channel_id: Option<ChannelId>,
    pub policy: RolloutPolicy,
    pub rollout_in_progress: bool,
    /// External alias, unique per (application, channel arch).
    pub track: String,
    pub created_at: u64,
}

// ── Instance ──────────────────────────────────────────────────────

/// Curly-brace wrapped pseudo-UUID used by test and synthetic clients.
static SYNTHETIC_INSTANCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\{.{8}-.{4}-.{4}-.{4}-.{12}\}$").expect("static regex")
});

/// True for synthetic instance ids that must not count towards fleet size.
pub fn is_synthetic_instance(instance_id: &str) -> bool {
    SYNTHETIC_INSTANCE.is_match(instance_id)
}

/// A client machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub ip: String,
    pub alias: Option<String>,
    pub created_at: u64,
}

/// Update lifecycle of an instance for one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Undefined,
    UpdateGranted,
    Error,
    Complete,
    Installed,
    Downloaded,
    Downloading,
    OnHold,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 8] = [
        InstanceStatus::Undefined,
        InstanceStatus::UpdateGranted,
        InstanceStatus::Error,
        InstanceStatus::Complete,
        InstanceStatus::Installed,
        InstanceStatus::Downloaded,
        InstanceStatus::Downloading,
        InstanceStatus::OnHold,
    ];

    /// Stable numeric code.
    pub fn code(&self) -> u8 {
        match self {
            InstanceStatus::Undefined => 0,
            InstanceStatus::UpdateGranted => 1,
            InstanceStatus::Error => 2,
            InstanceStatus::Complete => 3,
            InstanceStatus::Installed => 4,
            InstanceStatus::Downloaded => 5,
            InstanceStatus::Downloading => 6,
            InstanceStatus::OnHold => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Whether an instance in this status holds an in-flight update.
    pub fn keeps_update_in_progress(&self) -> bool {
        matches!(
            self,
            InstanceStatus::UpdateGranted
                | InstanceStatus::Downloading
                | InstanceStatus::Downloaded
                | InstanceStatus::Installed
        )
    }

    /// The instance finished an update attempt, for better or worse.
    pub fn is_terminal_attempt(&self) -> bool {
        matches!(self, InstanceStatus::Complete | InstanceStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Undefined => "undefined",
            InstanceStatus::UpdateGranted => "update_granted",
            InstanceStatus::Error => "error",
            InstanceStatus::Complete => "complete",
            InstanceStatus::Installed => "installed",
            InstanceStatus::Downloaded => "downloaded",
            InstanceStatus::Downloading => "downloading",
            InstanceStatus::OnHold => "on_hold",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-application state of an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceApplication {
    pub instance_id: InstanceId,
    pub application_id: AppId,
    pub group_id: GroupId,
    pub version: String,
    pub last_check_at: u64,
    pub last_update_granted_at: Option<u64>,
    /// Version actually handed out by the last grant (a floor or the target).
    pub last_update_version: Option<String>,
    /// Channel target the last grant was made towards.
    #[serde(default)]
    pub last_update_target: Option<String>,
    pub status: InstanceStatus,
    pub update_in_progress: bool,
    pub created_at: u64,
}

impl InstanceApplication {
    /// A fresh row for an instance seen for the first time.
    pub fn first_seen(
        instance_id: &str,
        application_id: &str,
        group_id: &str,
        version: &str,
        now: u64,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            application_id: application_id.to_string(),
            group_id: group_id.to_string(),
            version: version.to_string(),
            last_check_at: now,
            last_update_granted_at: None,
            last_update_version: None,
            last_update_target: None,
            status: InstanceStatus::Undefined,
            update_in_progress: false,
            created_at: now,
        }
    }

    /// The target the last grant counts towards. Rows written before
    /// targets were tracked fall back to the delivered version.
    pub fn granted_target(&self) -> Option<&str> {
        self.last_update_target
            .as_deref()
            .or(self.last_update_version.as_deref())
    }

    pub fn table_key(&self) -> String {
        instance_app_key(&self.instance_id, &self.application_id)
    }
}

/// Composite key for the instance-applications table.
pub fn instance_app_key(instance_id: &str, application_id: &str) -> String {
    format!("{application_id}:{instance_id}")
}

/// An instance together with its state for one application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub instance: Instance,
    pub application: InstanceApplication,
}

/// One row per status transition, never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceStatusHistoryEntry {
    pub instance_id: InstanceId,
    pub application_id: AppId,
    pub group_id: GroupId,
    pub status: InstanceStatus,
    pub version: String,
    pub created_at: u64,
    pub error_code: Option<String>,
}

/// One check-in applied to an instance-application row.
///
/// Only the reported version, the check time and the group are touched;
/// status and grant fields belong to transitions and grants.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckIn {
    pub instance_id: InstanceId,
    pub application_id: AppId,
    pub group_id: GroupId,
    pub version: String,
    pub at: u64,
}

/// A requested status change, applied atomically by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTransition {
    pub instance_id: InstanceId,
    pub application_id: AppId,
    pub status: InstanceStatus,
    pub error_code: Option<String>,
    pub at: u64,
}

// ── Activity ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityClass {
    PackageNotFound,
    RolloutStarted,
    RolloutFinished,
    RolloutFailed,
    InstanceUpdateFailed,
    ChannelPackageUpdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySeverity {
    Success,
    Info,
    Warning,
    Error,
}

/// Coarse event log entry shown to operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEntry {
    pub application_id: AppId,
    pub group_id: Option<GroupId>,
    pub channel_id: Option<ChannelId>,
    pub instance_id: Option<InstanceId>,
    pub class: ActivityClass,
    pub severity: ActivitySeverity,
    pub version: String,
    pub created_at: u64,
}

impl ActivityEntry {
    /// Two entries describe the same milestone.
    pub fn same_milestone(&self, other: &ActivityEntry) -> bool {
        self.class == other.class
            && self.severity == other.severity
            && self.version == other.version
            && self.application_id == other.application_id
            && self.group_id == other.group_id
    }
}

// ── Aggregates ────────────────────────────────────────────────────

/// Rollout counters for a group, evaluated against one target version.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdatesStats {
    pub total_instances: u64,
    pub updates_to_current_version_granted: u64,
    pub updates_to_current_version_attempted: u64,
    pub updates_to_current_version_succeeded: u64,
    pub updates_to_current_version_failed: u64,
    pub updates_granted_in_last_period: u64,
    pub updates_in_progress: u64,
    pub updates_timed_out: u64,
}

/// Inputs of an `UpdatesStats` computation.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatesStatsQuery {
    pub group_id: GroupId,
    pub version: String,
    pub period_interval_secs: u64,
    pub update_timeout_secs: u64,
    pub now: u64,
}

/// Instance counts per status.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstancesStatusStats {
    pub total: u64,
    pub undefined: u64,
    pub update_granted: u64,
    pub error: u64,
    pub complete: u64,
    pub installed: u64,
    pub downloaded: u64,
    pub downloading: u64,
    pub on_hold: u64,
}

impl InstancesStatusStats {
    pub fn record(&mut self, status: InstanceStatus) {
        self.total += 1;
        let slot = match status {
            InstanceStatus::Undefined => &mut self.undefined,
            InstanceStatus::UpdateGranted => &mut self.update_granted,
            InstanceStatus::Error => &mut self.error,
            InstanceStatus::Complete => &mut self.complete,
            InstanceStatus::Installed => &mut self.installed,
            InstanceStatus::Downloaded => &mut self.downloaded,
            InstanceStatus::Downloading => &mut self.downloading,
            InstanceStatus::OnHold => &mut self.on_hold,
        };
        *slot += 1;
    }
}

/// Share of a group's instances running one version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionBreakdownEntry {
    pub version: String,
    pub instances: u64,
    pub percentage: f64,
}

/// Bucket start (unix seconds) → version → instance count.
pub type VersionCountTimeline = BTreeMap<u64, HashMap<String, u64>>;

/// Bucket start (unix seconds) → status → version → transition count.
pub type StatusCountTimeline = BTreeMap<u64, HashMap<InstanceStatus, HashMap<String, u64>>>;
