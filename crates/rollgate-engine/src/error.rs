//! Engine error types.
//!
//! Three families share one closed enum: caller mistakes (validation),
//! expected "no update for you" answers ([`Denial`]), and integrity
//! conflicts that reject a catalog mutation. Storage failures are wrapped
//! as-is.

use serde::Serialize;
use thiserror::Error;

/// Flow-control outcomes of a check-in or event.
///
/// These are normal answers, not failures; the protocol layer turns them
/// into its own "no update" response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Denial {
    #[error("updates are disabled for this group")]
    UpdatesDisabled,

    #[error("max updates per period limit reached")]
    MaxUpdatesPerPeriodLimitReached,

    #[error("max concurrent updates limit reached")]
    MaxConcurrentUpdatesLimitReached,

    #[error("max timed out updates limit reached")]
    MaxTimedOutUpdatesLimitReached,

    #[error("an update is already in progress on this instance")]
    UpdateInProgressOnInstance,

    #[error("no update package available")]
    NoUpdatePackageAvailable,

    #[error("no package configured for the group's channel")]
    NoPackageFound,

    #[error("no update in progress on this instance")]
    NoUpdateInProgress,
}

/// Errors returned by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    // ── Validation ─────────────────────────────────────────────────
    #[error("invalid version {0:?}")]
    InvalidSemver(String),

    #[error("invalid architecture {0:?}")]
    InvalidArch(String),

    #[error("architecture mismatch: channel is {channel}, package is {package}")]
    ArchMismatch { channel: String, package: String },

    #[error("invalid instance id {0:?}")]
    InvalidInstanceId(String),

    #[error("invalid ip address {0:?}")]
    InvalidIp(String),

    #[error("invalid application or group")]
    InvalidApplicationOrGroup,

    #[error("invalid application {0:?}")]
    InvalidApplication(String),

    #[error("invalid channel {0:?}")]
    InvalidChannel(String),

    #[error("invalid package {0:?}")]
    InvalidPackage(String),

    #[error("invalid group {0:?}")]
    InvalidGroup(String),

    #[error("invalid team {0:?}")]
    InvalidTeam(String),

    #[error("invalid instance {0:?}")]
    InvalidInstance(String),

    #[error("invalid timezone {0:?}")]
    InvalidTimezone(String),

    #[error("invalid event type {event_type} with result {event_result}")]
    InvalidEventTypeOrResult { event_type: u32, event_result: u32 },

    #[error("unknown stats window {0:?}")]
    InvalidStatsWindow(String),

    // ── Flow control ───────────────────────────────────────────────
    #[error(transparent)]
    Denied(#[from] Denial),

    // ── Conflicts ──────────────────────────────────────────────────
    #[error("package is blacklisted for the channel")]
    BlacklistedPackage,

    #[error("cannot blacklist a channel that targets this package")]
    BlacklistingTargetChannel,

    #[error("package is a floor for the channel and cannot be blacklisted")]
    PackageIsFloor,

    #[error("package belongs to a different application than the channel")]
    ApplicationMismatch,

    // ── Storage ────────────────────────────────────────────────────
    #[error("state store error: {0}")]
    State(#[from] rollgate_state::StateError),
}

impl EngineError {
    /// The flow-control answer carried by this error, if any.
    pub fn denial(&self) -> Option<Denial> {
        match self {
            EngineError::Denied(d) => Some(*d),
            _ => None,
        }
    }

    /// True for expected answers that should not be logged as errors.
    pub fn is_flow_control(&self) -> bool {
        self.denial().is_some()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
