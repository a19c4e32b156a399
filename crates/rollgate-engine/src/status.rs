//! Progress events reported by clients and the statuses they lead to.
//!
//! ```text
//! Undefined ─grant─▶ UpdateGranted ─13─▶ Downloading ─14─▶ Downloaded ─800─▶ Installed ─3/2─▶ Complete
//!                         │                  │                 │                │
//!                         └──────────────────┴──── failed ─────┴────────────────┴──▶ Error
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use rollgate_state::InstanceStatus;

use crate::error::{EngineError, EngineResult};

/// Kind of progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UpdateComplete,
    DownloadStarted,
    DownloadFinished,
    Installed,
}

impl EventType {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            3 => Some(EventType::UpdateComplete),
            13 => Some(EventType::DownloadStarted),
            14 => Some(EventType::DownloadFinished),
            800 => Some(EventType::Installed),
            _ => None,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            EventType::UpdateComplete => 3,
            EventType::DownloadStarted => 13,
            EventType::DownloadFinished => 14,
            EventType::Installed => 800,
        }
    }
}

/// Outcome attached to a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventResult {
    Failed,
    Success,
    SuccessReboot,
}

impl EventResult {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(EventResult::Failed),
            1 => Some(EventResult::Success),
            2 => Some(EventResult::SuccessReboot),
            _ => None,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            EventResult::Failed => 0,
            EventResult::Success => 1,
            EventResult::SuccessReboot => 2,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({})", self.code())
    }
}

/// Status an event moves the instance to.
///
/// `Ok(None)` is a valid event that changes nothing (the intermediate
/// update-complete acknowledgement).
pub fn status_for_event(event_type: u32, event_result: u32) -> EngineResult<Option<InstanceStatus>> {
    let invalid = EngineError::InvalidEventTypeOrResult {
        event_type,
        event_result,
    };
    let (Some(kind), Some(result)) = (
        EventType::from_code(event_type),
        EventResult::from_code(event_result),
    ) else {
        return Err(invalid);
    };

    match (kind, result) {
        (_, EventResult::Failed) => Ok(Some(InstanceStatus::Error)),
        (EventType::DownloadStarted, EventResult::Success) => Ok(Some(InstanceStatus::Downloading)),
        (EventType::DownloadFinished, EventResult::Success) => Ok(Some(InstanceStatus::Downloaded)),
        (EventType::Installed, EventResult::Success) => Ok(Some(InstanceStatus::Installed)),
        (EventType::UpdateComplete, EventResult::SuccessReboot) => Ok(Some(InstanceStatus::Complete)),
        (EventType::UpdateComplete, EventResult::Success) => Ok(None),
        _ => Err(invalid),
    }
}

/// Position along the happy path; `None` off it.
fn progress_rank(status: InstanceStatus) -> Option<u8> {
    match status {
        InstanceStatus::UpdateGranted => Some(1),
        InstanceStatus::Downloading => Some(2),
        InstanceStatus::Downloaded => Some(3),
        InstanceStatus::Installed => Some(4),
        InstanceStatus::Complete => Some(5),
        _ => None,
    }
}

/// Whether moving from `current` to `next` would go back along the path.
///
/// Errors are never regressions; an update can fail at any stage.
pub fn is_regression(current: InstanceStatus, next: InstanceStatus) -> bool {
    match (progress_rank(current), progress_rank(next)) {
        (Some(from), Some(to)) => to < from,
        _ => false,
    }
}
