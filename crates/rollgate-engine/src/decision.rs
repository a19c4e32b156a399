//! Check-in decision table.
//!
//! Maps what is known about an instance at check-in time to the single
//! next step the engine takes. Nothing here touches storage; the engine
//! carries the step out.
//!
//! | status                           | target      | behind | step                 |
//! |----------------------------------|-------------|--------|----------------------|
//! | Downloading/Downloaded/Installed | *           | *      | `RejectInFlight`     |
//! | UpdateGranted                    | available   | yes    | `Redeliver`          |
//! | *                                | none        | *      | `NoPackage`          |
//! | *                                | blacklisted | *      | `Blacklisted`        |
//! | *                                | available   | no     | `UpToDate`           |
//! | other                            | available   | yes    | `EvaluatePolicy`     |

use rollgate_state::InstanceStatus;

/// State of the group channel's target package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// No channel, or the channel has no target package.
    Missing,
    /// The target is blacklisted for the channel.
    Blacklisted,
    Available,
}

/// Inputs of one decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckInFacts {
    pub status: InstanceStatus,
    /// The instance has been granted an update before.
    pub had_grant: bool,
    pub target: TargetState,
    /// The instance version is strictly older than the target.
    pub behind_target: bool,
}

/// What the engine does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// An update is being applied; answer "in progress".
    RejectInFlight,
    /// Hand the granted update out again, without policy checks.
    Redeliver,
    /// Nothing to deliver; record the missing package.
    NoPackage,
    /// The target may not go to this channel.
    Blacklisted { complete: bool },
    /// The instance already runs the target or something newer.
    UpToDate { complete: bool },
    /// Run admission control and grant on success.
    EvaluatePolicy,
}

pub fn plan_check_in(facts: &CheckInFacts) -> Step {
    use rollgate_state::InstanceStatus::*;

    if matches!(facts.status, Downloading | Downloaded | Installed) {
        return Step::RejectInFlight;
    }
    if facts.status == UpdateGranted
        && facts.target == TargetState::Available
        && facts.behind_target
    {
        return Step::Redeliver;
    }

    // A previous grant that is still open gets closed out as complete.
    let complete = facts.had_grant && facts.status != Complete;
    match facts.target {
        TargetState::Missing => Step::NoPackage,
        TargetState::Blacklisted => Step::Blacklisted { complete },
        TargetState::Available if !facts.behind_target => Step::UpToDate { complete },
        TargetState::Available => Step::EvaluatePolicy,
    }
}
