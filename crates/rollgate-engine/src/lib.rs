//! rollgate update decisions: rollout policy, floors and instance status.
//!
//! This crate decides, for each instance check-in, whether an update is
//! granted and which package is handed out, and keeps the derived
//! bookkeeping (instance status, group rollout flag, activity log,
//! identity caches) consistent.
//!
//! # Components
//!
//! - **`cache`**: external app ids and tracks to internal ids
//! - **`floors`**: mandatory intermediate versions, update plans
//! - **`policy`**: admission control (quotas, safe mode, office hours)
//! - **`decision`**: check-in decision table
//! - **`status`**: progress events to instance statuses
//! - **`activity`**: activity log and rollout flag bookkeeping
//! - **`engine`** / **`admin`** / **`checkin`** / **`stats`**: the [`Engine`] facade
//!
//! Storage goes through [`rollgate_state::UpdateStore`].

pub mod activity;
pub mod admin;
pub mod cache;
pub mod checkin;
pub mod clock;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod floors;
pub mod policy;
pub mod stats;
pub mod status;

pub use admin::{NewApplication, NewChannel, NewGroup, NewPackage};
pub use cache::IdentityCache;
pub use checkin::{CheckInRequest, CheckInResponse, EventAck, UpdateOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{Engine, EventReport, InstanceRegistration, ProgressEvent};
pub use error::{Denial, EngineError, EngineResult};
pub use floors::{ManifestEntry, ManifestMode, RequiredFloors, UpdatePlan};
pub use stats::StatsWindow;
pub use status::{EventResult, EventType};
