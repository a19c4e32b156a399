//! rollgate-state — domain model and update store for rollgate.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for applications, channels, packages, floors, groups, instances,
//! the instance status history and the activity log.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{channel_id}:{package_id}`, `{app_id}:{instance_id}`)
//! address relationship rows; append-only logs use sequence keys.
//!
//! The rollout engine talks to storage through the [`UpdateStore`] trait.
//! [`StateStore`] implements it and is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`), so one handle can be shared across async tasks.

pub mod error;
pub mod persistence;
pub mod store;
pub mod tables;
pub mod types;
pub mod version;

pub use error::{StateError, StateResult};
pub use persistence::UpdateStore;
pub use store::{FloorRange, StateStore};
pub use types::*;
pub use version::Version;
