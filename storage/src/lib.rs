//! Storage layer: environment ownership, typed CRUD, tiers, and lifecycle.
//!
//! This crate is the only component that opens KV environments. The
//! [`Coordinator`] owns the full database set and its temperature tiers;
//! each tier is a [`StorageManager`] that performs typed CRUD with index
//! maintenance in the same transaction and emits a [`MutationEvent`] on
//! every commit.
//!
//! Consumers up-stack (embedding, weaver, query) receive borrowed store
//! handles, never paths.

pub mod coordinator;
pub mod database_type;
pub mod events;
pub mod store;
pub mod time_scope;

pub use coordinator::Coordinator;
pub use database_type::{
    bucket_for_timestamp, DatabaseKind, DurabilityClass, TemperatureTier, TierAddress,
};
pub use events::{EventBus, MutationEvent, MutationKind};
pub use store::StorageManager;
pub use time_scope::TimeScope;
