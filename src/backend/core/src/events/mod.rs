//! Event Sourcing System
//!
//! The causal event log is the source of truth for entity state:
//!
//! - **`identifier`**: `tenant.context.aggregate#sequence` identifiers and their generator.
//! - **`event`**: The immutable `CausalEvent` record with its causation metadata.
//! - **`store`**: The `EventStore` trait, optimistic-concurrency append and snapshots.
//! - **`aggregate`**: Reducer registries, deterministic replay and the `AggregateRoot`
//!   write model, with Task and Contract aggregates.
//! - **`bus`**: In-process publish/subscribe with per-handler fault isolation.

pub mod aggregate;
pub mod bus;
pub mod event;
pub mod identifier;
pub mod store;

pub use aggregate::*;
pub use bus::*;
pub use event::*;
pub use identifier::*;
pub use store::*;
