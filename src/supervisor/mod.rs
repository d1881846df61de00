//! Supervisor Module
//!
//! The coordination core of a node: it decides where every entity runs and keeps the
//! local registry consistent with that decision.
//!
//! ## Core Concepts
//! - **Ownership**: the membership ring names exactly one owner per `EntityId` for a
//!   stable member set. Calls for ids owned elsewhere are forwarded to the owner.
//! - **Local Registry**: the source of truth for "is this entity running *here*". The
//!   cluster store only records who ran it last.
//! - **Boot / Offload**: on start a node runs the persisted entities it owns, stopping
//!   stale copies on other nodes first. When a node leaves, the new owners take over its
//!   entities and replay missed work (reconciliation).
//! - **Crash Isolation**: each entity runs inside a `RecoverableEntity` that restarts it
//!   with backoff and gives up after a bounded number of crashes.
//! - **Node State**: `Booting -> Active -> Draining -> Stopped`; a draining node takes no
//!   new entities, so `stop_node` always ends with an empty registry.

pub mod entity;
pub mod reconcile;
pub mod registry;
pub mod service;
pub mod state;

pub use service::{BroadcastReport, Supervisor, SupervisorStats};
pub use state::NodeState;
