//! Distributed Schedule Supervisor Library
//!
//! Spreads many small recurring work entities (one schedule poller per app partition)
//! over a changing set of nodes, so that each entity runs on exactly one node at a time
//! and moves on its own when a node leaves.
//!
//! ## Architecture Modules
//!
//! - **`membership`**: cluster membership. UDP gossip (SWIM-like) for discovery and failure
//!   detection, a consistent-hash ring for ownership, and an in-process variant of both.
//! - **`forwarding`**: the envelope, retry policy and HTTP transport used to hand a control
//!   call to the node owning an entity.
//! - **`supervisor`**: the coordination core. Local registry, start/stop, boot, offload,
//!   reconciliation and app activation.
//! - **`store`**: the persisted cluster state and entity factory the supervisor consumes,
//!   with an in-memory store.
//! - **`poller`**: the schedule poller entity run by the binary.
//! - **`config`**: supervisor tunables and the node command line.
//! - **`error`**: error types of the layers above.

pub mod config;
pub mod error;
pub mod forwarding;
pub mod membership;
pub mod poller;
pub mod store;
pub mod supervisor;
