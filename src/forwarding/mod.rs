//! Forwarding Module
//!
//! Carries control calls (start, stop, cache invalidation) to the node that owns the
//! entities involved.
//!
//! ## Core Concepts
//! - **Envelope**: a `Request` names the method, the destination and the entity ids or app
//!   names, plus the context headers of the originating call. The owner answers with a `Response`.
//! - **Delivery**: HTTP POST to `/rpc/<method>`, one attempt plus a fixed retry schedule,
//!   never re-routed to another node.
//! - **Receiving side**: anything implementing `RpcHandler` can answer forwarded calls; the
//!   axum handlers in `handlers` expose it over HTTP.

pub mod client;
pub mod handlers;
pub mod protocol;


use async_trait::async_trait;

/// Receiving end of the forwarding protocol.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handles one encoded `Request` for `method` and returns the encoded `Response`.
    async fn handle_rpc(&self, method: &str, payload: &[u8]) -> Vec<u8>;
}
