//! Forwarding Protocol
//!
//! Defines the envelope exchanged when a node asks the owner of an entity to act on it,
//! plus the method names and the retry schedule used to deliver it.
//!
//! Envelopes are JSON-encoded and POSTed to `/rpc/<method>` on the destination node.

use crate::store::types::EntityId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// --- Service & Methods ---

/// Service name the supervisor's methods are registered under.
pub const SERVICE_NAME: &str = "supervisor";
/// Start a list of entities on the receiving node (or forward them on).
pub const METHOD_START_ENTITIES: &str = "StartEntities";
/// Stop a list of entities on the receiving node (or forward them on).
pub const METHOD_STOP_ENTITIES: &str = "StopEntities";
/// Invalidate cached app details on the receiving node.
pub const METHOD_APP_DETAILS_UPDATE: &str = "AppDetailsUpdate";

/// Prefix of the RPC endpoints; the method name is the last path segment.
pub const ENDPOINT_RPC: &str = "/rpc";
/// Supervisor statistics of the node.
pub const ENDPOINT_STATS: &str = "/stats";

// --- Context Headers ---

pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_ORIGIN_NODE: &str = "x-origin-node";

// --- Envelope ---

/// Body of a forwarded call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Payload {
    Ids { ids: Vec<EntityId> },
    Names { names: Vec<String> },
}

/// A control call forwarded to another node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    /// Address of the node the call is meant for.
    pub destination: String,
    /// Context of the originating call (request id, origin node).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub payload: Payload,
}

impl Request {
    pub fn new(method: &str, destination: &str, payload: Payload) -> Self {
        Self {
            method: method.to_string(),
            destination: destination.to_string(),
            headers: BTreeMap::new(),
            payload,
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    /// Ids the call is about; used as routing keys.
    pub fn routing_keys(&self) -> Vec<String> {
        match &self.payload {
            Payload::Ids { ids } => ids.iter().map(|id| id.0.clone()).collect(),
            Payload::Names { names } => names.clone(),
        }
    }
}

/// Outcome of a forwarded call. Serialized as `0` (success) / `1` (failed).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(into = "u8", try_from = "u8")]
pub enum ResponseStatus {
    Success = 0,
    Failed = 1,
}

impl From<ResponseStatus> for u8 {
    fn from(status: ResponseStatus) -> Self {
        status as u8
    }
}

impl TryFrom<u8> for ResponseStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResponseStatus::Success),
            1 => Ok(ResponseStatus::Failed),
            other => Err(format!("invalid response status {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    /// Address of the node that produced the response.
    pub server_address: String,
    /// Empty on success.
    #[serde(default)]
    pub error: String,
    pub status: ResponseStatus,
}

impl Response {
    pub fn success(server_address: &str) -> Self {
        Self {
            server_address: server_address.to_string(),
            error: String::new(),
            status: ResponseStatus::Success,
        }
    }

    pub fn failure(server_address: &str, error: impl ToString) -> Self {
        Self {
            server_address: server_address.to_string(),
            error: error.to_string(),
            status: ResponseStatus::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

// --- Retry Policy ---

/// Delivery policy of a forwarded call.
///
/// One initial attempt plus up to `max_retries` retries. Retry `n` waits
/// `retry_schedule[n]` (the last entry repeats) and every attempt is cut off
/// after `timeout`. Calls are never re-routed to another node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardOptions {
    pub max_retries: usize,
    pub retry_schedule: Vec<Duration>,
    pub timeout: Duration,
}

impl ForwardOptions {
    pub fn attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Wait before retry number `retry` (0-based).
    pub fn backoff(&self, retry: usize) -> Duration {
        self.retry_schedule
            .get(retry)
            .or_else(|| self.retry_schedule.last())
            .copied()
            .unwrap_or_default()
    }
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_schedule: vec![
                Duration::from_secs(3),
                Duration::from_secs(6),
                Duration::from_secs(12),
            ],
            timeout: Duration::from_secs(3),
        }
    }
}
