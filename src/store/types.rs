use crate::error::SupervisorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of one ownable unit of work: `"<appId>.<partitionIndex>"`.
///
/// The id is what gets hashed onto the ring, so two nodes with the same
/// membership view always agree on its owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub const SEPARATOR: char = '.';

    pub fn new(app_id: &str, partition: u32) -> Self {
        Self(format!("{}{}{}", app_id, Self::SEPARATOR, partition))
    }

    /// App part of the id. App ids may themselves contain dots, so the split
    /// happens on the last separator.
    pub fn app_id(&self) -> &str {
        match self.0.rsplit_once(Self::SEPARATOR) {
            Some((app, _)) => app,
            None => &self.0,
        }
    }

    pub fn partition(&self) -> Option<u32> {
        self.0
            .rsplit_once(Self::SEPARATOR)
            .and_then(|(_, partition)| partition.parse().ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for EntityId {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(Self::SEPARATOR) {
            Some((app, partition)) if !app.is_empty() && partition.parse::<u32>().is_ok() => {
                Ok(Self(s.to_string()))
            }
            _ => Err(SupervisorError::InvalidEntityId(s.to_string())),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted run state of an entity. Serialized as `0`/`1`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(into = "u8", try_from = "u8")]
pub enum EntityStatus {
    Stopped = 0,
    Running = 1,
}

impl From<EntityStatus> for u8 {
    fn from(status: EntityStatus) -> Self {
        status as u8
    }
}

impl TryFrom<u8> for EntityStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EntityStatus::Stopped),
            1 => Ok(EntityStatus::Running),
            other => Err(format!("invalid entity status {}", other)),
        }
    }
}

/// Durable record of an entity: who ran it last and how it ended up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityInfo {
    pub id: EntityId,
    /// Last known or assigned owner address.
    pub node: String,
    pub status: EntityStatus,
    /// Trail of `{node:status}` transitions, oldest first.
    pub history: String,
}

impl EntityInfo {
    pub fn new(id: EntityId, node: &str, status: EntityStatus) -> Self {
        Self {
            id,
            node: node.to_string(),
            status,
            history: String::new(),
        }
    }

    /// Applies a transition and appends it to the history, dropping whole
    /// entries from the front until the trail fits in `max_len` bytes.
    pub fn record_transition(&mut self, node: &str, status: EntityStatus, max_len: usize) {
        self.node = node.to_string();
        self.status = status;
        self.history
            .push_str(&format!("{{{}:{}}}", node, u8::from(status)));

        while self.history.len() > max_len {
            match self.history.find('}') {
                Some(end) if end + 1 < self.history.len() => {
                    self.history.drain(..=end);
                }
                _ => {
                    self.history.clear();
                }
            }
        }
    }
}

/// An application whose work is split into `partitions` entities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub app_id: String,
    pub partitions: u32,
    /// Gate on whether the app's entities may run at all.
    pub active: bool,
}

impl App {
    pub fn new(app_id: &str, partitions: u32, active: bool) -> Self {
        Self {
            app_id: app_id.to_string(),
            partitions,
            active,
        }
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        (0..self.partitions)
            .map(|partition| EntityId::new(&self.app_id, partition))
            .collect()
    }
}

/// State of a persisted schedule, as seen by a retriever.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ScheduleStatus {
    Scheduled,
    Triggered,
    Miss,
}

/// What a retriever should do with the schedules it selects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionType {
    Trigger,
    /// Replay schedules whose window fell inside an outage.
    Reconcile,
}
