//! Consistent hash ring.
//!
//! Each member is placed on the ring `replicas` times; a key belongs to the
//! first point at or after its own hash, wrapping around. Positions come from
//! `blake3`, so every process computes the same ring for the same member set.

use std::collections::BTreeMap;

pub const DEFAULT_REPLICAS: usize = 100;

#[derive(Debug, Clone)]
pub struct HashRing {
    replicas: usize,
    points: BTreeMap<u64, String>,
    members: Vec<String>,
}

impl HashRing {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            points: BTreeMap::new(),
            members: Vec::new(),
        }
    }

    pub fn with_members<I, S>(replicas: usize, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ring = Self::new(replicas);
        for member in members {
            ring.add(&member.into());
        }
        ring
    }

    /// Returns `false` if the member was already present.
    pub fn add(&mut self, member: &str) -> bool {
        if self.members.iter().any(|m| m == member) {
            return false;
        }

        for replica in 0..self.replicas {
            let point = hash(&format!("{}#{}", member, replica));
            // On a collision the lexicographically smaller member keeps the
            // point, independent of insertion order.
            match self.points.get(&point) {
                Some(existing) if existing.as_str() <= member => {}
                _ => {
                    self.points.insert(point, member.to_string());
                }
            }
        }

        self.members.push(member.to_string());
        self.members.sort();
        true
    }

    /// Returns `false` if the member was not present.
    pub fn remove(&mut self, member: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != member);
        if self.members.len() == before {
            return false;
        }

        // Rebuild so points shadowed by the removed member come back.
        let remaining = std::mem::take(&mut self.members);
        self.points.clear();
        for m in remaining {
            self.add(&m);
        }
        true
    }

    pub fn lookup(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }

        let point = hash(key);
        self.points
            .range(point..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, member)| member.as_str())
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.iter().any(|m| m == member)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}

fn hash(key: &str) -> u64 {
    let digest = blake3::hash(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(bytes)
}
