//! Ownership coordinator for distributed-mode lanes (spec.md §4.13).
//!
//! Tracks which node currently owns each shard and hands out fencing
//! tokens that are strictly increasing per shard, so a worker holding a
//! stale token can be told to back off even if it still believes it owns
//! the shard.

use crate::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Current claim on a shard.
#[derive(Debug, Clone)]
pub struct OwnershipClaim {
    pub shard: String,
    pub node: String,
    pub lease: String,
    pub fencing_token: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

struct ShardRecord {
    claim: Option<OwnershipClaim>,
    last_token: u64,
}

impl Default for ShardRecord {
    fn default() -> Self {
        Self {
            claim: None,
            last_token: 0,
        }
    }
}

/// Coordinates shard ownership and fencing across cluster nodes.
///
/// A lane name being "admitted" (`can_consume`) is independent of shard
/// ownership: it's the coarse switch a fallback/degraded lane uses to
/// stop a node from consuming a lane it no longer owns at all, while
/// fencing tokens guard individual shards within an admitted lane.
pub struct OwnershipCoordinator {
    shards: RwLock<HashMap<String, ShardRecord>>,
    admitted_lanes: RwLock<HashMap<String, bool>>,
}

impl Default for OwnershipCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnershipCoordinator {
    pub fn new() -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            admitted_lanes: RwLock::new(HashMap::new()),
        }
    }

    /// Claims `shard` for `node`, returning a fresh fencing token strictly
    /// greater than any token previously issued for this shard.
    ///
    /// `expected_token`, if given, must match the shard's currently
    /// recorded token (compare-and-swap semantics for re-claiming a lease
    /// the caller believes it still holds).
    pub fn claim(
        &self,
        shard: &str,
        node: &str,
        lease: &str,
        ttl: Duration,
        expected_token: Option<u64>,
    ) -> Result<OwnershipClaim> {
        let mut shards = self.shards.write().unwrap();
        let record = shards.entry(shard.to_string()).or_default();

        if let Some(expected) = expected_token {
            if record.last_token != expected {
                return Err(EngineError::FailedPrecondition(format!(
                    "shard {shard} fencing token mismatch: expected {expected}, recorded {}",
                    record.last_token
                )));
            }
        }

        let now = Utc::now();
        let token = record.last_token + 1;
        record.last_token = token;
        let claim = OwnershipClaim {
            shard: shard.to_string(),
            node: node.to_string(),
            lease: lease.to_string(),
            fencing_token: token,
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
        };
        record.claim = Some(claim.clone());
        Ok(claim)
    }

    /// Fails if the currently recorded token for `shard` is greater than
    /// `token` — i.e. a newer claim has superseded the caller's.
    pub fn validate_fencing_token(&self, shard: &str, token: u64) -> Result<()> {
        let shards = self.shards.read().unwrap();
        match shards.get(shard) {
            Some(record) if record.last_token > token => Err(EngineError::FailedPrecondition(
                format!("stale fencing token for shard {shard}"),
            )),
            _ => Ok(()),
        }
    }

    /// Releases the claim on `shard` iff `node`/`lease`/`expected_token`
    /// all match the recorded claim.
    pub fn release(
        &self,
        shard: &str,
        node: &str,
        lease: &str,
        expected_token: u64,
    ) -> Result<()> {
        let mut shards = self.shards.write().unwrap();
        if let Some(record) = shards.get_mut(shard) {
            let matches = record
                .claim
                .as_ref()
                .map(|c| c.node == node && c.lease == lease && c.fencing_token == expected_token)
                .unwrap_or(false);
            if matches {
                record.claim = None;
                return Ok(());
            }
        }
        Err(EngineError::FailedPrecondition(format!(
            "no matching claim to release for shard {shard}"
        )))
    }

    pub fn current_claim(&self, shard: &str) -> Option<OwnershipClaim> {
        self.shards.read().unwrap().get(shard).and_then(|r| r.claim.clone())
    }

    /// Admits or revokes a lane for local consumption; workers check this
    /// before dequeueing (spec.md §4.13).
    pub fn set_admitted(&self, lane: &str, admitted: bool) {
        self.admitted_lanes.write().unwrap().insert(lane.to_string(), admitted);
    }

    /// Lanes default to admitted until explicitly revoked, so a
    /// single-node deployment with no coordinator wiring behaves like
    /// there's no ownership gate at all.
    pub fn can_consume(&self, lane: &str) -> bool {
        *self.admitted_lanes.read().unwrap().get(lane).unwrap_or(&true)
    }
}
