//! Checkpoint store (spec.md §4.8): durable snapshots of saga instances
//! used to resume execution after a crash.

use crate::core::saga::SagaInstance;
use crate::errors::{EngineError, Result};
use crate::storage::KvStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub instance: SagaInstance,
}

fn key(saga_id: &str) -> String {
    format!("checkpoint:{saga_id}")
}

pub struct CheckpointStore {
    kv: Arc<KvStore>,
}

impl CheckpointStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let payload =
            serde_json::to_vec(checkpoint).map_err(|e| EngineError::Internal(e.to_string()))?;
        self.kv.put(&key(&checkpoint.instance.id), &payload)
    }

    pub fn load(&self, saga_id: &str) -> Result<Checkpoint> {
        match self.kv.get(&key(saga_id))? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| EngineError::Internal(e.to_string()))
            }
            None => Err(EngineError::NotFound(format!("checkpoint for saga {saga_id}"))),
        }
    }

    pub fn delete(&self, saga_id: &str) -> Result<()> {
        self.kv.delete(&key(saga_id))
    }

    /// Lists every stored checkpoint, used by the recovery manager's
    /// startup scan.
    pub fn list_all(&self) -> Result<Vec<Checkpoint>> {
        self.kv
            .scan_prefix("checkpoint:")
            .map(|entries| {
                entries
                    .into_iter()
                    .filter_map(|(_, v)| serde_json::from_slice(&v).ok())
                    .collect()
            })
    }
}

/// Wraps a `CheckpointStore`, mutating and re-persisting the instance on
/// every step completion so a checkpoint is always a consistent snapshot.
pub struct Checkpointer {
    store: CheckpointStore,
}

impl Checkpointer {
    pub fn new(store: CheckpointStore) -> Self {
        Self { store }
    }

    pub fn record_step_completion(
        &self,
        instance: &mut SagaInstance,
        step_id: &str,
        result: serde_json::Value,
    ) -> Result<()> {
        instance.mark_step_completed(step_id, result);
        self.store.save(&Checkpoint {
            instance: instance.clone(),
        })
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }
}
