//! Saga store (spec.md §4.11): durable saga instance records with a
//! secondary index by state for efficient `List(state)` queries.

use crate::core::saga::{SagaInstance, SagaState};
use crate::errors::{EngineError, Result};
use crate::storage::KvStore;
use std::sync::Arc;

fn data_key(id: &str) -> String {
    format!("saga:{id}")
}

fn index_key(state: SagaState, id: &str) -> String {
    format!("saga:index:state:{:?}:{}", state, id)
}

#[derive(Debug, Clone, Default)]
pub struct SagaFilter {
    pub state: Option<SagaState>,
    pub limit: usize,
    pub offset: usize,
}

pub struct SagaStore {
    kv: Arc<KvStore>,
}

impl SagaStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    /// Persists `instance`, replacing any stale state-index entry from a
    /// prior state with the current one.
    pub fn save(&self, instance: &SagaInstance) -> Result<()> {
        if let Some(previous) = self.get(&instance.id).ok().flatten() {
            if previous.state != instance.state {
                self.kv.delete(&index_key(previous.state, &instance.id))?;
            }
        }
        let payload = serde_json::to_vec(instance).map_err(|e| EngineError::Internal(e.to_string()))?;
        self.kv.put(&data_key(&instance.id), &payload)?;
        self.kv.put(&index_key(instance.state, &instance.id), b"")?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<SagaInstance>> {
        match self.kv.get(&data_key(id))? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(|e| EngineError::Internal(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        if let Some(instance) = self.get(id)? {
            self.kv.delete(&index_key(instance.state, id))?;
        }
        self.kv.delete(&data_key(id))
    }

    pub fn list(&self, filter: &SagaFilter) -> Result<Vec<SagaInstance>> {
        let ids: Vec<String> = match filter.state {
            Some(state) => self
                .kv
                .scan_prefix(&format!("saga:index:state:{:?}:", state))?
                .into_iter()
                .map(|(k, _)| k.rsplit(':').next().unwrap_or("").to_string())
                .collect(),
            None => self
                .kv
                .scan_prefix("saga:")?
                .into_iter()
                .filter(|(k, _)| !k.starts_with("saga:index:"))
                .map(|(k, _)| k.trim_start_matches("saga:").to_string())
                .collect(),
        };

        let mut instances = Vec::new();
        for id in ids {
            if let Some(instance) = self.get(&id)? {
                instances.push(instance);
            }
        }
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let start = filter.offset.min(instances.len());
        let end = if filter.limit == 0 {
            instances.len()
        } else {
            (start + filter.limit).min(instances.len())
        };
        Ok(instances[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, state: SagaState) -> SagaInstance {
        let mut inst = SagaInstance::new(id, "d1", serde_json::json!({}));
        inst.state = state;
        inst
    }

    #[test]
    fn save_get_delete_round_trip() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        let store = SagaStore::new(kv);
        store.save(&instance("s1", SagaState::Created)).unwrap();
        assert!(store.get("s1").unwrap().is_some());
        store.delete("s1").unwrap();
        assert!(store.get("s1").unwrap().is_none());
    }

    #[test]
    fn list_by_state_uses_index() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        let store = SagaStore::new(kv);
        store.save(&instance("s1", SagaState::Running)).unwrap();
        store.save(&instance("s2", SagaState::Completed)).unwrap();
        store.save(&instance("s3", SagaState::Running)).unwrap();

        let running = store
            .list(&SagaFilter {
                state: Some(SagaState::Running),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(running.len(), 2);
    }

    #[test]
    fn state_transition_moves_index_entry() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        let store = SagaStore::new(kv);
        let mut inst = instance("s1", SagaState::Running);
        store.save(&inst).unwrap();
        inst.state = SagaState::Completed;
        store.save(&inst).unwrap();

        let running = store
            .list(&SagaFilter { state: Some(SagaState::Running), ..Default::default() })
            .unwrap();
        assert!(running.is_empty());
        let completed = store
            .list(&SagaFilter { state: Some(SagaState::Completed), ..Default::default() })
            .unwrap();
        assert_eq!(completed.len(), 1);
    }

    #[test]
    fn list_without_state_skips_index_keys() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        let store = SagaStore::new(kv);
        store.save(&instance("s1", SagaState::Running)).unwrap();
        store.save(&instance("s2", SagaState::Completed)).unwrap();
        let all = store.list(&SagaFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn pagination_applies_limit_and_offset() {
        let kv = Arc::new(KvStore::temporary().unwrap());
        let store = SagaStore::new(kv);
        for i in 0..5 {
            store.save(&instance(&format!("s{i}"), SagaState::Running)).unwrap();
        }
        let page = store
            .list(&SagaFilter { state: None, limit: 2, offset: 1 })
            .unwrap();
        assert_eq!(page.len(), 2);
    }
}
