//! Recovery manager (spec.md §4.9): on startup, resumes every
//! non-terminal checkpoint whose definition is registered.

use crate::cancel::CancelToken;
use crate::core::checkpoint::{Checkpoint, CheckpointStore};
use crate::core::orchestrator::SagaOrchestrator;
use crate::core::saga::SagaState;
use crate::errors::Result;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryOutcomes {
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
}

pub struct RecoveryReport {
    pub recovered: u64,
    pub outcomes: RecoveryOutcomes,
    pub first_error: Option<crate::errors::EngineError>,
}

pub struct RecoveryManager {
    checkpoints: Arc<CheckpointStore>,
    orchestrator: Arc<SagaOrchestrator>,
}

impl RecoveryManager {
    pub fn new(checkpoints: Arc<CheckpointStore>, orchestrator: Arc<SagaOrchestrator>) -> Self {
        Self { checkpoints, orchestrator }
    }

    /// Scans every stored checkpoint and resumes non-terminal ones. A
    /// missing definition or a per-saga resume error is logged and
    /// counted but does not abort the scan.
    pub async fn recover_all(&self) -> Result<RecoveryReport> {
        let checkpoints: Vec<Checkpoint> = self.checkpoints.list_all()?;
        let mut outcomes = RecoveryOutcomes::default();
        let mut first_error = None;
        let cancel = CancelToken::new();

        for checkpoint in checkpoints {
            if checkpoint.instance.state.is_terminal() {
                outcomes.skipped += 1;
                continue;
            }
            if self.orchestrator.definition(&checkpoint.instance.definition_id).is_none() {
                tracing::warn!(
                    saga_id = %checkpoint.instance.id,
                    definition = %checkpoint.instance.definition_id,
                    "skipping recovery: definition not registered"
                );
                outcomes.skipped += 1;
                continue;
            }
            match self.orchestrator.resume_from_checkpoint(checkpoint, &cancel).await {
                Ok(()) => outcomes.success += 1,
                Err(e) => {
                    outcomes.failed += 1;
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        Ok(RecoveryReport {
            recovered: outcomes.success + outcomes.failed,
            outcomes,
            first_error,
        })
    }
}
