//! Write-ahead log (spec.md §4.7): an append-only per-saga record of
//! every step/compensation transition, persisted to the embedded store so
//! a crash can be replayed from the last durable entry.

use crate::errors::{EngineError, Result};
use crate::storage::KvStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalEntryType {
    StepStarted,
    StepCompleted,
    StepFailed,
    CompensationStarted,
    CompensationCompleted,
    CompensationFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub saga_id: String,
    pub entry_type: WalEntryType,
    pub step_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl WalEntry {
    pub fn new(saga_id: impl Into<String>, entry_type: WalEntryType, step_id: impl Into<String>) -> Self {
        Self {
            saga_id: saga_id.into(),
            entry_type,
            step_id: step_id.into(),
            message: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.saga_id.is_empty() {
            return Err(EngineError::InvalidArgument("wal entry saga id empty".to_string()));
        }
        Ok(())
    }
}

fn data_key(saga_id: &str, seq: u64) -> String {
    format!("wal:{saga_id}:{seq:020}")
}

fn seq_key(saga_id: &str) -> String {
    format!("wal-seq:{saga_id}")
}

fn prefix(saga_id: &str) -> String {
    format!("wal:{saga_id}:")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalWriteMode {
    Sync,
    Async,
}

impl From<crate::config::WalWriteMode> for WalWriteMode {
    fn from(mode: crate::config::WalWriteMode) -> Self {
        match mode {
            crate::config::WalWriteMode::Sync => WalWriteMode::Sync,
            crate::config::WalWriteMode::Async => WalWriteMode::Async,
        }
    }
}

enum WriterMsg {
    Append(WalEntry, oneshot::Sender<Result<u64>>),
    Shutdown(oneshot::Sender<()>),
}

/// Append-only WAL over a shared `KvStore`. In async mode, appends are
/// enqueued to a bounded channel drained by a single writer task; when
/// that queue is full the caller falls back to writing synchronously so
/// durability is never silently sacrificed for throughput.
pub struct Wal {
    kv: Arc<KvStore>,
    mode: WalWriteMode,
    tx: Option<mpsc::Sender<WriterMsg>>,
    writer: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Wal {
    pub fn new(kv: Arc<KvStore>, mode: WalWriteMode, async_queue_size: usize) -> Arc<Self> {
        match mode {
            WalWriteMode::Sync => Arc::new(Self {
                kv,
                mode,
                tx: None,
                writer: std::sync::Mutex::new(None),
            }),
            WalWriteMode::Async => {
                let (tx, mut rx) = mpsc::channel::<WriterMsg>(async_queue_size);
                let kv_writer = kv.clone();
                let handle = tokio::spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        match msg {
                            WriterMsg::Append(entry, reply) => {
                                let result = Self::write_sync(&kv_writer, entry);
                                let _ = reply.send(result);
                            }
                            WriterMsg::Shutdown(reply) => {
                                let _ = reply.send(());
                                break;
                            }
                        }
                    }
                });
                Arc::new(Self {
                    kv,
                    mode,
                    tx: Some(tx),
                    writer: std::sync::Mutex::new(Some(handle)),
                })
            }
        }
    }

    fn write_sync(kv: &KvStore, mut entry: WalEntry) -> Result<u64> {
        entry.validate()?;
        if entry.timestamp.timestamp() == 0 {
            entry.timestamp = Utc::now();
        }
        let seq = kv.next_sequence(&seq_key(&entry.saga_id))?;
        let payload = serde_json::to_vec(&entry).map_err(|e| EngineError::Internal(e.to_string()))?;
        kv.put(&data_key(&entry.saga_id, seq), &payload)?;
        Ok(seq)
    }

    /// Appends `entry`, returning its assigned sequence number.
    pub async fn append(&self, entry: WalEntry) -> Result<u64> {
        entry.validate()?;
        match (&self.mode, &self.tx) {
            (WalWriteMode::Sync, _) | (_, None) => Self::write_sync(&self.kv, entry),
            (WalWriteMode::Async, Some(tx)) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                match tx.try_send(WriterMsg::Append(entry.clone(), reply_tx)) {
                    Ok(()) => reply_rx
                        .await
                        .map_err(|_| EngineError::Internal("wal writer dropped reply".to_string()))?,
                    Err(_) => {
                        // Queue full: fall back to a synchronous write so
                        // the append is never silently lost.
                        Self::write_sync(&self.kv, entry)
                    }
                }
            }
        }
    }

    pub fn list(&self, saga_id: &str) -> Result<Vec<WalEntry>> {
        self.kv
            .scan_prefix(&prefix(saga_id))?
            .into_iter()
            .map(|(_, v)| serde_json::from_slice(&v).map_err(|e| EngineError::Internal(e.to_string())))
            .collect()
    }

    pub fn delete_by_saga_id(&self, saga_id: &str) -> Result<()> {
        self.kv.delete_prefix(&prefix(saga_id))?;
        self.kv.delete(&seq_key(saga_id))?;
        Ok(())
    }

    /// Drains and stops the async writer task, if any. Idempotent.
    pub async fn close(&self) {
        let tx = self.tx.clone();
        if let Some(tx) = tx {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(WriterMsg::Shutdown(reply_tx)).await.is_ok() {
                let _ = reply_rx.await;
            }
        }
        if let Some(handle) = self.writer.lock().unwrap().take() {
            let _ = handle.await;
        }
    }
}
