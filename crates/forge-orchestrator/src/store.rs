//! Record persistence seam
//!
//! The orchestrator is the sole writer of an execution's record; the store
//! only ever sees whole-record snapshots. `status` and external readers get
//! the latest stored snapshot, never a reference into live state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use forge_core::{ExecutionId, ExecutionRecord, ForgeError, Result};
use tokio::sync::RwLock;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Store the latest snapshot of a record, replacing any previous one
    async fn put(&self, record: ExecutionRecord) -> Result<()>;

    async fn load(&self, id: ExecutionId) -> Result<ExecutionRecord>;

    async fn list(&self) -> Result<Vec<ExecutionId>>;
}

/// Map-backed store, the default for embedded and test use
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: Arc<RwLock<HashMap<ExecutionId, ExecutionRecord>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn put(&self, record: ExecutionRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.execution_id, record);
        Ok(())
    }

    async fn load(&self, id: ExecutionId) -> Result<ExecutionRecord> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ForgeError::ExecutionNotFound(id))
    }

    async fn list(&self) -> Result<Vec<ExecutionId>> {
        Ok(self.records.read().await.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::{ExecutionStatus, Goal};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_put_then_load() {
        let store = InMemoryRecordStore::new();
        let record = ExecutionRecord::new(Goal::new("goal", "repo"));
        let id = record.execution_id;

        store.put(record).await.unwrap();

        let loaded = store.load(id).await.unwrap();
        assert_eq!(loaded.execution_id, id);
        assert_eq!(loaded.status, ExecutionStatus::Planning);
    }

    #[tokio::test]
    async fn test_put_replaces_snapshot() {
        let store = InMemoryRecordStore::new();
        let mut record = ExecutionRecord::new(Goal::new("goal", "repo"));
        let id = record.execution_id;
        store.put(record.clone()).await.unwrap();

        record.finish(ExecutionStatus::Completed);
        store.put(record).await.unwrap();

        let loaded = store.load(id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_record_errors() {
        let store = InMemoryRecordStore::new();
        let err = store.load(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ForgeError::ExecutionNotFound(_)));
    }
}
