//! The data-manager boundary the engine persists through
//!
//! The engine never owns a database. It consumes these traits: the manager
//! opens one storage transaction per workflow commit, writes every record
//! the runner queued, and commits or rolls back as a unit. Collections are
//! schemaless JSON documents; filters are field-equality objects.
//!
//! [`MemoryDataManager`] is the bundled in-memory implementation, used by
//! the tests and suitable as a default for embedded callers.

use crate::error::{Result, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Collection name for workflow rows
pub const WORKFLOW: &str = "workflow";
/// Collection name for step rows
pub const WORKFLOW_STEP: &str = "workflow_step";
/// Collection name for stage rows
pub const WORKFLOW_STAGE: &str = "workflow_stage";
/// Collection name for the memory side records
pub const WORKFLOW_MEMORY: &str = "workflow_memory";
/// Collection name for participants
pub const WORKFLOW_PARTICIPANT: &str = "workflow_participant";
/// Collection name for the mutation audit log
pub const WORKFLOW_MUTATION: &str = "workflow_mutation";
/// Collection name for activity records
pub const WORKFLOW_ACTIVITY: &str = "workflow_activity";
/// Collection name for workflow messages
pub const WORKFLOW_MESSAGE: &str = "workflow_message";

/// The persistence backend the workflow manager writes through
#[async_trait]
pub trait WorkflowDataManager: Send + Sync {
    /// Opens a storage transaction; writes are atomic per transaction
    async fn transaction(&self) -> Result<Box<dyn StorageTransaction>>;

    /// Finds the first record matching the field-equality filter
    async fn find_one(&self, collection: &str, filter: &Value) -> Result<Value>;

    /// Finds every record matching the field-equality filter
    async fn find_many(&self, collection: &str, filter: &Value) -> Result<Vec<Value>>;
}

/// One atomic unit of storage writes
#[async_trait]
pub trait StorageTransaction: Send {
    /// Queues an insert
    async fn insert(&mut self, collection: &str, record: Value) -> Result<()>;

    /// Queues a field merge into the first record matching the filter;
    /// commit fails with a not-found error when nothing matches
    async fn update_one(&mut self, collection: &str, filter: Value, changes: Value) -> Result<()>;

    /// Queues an update-or-insert keyed by the filter
    async fn upsert(&mut self, collection: &str, filter: Value, record: Value) -> Result<()>;

    /// Queues removal of the first record matching the filter; no match
    /// is a silent no-op
    async fn remove(&mut self, collection: &str, filter: Value) -> Result<()>;

    /// Applies every queued write atomically
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discards every queued write
    async fn rollback(self: Box<Self>) -> Result<()>;
}

fn matches(record: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields.iter().all(|(k, v)| record.get(k) == Some(v)),
        None => false,
    }
}

fn merge(record: &mut Value, changes: &Value) {
    if let (Some(target), Some(fields)) = (record.as_object_mut(), changes.as_object()) {
        for (k, v) in fields {
            target.insert(k.clone(), v.clone());
        }
    }
}

enum Op {
    Insert {
        collection: String,
        record: Value,
    },
    UpdateOne {
        collection: String,
        filter: Value,
        changes: Value,
    },
    Upsert {
        collection: String,
        filter: Value,
        record: Value,
    },
    Remove {
        collection: String,
        filter: Value,
    },
}

type Store = Arc<DashMap<String, Vec<Value>>>;

/// In-memory data manager backed by a concurrent map.
///
/// Writes are buffered per transaction and applied at commit, so a rolled
/// back transaction leaves the store untouched.
#[derive(Default, Clone)]
pub struct MemoryDataManager {
    store: Store,
}

impl MemoryDataManager {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently in a collection
    pub fn count(&self, collection: &str) -> usize {
        self.store.get(collection).map(|c| c.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for MemoryDataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDataManager")
            .field(
                "collections",
                &self
                    .store
                    .iter()
                    .map(|e| (e.key().clone(), e.value().len()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[async_trait]
impl WorkflowDataManager for MemoryDataManager {
    async fn transaction(&self) -> Result<Box<dyn StorageTransaction>> {
        Ok(Box::new(MemoryTransaction {
            store: Arc::clone(&self.store),
            ops: Vec::new(),
        }))
    }

    async fn find_one(&self, collection: &str, filter: &Value) -> Result<Value> {
        self.store
            .get(collection)
            .and_then(|records| records.iter().find(|r| matches(r, filter)).cloned())
            .ok_or_else(|| {
                StorageError::NotFound {
                    collection: collection.to_string(),
                }
                .into()
            })
    }

    async fn find_many(&self, collection: &str, filter: &Value) -> Result<Vec<Value>> {
        Ok(self
            .store
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| matches(r, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

struct MemoryTransaction {
    store: Store,
    ops: Vec<Op>,
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn insert(&mut self, collection: &str, record: Value) -> Result<()> {
        self.ops.push(Op::Insert {
            collection: collection.to_string(),
            record,
        });
        Ok(())
    }

    async fn update_one(&mut self, collection: &str, filter: Value, changes: Value) -> Result<()> {
        self.ops.push(Op::UpdateOne {
            collection: collection.to_string(),
            filter,
            changes,
        });
        Ok(())
    }

    async fn upsert(&mut self, collection: &str, filter: Value, record: Value) -> Result<()> {
        self.ops.push(Op::Upsert {
            collection: collection.to_string(),
            filter,
            record,
        });
        Ok(())
    }

    async fn remove(&mut self, collection: &str, filter: Value) -> Result<()> {
        self.ops.push(Op::Remove {
            collection: collection.to_string(),
            filter,
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { store, ops } = *self;
        for op in ops {
            match op {
                Op::Insert { collection, record } => {
                    store.entry(collection).or_default().push(record);
                }
                Op::UpdateOne {
                    collection,
                    filter,
                    changes,
                } => {
                    let mut records = store.entry(collection.clone()).or_default();
                    let record = records
                        .iter_mut()
                        .find(|r| matches(r, &filter))
                        .ok_or(StorageError::NotFound { collection })?;
                    merge(record, &changes);
                }
                Op::Upsert {
                    collection,
                    filter,
                    record,
                } => {
                    let mut records = store.entry(collection).or_default();
                    match records.iter_mut().find(|r| matches(r, &filter)) {
                        Some(existing) => merge(existing, &record),
                        None => records.push(record),
                    }
                }
                Op::Remove { collection, filter } => {
                    if let Some(mut records) = store.get_mut(&collection) {
                        if let Some(pos) = records.iter().position(|r| matches(r, &filter)) {
                            records.remove(pos);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
