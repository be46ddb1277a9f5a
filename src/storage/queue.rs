use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::storage::store::KeyValueStore;

/// Reference to one persisted batch file, queued for the archiver
///
/// Carries no payload beyond the resolved path; the archiver re-reads the
/// batch from disk. Equality is by resolved path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveTask {
    /// Resolved path of the batch file
    pub activity_path: PathBuf,
}

impl ArchiveTask {
    pub fn new(activity_path: impl AsRef<Path>) -> Self {
        let path = activity_path.as_ref();
        Self {
            activity_path: path.canonicalize().unwrap_or_else(|_| path.to_path_buf()),
        }
    }

    /// Serialize for the store list
    pub fn as_value(&self) -> String {
        self.activity_path.display().to_string()
    }

    /// Rebuild from a store list value
    pub fn from_value(value: &str) -> Self {
        Self {
            activity_path: PathBuf::from(value),
        }
    }
}

impl fmt::Display for ArchiveTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchiveTask<{}>", self.activity_path.display())
    }
}

/// FIFO queue of batch references in the coordination store
///
/// Produced by the monitor, consumed by exactly one archiver. Concurrent
/// consumers are not part of the contract: they would split a batch's items
/// across processes.
pub struct TaskQueue {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Append a task to the tail of the queue
    pub async fn push(&self, task: &ArchiveTask) -> Result<()> {
        self.store.rpush(&self.key, &task.as_value()).await?;
        debug!("Pushed task to queue: {}", task);
        Ok(())
    }

    /// Remove and return the head of the queue, or `None` when empty
    pub async fn pop(&self) -> Result<Option<ArchiveTask>> {
        let value = self.store.lpop(&self.key).await?;
        Ok(value.map(|v| {
            let task = ArchiveTask::from_value(&v);
            debug!("Popped task from queue: {}", task);
            task
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::MemoryStore;

    fn queue() -> TaskQueue {
        TaskQueue::new(Arc::new(MemoryStore::new()), "test:tasks")
    }

    #[tokio::test]
    async fn pops_in_push_order() {
        let queue = queue();
        for name in ["a.json", "b.json", "c.json"] {
            queue.push(&ArchiveTask::from_value(name)).await.unwrap();
        }

        let popped: Vec<String> = [
            queue.pop().await.unwrap(),
            queue.pop().await.unwrap(),
            queue.pop().await.unwrap(),
        ]
        .into_iter()
        .map(|t| t.unwrap().as_value())
        .collect();

        assert_eq!(popped, vec!["a.json", "b.json", "c.json"]);
    }

    #[tokio::test]
    async fn pop_on_empty_is_none_not_error() {
        let queue = queue();
        assert!(queue.pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn task_value_round_trip() {
        let task = ArchiveTask::from_value("/tmp/results/20240102030405.json");
        assert_eq!(
            ArchiveTask::from_value(&task.as_value()),
            task,
        );
    }
}
