pub mod batch;
pub mod queue;
pub mod store;

// Re-export common types
pub use queue::{ArchiveTask, TaskQueue};
pub use store::{KeyValueStore, MemoryStore, RedisStore};
