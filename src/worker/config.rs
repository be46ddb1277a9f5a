use anyhow::Result;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::storage::store::KeyValueStore;

/// One configurable field of a worker
///
/// Built statically per worker type instead of discovered by reflection.
/// `get` produces the storage (JSON) representation; `set` parses it back.
/// Derived fields carry no setter and declare the field they are derived
/// from, so writes to the source re-materialize them.
pub struct ConfigField<W> {
    pub name: &'static str,

    /// Read-only fields can never be set through the external write path
    pub read_only: bool,

    /// Source field this one is re-derived from on every accepted write
    pub depends_on: Option<&'static str>,

    pub get: fn(&W) -> Value,
    pub set: Option<fn(&mut W, &Value) -> Result<()>>,
}

/// A worker with a declared set of configurable fields
pub trait Configurable: Sized {
    fn config_fields() -> &'static [ConfigField<Self>];
}

/// Reflects a worker's configurable fields to and from the store
///
/// The store blob is self-healing: the first load seeds it from the
/// instance, later loads converge store and instance by applying stored
/// values and writing the full resulting snapshot back.
pub struct ConfigSynchronizer {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl ConfigSynchronizer {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// The instance's full current snapshot, in storage representation
    pub fn snapshot<W: Configurable + 'static>(worker: &W) -> Map<String, Value> {
        let mut map = Map::new();
        for field in W::config_fields() {
            map.insert(field.name.to_string(), (field.get)(worker));
        }
        map
    }

    /// Read the stored blob as a JSON map
    pub async fn stored(&self) -> Result<Map<String, Value>> {
        let Some(blob) = self.store.get(&self.key).await? else {
            return Ok(Map::new());
        };
        match serde_json::from_str::<Map<String, Value>>(&blob) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!("Discarding malformed config blob at {}: {}", self.key, e);
                Ok(Map::new())
            }
        }
    }

    async fn write(&self, map: &Map<String, Value>) -> Result<()> {
        let blob = serde_json::to_string(map)?;
        self.store.set(&self.key, &blob).await
    }

    /// Merge stored values into the instance, then write back its snapshot
    ///
    /// Applies every stored field that has a setter: the mutable fields and
    /// store-persisted ones like the crawl checkpoint. Derived fields and
    /// unknown keys are ignored.
    pub async fn load<W: Configurable + 'static>(&self, worker: &mut W) -> Result<()> {
        let stored = self.stored().await?;
        if stored.is_empty() {
            info!("No configs found in store.");
        } else {
            for field in W::config_fields() {
                if let (Some(set), Some(value)) = (field.set, stored.get(field.name)) {
                    set(worker, value)?;
                    debug!("Applied stored config {} = {}", field.name, value);
                }
            }
        }
        self.sync_from(worker).await
    }

    /// Write the instance's full snapshot to the store
    pub async fn sync_from<W: Configurable + 'static>(&self, worker: &W) -> Result<()> {
        self.write(&Self::snapshot(worker)).await
    }

    /// Control-surface write path
    ///
    /// Applies only mutable keys present in `partial` (unknown and
    /// read-only keys are ignored, not errored), re-derives dependents,
    /// persists the full snapshot, and returns the accepted subset
    /// including refreshed dependents.
    pub async fn apply_external_update<W: Configurable + 'static>(
        &self,
        worker: &mut W,
        partial: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let mut accepted = Map::new();

        for field in W::config_fields().iter().filter(|f| !f.read_only) {
            let Some(value) = partial.get(field.name) else {
                continue;
            };
            let Some(set) = field.set else {
                continue;
            };
            set(worker, value)?;
            accepted.insert(field.name.to_string(), value.clone());

            // Re-derive everything hanging off the field just written
            for dependent in W::config_fields()
                .iter()
                .filter(|d| d.depends_on == Some(field.name))
            {
                accepted.insert(dependent.name.to_string(), (dependent.get)(worker));
            }
        }

        self.sync_from(worker).await?;
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::MemoryStore;
    use anyhow::Context;
    use serde_json::json;

    /// Minimal worker with the same field shapes the real ones use
    struct Probe {
        people: String,
        interval: u64,
        checkpoint: String,
    }

    impl Probe {
        fn new() -> Self {
            Self {
                people: "alice".to_string(),
                interval: 60,
                checkpoint: "2024-01-01T00:00:00".to_string(),
            }
        }

        fn profile_url(&self) -> String {
            format!("https://example.test/people/{}", self.people)
        }
    }

    impl Configurable for Probe {
        fn config_fields() -> &'static [ConfigField<Self>] {
            const FIELDS: &[ConfigField<Probe>] = &[
                ConfigField {
                    name: "people",
                    read_only: false,
                    depends_on: None,
                    get: |w| Value::String(w.people.clone()),
                    set: Some(|w, v| {
                        w.people = v.as_str().context("people must be a string")?.to_string();
                        Ok(())
                    }),
                },
                ConfigField {
                    name: "interval",
                    read_only: false,
                    depends_on: None,
                    get: |w| json!(w.interval),
                    set: Some(|w, v| {
                        w.interval = v.as_u64().context("interval must be an integer")?;
                        Ok(())
                    }),
                },
                ConfigField {
                    name: "profile_url",
                    read_only: true,
                    depends_on: Some("people"),
                    get: |w| Value::String(w.profile_url()),
                    set: None,
                },
                ConfigField {
                    name: "checkpoint",
                    read_only: true,
                    depends_on: None,
                    get: |w| Value::String(w.checkpoint.clone()),
                    set: Some(|w, v| {
                        w.checkpoint =
                            v.as_str().context("checkpoint must be a string")?.to_string();
                        Ok(())
                    }),
                },
            ];
            FIELDS
        }
    }

    fn sync() -> ConfigSynchronizer {
        ConfigSynchronizer::new(Arc::new(MemoryStore::new()), "test:configs")
    }

    #[tokio::test]
    async fn first_load_seeds_the_store() {
        let sync = sync();
        let mut probe = Probe::new();
        sync.load(&mut probe).await.unwrap();

        let stored = sync.stored().await.unwrap();
        assert_eq!(stored["people"], json!("alice"));
        assert_eq!(stored["profile_url"], json!("https://example.test/people/alice"));
    }

    #[tokio::test]
    async fn mutable_write_round_trips() {
        let sync = sync();
        let mut probe = Probe::new();
        sync.load(&mut probe).await.unwrap();

        let partial = json!({"interval": 120}).as_object().unwrap().clone();
        let accepted = sync.apply_external_update(&mut probe, &partial).await.unwrap();

        assert_eq!(accepted["interval"], json!(120));
        assert_eq!(probe.interval, 120);
        assert_eq!(sync.stored().await.unwrap()["interval"], json!(120));
    }

    #[tokio::test]
    async fn read_only_external_write_leaves_store_unchanged() {
        let sync = sync();
        let mut probe = Probe::new();
        sync.load(&mut probe).await.unwrap();

        let partial = json!({"checkpoint": "2030-01-01T00:00:00"})
            .as_object()
            .unwrap()
            .clone();
        let accepted = sync.apply_external_update(&mut probe, &partial).await.unwrap();

        assert!(accepted.is_empty());
        assert_eq!(probe.checkpoint, "2024-01-01T00:00:00");
        assert_eq!(
            sync.stored().await.unwrap()["checkpoint"],
            json!("2024-01-01T00:00:00")
        );
    }

    #[tokio::test]
    async fn dependents_are_rederived_on_source_write() {
        let sync = sync();
        let mut probe = Probe::new();
        sync.load(&mut probe).await.unwrap();

        let partial = json!({"people": "bob"}).as_object().unwrap().clone();
        let accepted = sync.apply_external_update(&mut probe, &partial).await.unwrap();

        assert_eq!(accepted["profile_url"], json!("https://example.test/people/bob"));
        assert_eq!(
            sync.stored().await.unwrap()["profile_url"],
            json!("https://example.test/people/bob")
        );
    }

    #[tokio::test]
    async fn persisted_checkpoint_is_reapplied_on_load() {
        let sync = sync();
        let mut first = Probe::new();
        first.checkpoint = "2024-06-01T12:00:00".to_string();
        sync.sync_from(&first).await.unwrap();

        // A fresh instance (fresh process) picks the checkpoint back up
        let mut second = Probe::new();
        sync.load(&mut second).await.unwrap();
        assert_eq!(second.checkpoint, "2024-06-01T12:00:00");
    }

    #[tokio::test]
    async fn unknown_keys_are_ignored() {
        let sync = sync();
        let mut probe = Probe::new();
        let partial = json!({"no_such_field": 1}).as_object().unwrap().clone();
        let accepted = sync.apply_external_update(&mut probe, &partial).await.unwrap();
        assert!(accepted.is_empty());
    }
}
