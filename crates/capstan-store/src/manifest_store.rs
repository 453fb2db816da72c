//! Manifest metadata table.
//!
//! Keyed `(execution_id, manifest_id)`. Manifests are written once with
//! `committed = false` and flipped exactly once by a conditional update —
//! the second phase of the kernel's commit.

use async_trait::async_trait;
use capstan_core::{Error, Manifest, Result};
use dashmap::DashMap;

#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Create a manifest row. Fails on duplicate id (single writer per
    /// `(execution, segment)`).
    async fn put(&self, manifest: &Manifest) -> Result<()>;

    /// Conditional flip `committed: false -> true`. `Conflict` when the
    /// manifest is missing or already committed.
    async fn mark_committed(&self, execution_id: &str, manifest_id: &str) -> Result<()>;

    async fn get(&self, execution_id: &str, manifest_id: &str) -> Result<Manifest>;

    /// Latest committed manifest for an execution, by id order.
    async fn latest_committed(&self, execution_id: &str) -> Result<Option<Manifest>>;

    /// All manifests for an execution, id-ordered.
    async fn list(&self, execution_id: &str) -> Result<Vec<Manifest>>;

    /// Drop an uncommitted or superseded manifest row.
    async fn delete(&self, execution_id: &str, manifest_id: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryManifestStore {
    // (execution_id, manifest_id) -> manifest
    rows: DashMap<(String, String), Manifest>,
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManifestStore for MemoryManifestStore {
    async fn put(&self, manifest: &Manifest) -> Result<()> {
        let key = (
            manifest.execution_id.clone(),
            manifest.manifest_id.clone(),
        );
        if self.rows.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "manifest {} already exists for execution {}",
                manifest.manifest_id, manifest.execution_id
            )));
        }
        self.rows.insert(key, manifest.clone());
        Ok(())
    }

    async fn mark_committed(&self, execution_id: &str, manifest_id: &str) -> Result<()> {
        let key = (execution_id.to_string(), manifest_id.to_string());
        let mut entry = self
            .rows
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("manifest {manifest_id}")))?;
        if entry.committed {
            return Err(Error::Conflict(format!(
                "manifest {manifest_id} already committed"
            )));
        }
        entry.committed = true;
        Ok(())
    }

    async fn get(&self, execution_id: &str, manifest_id: &str) -> Result<Manifest> {
        self.rows
            .get(&(execution_id.to_string(), manifest_id.to_string()))
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::NotFound(format!("manifest {manifest_id}")))
    }

    async fn latest_committed(&self, execution_id: &str) -> Result<Option<Manifest>> {
        let mut committed: Vec<Manifest> = self
            .rows
            .iter()
            .filter(|e| e.key().0 == execution_id && e.value().committed)
            .map(|e| e.value().clone())
            .collect();
        committed.sort_by(|a, b| a.manifest_id.cmp(&b.manifest_id));
        Ok(committed.pop())
    }

    async fn list(&self, execution_id: &str) -> Result<Vec<Manifest>> {
        let mut rows: Vec<Manifest> = self
            .rows
            .iter()
            .filter(|e| e.key().0 == execution_id)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by(|a, b| a.manifest_id.cmp(&b.manifest_id));
        Ok(rows)
    }

    async fn delete(&self, execution_id: &str, manifest_id: &str) -> Result<()> {
        self.rows
            .remove(&(execution_id.to_string(), manifest_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(execution: &str, segment: u32) -> Manifest {
        Manifest::new(execution, "owner", "wf", segment, None)
    }

    #[tokio::test]
    async fn commit_flip_is_one_shot() {
        let store = MemoryManifestStore::new();
        let m = manifest("e1", 0);
        store.put(&m).await.unwrap();

        store.mark_committed("e1", &m.manifest_id).await.unwrap();
        let err = store.mark_committed("e1", &m.manifest_id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn latest_committed_ignores_uncommitted() {
        let store = MemoryManifestStore::new();
        let m0 = manifest("e1", 0);
        store.put(&m0).await.unwrap();
        store.mark_committed("e1", &m0.manifest_id).await.unwrap();

        std::thread::sleep(std::time::Duration::from_millis(2));
        let m1 = manifest("e1", 1);
        store.put(&m1).await.unwrap();

        let latest = store.latest_committed("e1").await.unwrap().unwrap();
        assert_eq!(latest.manifest_id, m0.manifest_id);
    }

    #[tokio::test]
    async fn duplicate_put_conflicts() {
        let store = MemoryManifestStore::new();
        let m = manifest("e1", 0);
        store.put(&m).await.unwrap();
        assert!(matches!(store.put(&m).await, Err(Error::Conflict(_))));
    }
}
