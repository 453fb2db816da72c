//! Manifests — versioned metadata pinning one committed state snapshot.

use crate::value::BlockPointer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub manifest_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_manifest_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub execution_id: String,
    pub owner_id: String,
    pub workflow_id: String,
    pub segment_id: u32,
    /// Content hashes of every block this snapshot references.
    pub blocks: Vec<String>,
    /// state path -> pointer for offloaded subtrees.
    pub pointer_map: BTreeMap<String, BlockPointer>,
    pub committed: bool,
    /// Checksum of the inline state snapshot.
    pub checksum: String,
}

impl Manifest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_id: impl Into<String>,
        owner_id: impl Into<String>,
        workflow_id: impl Into<String>,
        segment_id: u32,
        previous_manifest_id: Option<String>,
    ) -> Self {
        Self {
            manifest_id: new_manifest_id(),
            previous_manifest_id,
            created_at: Utc::now(),
            execution_id: execution_id.into(),
            owner_id: owner_id.into(),
            workflow_id: workflow_id.into(),
            segment_id,
            blocks: Vec::new(),
            pointer_map: BTreeMap::new(),
            committed: false,
            checksum: String::new(),
        }
    }
}

/// Time-ordered manifest id: millisecond timestamp prefix keeps ids
/// monotone per execution, uuid suffix keeps them unique.
pub fn new_manifest_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{:013}-{}", millis, &suffix[..8])
}

/// Blocks are content-addressed: `workflows/{owner}/{workflow}/{exec}/blocks/{sha256}`.
pub fn block_key(owner: &str, workflow: &str, execution: &str, sha256: &str) -> String {
    format!("workflows/{owner}/{workflow}/{execution}/blocks/{sha256}")
}

pub fn manifest_key(owner: &str, workflow: &str, execution: &str, manifest_id: &str) -> String {
    format!("workflows/{owner}/{workflow}/{execution}/manifests/{manifest_id}.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_ids_are_time_ordered() {
        let a = new_manifest_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_manifest_id();
        assert!(b > a, "{b} should sort after {a}");
    }

    #[test]
    fn block_key_layout() {
        let key = block_key("o1", "w1", "e1", "abc123");
        assert_eq!(key, "workflows/o1/w1/e1/blocks/abc123");
    }
}
