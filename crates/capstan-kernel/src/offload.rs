//! Payload-size-driven offloading.
//!
//! However a state arrived, if it is big it goes to the blob store: the
//! largest top-level subtrees are pointerized greedily until the inline
//! snapshot fits under the threshold. Once a value is a pointer it is
//! never pointerized again — the whole-state fallback therefore starts
//! over from the original tree rather than wrapping pointers in
//! pointers.

use capstan_core::{block_key, BlockPointer, StateBag, Value};
use capstan_store::content_hash;

/// Fallback path key when the entire state is offloaded as one block.
pub const WHOLE_STATE_PATH: &str = "__state";

/// One subtree scheduled for the blob store.
#[derive(Clone, Debug)]
pub struct OffloadedBlock {
    /// Top-level state path the pointer replaces.
    pub path: String,
    pub key: String,
    pub checksum: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct OffloadPlan {
    pub state: StateBag,
    pub blocks: Vec<OffloadedBlock>,
}

/// Identity of the execution whose blocks we are writing — shapes the
/// content-addressed keys.
#[derive(Clone, Debug)]
pub struct BlockScope<'a> {
    pub bucket: &'a str,
    pub owner_id: &'a str,
    pub workflow_id: &'a str,
    pub execution_id: &'a str,
}

impl BlockScope<'_> {
    fn pointer_for(&self, bytes: &[u8]) -> (String, BlockPointer) {
        let checksum = content_hash(bytes);
        let key = block_key(self.owner_id, self.workflow_id, self.execution_id, &checksum);
        let pointer = BlockPointer::new(self.bucket, key.clone(), checksum.clone(), bytes.len() as u64);
        (checksum, pointer)
    }
}

/// Pointerize until the inline snapshot fits within `threshold` bytes.
pub fn offload(state: StateBag, threshold: usize, scope: &BlockScope<'_>) -> OffloadPlan {
    if state.serialized_size() <= threshold {
        return OffloadPlan {
            state,
            blocks: Vec::new(),
        };
    }

    let original = state.clone();
    let mut state = state;
    let mut blocks = Vec::new();

    while state.serialized_size() > threshold {
        // Largest non-pointer top-level subtree is the next candidate.
        let candidate = state
            .iter()
            .filter(|(_, v)| !v.is_pointer())
            .max_by_key(|(_, v)| v.serialized_size())
            .map(|(k, v)| (k.clone(), v.serialized_size()));

        let Some((path, size)) = candidate else {
            break;
        };
        // A pointer object serializes at roughly 250 bytes; swapping a
        // smaller subtree for one only grows the state.
        if size < 512 {
            break;
        }

        let value = state.get(&path).cloned().expect("candidate exists");
        let bytes = serde_json::to_vec(&value).unwrap_or_default();
        let (checksum, pointer) = scope.pointer_for(&bytes);
        blocks.push(OffloadedBlock {
            path: path.clone(),
            key: pointer.key.clone(),
            checksum,
            bytes,
        });
        state.insert(path, Value::Pointer(pointer));
    }

    if state.serialized_size() > threshold {
        // Last resort: one block for the original tree. The inline bag
        // shrinks to a single pointer, and no pointer ends up beneath
        // another because we discard the partial pointerization.
        let bytes = serde_json::to_vec(&original).unwrap_or_default();
        let (checksum, pointer) = scope.pointer_for(&bytes);
        let mut wrapped = StateBag::new();
        wrapped.insert(WHOLE_STATE_PATH, Value::Pointer(pointer.clone()));
        return OffloadPlan {
            state: wrapped,
            blocks: vec![OffloadedBlock {
                path: WHOLE_STATE_PATH.to_string(),
                key: pointer.key,
                checksum,
                bytes,
            }],
        };
    }

    OffloadPlan { state, blocks }
}
