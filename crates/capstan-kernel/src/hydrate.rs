//! Manifest hydration — load blocks, verify checksums, resolve pointers.
//!
//! Reads retry with short exponential backoff: the blob store is
//! read-after-write consistent, so a block that stays missing or corrupt
//! through the retry budget is a real fault. Missing surfaces as
//! `StateHydration`; a persistent checksum mismatch is the stronger
//! `StorageCorruption`.

use crate::offload::WHOLE_STATE_PATH;
use capstan_core::{block_key, Error, Manifest, Result, StateBag, Value};
use capstan_store::{verify_checksum, with_backoff, BlobStore, RetryPolicy};
use futures::future::BoxFuture;
use futures::FutureExt;

/// Pointers loaded from a block may themselves point (the whole-state
/// fallback); anything deeper than this is a malformed tree.
const MAX_POINTER_DEPTH: u8 = 4;

pub async fn hydrate_manifest(
    blobs: &dyn BlobStore,
    manifest: &Manifest,
    retry: RetryPolicy,
) -> Result<StateBag> {
    let root_key = block_key(
        &manifest.owner_id,
        &manifest.workflow_id,
        &manifest.execution_id,
        &manifest.checksum,
    );
    let bytes = load_verified(blobs, &root_key, &manifest.checksum, retry).await?;
    let bag: StateBag = serde_json::from_slice(&bytes)?;

    let resolved = resolve_value(blobs, Value::Map(bag), retry, 0).await?;
    let mut bag = match resolved {
        Value::Map(bag) => bag,
        _ => return Err(Error::StateHydration("root block is not a mapping".into())),
    };

    // Unwrap the whole-state fallback shape.
    if bag.len() == 1 {
        match bag.remove(WHOLE_STATE_PATH) {
            Some(Value::Map(inner)) => return Ok(inner),
            Some(other) => {
                // A user key that merely shares the name.
                bag.insert(WHOLE_STATE_PATH, other);
            }
            None => {}
        }
    }
    Ok(bag)
}

async fn load_verified(
    blobs: &dyn BlobStore,
    key: &str,
    checksum: &str,
    retry: RetryPolicy,
) -> Result<Vec<u8>> {
    let result = with_backoff(retry, "block_read", || async {
        let bytes = blobs.get(key).await?;
        verify_checksum(&bytes, checksum)?;
        Ok(bytes)
    })
    .await;

    match result {
        Ok(bytes) => Ok(bytes),
        // Corruption that outlived the retries is its own failure kind.
        Err(e @ Error::StorageCorruption(_)) => Err(e),
        Err(Error::NotFound(what)) => Err(Error::StateHydration(format!(
            "{what} missing after {} attempts",
            retry.attempts
        ))),
        Err(e) => Err(Error::StateHydration(e.to_string())),
    }
}

fn resolve_value<'a>(
    blobs: &'a dyn BlobStore,
    value: Value,
    retry: RetryPolicy,
    depth: u8,
) -> BoxFuture<'a, Result<Value>> {
    async move {
        if depth > MAX_POINTER_DEPTH {
            return Err(Error::StateHydration(format!(
                "pointer chain deeper than {MAX_POINTER_DEPTH}"
            )));
        }
        match value {
            Value::Pointer(pointer) => {
                let bytes = load_verified(blobs, &pointer.key, &pointer.checksum, retry).await?;
                let loaded: Value = serde_json::from_slice(&bytes)?;
                resolve_value(blobs, loaded, retry, depth + 1).await
            }
            Value::Seq(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(resolve_value(blobs, item, retry, depth).await?);
                }
                Ok(Value::Seq(resolved))
            }
            Value::Map(bag) => {
                let mut resolved = StateBag::new();
                for (key, item) in bag {
                    resolved.insert(key, resolve_value(blobs, item, retry, depth).await?);
                }
                Ok(Value::Map(resolved))
            }
            scalar => Ok(scalar),
        }
    }
    .boxed()
}
