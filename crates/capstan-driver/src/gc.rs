//! The GC worker — drains the orphan-block queue in small batches.

use capstan_store::{BlobStore, GcQueue};
use std::sync::Arc;
use tracing::{info, warn};

/// Queue batch size cap.
pub const GC_BATCH_SIZE: usize = 10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcBatchReport {
    pub processed: usize,
    pub deleted: usize,
    /// Already gone — treated as success.
    pub skipped_missing: usize,
    /// Redelivered (or dead-lettered) for another pass.
    pub failed: usize,
}

pub struct GcWorker {
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn GcQueue>,
}

impl GcWorker {
    pub fn new(blobs: Arc<dyn BlobStore>, queue: Arc<dyn GcQueue>) -> Self {
        Self { blobs, queue }
    }

    /// Process one batch. Individual failures do not stop the batch;
    /// only the failed subset is redelivered.
    pub async fn drain_batch(&self) -> GcBatchReport {
        let batch = self.queue.receive(GC_BATCH_SIZE);
        let mut report = GcBatchReport {
            processed: batch.len(),
            ..Default::default()
        };

        for delivery in batch {
            let key = delivery.message.block_key.clone();
            let reason = delivery.message.reason;

            let exists = match self.blobs.head(&key).await {
                Ok(exists) => exists,
                Err(e) => {
                    warn!(key = %key, "gc head failed: {e}");
                    report.failed += 1;
                    self.queue.nack(delivery);
                    continue;
                }
            };
            if !exists {
                report.skipped_missing += 1;
                self.queue.ack(&delivery);
                continue;
            }

            match self.blobs.delete(&key).await {
                Ok(()) => {
                    info!(
                        key = %key,
                        reason = ?reason,
                        transaction = %delivery.message.transaction_id,
                        "gc cleaned orphan block"
                    );
                    report.deleted += 1;
                    self.queue.ack(&delivery);
                }
                Err(e) => {
                    warn!(key = %key, "gc delete failed: {e}");
                    report.failed += 1;
                    self.queue.nack(delivery);
                }
            }
        }
        report
    }

    /// Drain until the queue is empty. Used by tests and shutdown paths.
    pub async fn drain_all(&self) -> GcBatchReport {
        let mut total = GcBatchReport::default();
        loop {
            let report = self.drain_batch().await;
            if report.processed == 0 {
                break;
            }
            total.processed += report.processed;
            total.deleted += report.deleted;
            total.skipped_missing += report.skipped_missing;
            total.failed += report.failed;
            if report.failed == report.processed {
                // Everything redelivered; stop instead of spinning.
                break;
            }
        }
        total
    }
}
