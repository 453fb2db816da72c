//! The orchestrator driver — the state-machine loop tying partitioner,
//! segment runner, state kernel, governance, and the durable stores
//! together.
//!
//! Realized here as an in-process async loop: durable per-step progress
//! comes from committed manifests, so a crashed driver resumes at the
//! last committed manifest; the terminal event reaches the finalizer
//! at least once.

pub mod aggregate;
pub mod driver;
pub mod fanout;
pub mod gc;
pub mod idempotency;
pub mod notify;

pub use aggregate::AggregateReport;
pub use driver::{DriverDeps, SubmitOutcome, SubmitRequest, WorkflowDriver};
pub use gc::{GcBatchReport, GcWorker};
pub use idempotency::{derive_idempotency_key, Finalizer, TerminalEvent};
pub use notify::{ProgressNotifier, ProgressSink, ProgressSnapshot};
