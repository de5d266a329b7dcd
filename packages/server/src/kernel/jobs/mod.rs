//! Job orchestration core.
//!
//! - [`Dispatcher`] - decides whether a request needs a new attempt and hands
//!   committed attempts to the task queue
//! - [`Worker`] / [`WorkerPool`] - run attempts, classify failures, retry with backoff
//! - [`JobStore`] - durable per (url, work type) state machine
//! - [`DedupLock`] - advisory TTL lock against duplicate submissions
//! - [`ScreenshotSweep`] - finishes url scans whose screenshot arrived late
//!
//! # Architecture
//!
//! ```text
//! request_job(url, work_type)
//!     │
//!     ├─► processed artifact? ──► SKIP
//!     ├─► DedupLock.try_acquire ──fail──► ATTACH / THROTTLED
//!     ├─► JobStore.plan_dispatch (row lock) ──► ATTACH | DISPATCH
//!     └─► (after commit) TaskQueue.enqueue
//!
//! WorkerPool
//!     │
//!     └─► Worker.process(envelope)
//!             ├─► JobStore.claim
//!             ├─► handlers::run ──► Analyzer / Scanner ──► ArtifactStore
//!             └─► JobStore.mark_* ──► Broadcaster.publish
//! ```

mod artifacts;
mod dispatcher;
mod error;
mod handlers;
mod job_store;
mod lock;
mod postgres_store;
mod queue;
mod record;
mod retry;
mod sweep;
mod worker;

pub use artifacts::{
    clean_markdown, Artifact, ArtifactPayload, ArtifactStore, Classification, DeepReport,
    MemoryArtifactStore, UrlScanResult,
};
pub use dispatcher::{DispatchDecision, DispatchError, Dispatcher, JobRequestOutcome};
pub use error::{BackendError, ErrorKind, JobError, StoreError};
pub use job_store::{JobStore, MemoryJobStore};
pub use lock::{DedupLock, LockKey};
pub use postgres_store::PostgresJobStore;
pub use queue::{LocalTaskQueue, TaskEnvelope, TaskQueue, TaskReceiver};
pub use record::{new_task_id, DispatchPlan, JobRecord, JobStatus, WorkType, STALE_JOB_ERROR};
pub use retry::RetryPolicy;
pub use sweep::ScreenshotSweep;
pub use worker::{JobOutcome, JobWorkerConfig, Worker, WorkerPool};
