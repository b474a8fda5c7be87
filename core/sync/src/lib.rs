//! Fieldsync Sync Engine
//!
//! Reconciles a device-local mutation queue with a remote authoritative
//! store over an intermittent link:
//! - Coalescing, persistent mutation queue
//! - Push with retry backoff and server-side conflict freezing
//! - Per-entity delta pull with last-write-wins merge
//! - Monotonic pull checkpoint
//! - Single-flight cycles behind a non-blocking lock

pub mod adapter;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod http;
pub mod lock;
pub mod queue;
pub mod retry;
pub mod state;

// Re-export main types
pub use adapter::{Adapter, PullResponse, PushResponse};
pub use checkpoint::{Checkpoint, CHECKPOINT_KEY};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use conflict::{ConflictStore, ResolutionResult};
pub use engine::SyncEngine;
pub use http::HttpAdapter;
pub use lock::{LockGuard, NamedLock, NoLock, TryLock};
pub use queue::{Completion, MutationQueue, RemoteMerge};
pub use retry::RetryScheduler;
pub use state::{CyclePhase, CycleSummary, SyncStatus};
