//! edgesync sync engine
//!
//! Keeps data consistent between an intermittently connected edge node
//! and a cloud store:
//! - Connectivity monitoring over a set of probed endpoints
//! - Durable, priority-ordered operation queue
//! - Version tracking and conflict detection/resolution
//! - Bandwidth-aware batch draining with bounded retries
//! - Background loops with a durable shutdown

pub mod bandwidth;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod handler;
pub mod http;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod transfer;
pub mod version;

// Re-export main types
pub use bandwidth::BandwidthOptimizer;
pub use config::SyncConfig;
pub use conflict::{ConflictRecord, ConflictResolver, ConflictStrategy, MergeFn};
pub use connectivity::{
    ConnectivityMonitor, ConnectivitySample, ConnectivityStatus, Probe, StaticProbe,
};
pub use engine::{
    BatchReport, DroppedOperation, EngineCounters, EngineStatus, SyncEngine, SyncEngineBuilder,
    TransferId,
};
pub use handler::{HandlerRegistry, OperationHandler};
pub use http::{HttpHandler, HttpProbe, HttpTransport};
pub use queue::{OperationKind, OperationQueue, QueuedOperation};
pub use retry::{RetryDecision, RetryPolicy};
pub use transfer::{RecordTransport, SyncDirection, SyncOperation, TransferStatus};
pub use version::{SyncRecord, VersionTracker};
