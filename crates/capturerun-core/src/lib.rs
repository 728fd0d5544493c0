//! CaptureRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Hypervisor APIs
//! - Runtime specifics
//!
//! All types here represent the core business domain of CaptureRun:
//! tasks and their status model, scheduler events, capture states for
//! the manual-mode handshake, performance samples, and workpool leases.

pub mod capture;
pub mod error;
pub mod event;
pub mod ids;
pub mod perf;
pub mod status;
pub mod task;
pub mod workpool;

// Re-export commonly used types
pub use capture::{CaptureRequest, CaptureState, CaptureStatus};
pub use error::CoreError;
pub use event::TaskEvent;
pub use ids::{InstanceId, LeaseId, TaskId, Ticket, WorkpoolId};
pub use perf::PerformanceSample;
pub use status::{ConversionStatus, ManualModeStatus, MetaStatus, TaskKind, TaskStatus};
pub use task::{NewTask, TaskField, TaskState, TaskUpdate};
pub use workpool::{Instance, InstanceState, Lease, WorkpoolSpec, WorkpoolSummary};

/// Current wall-clock time as Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
