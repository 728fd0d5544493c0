//! CaptureRun Control Plane Library
//!
//! This crate provides the control plane for CaptureRun: the bounded task
//! scheduler, the workpool lease pool, the manual-mode ticket handshake,
//! conversion jobs with stall detection, and the HTTP surface over them.

pub mod config;
pub mod conversion;
pub mod events;
pub mod http;
pub mod manual;
pub mod metrics;
pub mod scheduler;
pub mod stall;
pub mod state;
pub mod stub;
pub mod workpool;

pub use config::{Config, QueueLimits};
pub use conversion::{ConversionBackend, ConversionJob};
pub use events::EventBus;
pub use manual::{Capturer, ManualMode};
pub use scheduler::Scheduler;
pub use state::AppState;
pub use workpool::{LeasePool, Provisioner};
