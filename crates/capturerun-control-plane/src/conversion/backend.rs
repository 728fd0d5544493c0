//! Converter backend interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use capturerun_core::{CaptureRequest, ConversionStatus, Lease, PerformanceSample};

use crate::scheduler::JobError;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl From<BackendError> for JobError {
    fn from(e: BackendError) -> Self {
        JobError::Backend(e.0)
    }
}

/// What the backend reports about a submitted conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverterStatus {
    pub stage: ConversionStatus,

    /// Completion percentage, when the backend knows it.
    #[serde(default)]
    pub percent: Option<i32>,

    /// Latest VM counters, when the backend samples them.
    #[serde(default)]
    pub performance: Option<PerformanceSample>,

    /// Failure message for the failed stage.
    #[serde(default)]
    pub error: Option<String>,
}

impl ConverterStatus {
    pub fn new(stage: ConversionStatus) -> Self {
        Self {
            stage,
            percent: None,
            performance: None,
            error: None,
        }
    }

    pub fn with_percent(mut self, percent: i32) -> Self {
        self.percent = Some(percent);
        self
    }

    pub fn with_performance(mut self, sample: PerformanceSample) -> Self {
        self.performance = Some(sample);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Runs automatic conversions on leased VMs.
#[async_trait]
pub trait ConversionBackend: Send + Sync + 'static {
    /// Start converting on the leased VM; returns the backend's job id.
    async fn submit(&self, lease: &Lease, request: &CaptureRequest) -> Result<String, BackendError>;

    async fn poll(&self, job: &str) -> Result<ConverterStatus, BackendError>;

    async fn cancel(&self, job: &str) -> Result<(), BackendError>;
}
