//! Core domain errors.

use thiserror::Error;

/// Core domain errors for CaptureRun.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
