//! Error kinds for the highlight pipeline
//!
//! Two layers: `PipelineError` is what the API boundary returns synchronously
//! (bad submissions, unknown jobs), while `StageFailure` is what a running
//! stage produces and the orchestrator records on the job.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::highlights::InvalidConfig;
use crate::process::ProcessError;

/// Result type for the synchronous API surface
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors surfaced directly to callers of the pipeline API
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Job not found: {0}")]
    NotFound(String),
}

impl From<InvalidConfig> for PipelineError {
    fn from(err: InvalidConfig) -> Self {
        PipelineError::InvalidConfig(err.0)
    }
}

/// Typed error kind recorded on a job alongside the human readable reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidInput,
    InvalidConfig,
    ExtractionFailed,
    TranscriptionFailed,
    ClipCutFailed,
    NotFound,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::InvalidConfig => "InvalidConfig",
            ErrorKind::ExtractionFailed => "ExtractionFailed",
            ErrorKind::TranscriptionFailed => "TranscriptionFailed",
            ErrorKind::ClipCutFailed => "ClipCutFailed",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// Failure produced by one pipeline stage
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageFailure {
    /// `transient` failures are retried with backoff, the rest fail the job
    #[error("Audio extraction failed: {cause}")]
    ExtractionFailed { cause: String, transient: bool },

    #[error("Transcription failed: {cause}")]
    TranscriptionFailed { cause: String },

    #[error("Highlight detection failed: {0}")]
    InvalidConfig(String),

    #[error("Clip cut failed: {cause}")]
    ClipCutFailed { cause: String },

    #[error("Job cancelled")]
    Cancelled,
}

impl StageFailure {
    pub fn extraction(cause: impl Into<String>, transient: bool) -> Self {
        StageFailure::ExtractionFailed {
            cause: cause.into(),
            transient,
        }
    }

    pub fn transcription(cause: impl Into<String>) -> Self {
        StageFailure::TranscriptionFailed { cause: cause.into() }
    }

    pub fn clip_cut(cause: impl Into<String>) -> Self {
        StageFailure::ClipCutFailed { cause: cause.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StageFailure::ExtractionFailed { .. } => ErrorKind::ExtractionFailed,
            StageFailure::TranscriptionFailed { .. } => ErrorKind::TranscriptionFailed,
            StageFailure::InvalidConfig(_) => ErrorKind::InvalidConfig,
            StageFailure::ClipCutFailed { .. } => ErrorKind::ClipCutFailed,
            StageFailure::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Only extraction failures are ever worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, StageFailure::ExtractionFailed { transient: true, .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageFailure::Cancelled)
    }

    /// Map a process failure into a transcription failure
    pub fn from_transcription_process(err: ProcessError) -> Self {
        match err {
            ProcessError::Cancelled { .. } => StageFailure::Cancelled,
            other => StageFailure::transcription(other.to_string()),
        }
    }

    /// Map a process failure into a per-candidate cut failure
    pub fn from_cut_process(err: ProcessError) -> Self {
        match err {
            ProcessError::Cancelled { .. } => StageFailure::Cancelled,
            other => StageFailure::clip_cut(other.to_string()),
        }
    }
}

impl From<InvalidConfig> for StageFailure {
    fn from(err: InvalidConfig) -> Self {
        StageFailure::InvalidConfig(err.0)
    }
}
