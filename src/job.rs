//! Job model: lifecycle state machine, recorded outcomes, status snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{ErrorKind, StageFailure};
use crate::highlights::{DetectorConfig, HighlightCandidate};

/// Opaque job identifier, unique per submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

/// Where a job is in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    ExtractingAudio,
    Transcribing,
    DetectingHighlights,
    CuttingClips,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::PartiallyFailed | JobState::Failed
        )
    }

    /// The stage that follows this one on the happy path
    pub fn next_stage(&self) -> Option<JobState> {
        match self {
            JobState::Pending => Some(JobState::ExtractingAudio),
            JobState::ExtractingAudio => Some(JobState::Transcribing),
            JobState::Transcribing => Some(JobState::DetectingHighlights),
            JobState::DetectingHighlights => Some(JobState::CuttingClips),
            _ => None,
        }
    }

    /// Legal transitions: one stage forward, `Failed` from anywhere
    /// non-terminal, success outcomes only out of `CuttingClips`
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobState::Failed => true,
            JobState::Succeeded | JobState::PartiallyFailed => *self == JobState::CuttingClips,
            stage => self.next_stage() == Some(stage),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a job ended where it did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TerminalReason {
    /// Every candidate was cut
    Completed,
    SomeClipsFailed { failed: usize, total: usize },
    AllClipsFailed { total: usize },
    /// The detector returned no candidates
    NoHighlightsFound,
    StageFailed { stage: JobState, kind: ErrorKind },
    Cancelled,
}

impl TerminalReason {
    pub fn final_state(&self) -> JobState {
        match self {
            TerminalReason::Completed => JobState::Succeeded,
            TerminalReason::SomeClipsFailed { .. } => JobState::PartiallyFailed,
            _ => JobState::Failed,
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            TerminalReason::Completed | TerminalReason::NoHighlightsFound => None,
            TerminalReason::SomeClipsFailed { .. } | TerminalReason::AllClipsFailed { .. } => {
                Some(ErrorKind::ClipCutFailed)
            }
            TerminalReason::StageFailed { kind, .. } => Some(*kind),
            TerminalReason::Cancelled => Some(ErrorKind::Cancelled),
        }
    }

    /// Human-readable explanation
    pub fn describe(&self) -> String {
        match self {
            TerminalReason::Completed => "all highlight clips were produced".to_string(),
            TerminalReason::SomeClipsFailed { failed, total } => {
                format!("{} of {} clips failed to cut", failed, total)
            }
            TerminalReason::AllClipsFailed { total } => format!("all {} clips failed to cut", total),
            TerminalReason::NoHighlightsFound => "no highlights found in the transcript".to_string(),
            TerminalReason::StageFailed { stage, kind } => format!("{} failed during {}", kind, stage),
            TerminalReason::Cancelled => "job was cancelled".to_string(),
        }
    }
}

/// A produced highlight clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    /// 1-based position in the detector's ranking
    pub rank: usize,
    pub path: PathBuf,
    pub candidate: HighlightCandidate,
    /// Exit status of the cut process
    pub exit_status: i32,
    pub size_bytes: u64,
}

/// A failure recorded against a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: JobState,
    pub kind: ErrorKind,
    pub reason: String,
    /// Set for per-candidate clip failures
    pub candidate_rank: Option<usize>,
    pub at: DateTime<Utc>,
}

impl StageError {
    pub fn new(stage: JobState, failure: &StageFailure) -> Self {
        Self {
            stage,
            kind: failure.kind(),
            reason: failure.to_string(),
            candidate_rank: None,
            at: Utc::now(),
        }
    }

    pub fn for_candidate(mut self, rank: usize) -> Self {
        self.candidate_rank = Some(rank);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: JobState,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: Option<i64>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransitionError {
    #[error("illegal transition {from} -> {to}")]
    Illegal { from: JobState, to: JobState },

    #[error("job already finished in state {0}")]
    Frozen(JobState),
}

/// One extraction request and everything recorded about it
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub video_path: PathBuf,
    pub detector: DetectorConfig,
    pub created_at: DateTime<Utc>,
    state: JobState,
    finished_at: Option<DateTime<Utc>>,
    clips: Vec<Clip>,
    errors: Vec<StageError>,
    timings: Vec<StageTiming>,
    terminal_reason: Option<TerminalReason>,
    extraction_attempts: u32,
    source_duration: Option<f64>,
}

impl Job {
    pub fn new(video_path: PathBuf, detector: DetectorConfig) -> Self {
        Self {
            id: JobId::new(),
            video_path,
            detector,
            created_at: Utc::now(),
            state: JobState::Pending,
            finished_at: None,
            clips: Vec::new(),
            errors: Vec::new(),
            timings: Vec::new(),
            terminal_reason: None,
            extraction_attempts: 0,
            source_duration: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn clips(&self) -> &[Clip] {
        &self.clips
    }

    pub fn errors(&self) -> &[StageError] {
        &self.errors
    }

    /// Move to the next pipeline stage
    pub fn advance(&mut self, next: JobState) -> Result<(), TransitionError> {
        if next.is_terminal() {
            return Err(TransitionError::Illegal { from: self.state, to: next });
        }
        self.transition(next)?;
        self.timings.push(StageTiming {
            stage: next,
            started_at: Utc::now(),
            elapsed_ms: None,
        });
        Ok(())
    }

    /// Enter the terminal state implied by `reason`
    pub fn finish(&mut self, reason: TerminalReason) -> Result<(), TransitionError> {
        self.transition(reason.final_state())?;
        self.finished_at = Some(Utc::now());
        self.terminal_reason = Some(reason);
        Ok(())
    }

    pub fn record_clip(&mut self, clip: Clip) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.clips.push(clip);
        Ok(())
    }

    pub fn record_error(&mut self, error: StageError) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.errors.push(error);
        Ok(())
    }

    pub fn record_extraction_attempt(&mut self) {
        self.extraction_attempts += 1;
    }

    pub fn set_source_duration(&mut self, duration: Option<f64>) {
        self.source_duration = duration;
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id,
            video_path: self.video_path.clone(),
            state: self.state,
            reason: self.terminal_reason.as_ref().map(TerminalReason::describe),
            error_kind: self.terminal_reason.as_ref().and_then(TerminalReason::kind),
            terminal_reason: self.terminal_reason.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
            source_duration: self.source_duration,
            extraction_attempts: self.extraction_attempts,
            clips: self.clips.clone(),
            errors: self.errors.clone(),
            timings: self.timings.clone(),
        }
    }

    fn ensure_open(&self) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Frozen(self.state));
        }
        Ok(())
    }

    fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Frozen(self.state));
        }
        if !self.state.can_transition_to(next) {
            return Err(TransitionError::Illegal { from: self.state, to: next });
        }

        let now = Utc::now();
        if let Some(timing) = self.timings.last_mut().filter(|t| t.elapsed_ms.is_none()) {
            timing.elapsed_ms = Some((now - timing.started_at).num_milliseconds());
        }
        self.state = next;
        Ok(())
    }
}

/// Serializable snapshot returned by status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub video_path: PathBuf,
    pub state: JobState,
    /// Human-readable terminal reason
    pub reason: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub terminal_reason: Option<TerminalReason>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub source_duration: Option<f64>,
    pub extraction_attempts: u32,
    pub clips: Vec<Clip>,
    pub errors: Vec<StageError>,
    pub timings: Vec<StageTiming>,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
