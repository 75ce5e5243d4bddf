pub mod engine;
pub mod whisper;

pub use engine::{shared_engine, LazySharedEngine, SharedEngine};
pub use whisper::{parse_whisper_json, WhisperEngine};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::watch;

use crate::error::StageFailure;

/// One time-coded unit of recognized speech
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    pub text: String,
    /// Engine confidence in 0..=1, if the backend reports one
    pub confidence: Option<f64>,
}

impl TranscriptSegment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: Option<f64>) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Speech-to-text backend
///
/// Implementations turn one normalized audio file into an ordered transcript.
/// They must stop work promptly once `cancel_rx` flips to `true`.
#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn transcribe(
        &self,
        audio_path: &Path,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<Vec<TranscriptSegment>, StageFailure>;
}

/// Check that a transcript is usable as-is: finite, non-negative times,
/// `end >= start`, ordered by start and non-overlapping. Never re-sorts.
pub fn validate_transcript(segments: &[TranscriptSegment]) -> Result<(), String> {
    let mut previous_end: Option<f64> = None;

    for (index, segment) in segments.iter().enumerate() {
        if !segment.start.is_finite() || !segment.end.is_finite() {
            return Err(format!("segment {} has a non-finite timestamp", index));
        }
        if segment.start < 0.0 {
            return Err(format!("segment {} starts at negative time {:.3}s", index, segment.start));
        }
        if segment.end < segment.start {
            return Err(format!(
                "segment {} ends ({:.3}s) before it starts ({:.3}s)",
                index, segment.end, segment.start
            ));
        }
        if let Some(prev_end) = previous_end {
            if segment.start < prev_end {
                return Err(format!(
                    "segment {} starts at {:.3}s before previous segment ends at {:.3}s",
                    index, segment.start, prev_end
                ));
            }
        }
        previous_end = Some(segment.end);
    }

    Ok(())
}
