/// Highlight Reel - video highlight extraction
///
/// Turns one source video into a small set of highlight clips: extract the
/// audio, transcribe it with Whisper, score the transcript for salient
/// moments and cut those ranges out of the video with ffmpeg.

pub mod audio;
pub mod clip;
pub mod config;
pub mod error;
pub mod highlights;
pub mod job;
pub mod pipeline;
pub mod process;
pub mod transcription;

// Re-export main types for easy access
pub use crate::audio::{ExtractAudio, FfmpegAudioExtractor, TempAudio};
pub use crate::clip::{CutClip, CutReport, FfmpegClipCutter};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{ErrorKind, PipelineError, StageFailure};
pub use crate::highlights::{DetectorConfig, HighlightCandidate, HighlightDetector, MatchMode, Selection};
pub use crate::job::{Clip, JobId, JobState, JobStatus, StageError, TerminalReason};
pub use crate::pipeline::{Pipeline, PipelineStages};
pub use crate::transcription::{TranscriptSegment, TranscriptionEngine};
