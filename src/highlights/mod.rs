//! Highlight detection over time-coded transcripts
//!
//! Turns an ordered transcript into a small ranked set of time ranges worth
//! clipping. Everything in here is pure: no I/O, no clocks, no hidden state.

pub mod detector;
pub mod scoring;

pub use detector::HighlightDetector;
pub use scoring::KeywordScorer;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Rejected detector configuration
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid detector configuration: {0}")]
pub struct InvalidConfig(pub String);

/// How keywords are matched against segment text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Case-insensitive substring match ("goal" matches "goalkeeper")
    Substring,
    /// Case-insensitive whole-word match, multi-word keywords match as phrases
    #[default]
    Token,
}

/// Per-job detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Terms that mark a segment as salient
    pub keywords: BTreeSet<String>,

    /// Scored segments closer than this (seconds) merge into one candidate
    pub min_gap_secs: f64,

    /// Upper bound on a single candidate's span (seconds)
    pub max_clip_length_secs: f64,

    /// Maximum number of candidates returned
    pub max_clips: usize,

    /// Scale keyword hits by the engine's confidence when available
    pub confidence_weighting: bool,

    pub match_mode: MatchMode,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            keywords: [
                "amazing",
                "incredible",
                "important",
                "highlight",
                "key point",
                "secret",
                "best",
                "wow",
            ]
            .iter()
            .map(|k| k.to_string())
            .collect(),
            min_gap_secs: 1.0,
            max_clip_length_secs: 60.0,
            max_clips: 4,
            confidence_weighting: true,
            match_mode: MatchMode::Token,
        }
    }
}

impl DetectorConfig {
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_min_gap(mut self, secs: f64) -> Self {
        self.min_gap_secs = secs;
        self
    }

    pub fn with_max_clip_length(mut self, secs: f64) -> Self {
        self.max_clip_length_secs = secs;
        self
    }

    pub fn with_max_clips(mut self, max_clips: usize) -> Self {
        self.max_clips = max_clips;
        self
    }

    pub fn with_match_mode(mut self, mode: MatchMode) -> Self {
        self.match_mode = mode;
        self
    }

    pub fn with_confidence_weighting(mut self, enabled: bool) -> Self {
        self.confidence_weighting = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.max_clips == 0 {
            return Err(InvalidConfig("max_clips must be greater than 0".to_string()));
        }
        if !self.min_gap_secs.is_finite() || self.min_gap_secs < 0.0 {
            return Err(InvalidConfig(format!(
                "min_gap_secs must be a non-negative number, got {}",
                self.min_gap_secs
            )));
        }
        if !self.max_clip_length_secs.is_finite() || self.max_clip_length_secs <= 0.0 {
            return Err(InvalidConfig(format!(
                "max_clip_length_secs must be positive, got {}",
                self.max_clip_length_secs
            )));
        }
        if self.keywords.iter().any(|k| k.trim().is_empty()) {
            return Err(InvalidConfig("keywords must not be blank".to_string()));
        }
        Ok(())
    }
}

/// How a candidate was selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    /// One or more keyword-bearing segments, possibly merged
    Keyword,
    /// No keyword matched anywhere; one of the longest segments
    LongestSegment,
}

/// A scored, time-bounded range of the source video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighlightCandidate {
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    /// Salience, higher is better
    pub score: f64,
    /// Transcript indices this candidate was built from
    pub source_indices: Vec<usize>,
    pub selection: Selection,
}

impl HighlightCandidate {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &HighlightCandidate) -> bool {
        self.start < other.end && other.start < self.end
    }
}
