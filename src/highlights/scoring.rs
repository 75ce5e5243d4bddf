//! Keyword scoring of individual transcript segments
use super::{DetectorConfig, MatchMode};
use crate::transcription::TranscriptSegment;

/// A keyword normalized once up front
#[derive(Debug, Clone)]
struct Keyword {
    lowered: String,
    tokens: Vec<String>,
}

/// Scores segments by keyword hits, optionally weighted by confidence
#[derive(Debug, Clone)]
pub struct KeywordScorer {
    keywords: Vec<Keyword>,
    mode: MatchMode,
    confidence_weighting: bool,
}

impl KeywordScorer {
    pub fn new(config: &DetectorConfig) -> Self {
        let keywords = config
            .keywords
            .iter()
            .map(|k| {
                let lowered = k.trim().to_lowercase();
                let tokens = tokenize(&lowered);
                Keyword { lowered, tokens }
            })
            .filter(|k| !k.lowered.is_empty())
            .collect();

        Self {
            keywords,
            mode: config.match_mode,
            confidence_weighting: config.confidence_weighting,
        }
    }

    pub fn has_keywords(&self) -> bool {
        !self.keywords.is_empty()
    }

    /// Number of keyword occurrences in `text`
    pub fn count_hits(&self, text: &str) -> usize {
        if self.keywords.is_empty() {
            return 0;
        }
        let lowered = text.to_lowercase();
        match self.mode {
            MatchMode::Substring => self
                .keywords
                .iter()
                .map(|k| lowered.matches(k.lowered.as_str()).count())
                .sum(),
            MatchMode::Token => {
                let tokens = tokenize(&lowered);
                self.keywords
                    .iter()
                    .filter(|k| !k.tokens.is_empty() && k.tokens.len() <= tokens.len())
                    .map(|k| {
                        tokens
                            .windows(k.tokens.len())
                            .filter(|window| *window == k.tokens.as_slice())
                            .count()
                    })
                    .sum()
            }
        }
    }

    /// Salience of one segment; zero means "no keyword here"
    pub fn score(&self, segment: &TranscriptSegment) -> f64 {
        let hits = self.count_hits(&segment.text);
        if hits == 0 {
            return 0.0;
        }

        let mut score = hits as f64;
        if self.confidence_weighting {
            if let Some(confidence) = segment.confidence.filter(|c| c.is_finite()) {
                // Low confidence halves a hit at most, it never erases one
                score *= 0.5 + 0.5 * confidence.clamp(0.0, 1.0);
            }
        }
        score
    }
}

/// Lowercase word tokens; apostrophes stay inside words ("don't")
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|t| t.trim_matches('\''))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}
