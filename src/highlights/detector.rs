//! Highlight detector: score, merge, rank, truncate
use super::scoring::KeywordScorer;
use super::{DetectorConfig, HighlightCandidate, InvalidConfig, Selection};
use crate::transcription::TranscriptSegment;
use tracing::debug;

/// Selects the most salient time ranges of a transcript
///
/// 1. every segment is scored by keyword hits (see [`KeywordScorer`]);
/// 2. consecutive scored segments separated by less than `min_gap_secs` are
///    merged, summing their scores, as long as the merged span stays within
///    `max_clip_length_secs`;
/// 3. candidates are ranked by score, ties broken by earliest start;
/// 4. the top `max_clips` are returned.
///
/// When no segment matches any keyword the detector falls back to the
/// longest segments by duration, so a transcript without keyword hits still
/// yields clips. Those candidates are tagged [`Selection::LongestSegment`].
#[derive(Debug, Clone)]
pub struct HighlightDetector {
    config: DetectorConfig,
    scorer: KeywordScorer,
}

impl HighlightDetector {
    pub fn new(config: DetectorConfig) -> Result<Self, InvalidConfig> {
        config.validate()?;
        let scorer = KeywordScorer::new(&config);
        Ok(Self { config, scorer })
    }

    /// Detect highlight candidates in an ordered, non-overlapping transcript.
    ///
    /// `source_duration` clamps candidates to the video length when known.
    pub fn detect(
        &self,
        segments: &[TranscriptSegment],
        source_duration: Option<f64>,
    ) -> Vec<HighlightCandidate> {
        if segments.is_empty() {
            return Vec::new();
        }

        let bound = upper_bound(segments, source_duration);
        let scores: Vec<f64> = segments.iter().map(|s| self.scorer.score(s)).collect();

        let mut candidates = if scores.iter().any(|s| *s > 0.0) {
            clamp_all(self.merge_scored(segments, &scores), bound)
        } else {
            Vec::new()
        };

        // Keyword hits that clamp to nothing (zero-length, past the end) don't count
        if candidates.is_empty() {
            debug!(
                "No usable keyword matches in {} segments, falling back to longest segments",
                segments.len()
            );
            candidates = clamp_all(self.longest_segments(segments), bound);
        }

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.start.total_cmp(&b.start))
        });
        candidates.truncate(self.config.max_clips);
        candidates
    }

    fn merge_scored(&self, segments: &[TranscriptSegment], scores: &[f64]) -> Vec<HighlightCandidate> {
        let max_len = self.config.max_clip_length_secs;
        let mut merged = Vec::new();
        let mut current: Option<HighlightCandidate> = None;

        for (index, (segment, &score)) in segments.iter().zip(scores).enumerate() {
            if score <= 0.0 {
                continue;
            }

            if let Some(candidate) = current.as_mut() {
                let gap = segment.start - candidate.end;
                let merged_span = segment.end - candidate.start;
                if gap < self.config.min_gap_secs && merged_span <= max_len {
                    candidate.end = segment.end;
                    candidate.score += score;
                    candidate.source_indices.push(index);
                    continue;
                }
            }

            if let Some(done) = current.take() {
                merged.push(done);
            }
            current = Some(single_segment(index, segment, score, max_len, Selection::Keyword));
        }

        merged.extend(current);
        merged
    }

    fn longest_segments(&self, segments: &[TranscriptSegment]) -> Vec<HighlightCandidate> {
        let max_len = self.config.max_clip_length_secs;
        segments
            .iter()
            .enumerate()
            .map(|(index, segment)| {
                single_segment(index, segment, 0.0, max_len, Selection::LongestSegment)
            })
            .collect()
    }
}

fn single_segment(
    index: usize,
    segment: &TranscriptSegment,
    score: f64,
    max_len: f64,
    selection: Selection,
) -> HighlightCandidate {
    HighlightCandidate {
        start: segment.start,
        end: segment.end.min(segment.start + max_len),
        score,
        source_indices: vec![index],
        selection,
    }
}

/// Latest time a candidate may reach: transcript end, or the video length if shorter
fn upper_bound(segments: &[TranscriptSegment], source_duration: Option<f64>) -> f64 {
    let transcript_end = segments.iter().map(|s| s.end).fold(0.0, f64::max);
    match source_duration {
        Some(duration) if duration.is_finite() && duration > 0.0 => transcript_end.min(duration),
        _ => transcript_end,
    }
}

fn clamp_all(candidates: Vec<HighlightCandidate>, bound: f64) -> Vec<HighlightCandidate> {
    candidates
        .into_iter()
        .filter_map(|c| clamp_to_bound(c, bound))
        .collect()
}

fn clamp_to_bound(mut candidate: HighlightCandidate, bound: f64) -> Option<HighlightCandidate> {
    candidate.start = candidate.start.max(0.0);
    candidate.end = candidate.end.min(bound);
    if candidate.end - candidate.start <= 0.0 {
        return None;
    }
    if candidate.selection == Selection::LongestSegment {
        candidate.score = candidate.duration();
    }
    Some(candidate)
}
