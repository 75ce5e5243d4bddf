//! Clip cutting: one highlight candidate in, one self-contained video file out

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ClipConfig;
use crate::error::StageFailure;
use crate::highlights::HighlightCandidate;
use crate::process::{ProcessError, ProcessRunner};

/// What a successful cut produced
#[derive(Debug, Clone, PartialEq)]
pub struct CutReport {
    pub exit_code: i32,
    pub size_bytes: u64,
}

/// Clip cutting stage
#[async_trait]
pub trait CutClip: Send + Sync {
    /// Cut `candidate` out of `video_path` into `output_path`.
    ///
    /// Must never overwrite an existing `output_path`.
    async fn cut(
        &self,
        video_path: &Path,
        candidate: &HighlightCandidate,
        output_path: &Path,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<CutReport, StageFailure>;
}

/// `<dir>/<jobId>_highlight_<rank>_<start>-<end>.<container>`
pub fn output_path_for(
    dir: &Path,
    job_id: &str,
    rank: usize,
    candidate: &HighlightCandidate,
    container: &str,
) -> PathBuf {
    dir.join(format!(
        "{}_highlight_{}_{:.2}-{:.2}.{}",
        job_id, rank, candidate.start, candidate.end, container
    ))
}

/// ffmpeg-based cutter
#[derive(Debug, Clone)]
pub struct FfmpegClipCutter {
    config: ClipConfig,
}

impl FfmpegClipCutter {
    pub fn new(config: ClipConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, video_path: &Path, candidate: &HighlightCandidate, output_path: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-nostdin".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-n".to_string(), // Never overwrite
            "-ss".to_string(),
            format!("{:.3}", candidate.start),
            "-i".to_string(),
            video_path.to_string_lossy().into_owned(),
            "-t".to_string(),
            format!("{:.3}", candidate.duration()),
        ];

        if self.config.stream_copy {
            args.extend(["-c".to_string(), "copy".to_string()]);
        } else {
            args.extend(
                ["-c:v", "libx264", "-preset", "veryfast", "-crf", "20", "-c:a", "aac", "-b:a", "128k"]
                    .iter()
                    .map(|s| s.to_string()),
            );
        }

        args.extend(["-avoid_negative_ts".to_string(), "make_zero".to_string()]);
        if self.config.container.eq_ignore_ascii_case("mp4") || self.config.container.eq_ignore_ascii_case("mov") {
            args.extend(["-movflags".to_string(), "+faststart".to_string()]);
        }
        args.push(output_path.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl CutClip for FfmpegClipCutter {
    async fn cut(
        &self,
        video_path: &Path,
        candidate: &HighlightCandidate,
        output_path: &Path,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<CutReport, StageFailure> {
        if tokio::fs::try_exists(output_path).await.unwrap_or(true) {
            return Err(StageFailure::clip_cut(format!(
                "output {} already exists",
                output_path.display()
            )));
        }

        let start_time = Instant::now();
        debug!(
            "✂️  Cutting {:.2}s-{:.2}s into {}",
            candidate.start,
            candidate.end,
            output_path.display()
        );

        let result = ProcessRunner::new(&self.config.ffmpeg_path)
            .with_timeout(self.config.timeout())
            .with_cancel(cancel_rx)
            .run(self.build_args(video_path, candidate, output_path))
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                if !lost_overwrite_race(&err) {
                    remove_partial(output_path).await;
                }
                return Err(StageFailure::from_cut_process(err));
            }
        };

        let size_bytes = tokio::fs::metadata(output_path).await.map(|m| m.len()).unwrap_or(0);
        if size_bytes == 0 {
            remove_partial(output_path).await;
            return Err(StageFailure::clip_cut(format!(
                "ffmpeg produced no output for {}",
                output_path.display()
            )));
        }

        info!(
            "🎬 Clip ready: {} ({:.1}s, {:.1} MB in {:.1}s)",
            output_path.display(),
            candidate.duration(),
            size_bytes as f64 / 1_000_000.0,
            start_time.elapsed().as_secs_f64()
        );
        Ok(CutReport {
            exit_code: output.exit_code,
            size_bytes,
        })
    }
}

/// Someone else created the file between our check and ffmpeg's `-n`
fn lost_overwrite_race(err: &ProcessError) -> bool {
    err.stderr().contains("already exists")
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("🧹 Removed partial clip: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("⚠️  Could not remove partial clip {}: {}", path.display(), e),
    }
}
