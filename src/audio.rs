//! Audio extraction: video in, mono 16 kHz WAV out

use async_trait::async_trait;
use regex::RegexSet;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::AudioConfig;
use crate::error::StageFailure;
use crate::process::{ProcessError, ProcessRunner};

/// A WAV header with no samples
const EMPTY_WAV_BYTES: u64 = 44;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Temporary audio file owned by one job
///
/// Removed exactly once: explicitly through [`TempAudio::release`], or on
/// drop when the job exits early (failure, cancellation, panic).
#[derive(Debug)]
pub struct TempAudio {
    path: TempPath,
}

impl TempAudio {
    /// Create an empty `.wav` file in `dir`, or the system temp dir
    pub fn create_in(dir: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("highlight-audio-").suffix(".wav");
        let file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(Self {
            path: file.into_temp_path(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> io::Result<u64> {
        Ok(tokio::fs::metadata(self.path()).await?.len())
    }

    /// Delete the file now, reporting failure instead of ignoring it
    pub fn release(self) -> io::Result<()> {
        let path: PathBuf = self.path.to_path_buf();
        self.path.close()?;
        debug!("🧹 Released temporary audio: {}", path.display());
        Ok(())
    }
}

/// Audio extraction stage
#[async_trait]
pub trait ExtractAudio: Send + Sync {
    /// One extraction attempt; retries are the caller's business
    async fn extract(
        &self,
        video_path: &Path,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<TempAudio, StageFailure>;

    /// Source duration in seconds, when it can be learned
    async fn probe_duration(&self, _video_path: &Path, _cancel_rx: watch::Receiver<bool>) -> Option<f64> {
        None
    }
}

/// ffmpeg-based extractor producing 16-bit PCM WAV
#[derive(Debug, Clone)]
pub struct FfmpegAudioExtractor {
    config: AudioConfig,
}

impl FfmpegAudioExtractor {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, video_path: &Path, audio_path: &Path) -> Vec<String> {
        vec![
            "-nostdin".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-y".to_string(), // The scoped temp file already exists
            "-i".to_string(),
            video_path.to_string_lossy().into_owned(),
            "-vn".to_string(),
            "-acodec".to_string(),
            "pcm_s16le".to_string(),
            "-ar".to_string(),
            self.config.sample_rate.to_string(),
            "-ac".to_string(),
            self.config.channels.to_string(),
            "-f".to_string(),
            "wav".to_string(),
            audio_path.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl ExtractAudio for FfmpegAudioExtractor {
    async fn extract(
        &self,
        video_path: &Path,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<TempAudio, StageFailure> {
        let start_time = Instant::now();
        let audio = TempAudio::create_in(self.config.temp_dir.as_deref()).map_err(|e| {
            StageFailure::extraction(format!("cannot create temporary audio file: {}", e), true)
        })?;

        info!("🎵 Extracting audio for transcription: {}", video_path.display());

        ProcessRunner::new(&self.config.ffmpeg_path)
            .with_timeout(self.config.timeout())
            .with_cancel(cancel_rx)
            .run(self.build_args(video_path, audio.path()))
            .await
            .map_err(classify_ffmpeg_error)?;

        let size = audio
            .len()
            .await
            .map_err(|e| StageFailure::extraction(format!("cannot stat extracted audio: {}", e), true))?;
        if size <= EMPTY_WAV_BYTES {
            warn!("⚠️  ffmpeg produced empty audio ({} bytes) for {}", size, video_path.display());
            return Err(StageFailure::extraction(
                format!("ffmpeg produced empty audio ({} bytes)", size),
                true,
            ));
        }

        info!(
            "✅ Audio extracted: {} ({:.1} MB in {:.1}s)",
            audio.path().display(),
            size as f64 / 1_000_000.0,
            start_time.elapsed().as_secs_f64()
        );
        Ok(audio)
    }

    async fn probe_duration(&self, video_path: &Path, cancel_rx: watch::Receiver<bool>) -> Option<f64> {
        let output = ProcessRunner::new(&self.config.ffprobe_path)
            .with_timeout(PROBE_TIMEOUT)
            .with_cancel(cancel_rx)
            .run([
                OsStr::new("-v"),
                OsStr::new("quiet"),
                OsStr::new("-print_format"),
                OsStr::new("json"),
                OsStr::new("-show_format"),
                video_path.as_os_str(),
            ])
            .await;

        match output {
            Ok(output) => {
                let duration = parse_probe_duration(&output.stdout);
                debug!("📏 Source duration for {}: {:?}", video_path.display(), duration);
                duration
            }
            Err(e) => {
                debug!("ffprobe unavailable for {}: {}", video_path.display(), e);
                None
            }
        }
    }
}

/// Duration from `ffprobe -print_format json -show_format` output
pub fn parse_probe_duration(json: &str) -> Option<f64> {
    let data: serde_json::Value = serde_json::from_str(json).ok()?;
    let format = &data["format"];
    let duration = match &format["duration"] {
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        serde_json::Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    (duration.is_finite() && duration > 0.0).then_some(duration)
}

/// ffmpeg stderr messages that no retry can fix
const PERMANENT_ERROR_PATTERNS: &[&str] = &[
    r"(?i)invalid data found when processing input",
    r"(?i)does not contain any stream",
    r"(?i)matches no streams",
    r"(?i)output file #\d+ does not contain any stream",
    r"(?i)unknown decoder",
    r"(?i)decoder \(codec [^)]*\) not found",
    r"(?i)could not find codec parameters",
    r"(?i)no such file or directory",
    r"(?i)moov atom not found",
    r"(?i)permission denied",
];

fn permanent_errors() -> Option<&'static RegexSet> {
    static PATTERNS: OnceLock<Option<RegexSet>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| RegexSet::new(PERMANENT_ERROR_PATTERNS).ok())
        .as_ref()
}

/// True when ffmpeg's stderr reports a codec or container problem
pub fn is_permanent_ffmpeg_error(stderr: &str) -> bool {
    permanent_errors().map_or(false, |set| set.is_match(stderr))
}

fn classify_ffmpeg_error(err: ProcessError) -> StageFailure {
    match err {
        ProcessError::Cancelled { .. } => StageFailure::Cancelled,
        ProcessError::Spawn { .. } => StageFailure::extraction(err.to_string(), false),
        ProcessError::Failed { ref stderr, .. } => {
            let transient = !is_permanent_ffmpeg_error(stderr);
            StageFailure::extraction(err.to_string(), transient)
        }
        ProcessError::Timeout { .. } | ProcessError::Io { .. } => StageFailure::extraction(err.to_string(), true),
    }
}
