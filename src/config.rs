use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::highlights::DetectorConfig;

/// Configuration for the highlight pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Audio extraction settings
    pub audio: AudioConfig,

    /// Transcription engine settings (startup-time only)
    pub transcription: TranscriptionConfig,

    /// Default highlight detector settings
    pub highlights: DetectorConfig,

    /// Clip cutting settings
    pub clips: ClipConfig,

    /// Job scheduling settings
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Target sample rate for transcription
    pub sample_rate: u32,

    /// Output channel count (mono for Whisper)
    pub channels: u32,

    /// ffmpeg executable
    pub ffmpeg_path: String,

    /// ffprobe executable, used to learn the source duration
    pub ffprobe_path: String,

    /// Timeout for one extraction attempt (seconds)
    pub timeout_secs: u64,

    /// Attempts for transient extraction failures, including the first
    pub max_attempts: u32,

    /// Backoff before the second attempt, doubled after each further failure
    pub retry_backoff_ms: u64,

    /// Directory for temporary audio (system temp dir when unset)
    pub temp_dir: Option<PathBuf>,
}

/// Which Whisper command to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WhisperBackend {
    /// Pick the first installed command, fastest first
    #[default]
    Auto,
    WhisperCli,
    WhisperCpp,
    /// OpenAI's Python `whisper` command
    #[serde(rename = "whisper")]
    Python,
}

impl WhisperBackend {
    pub fn program(&self) -> &'static str {
        match self {
            WhisperBackend::Auto => "whisper",
            WhisperBackend::WhisperCli => "whisper-cli",
            WhisperBackend::WhisperCpp => "whisper-cpp",
            WhisperBackend::Python => "whisper",
        }
    }

    /// whisper.cpp builds take ggml model files and short flags
    pub fn is_cpp(&self) -> bool {
        matches!(self, WhisperBackend::WhisperCli | WhisperBackend::WhisperCpp)
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "auto" => Some(WhisperBackend::Auto),
            "whisper-cli" => Some(WhisperBackend::WhisperCli),
            "whisper-cpp" => Some(WhisperBackend::WhisperCpp),
            "whisper" | "python" => Some(WhisperBackend::Python),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Whisper model size/variant ("tiny", "base", "small", ...)
    pub model: String,

    pub backend: WhisperBackend,

    /// Where ggml model files live for whisper.cpp
    pub model_dir: PathBuf,

    /// Language hint, auto-detected when unset
    pub language: Option<String>,

    pub threads: usize,

    /// Timeout for one transcription (seconds)
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipConfig {
    /// Base directory for produced clips
    pub output_dir: PathBuf,

    pub ffmpeg_path: String,

    /// Maximum concurrent cut processes, shared by all jobs
    pub workers: usize,

    /// Timeout for one cut (seconds)
    pub timeout_secs: u64,

    /// Copy streams instead of re-encoding (faster, keyframe-aligned cuts)
    pub stream_copy: bool,

    /// Output container extension
    pub container: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Jobs allowed past `Pending` at the same time
    pub max_concurrent_jobs: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000, // Optimal for Whisper
            channels: 1,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            timeout_secs: 600,
            max_attempts: 3,
            retry_backoff_ms: 500,
            temp_dir: None,
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            model: "base".to_string(),
            backend: WhisperBackend::Auto,
            model_dir: PathBuf::from("models"),
            language: None,
            threads: num_cpus::get().min(8),
            timeout_secs: 3600, // 60 minutes for long videos
        }
    }
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("clips"),
            ffmpeg_path: "ffmpeg".to_string(),
            workers: num_cpus::get().min(4),
            timeout_secs: 300,
            stream_copy: false,
            container: "mp4".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
        }
    }
}

impl AudioConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Backoff after the given failed attempt (1-based)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

impl ClipConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

const CONFIG_PATHS: [&str; 2] = ["highlight-reel.toml", "config/highlight-reel.toml"];

impl Config {
    /// Load configuration: first config file found, then `HIGHLIGHT_REEL_*`
    /// environment overrides on top
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&CONFIG_PATHS)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// First existing file among `paths`, or defaults when none exists
    pub fn load_from<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        for path in paths {
            let path = path.as_ref();
            if !path.is_file() {
                continue;
            }
            let config = Self::from_file(path)?;
            tracing::info!("📄 Loaded configuration from: {}", path.display());
            return Ok(config);
        }

        tracing::debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply `HIGHLIGHT_REEL_*` overrides; unparsable values are ignored
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ffmpeg) = lookup("HIGHLIGHT_REEL_FFMPEG") {
            self.audio.ffmpeg_path = ffmpeg.clone();
            self.clips.ffmpeg_path = ffmpeg;
        }

        if let Some(ffprobe) = lookup("HIGHLIGHT_REEL_FFPROBE") {
            self.audio.ffprobe_path = ffprobe;
        }

        if let Some(dir) = lookup("HIGHLIGHT_REEL_TEMP_DIR") {
            self.audio.temp_dir = Some(PathBuf::from(dir));
        }

        if let Some(model) = lookup("HIGHLIGHT_REEL_WHISPER_MODEL") {
            self.transcription.model = model;
        }

        if let Some(backend) = lookup("HIGHLIGHT_REEL_WHISPER_BACKEND") {
            match WhisperBackend::parse(&backend) {
                Some(backend) => self.transcription.backend = backend,
                None => tracing::warn!("Ignoring unknown Whisper backend: {}", backend),
            }
        }

        if let Some(dir) = lookup("HIGHLIGHT_REEL_MODEL_DIR") {
            self.transcription.model_dir = PathBuf::from(dir);
        }

        if let Some(language) = lookup("HIGHLIGHT_REEL_LANGUAGE") {
            self.transcription.language = Some(language);
        }

        if let Some(output_dir) = lookup("HIGHLIGHT_REEL_OUTPUT_DIR") {
            self.clips.output_dir = PathBuf::from(output_dir);
        }

        if let Some(workers) = lookup("HIGHLIGHT_REEL_WORKERS").and_then(|w| w.parse().ok()) {
            self.clips.workers = workers;
        }

        if let Some(jobs) = lookup("HIGHLIGHT_REEL_MAX_JOBS").and_then(|j| j.parse().ok()) {
            self.pipeline.max_concurrent_jobs = jobs;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(anyhow!("audio.sample_rate must be greater than 0"));
        }
        if self.audio.channels == 0 {
            return Err(anyhow!("audio.channels must be greater than 0"));
        }
        if self.audio.max_attempts == 0 {
            return Err(anyhow!("audio.max_attempts must be greater than 0"));
        }
        if self.audio.timeout_secs == 0 || self.transcription.timeout_secs == 0 || self.clips.timeout_secs == 0 {
            return Err(anyhow!("stage timeouts must be greater than 0"));
        }
        if self.clips.workers == 0 {
            return Err(anyhow!("clips.workers must be greater than 0"));
        }
        if self.pipeline.max_concurrent_jobs == 0 {
            return Err(anyhow!("pipeline.max_concurrent_jobs must be greater than 0"));
        }
        if self.clips.container.is_empty() || !self.clips.container.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(anyhow!("clips.container must be a plain extension, got '{}'", self.clips.container));
        }
        if self.transcription.model.trim().is_empty() {
            return Err(anyhow!("transcription.model must not be empty"));
        }
        self.highlights.validate()?;

        tracing::debug!("✅ Configuration validation passed");
        Ok(())
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "Highlight Reel Configuration:\n\
            - Audio: {}Hz, {} channel(s), {} attempt(s)\n\
            - Whisper: {} model via {:?}\n\
            - Keywords: {}\n\
            - Max Clips: {} (max {:.0}s each, merge gap {:.1}s)\n\
            - Clip Workers: {}\n\
            - Output Directory: {}",
            self.audio.sample_rate,
            self.audio.channels,
            self.audio.max_attempts,
            self.transcription.model,
            self.transcription.backend,
            self.highlights.keywords.iter().cloned().collect::<Vec<_>>().join(", "),
            self.highlights.max_clips,
            self.highlights.max_clip_length_secs,
            self.highlights.min_gap_secs,
            self.clips.workers,
            self.clips.output_dir.display()
        )
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.clips.workers = workers;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, jobs: usize) -> Self {
        self.config.pipeline.max_concurrent_jobs = jobs;
        self
    }

    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.config.clips.output_dir = dir;
        self
    }

    pub fn with_temp_dir(mut self, dir: PathBuf) -> Self {
        self.config.audio.temp_dir = Some(dir);
        self
    }

    pub fn with_ffmpeg(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.config.audio.ffmpeg_path = path.clone();
        self.config.clips.ffmpeg_path = path;
        self
    }

    pub fn with_extraction_retries(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.config.audio.max_attempts = max_attempts;
        self.config.audio.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_whisper_model(mut self, model: impl Into<String>) -> Self {
        self.config.transcription.model = model.into();
        self
    }

    pub fn with_detector(mut self, detector: DetectorConfig) -> Self {
        self.config.highlights = detector;
        self
    }

    pub fn stream_copy(mut self, enable: bool) -> Self {
        self.config.clips.stream_copy = enable;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
